//! The performance-counter collector: schema discovery, instance
//! enumeration, data collection, and counter post-processing.
//!
//! A collector is a single-threaded cooperative state machine. An external
//! scheduler invokes [`PerfCollector::poll_counter`],
//! [`PerfCollector::poll_instance`] and [`PerfCollector::poll_data`]
//! serially; only `poll_data` emits matrices, and only from the second
//! cycle onward, once a previous-poll snapshot exists to delta against.

pub mod parse;
pub mod plugin;
pub mod schema;
mod workload;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::errors::CollectorError;
use crate::matrix::{Matrix, MetricProperty, With};
use crate::metadata::CollectorMetadata;
use crate::rest::{now_ns, HrefBuilder, PerfRecord, RestError, Transport};
use crate::template::{CounterKind, Template};

use self::parse::{parse_metric_response, parse_metric_responses, parse_props, scalar_string};
use self::plugin::Plugin;
use self::schema::{CounterInfo, MetricDef};
use self::workload::{apply_qos_labels, is_constituent, is_workload_detail_object, is_workload_object};

pub use self::parse::MetricResponse;

/// Matrices emitted to the exporter, keyed by object name.
pub type MatrixMap = HashMap<String, Matrix>;

/// Synthetic per-instance timestamp metric present on every populated
/// matrix; raw, never exported, and the rate denominator.
pub const TIMESTAMP_METRIC: &str = "timestamp";

/// Separator between an array counter's name and its bucket label.
pub(crate) const ARRAY_KEY_TOKEN: char = '#';

const BILLION: f64 = 1_000_000_000.0;

const DEFAULT_LATENCY_IO_REQD: u32 = 10;

/// Template-derived addressing: which counters to request and how records
/// map onto instances.
#[derive(Debug, Clone, Default)]
pub struct ObjectProp {
    /// Object name stamped on emitted matrices.
    pub object: String,
    /// Counter-table API path.
    pub query: String,
    /// All declared counters, name -> display.
    pub counters: HashMap<String, String>,
    /// Declared float counters.
    pub metrics: HashMap<String, MetricDef>,
    /// Property names joined, in order, to form the instance key.
    pub instance_keys: Vec<String>,
    /// Instance label counters, name -> display.
    pub instance_labels: HashMap<String, String>,
    /// Upstream request timeout hint, seconds.
    pub return_timeout: Option<u32>,
}

/// Performance-specific collector state.
#[derive(Debug, Default)]
struct PerfProps {
    /// No previous-poll snapshot yet; the first data poll emits nothing.
    is_cache_empty: bool,
    /// Schema cache: counter name -> type/unit/denominator metadata.
    counter_info: HashMap<String, CounterInfo>,
    /// Minimum ops delta before a latency sample is trusted.
    latency_io_reqd: u32,
    /// QoS label renames applied on workload instance polls.
    qos_labels: Vec<(String, String)>,
    /// Suppress constituent workloads on instance polls.
    disable_constituents: bool,
    /// Latency metrics synthesized per resource layer on workload-detail
    /// objects.
    workload_detail_metrics: Vec<String>,
}

/// Collector for one object template against one cluster.
#[derive(Debug)]
pub struct PerfCollector<C: Transport> {
    client: C,
    template: Template,
    prop: ObjectProp,
    perf: PerfProps,
    /// Metric definitions absent from the current schema, kept for
    /// restoration when a later schema lists them again.
    archived: HashMap<String, MetricDef>,
    /// The stored matrix: instance cache plus the previous poll's raw
    /// values.
    matrix: Matrix,
    metadata: CollectorMetadata,
}

impl<C: Transport> PerfCollector<C> {
    /// Builds a collector from a template. Fails fast on missing required
    /// template fields.
    pub fn init(client: C, template: Template, cluster: &str) -> Result<Self, CollectorError> {
        if template.query.is_empty() {
            return Err(CollectorError::MissingParam("query".to_string()));
        }

        let decls = template.counter_decls();
        if decls.is_empty() {
            return Err(CollectorError::MissingParam("counters".to_string()));
        }

        let object = if !template.object.is_empty() {
            template.object.clone()
        } else if !template.name.is_empty() {
            template.name.to_lowercase()
        } else {
            return Err(CollectorError::MissingParam("object".to_string()));
        };

        let mut prop = ObjectProp {
            object,
            query: template.query.clone(),
            return_timeout: template.return_timeout,
            ..Default::default()
        };

        // Key fields are ordered by display name so instance keys are
        // deterministic across template edits.
        let mut key_fields: Vec<(String, String)> = Vec::new();
        for decl in decls {
            prop.counters.insert(decl.name.clone(), decl.display.clone());
            match decl.kind {
                CounterKind::Key => {
                    key_fields.push((decl.display.clone(), decl.name.clone()));
                    prop.instance_labels.insert(decl.name, decl.display);
                }
                CounterKind::Label => {
                    prop.instance_labels.insert(decl.name, decl.display);
                }
                CounterKind::Float => {
                    prop.metrics
                        .insert(decl.name.clone(), MetricDef::new(&decl.name, &decl.display, true));
                }
            }
        }
        key_fields.sort();
        prop.instance_keys = key_fields.into_iter().map(|(_, name)| name).collect();

        let mut perf = PerfProps {
            is_cache_empty: true,
            latency_io_reqd: template.latency_io_reqd.unwrap_or(DEFAULT_LATENCY_IO_REQD),
            ..Default::default()
        };

        if is_workload_object(&prop.query) || is_workload_detail_object(&prop.query) {
            if template.qos_labels.is_empty() {
                return Err(CollectorError::MissingParam("qos_labels".to_string()));
            }
            perf.qos_labels = template
                .qos_labels
                .iter()
                .map(|raw| crate::template::parse_qos_label(raw))
                .collect();
        }

        if is_workload_detail_object(&prop.query) && template.resource_map.is_empty() {
            return Err(CollectorError::MissingParam("resource_map".to_string()));
        }

        perf.workload_detail_metrics = vec!["resource_latency".to_string()];
        if let Some(refine) = template.refine() {
            if refine.with_constituents == Some(false) {
                perf.disable_constituents = true;
            }
            if refine.with_service_latency != Some(false) {
                perf.workload_detail_metrics
                    .push("service_time_latency".to_string());
            }
        }

        let mut matrix = Matrix::new(&prop.object);
        matrix.set_global_label("cluster", cluster);
        for (name, value) in &template.labels {
            matrix.set_global_label(name, value);
        }
        matrix.set_export_options(template.export_options.clone());

        debug!(
            object = prop.object.as_str(),
            num_metrics = prop.metrics.len(),
            num_labels = prop.instance_labels.len(),
            "initialized collector"
        );

        Ok(Self {
            client,
            template,
            prop,
            perf,
            archived: HashMap::new(),
            matrix,
            metadata: CollectorMetadata::default(),
        })
    }

    pub fn object(&self) -> &str {
        &self.prop.object
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn metadata(&self) -> &CollectorMetadata {
        &self.metadata
    }

    /// Dispatches a per-object enrichment plugin by kind.
    pub fn load_plugin(&self, kind: &str) -> Option<Box<dyn Plugin>> {
        plugin::load_plugin(kind)
    }

    // --- Schema phase ---

    /// Refreshes the counter schema cache from the counter-table root.
    pub fn poll_counter(&mut self) -> Result<Option<MatrixMap>, CollectorError> {
        let href = HrefBuilder::new(&self.prop.query)
            .return_timeout(self.prop.return_timeout)
            .build();
        debug!(href = href.as_str(), "schema poll");

        let api_start = Instant::now();
        self.client.metadata().reset();
        let records = self
            .client
            .fetch(&href)
            .map_err(|e| self.handle_error(e, &href))?;

        self.poll_counter_records(&records, api_start.elapsed())
    }

    fn poll_counter_records(
        &mut self,
        records: &[Value],
        api_d: Duration,
    ) -> Result<Option<MatrixMap>, CollectorError> {
        let parse_start = Instant::now();
        let first = records
            .first()
            .ok_or_else(|| CollectorError::Config("no data found".to_string()))?;
        let schema = first
            .get("counter_schemas")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut seen: HashSet<String> = HashSet::new();
        let Self {
            prop,
            perf,
            template,
            archived,
            ..
        } = self;
        let workload_detail = is_workload_detail_object(&prop.query);

        // First pass: restore archived metrics, divert string counters to
        // instance labels, and register every referenced denominator as a
        // non-exported metric.
        for counter in &schema {
            if !counter.is_object() {
                warn!("counter schema entry is not an object, skipping");
                continue;
            }
            let name = counter
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let counter_type = template
                .override_for(&name)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    counter
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                });

            if let Some(metric) = archived.remove(&name) {
                info!(key = name.as_str(), "metric found in archive, restoring");
                prop.metrics.insert(name.clone(), metric);
            }

            if !prop.metrics.contains_key(&name) {
                continue;
            }

            if counter_type.contains("string") {
                if !prop.instance_labels.contains_key(&name) {
                    let display = prop
                        .counters
                        .get(&name)
                        .cloned()
                        .unwrap_or_else(|| name.clone());
                    prop.instance_labels.insert(name.clone(), display);
                }
                if let Some(def) = prop.metrics.get_mut(&name) {
                    def.exportable = false;
                }
                continue;
            }

            let denominator = counter
                .pointer("/denominator/name")
                .and_then(Value::as_str)
                .unwrap_or("");
            if !denominator.is_empty() && !prop.metrics.contains_key(denominator) {
                // Workload-detail latency is normalized by ops, not visits.
                if workload_detail && denominator == "visits" {
                    continue;
                }
                prop.metrics
                    .insert(denominator.to_string(), MetricDef::new(denominator, "", false));
            }
        }

        // Second pass: fill the schema cache for every active metric.
        for counter in &schema {
            let Some(name) = counter.get("name").and_then(Value::as_str) else {
                continue;
            };
            if !prop.metrics.contains_key(name) {
                continue;
            }
            seen.insert(name.to_string());
            if !perf.counter_info.contains_key(name) {
                let type_str = template
                    .override_for(name)
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        counter
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string()
                    });
                perf.counter_info.insert(
                    name.to_string(),
                    CounterInfo {
                        name: name.to_string(),
                        description: counter
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        property: parse_property_type(&type_str, name),
                        unit: counter
                            .get("unit")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        denominator: counter
                            .pointer("/denominator/name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    },
                );
            }
        }

        // Archive metrics the current schema no longer lists.
        let unseen: Vec<String> = prop
            .metrics
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in unseen {
            if let Some(def) = prop.metrics.remove(&name) {
                warn!(key = name.as_str(), "metric not found in counter schema, archiving");
                archived.insert(name, def);
            }
        }

        // Each instance carries its own timestamp because instances can
        // arrive in different batches.
        if self.matrix.get_metric(TIMESTAMP_METRIC).is_none() {
            let metric = self.matrix.new_metric(TIMESTAMP_METRIC);
            metric.set_property(MetricProperty::Raw);
            metric.set_exportable(false);
        }

        self.process_workload_counter()?;

        self.metadata.counter.api_time = api_d;
        self.metadata.counter.parse_time = parse_start.elapsed();
        self.metadata.counter.metrics = self.perf.counter_info.len() as u64;
        self.metadata.counter.bytes_rx = self.client.metadata().bytes_rx();
        self.metadata.counter.num_calls = self.client.metadata().num_calls();

        Ok(None)
    }

    // --- Instance phase ---

    /// Refreshes the instance cache from a row poll (or the workloads
    /// endpoint for QoS objects).
    pub fn poll_instance(&mut self) -> Result<Option<MatrixMap>, CollectorError> {
        let workload =
            is_workload_object(&self.prop.query) || is_workload_detail_object(&self.prop.query);

        let (data_query, fields, filter) = if workload {
            (
                workload::QOS_WORKLOAD_QUERY.to_string(),
                "*",
                vec![format!("workload_class={}", self.workload_class_filter())],
            )
        } else {
            (format!("{}/rows", self.prop.query), "properties", Vec::new())
        };

        let href = HrefBuilder::new(&data_query)
            .fields(&[fields])
            .filter(filter)
            .return_timeout(self.prop.return_timeout)
            .build();
        debug!(href = href.as_str(), "instance poll");

        let api_start = Instant::now();
        self.client.metadata().reset();
        let records = self
            .client
            .fetch(&href)
            .map_err(|e| self.handle_error(e, &href))?;

        self.poll_instance_records(&records, api_start.elapsed())
    }

    fn poll_instance_records(
        &mut self,
        records: &[Value],
        api_d: Duration,
    ) -> Result<Option<MatrixMap>, CollectorError> {
        let parse_start = Instant::now();
        if records.is_empty() {
            return Err(CollectorError::NoInstance(format!(
                "no {} instances on cluster",
                self.prop.object
            )));
        }

        let workload = is_workload_object(&self.prop.query);
        let workload_detail = is_workload_detail_object(&self.prop.query);
        let keys: Vec<String> = if workload {
            vec!["uuid".to_string()]
        } else if workload_detail {
            vec!["name".to_string()]
        } else {
            self.prop.instance_keys.clone()
        };

        let Self { matrix, perf, .. } = self;
        let mut old: HashSet<String> = matrix.instances().keys().cloned().collect();
        let old_size = old.len();

        for record in records {
            if !record.is_object() {
                warn!("instance record is not an object, skipping");
                continue;
            }

            // The workloads endpoint lacks a constituent filter, so
            // constituents are dropped client-side.
            if (workload || workload_detail) && perf.disable_constituents {
                let volume = record.get("volume").and_then(Value::as_str).unwrap_or("");
                if is_constituent(volume) {
                    continue;
                }
            }

            let mut instance_key = String::new();
            let mut missing_key = false;
            for key in &keys {
                let value = if workload || workload_detail {
                    record.get(key.as_str()).cloned()
                } else {
                    parse::parse_property(record, key)
                };
                match value {
                    Some(v) if !v.is_null() => instance_key.push_str(&scalar_string(&v)),
                    _ => {
                        warn!(key = key.as_str(), "skip instance, missing key");
                        missing_key = true;
                        break;
                    }
                }
            }
            if missing_key {
                continue;
            }

            if old.remove(&instance_key) {
                if workload || workload_detail {
                    if let Some(instance) = matrix.get_instance_mut(&instance_key) {
                        apply_qos_labels(&perf.qos_labels, record, instance);
                    }
                }
            } else {
                match matrix.new_instance(&instance_key) {
                    Ok(instance) => {
                        if workload || workload_detail {
                            apply_qos_labels(&perf.qos_labels, record, instance);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, instance_key = instance_key.as_str(), "add instance");
                    }
                }
            }
        }

        let removed = old.len();
        for key in &old {
            matrix.remove_instance(key);
            debug!(instance_key = key.as_str(), "removed instance");
        }

        let new_size = matrix.instances().len();
        let added = new_size - (old_size - removed);
        debug!(new = added, removed, total = new_size, "instances");

        self.metadata.instance.api_time = api_d;
        self.metadata.instance.parse_time = parse_start.elapsed();
        self.metadata.instance.instances = new_size as u64;
        self.metadata.instance.bytes_rx = self.client.metadata().bytes_rx();
        self.metadata.instance.num_calls = self.client.metadata().num_calls();

        if new_size == 0 {
            return Err(CollectorError::NoInstance(String::new()));
        }

        Ok(None)
    }

    // --- Data phase ---

    /// Collects counter values and emits the post-processed matrix. The
    /// first cycle after start-up only stores its snapshot and emits
    /// nothing.
    pub fn poll_data(&mut self) -> Result<Option<MatrixMap>, CollectorError> {
        if self.matrix.instances().is_empty() {
            return Err(CollectorError::NoInstance(format!(
                "no {} instances fetched in instance poll",
                self.prop.object
            )));
        }
        if self.matrix.get_metric(TIMESTAMP_METRIC).is_none() {
            return Err(CollectorError::Config("missing timestamp metric".to_string()));
        }

        let api_start = Instant::now();
        let start_ns = now_ns();
        self.client.metadata().reset();

        // Sorted metric names keep the href deterministic.
        let mut names: Vec<&str> = self.prop.metrics.keys().map(String::as_str).collect();
        names.sort_unstable();
        let filter = vec![format!("counters.name={}", names.join("|"))];

        let href = HrefBuilder::new(&format!("{}/rows", self.prop.query))
            .fields(&["*"])
            .filter(filter)
            .return_timeout(self.prop.return_timeout)
            .build();
        debug!(href = href.as_str(), "data poll");

        let perf_records = self.client.fetch_perf(&href)?;
        self.metadata.data.api_time = api_start.elapsed();

        self.poll_data_records(start_ns, &perf_records)
    }

    fn poll_data_records(
        &mut self,
        start_ns: i64,
        perf_records: &[PerfRecord],
    ) -> Result<Option<MatrixMap>, CollectorError> {
        if perf_records.is_empty() {
            return Err(CollectorError::NoInstance(format!(
                "no {} instances on cluster",
                self.prop.object
            )));
        }

        let parse_start = Instant::now();
        let mut cur = self.matrix.clone_with(With {
            data: false,
            metrics: true,
            instances: true,
            export_instances: true,
            partial_instances: false,
        });
        cur.reset();

        let (count, num_partials) = self.populate(&mut cur, start_ns, perf_records);

        if is_workload_detail_object(&self.prop.query) {
            // Without the parent ops denominator none of the synthesized
            // latencies can be cooked.
            self.fetch_parent_ops(&mut cur)?;
        }

        self.metadata.data.parse_time = parse_start.elapsed();
        self.metadata.data.metrics = count;
        self.metadata.data.instances = cur.instances().len() as u64;
        self.metadata.data.bytes_rx = self.client.metadata().bytes_rx();
        self.metadata.data.num_calls = self.client.metadata().num_calls();
        self.metadata.data.num_partials = num_partials;

        if self.perf.is_cache_empty {
            debug!("skip postprocessing until next poll (previous cache empty)");
            self.matrix = cur;
            self.perf.is_cache_empty = false;
            return Ok(None);
        }

        let calc_start = Instant::now();

        // Raw snapshot for the next cycle; post-processing may rewind
        // guarded latency instances inside it.
        let mut cached = cur.clone_with(With {
            data: true,
            metrics: true,
            instances: true,
            export_instances: true,
            partial_instances: true,
        });

        let total_skips = self.post_process(&mut cur, &mut cached);

        self.metadata.data.calc_time = calc_start.elapsed();
        self.metadata.data.skips = total_skips as u64;

        self.matrix = cached;

        let mut out = MatrixMap::new();
        out.insert(self.prop.object.clone(), cur);
        Ok(Some(out))
    }

    /// Parses every record into the fresh matrix. Returns the number of
    /// parsed values and the number of partial instances.
    fn populate(&mut self, cur: &mut Matrix, start_ns: i64, perf_records: &[PerfRecord]) -> (u64, u64) {
        let Self {
            prop,
            perf,
            template,
            matrix: prev_mat,
            ..
        } = self;

        let workload = is_workload_object(&prop.query);
        let workload_detail = is_workload_detail_object(&prop.query);

        let mut count: u64 = 0;
        let mut num_partials: u64 = 0;
        let mut ts = start_ns as f64 / BILLION;

        for page in perf_records {
            if page.timestamp != 0 {
                ts = page.timestamp as f64 / BILLION;
            } else {
                warn!("missing timestamp in response");
            }

            let Some(records) = page.records.as_array() else {
                continue;
            };

            for record in records {
                if !record.is_object() {
                    warn!("instance data is not an object, skipping");
                    continue;
                }

                let props = parse_props(record);

                let mut instance_key = String::new();
                if !prop.instance_keys.is_empty() {
                    for key in &prop.instance_keys {
                        match props.get(key) {
                            Some(value) => instance_key.push_str(&scalar_string(value)),
                            None => warn!(key = key.as_str(), "missing key"),
                        }
                    }
                    if instance_key.is_empty() {
                        continue;
                    }
                }

                // Latency layer (resource) for workload-detail records; the
                // raw key arrives as <cluster>:<workload>.<resource>.
                let mut layer = String::new();
                if workload_detail {
                    if let Some(idx) = instance_key.find(':') {
                        instance_key.drain(..=idx);
                    }
                    match instance_key.split_once('.') {
                        Some((workload_id, resource)) => {
                            layer = resource.to_string();
                            instance_key = workload_id.to_string();
                        }
                        None => {
                            warn!(
                                instance_key = instance_key.as_str(),
                                "instance key has unexpected format"
                            );
                            continue;
                        }
                    }

                    let layer_missing = perf
                        .workload_detail_metrics
                        .iter()
                        .any(|wm| cur.get_metric(&format!("{layer}{wm}")).is_none());
                    if layer_missing {
                        continue;
                    }
                }

                if !template.only_cluster_instance && instance_key.is_empty() {
                    continue;
                }

                let instance = {
                    let Some(instance) = cur.get_instance_mut(&instance_key) else {
                        if !workload && !workload_detail {
                            warn!(
                                instance_key = instance_key.as_str(),
                                "skip instance key, not found in cache"
                            );
                        }
                        continue;
                    };

                    if is_partial_aggregation(record) {
                        instance.set_partial(true);
                        num_partials += 1;
                    }

                    for (label, display) in &prop.instance_labels {
                        match props.get(label) {
                            Some(Value::Array(items)) => {
                                let joined = items
                                    .iter()
                                    .map(scalar_string)
                                    .collect::<Vec<_>>()
                                    .join(",");
                                instance.set_label(display, &joined);
                                count += 1;
                            }
                            Some(value) if !value.is_null() => {
                                instance.set_label(display, &scalar_string(value));
                                count += 1;
                            }
                            _ => {
                                // A label may be reported as a counter
                                // instead of a property.
                                match parse_metric_response(record, label) {
                                    Some(resp) if !resp.value.is_empty() => {
                                        instance.set_label(display, &resp.value);
                                        count += 1;
                                    }
                                    _ => error!(
                                        instance_key = instance_key.as_str(),
                                        label = label.as_str(),
                                        "missing label value"
                                    ),
                                }
                            }
                        }
                    }

                    instance.clone()
                };

                let responses = parse_metric_responses(record, &prop.metrics);

                for (name, def) in &prop.metrics {
                    let Some(resp) = responses.get(name) else {
                        warn!(counter = name.as_str(), "counter is missing or unable to parse");
                        continue;
                    };

                    if workload_detail {
                        for wm in &perf.workload_detail_metrics {
                            let wkey = format!("{layer}{wm}");
                            let Some(wmetric) = cur.get_metric_mut(&wkey) else {
                                continue;
                            };
                            let result = match (wm.as_str(), name.as_str()) {
                                ("resource_latency", "service_time")
                                | ("resource_latency", "wait_time") => {
                                    Some(wmetric.add_value_string(&instance, &resp.value))
                                }
                                ("service_time_latency", "service_time")
                                | ("wait_time_latency", "wait_time") => {
                                    Some(wmetric.set_value_string(&instance, &resp.value))
                                }
                                _ => None,
                            };
                            match result {
                                Some(Ok(())) => count += 1,
                                Some(Err(e)) => error!(
                                    error = %e,
                                    name = name.as_str(),
                                    value = resp.value.as_str(),
                                    "set workload latency failed"
                                ),
                                None => {}
                            }
                        }
                        continue;
                    }

                    if resp.is_array {
                        let labels: Vec<&str> = resp.label.split(',').collect();
                        let values: Vec<&str> = resp.value.split(',').collect();
                        if labels.len() != values.len() {
                            warn!(
                                labels = resp.label.as_str(),
                                values = resp.value.as_str(),
                                "labels don't match parsed values"
                            );
                            continue;
                        }

                        // The schema has no histogram type; the description
                        // text identifies histogram counters.
                        let description = perf
                            .counter_info
                            .get(name)
                            .map(|c| c.description.to_lowercase())
                            .unwrap_or_default();
                        let is_histogram = !labels.is_empty() && description.contains("histogram");
                        if is_histogram {
                            let parent_key = format!("{name}.bucket");
                            ensure_metric(cur, prev_mat, &parent_key, &def.label);
                            if let Some(parent) = cur.get_metric_mut(&parent_key) {
                                parent.set_array(true);
                                parent.set_exportable(def.exportable);
                                parent.set_buckets(
                                    labels.iter().map(|l| l.to_string()).collect(),
                                );
                                parent.set_histogram(true);
                            }
                        }

                        for (i, label) in labels.iter().enumerate() {
                            let key = format!("{name}{ARRAY_KEY_TOKEN}{label}");
                            if cur.get_metric(&key).is_none() {
                                ensure_metric(cur, prev_mat, &key, &def.label);
                                if let Some(metric) = cur.get_metric_mut(&key) {
                                    match label.split_once(ARRAY_KEY_TOKEN) {
                                        Some((parent, sub)) => {
                                            metric.set_label("metric", parent);
                                            metric.set_label("submetric", sub);
                                        }
                                        None => metric.set_label("metric", label),
                                    }
                                    metric.set_array(true);
                                    metric.set_exportable(def.exportable);
                                    if is_histogram {
                                        // Bucket index, so the exporter can
                                        // reconstruct the original order.
                                        metric.set_label("comment", &i.to_string());
                                        metric.set_label("bucket", &format!("{name}.bucket"));
                                        metric.set_histogram(true);
                                    }
                                }
                            }
                            if let Some(metric) = cur.get_metric_mut(&key) {
                                match metric.set_value_string(&instance, values[i]) {
                                    Ok(()) => count += 1,
                                    Err(e) => error!(
                                        error = %e,
                                        name = name.as_str(),
                                        label = *label,
                                        value = values[i],
                                        "set value failed"
                                    ),
                                }
                            }
                        }
                    } else {
                        ensure_metric(cur, prev_mat, name, &def.label);
                        if let Some(metric) = cur.get_metric_mut(name) {
                            metric.set_exportable(def.exportable);
                            match resp.value.parse::<f64>() {
                                Ok(value) => {
                                    metric.set_value(&instance, value);
                                    count += 1;
                                }
                                Err(_) => error!(
                                    key = name.as_str(),
                                    value = resp.value.as_str(),
                                    "unable to parse float value"
                                ),
                            }
                        }
                    }
                }

                if let Some(timestamp) = cur.get_metric_mut(TIMESTAMP_METRIC) {
                    timestamp.set_value(&instance, ts);
                }
            }
        }

        (count, num_partials)
    }

    /// Two-pass cooking of the populated matrix against the stored
    /// previous matrix. Returns the accumulated skips.
    fn post_process(&self, cur: &mut Matrix, cached: &mut Matrix) -> usize {
        let prev = &self.matrix;

        // Order metrics so denominators carry a computed delta before any
        // dependent metric divides by them.
        let mut ordered_keys: Vec<String> = Vec::with_capacity(cur.metrics().len());
        let mut denominator_keys: Vec<String> = Vec::new();
        for (key, metric) in cur.metrics() {
            if key == TIMESTAMP_METRIC || metric.buckets().is_some() {
                continue;
            }
            match self.counter_lookup(key, metric.is_array()) {
                Some(counter) if counter.denominator.is_empty() => ordered_keys.push(key.clone()),
                Some(_) => denominator_keys.push(key.clone()),
                None => {
                    warn!(counter = metric.name(), "counter is missing or unable to parse");
                }
            }
        }
        ordered_keys.extend(denominator_keys);

        // The timestamp delta is computed up front; it is the rate
        // denominator but must not be applied before averages are cooked.
        if let Err(e) = cur.delta(TIMESTAMP_METRIC, prev) {
            error!(error = %e, "calculate timestamp delta");
        }

        let mut total_skips = 0;

        for key in &ordered_keys {
            let is_array = cur.get_metric(key).map(|m| m.is_array()).unwrap_or(false);
            let ends_latency = cur
                .get_metric(key)
                .map(|m| m.name().ends_with("latency"))
                .unwrap_or(false);
            let Some(counter) = self.counter_lookup(key, is_array) else {
                error!(counter = key.as_str(), "missing counter");
                continue;
            };
            let property = counter.property;
            let denominator = counter.denominator.clone();

            if let Some(metric) = cur.get_metric_mut(key) {
                metric.set_property(property);
                metric.set_comment(&denominator);
            }

            // raw/string submit without post-processing.
            if matches!(property, MetricProperty::Raw | MetricProperty::String) {
                continue;
            }

            let skips = match cur.delta(key, prev) {
                Ok(skips) => skips,
                Err(e) => {
                    error!(error = %e, key = key.as_str(), "calculate delta");
                    continue;
                }
            };
            total_skips += skips;

            if property == MetricProperty::Delta {
                continue;
            }

            // Rates wait for the second pass so latency-style averages are
            // not divided by elapsed time first.
            if property == MetricProperty::Rate {
                continue;
            }

            if cur.get_metric(&denominator).is_none() {
                // service_time and wait_time feed the synthesized resource
                // metrics raw; their visits denominator is not collected.
                if is_workload_detail_object(&self.prop.query)
                    && (key == "service_time" || key == "wait_time")
                {
                    continue;
                }
                warn!(
                    key = key.as_str(),
                    property = property.as_str(),
                    denominator = denominator.as_str(),
                    "base counter missing"
                );
                continue;
            }

            // average: delta divided by base delta; percent: the same then
            // scaled. Latency averages apply the minimum-ops threshold.
            let divided = if ends_latency {
                cur.divide_with_threshold(
                    key,
                    &denominator,
                    self.perf.latency_io_reqd,
                    cached,
                    prev,
                    TIMESTAMP_METRIC,
                )
            } else {
                cur.divide(key, &denominator)
            };
            match divided {
                Ok(skips) => total_skips += skips,
                Err(e) => {
                    error!(error = %e, key = key.as_str(), "division by base");
                    continue;
                }
            }

            if property == MetricProperty::Average {
                continue;
            }

            match cur.multiply_by_scalar(key, 100.0) {
                Ok(skips) => total_skips += skips,
                Err(e) => error!(error = %e, key = key.as_str(), "multiply by scalar"),
            }
        }

        // Second pass: rates, normalized by the timestamp delta.
        for key in &ordered_keys {
            let is_array = cur.get_metric(key).map(|m| m.is_array()).unwrap_or(false);
            let Some(counter) = self.counter_lookup(key, is_array) else {
                continue;
            };
            if counter.property != MetricProperty::Rate {
                continue;
            }
            match cur.divide(key, TIMESTAMP_METRIC) {
                Ok(skips) => total_skips += skips,
                Err(e) => error!(error = %e, key = key.as_str(), "calculate rate"),
            }
        }

        total_skips
    }

    /// Schema lookup for a metric key; array members resolve through their
    /// base counter name.
    fn counter_lookup(&self, key: &str, is_array: bool) -> Option<&CounterInfo> {
        let name = if is_array {
            key.split(ARRAY_KEY_TOKEN).next().unwrap_or(key)
        } else {
            key
        };
        self.perf.counter_info.get(name)
    }

    /// Converts transport not-found kinds into a request-rejected error so
    /// the scheduler stands the task by.
    fn handle_error(&self, err: RestError, href: &str) -> CollectorError {
        if err.is_not_found() {
            CollectorError::ApiRequestRejected(format!("polling href=[{href}]: {err}"))
        } else {
            CollectorError::Transport(err)
        }
    }
}

/// Ensures a metric exists in both the current and previous matrices, so
/// delta computation never addresses a missing column. Array membership is
/// only discoverable from data, which is why creation happens here and not
/// in the schema phase.
fn ensure_metric(cur: &mut Matrix, prev: &mut Matrix, key: &str, label: &str) {
    cur.new_metric_with_label(key, label);
    prev.new_metric_with_label(key, label);
}

/// Whether the record marks its aggregation incomplete.
fn is_partial_aggregation(record: &Value) -> bool {
    match record.pointer("/aggregation/complete") {
        Some(Value::Bool(complete)) => !complete,
        Some(Value::String(s)) => s == "false",
        _ => false,
    }
}

/// Parses a schema type string, defaulting unknown types to raw.
fn parse_property_type(type_str: &str, name: &str) -> MetricProperty {
    match type_str.parse() {
        Ok(property) => property,
        Err(_) => {
            warn!(counter = name, counter_type = type_str, "unknown counter type, treating as raw");
            MetricProperty::Raw
        }
    }
}

#[cfg(test)]
mod tests;
