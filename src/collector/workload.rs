//! QoS workload handling: alternative instance keying, constituent
//! suppression, per-resource latency synthesis, and the parent ops fetch.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::errors::CollectorError;
use crate::matrix::{Instance, Matrix, MetricProperty};
use crate::rest::{HrefBuilder, Transport};

use super::parse::{parse_metric_response, parse_property, scalar_string};
use super::schema::CounterInfo;
use super::PerfCollector;

pub(super) const QOS_QUERY: &str = "api/cluster/counter/tables/qos";
pub(super) const QOS_VOLUME_QUERY: &str = "api/cluster/counter/tables/qos_volume";
pub(super) const QOS_DETAIL_QUERY: &str = "api/cluster/counter/tables/qos_detail";
pub(super) const QOS_DETAIL_VOLUME_QUERY: &str = "api/cluster/counter/tables/qos_detail_volume";
pub(super) const QOS_WORKLOAD_QUERY: &str = "api/storage/qos/workloads";

const WORKLOAD_CLASS: &str = "user_defined|system_defined";
const WORKLOAD_VOLUME_CLASS: &str = "autovolume";

/// Constituent workloads are named `<flexgroup>__<4 digits>`.
static CONSTITUENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*)__(\d{4})$").expect("constituent regex"));

pub(super) fn is_workload_object(query: &str) -> bool {
    query == QOS_QUERY || query == QOS_VOLUME_QUERY
}

pub(super) fn is_workload_detail_object(query: &str) -> bool {
    query == QOS_DETAIL_QUERY || query == QOS_DETAIL_VOLUME_QUERY
}

pub(super) fn is_constituent(volume: &str) -> bool {
    CONSTITUENT_REGEX.is_match(volume)
}

/// Applies the template's QoS label renames to an instance. Some fields
/// (lun, file, qtree) do not exist for every workload.
pub(super) fn apply_qos_labels(
    qos_labels: &[(String, String)],
    record: &Value,
    instance: &mut Instance,
) {
    for (label, display) in qos_labels {
        if let Some(value) = record.get(label.as_str()).filter(|v| !v.is_null()) {
            instance.set_label(display, &scalar_string(value));
        }
    }
}

impl<C: Transport> PerfCollector<C> {
    /// The workload-class filter value for instance polls: the template
    /// list sorted and `|`-joined, or the per-family default.
    pub(super) fn workload_class_filter(&self) -> String {
        let default = if self.prop.query == QOS_VOLUME_QUERY
            || self.prop.query == QOS_DETAIL_VOLUME_QUERY
        {
            WORKLOAD_VOLUME_CLASS
        } else {
            WORKLOAD_CLASS
        };

        let mut classes = self.template.workload_class.clone();
        if classes.is_empty() {
            debug!(default, "using default workload class");
            return default.to_string();
        }
        classes.sort();
        classes.join("|")
    }

    /// Creates the per-resource latency metrics for workload-detail
    /// objects. Their counter-info is cloned from `service_time` with the
    /// denominator forced to `ops`; the shared source counters themselves
    /// are not exported.
    pub(super) fn process_workload_counter(&mut self) -> Result<(), CollectorError> {
        if !is_workload_detail_object(&self.prop.query) {
            return Ok(());
        }

        let Self {
            prop,
            perf,
            template,
            matrix,
            ..
        } = self;

        for (name, def) in &prop.metrics {
            let metric = matrix.new_metric_with_label(name, &def.label);
            metric.set_exportable(def.exportable);
        }

        if matrix.get_metric("service_time").is_none() {
            error!("metric [service_time] required to calculate workload missing");
        }
        if matrix.get_metric("wait_time").is_none() {
            error!("metric [wait_time] required to calculate workload missing");
        }
        if matrix.get_metric("service_time").is_none() || matrix.get_metric("wait_time").is_none() {
            return Err(CollectorError::MissingParam("workload metrics".to_string()));
        }

        if matrix.get_metric("ops").is_none() {
            matrix.new_metric("ops");
            perf.counter_info.insert(
                "ops".to_string(),
                CounterInfo {
                    name: "ops".to_string(),
                    description: String::new(),
                    property: MetricProperty::Rate,
                    unit: "per_sec".to_string(),
                    denominator: String::new(),
                },
            );
        }

        if let Some(service) = matrix.get_metric_mut("service_time") {
            service.set_exportable(false);
        }
        if let Some(wait) = matrix.get_metric_mut("wait_time") {
            wait.set_exportable(false);
        }

        let (source_property, source_unit) = perf
            .counter_info
            .get("service_time")
            .map(|c| (c.property, c.unit.clone()))
            .unwrap_or((MetricProperty::Average, "microsec".to_string()));

        for (tag, resource) in &template.resource_map {
            for wm in &perf.workload_detail_metrics {
                let name = format!("{tag}{wm}");
                if matrix.get_metric(&name).is_some() {
                    continue;
                }
                let metric = matrix.new_metric_with_label(&name, wm);
                metric.set_label("resource", resource);
                perf.counter_info.insert(
                    name,
                    CounterInfo {
                        name: wm.clone(),
                        description: String::new(),
                        property: source_property,
                        unit: source_unit.clone(),
                        denominator: "ops".to_string(),
                    },
                );
            }
        }

        Ok(())
    }

    /// Fetches the `ops` counter of the parent QoS table and projects it
    /// onto the current matrix's instances by workload name. Workload-detail
    /// schemas do not report `ops` themselves.
    pub(super) fn fetch_parent_ops(&self, data: &mut Matrix) -> Result<(), CollectorError> {
        let (parent_query, object) = if self.prop.query == QOS_DETAIL_QUERY {
            (format!("{QOS_QUERY}/rows"), "qos")
        } else {
            (format!("{QOS_VOLUME_QUERY}/rows"), "qos_volume")
        };

        if data.get_metric("ops").is_none() {
            error!("ops counter not found in cache");
            return Err(CollectorError::MissingParam("counter ops".to_string()));
        }

        let href = HrefBuilder::new(&parent_query)
            .fields(&["*"])
            .filter(vec!["counters.name=ops".to_string()])
            .return_timeout(self.prop.return_timeout)
            .build();
        debug!(href = href.as_str(), "parent ops poll");

        let records = self.client.fetch(&href).map_err(|e| {
            error!(error = %e, href = href.as_str(), "failed to fetch parent ops");
            CollectorError::Transport(e)
        })?;

        if records.is_empty() {
            return Err(CollectorError::NoInstance(format!(
                "no {object} instances on cluster"
            )));
        }

        for record in &records {
            if !record.is_object() {
                warn!("instance data is not an object, skipping");
                continue;
            }

            let Some(name) = parse_property(record, "name").filter(|v| !v.is_null()) else {
                warn!(key = "name", "skip instance, missing key");
                continue;
            };
            let instance_key = scalar_string(&name);
            let Some(instance) = data.get_instance(&instance_key).cloned() else {
                continue;
            };

            if let Some(resp) = parse_metric_response(record, "ops") {
                if resp.value.is_empty() {
                    continue;
                }
                if let Some(ops) = data.get_metric_mut("ops") {
                    if let Err(e) = ops.set_value_string(&instance, &resp.value) {
                        error!(error = %e, metric = "ops", value = resp.value.as_str(), "set metric");
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_constituent() {
        assert!(is_constituent("vol__0001"));
        assert!(is_constituent("fg_data__0042"));
        assert!(!is_constituent("vol__001"));
        assert!(!is_constituent("vol_0001"));
        assert!(!is_constituent("vol"));
    }

    #[test]
    fn test_workload_object_classification() {
        assert!(is_workload_object(QOS_QUERY));
        assert!(is_workload_object(QOS_VOLUME_QUERY));
        assert!(!is_workload_object(QOS_DETAIL_QUERY));

        assert!(is_workload_detail_object(QOS_DETAIL_QUERY));
        assert!(is_workload_detail_object(QOS_DETAIL_VOLUME_QUERY));
        assert!(!is_workload_detail_object("api/cluster/counter/tables/disk"));
    }

    #[test]
    fn test_apply_qos_labels() {
        let labels = vec![
            ("volume".to_string(), "volume".to_string()),
            ("svm".to_string(), "svm".to_string()),
            ("lun".to_string(), "lun".to_string()),
        ];
        let record = serde_json::json!({"volume": "vol0", "svm": "svm1"});
        let mut instance = Instance::new(0);

        apply_qos_labels(&labels, &record, &mut instance);

        assert_eq!(instance.get_label("volume"), Some("vol0"));
        assert_eq!(instance.get_label("svm"), Some("svm1"));
        assert_eq!(instance.get_label("lun"), None);
    }
}
