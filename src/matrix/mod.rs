//! In-memory table of instances × metrics for one collected object.
//!
//! A `Matrix` owns the instance set, the metric set, and the arithmetic
//! primitives post-processing is built from. Values live in dense per-metric
//! vectors indexed by instance position; a parallel validity vector tracks
//! positions whose value could not be computed this cycle.

pub mod metric;

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub use metric::{Metric, MetricProperty};

/// Errors raised by matrix structure or value operations.
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("duplicate instance key {0:?}")]
    DuplicateInstance(String),

    #[error("metric {0:?} not found")]
    MetricNotFound(String),

    #[error("invalid numeric value {value:?} for metric {key:?}")]
    InvalidValue { key: String, value: String },

    #[error("unknown metric property {0:?}")]
    UnknownProperty(String),
}

/// A row in the matrix: one monitored entity (disk, volume, workload, ...).
#[derive(Debug, Clone)]
pub struct Instance {
    index: usize,
    labels: HashMap<String, String>,
    partial: bool,
    exportable: bool,
}

impl Instance {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            labels: HashMap::new(),
            partial: false,
            exportable: true,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_label(&mut self, name: &str, value: &str) {
        self.labels.insert(name.to_string(), value.to_string());
    }

    pub fn get_label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    /// True when the upstream marked this instance's aggregation incomplete.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn set_partial(&mut self, partial: bool) {
        self.partial = partial;
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }
}

/// Which labels and metrics an exporter publishes from this matrix.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportOptions {
    /// Labels that identify an instance in exported series.
    #[serde(default)]
    pub instance_keys: Vec<String>,

    /// Additional labels exported per instance.
    #[serde(default)]
    pub instance_labels: Vec<String>,

    /// Export every instance label regardless of the lists above.
    #[serde(default)]
    pub include_all_labels: bool,
}

/// Selects what a [`Matrix::clone_with`] copy carries over.
#[derive(Debug, Clone, Copy, Default)]
pub struct With {
    pub data: bool,
    pub metrics: bool,
    pub instances: bool,
    pub export_instances: bool,
    pub partial_instances: bool,
}

/// The engine's in-memory table for one object.
#[derive(Debug, Clone)]
pub struct Matrix {
    object: String,
    global_labels: HashMap<String, String>,
    instances: HashMap<String, Instance>,
    metrics: HashMap<String, Metric>,
    export_options: ExportOptions,
}

impl Matrix {
    pub fn new(object: &str) -> Self {
        Self {
            object: object.to_string(),
            global_labels: HashMap::new(),
            instances: HashMap::new(),
            metrics: HashMap::new(),
            export_options: ExportOptions::default(),
        }
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn set_object(&mut self, object: &str) {
        self.object = object.to_string();
    }

    pub fn set_global_label(&mut self, name: &str, value: &str) {
        self.global_labels.insert(name.to_string(), value.to_string());
    }

    pub fn global_labels(&self) -> &HashMap<String, String> {
        &self.global_labels
    }

    pub fn set_export_options(&mut self, options: ExportOptions) {
        self.export_options = options;
    }

    pub fn export_options(&self) -> &ExportOptions {
        &self.export_options
    }

    // --- Instances ---

    /// Adds an instance under a unique key, growing every metric column.
    pub fn new_instance(&mut self, key: &str) -> Result<&mut Instance, MatrixError> {
        if self.instances.contains_key(key) {
            return Err(MatrixError::DuplicateInstance(key.to_string()));
        }
        let instance = Instance::new(self.instances.len());
        for metric in self.metrics.values_mut() {
            metric.grow();
        }
        Ok(self
            .instances
            .entry(key.to_string())
            .or_insert(instance))
    }

    pub fn get_instance(&self, key: &str) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn get_instance_mut(&mut self, key: &str) -> Option<&mut Instance> {
        self.instances.get_mut(key)
    }

    pub fn instances(&self) -> &HashMap<String, Instance> {
        &self.instances
    }

    /// Removes an instance and compacts every metric column.
    pub fn remove_instance(&mut self, key: &str) {
        let Some(removed) = self.instances.remove(key) else {
            return;
        };
        let gone = removed.index;
        for metric in self.metrics.values_mut() {
            metric.remove_position(gone);
        }
        for instance in self.instances.values_mut() {
            if instance.index > gone {
                instance.index -= 1;
            }
        }
    }

    // --- Metrics ---

    /// Creates a float metric, or returns the existing one for the key.
    pub fn new_metric(&mut self, key: &str) -> &mut Metric {
        self.new_metric_with_label(key, "")
    }

    pub fn new_metric_with_label(&mut self, key: &str, label: &str) -> &mut Metric {
        let len = self.instances.len();
        self.metrics
            .entry(key.to_string())
            .or_insert_with(|| Metric::new(key, label, len))
    }

    pub fn get_metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    pub fn get_metric_mut(&mut self, key: &str) -> Option<&mut Metric> {
        self.metrics.get_mut(key)
    }

    pub fn metrics(&self) -> &HashMap<String, Metric> {
        &self.metrics
    }

    pub fn remove_metric(&mut self, key: &str) {
        self.metrics.remove(key);
    }

    /// Clears all values while preserving metric and instance structure.
    pub fn reset(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.clear_values();
        }
    }

    /// Deep structural copy with selective content.
    pub fn clone_with(&self, with: With) -> Matrix {
        let mut out = Matrix::new(&self.object);
        out.global_labels = self.global_labels.clone();
        out.export_options = self.export_options.clone();

        if with.instances {
            for (key, instance) in &self.instances {
                let mut copy = Instance::new(instance.index);
                copy.labels = instance.labels.clone();
                copy.exportable = if with.export_instances {
                    instance.exportable
                } else {
                    true
                };
                copy.partial = if with.partial_instances {
                    instance.partial
                } else {
                    false
                };
                out.instances.insert(key.clone(), copy);
            }
        }

        if with.metrics {
            for (key, metric) in &self.metrics {
                let mut copy = metric.clone();
                if !with.data {
                    copy.clear_values();
                }
                if !with.instances {
                    while copy.len() > 0 {
                        copy.remove_position(copy.len() - 1);
                    }
                }
                out.metrics.insert(key.clone(), copy);
            }
        }

        out
    }

    // --- Arithmetic primitives ---
    //
    // All primitives operate on a named metric key and return the number of
    // skips: instances whose result was dropped due to insufficient data.

    /// new[i] = cur[i] - prev[i], matched by instance key. A missing or
    /// invalid side, or a negative delta (counter reset), invalidates the
    /// result and counts as a skip.
    pub fn delta(&mut self, key: &str, prev: &Matrix) -> Result<usize, MatrixError> {
        let prev_metric = prev
            .metrics
            .get(key)
            .ok_or_else(|| MatrixError::MetricNotFound(key.to_string()))?;
        let Self {
            instances, metrics, ..
        } = self;
        let metric = metrics
            .get_mut(key)
            .ok_or_else(|| MatrixError::MetricNotFound(key.to_string()))?;

        let mut skips = 0;
        let (values, record) = metric.values_mut();
        for (ikey, instance) in instances.iter() {
            let i = instance.index;
            let prev_raw = prev
                .instances
                .get(ikey)
                .and_then(|p| prev_metric.raw_at(p.index));
            match prev_raw {
                Some(prev_value) if record[i] => {
                    let d = values[i] - prev_value;
                    values[i] = d;
                    if d < 0.0 {
                        record[i] = false;
                        skips += 1;
                        warn!(metric = key, instance = ikey.as_str(), delta = d, "negative delta, skipping");
                    }
                }
                _ => {
                    record[i] = false;
                    skips += 1;
                }
            }
        }
        Ok(skips)
    }

    /// new[i] = num[i] / denom[i]. A denominator <= 0 or an invalid side
    /// invalidates the result and counts as a skip.
    pub fn divide(&mut self, key: &str, base_key: &str) -> Result<usize, MatrixError> {
        let base = self
            .metrics
            .get(base_key)
            .ok_or_else(|| MatrixError::MetricNotFound(base_key.to_string()))?;
        let base_values = base.values().to_vec();
        let base_record = base.records().to_vec();
        let metric = self
            .metrics
            .get_mut(key)
            .ok_or_else(|| MatrixError::MetricNotFound(key.to_string()))?;

        let mut skips = 0;
        let (values, record) = metric.values_mut();
        for i in 0..values.len() {
            if !record[i] {
                continue;
            }
            if base_record[i] && base_values[i] > 0.0 {
                values[i] /= base_values[i];
            } else {
                record[i] = false;
                skips += 1;
            }
        }
        Ok(skips)
    }

    /// Latency-safe division for average counters whose name ends in
    /// `latency`: the sample is only cooked when at least `threshold` ops
    /// happened and time elapsed since the previous poll.
    ///
    /// A guarded instance is invalidated for this cycle, which leaves the
    /// exporter's previously published value in place. Its raw snapshot in
    /// `cached` is rewound to the previous poll's raw values so the next
    /// delta spans the extended window and the eventual cook covers the
    /// accumulated ops.
    pub fn divide_with_threshold(
        &mut self,
        key: &str,
        base_key: &str,
        threshold: u32,
        cached: &mut Matrix,
        prev: &Matrix,
        ts_key: &str,
    ) -> Result<usize, MatrixError> {
        let base = self
            .metrics
            .get(base_key)
            .ok_or_else(|| MatrixError::MetricNotFound(base_key.to_string()))?;
        let base_values = base.values().to_vec();
        let base_record = base.records().to_vec();
        let ts = self
            .metrics
            .get(ts_key)
            .ok_or_else(|| MatrixError::MetricNotFound(ts_key.to_string()))?;
        let ts_values = ts.values().to_vec();
        let ts_record = ts.records().to_vec();

        let Self {
            instances, metrics, ..
        } = self;
        let metric = metrics
            .get_mut(key)
            .ok_or_else(|| MatrixError::MetricNotFound(key.to_string()))?;

        let mut skips = 0;
        let min_ops = f64::from(threshold);
        let (values, record) = metric.values_mut();
        for (ikey, instance) in instances.iter() {
            let i = instance.index;
            if !record[i] {
                continue;
            }
            if !base_record[i] {
                record[i] = false;
                skips += 1;
                continue;
            }
            let ops = base_values[i];
            let elapsed = if ts_record[i] { ts_values[i] } else { 0.0 };
            if ops >= min_ops && elapsed > 0.0 {
                values[i] /= ops;
            } else {
                record[i] = false;
                skips += 1;
                rewind_raw(cached, prev, &[key, base_key], ikey);
            }
        }
        Ok(skips)
    }

    /// new[i] = cur[i] * scalar.
    pub fn multiply_by_scalar(&mut self, key: &str, scalar: f64) -> Result<usize, MatrixError> {
        let metric = self
            .metrics
            .get_mut(key)
            .ok_or_else(|| MatrixError::MetricNotFound(key.to_string()))?;
        let (values, record) = metric.values_mut();
        for i in 0..values.len() {
            if record[i] {
                values[i] *= scalar;
            }
        }
        Ok(0)
    }
}

/// Copies the previous poll's raw values for `keys` back into the cached
/// raw snapshot at `ikey`, extending the accumulation window for the next
/// delta. No-op when either side lacks the instance or a valid sample.
fn rewind_raw(cached: &mut Matrix, prev: &Matrix, keys: &[&str], ikey: &str) {
    let Some(cached_index) = cached.instances.get(ikey).map(Instance::index) else {
        return;
    };
    let Some(prev_index) = prev.instances.get(ikey).map(Instance::index) else {
        return;
    };
    for key in keys {
        let Some(prev_raw) = prev.metrics.get(*key).and_then(|m| m.raw_at(prev_index)) else {
            continue;
        };
        if let Some(cached_metric) = cached.metrics.get_mut(*key) {
            cached_metric.set_raw_at(cached_index, prev_raw);
        }
    }
}
