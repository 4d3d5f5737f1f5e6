use std::collections::HashMap;
use std::str::FromStr;

use super::{Instance, MatrixError};

/// How a counter's raw samples are turned into emitted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricProperty {
    /// Submitted as-is.
    #[default]
    Raw,
    /// Current minus previous sample.
    Delta,
    /// Delta normalized by elapsed time.
    Rate,
    /// Delta divided by the denominator counter's delta.
    Average,
    /// Average scaled to a percentage.
    Percent,
    /// Non-numeric; carried as an instance label.
    String,
}

impl MetricProperty {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricProperty::Raw => "raw",
            MetricProperty::Delta => "delta",
            MetricProperty::Rate => "rate",
            MetricProperty::Average => "average",
            MetricProperty::Percent => "percent",
            MetricProperty::String => "string",
        }
    }

    /// Whether post-processing divides this metric by a denominator counter.
    pub fn needs_denominator(&self) -> bool {
        matches!(self, MetricProperty::Average | MetricProperty::Percent)
    }
}

impl FromStr for MetricProperty {
    type Err = MatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(MetricProperty::Raw),
            "delta" => Ok(MetricProperty::Delta),
            "rate" => Ok(MetricProperty::Rate),
            "average" => Ok(MetricProperty::Average),
            "percent" => Ok(MetricProperty::Percent),
            "string" => Ok(MetricProperty::String),
            other => Err(MatrixError::UnknownProperty(other.to_string())),
        }
    }
}

/// A single metric column: metadata plus a dense value vector indexed by
/// instance position. Positions without a valid sample this cycle are
/// tracked in `record`.
#[derive(Debug, Clone)]
pub struct Metric {
    name: String,
    label: String,
    property: MetricProperty,
    /// Denominator counter name, carried downstream to plugins.
    comment: String,
    exportable: bool,
    array: bool,
    histogram: bool,
    /// Ordered bucket labels for histogram parents.
    buckets: Option<Vec<String>>,
    labels: HashMap<String, String>,
    values: Vec<f64>,
    record: Vec<bool>,
}

impl Metric {
    pub fn new(name: &str, label: &str, len: usize) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            property: MetricProperty::Raw,
            comment: String::new(),
            exportable: true,
            array: false,
            histogram: false,
            buckets: None,
            labels: HashMap::new(),
            values: vec![0.0; len],
            record: vec![false; len],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label_text(&mut self, label: &str) {
        self.label = label.to_string();
    }

    pub fn property(&self) -> MetricProperty {
        self.property
    }

    pub fn set_property(&mut self, property: MetricProperty) {
        self.property = property;
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn set_comment(&mut self, comment: &str) {
        self.comment = comment.to_string();
    }

    pub fn is_exportable(&self) -> bool {
        self.exportable
    }

    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    pub fn is_array(&self) -> bool {
        self.array
    }

    pub fn set_array(&mut self, array: bool) {
        self.array = array;
    }

    pub fn is_histogram(&self) -> bool {
        self.histogram
    }

    pub fn set_histogram(&mut self, histogram: bool) {
        self.histogram = histogram;
    }

    pub fn buckets(&self) -> Option<&[String]> {
        self.buckets.as_deref()
    }

    pub fn set_buckets(&mut self, buckets: Vec<String>) {
        self.buckets = Some(buckets);
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

    /// Valid value at the instance's position, if recorded this cycle.
    pub fn value(&self, instance: &Instance) -> Option<f64> {
        let i = instance.index();
        if *self.record.get(i)? {
            self.values.get(i).copied()
        } else {
            None
        }
    }

    pub fn set_value(&mut self, instance: &Instance, value: f64) {
        let i = instance.index();
        if let (Some(v), Some(r)) = (self.values.get_mut(i), self.record.get_mut(i)) {
            *v = value;
            *r = true;
        }
    }

    /// Parses and stores a numeric value. Parse failures surface as typed
    /// errors so callers can log and skip the record.
    pub fn set_value_string(&mut self, instance: &Instance, value: &str) -> Result<(), MatrixError> {
        let parsed: f64 = value.parse().map_err(|_| MatrixError::InvalidValue {
            key: self.name.clone(),
            value: value.to_string(),
        })?;
        self.set_value(instance, parsed);
        Ok(())
    }

    /// Parses and accumulates onto any value already recorded this cycle.
    pub fn add_value_string(&mut self, instance: &Instance, value: &str) -> Result<(), MatrixError> {
        let parsed: f64 = value.parse().map_err(|_| MatrixError::InvalidValue {
            key: self.name.clone(),
            value: value.to_string(),
        })?;
        let current = self.value(instance).unwrap_or(0.0);
        self.set_value(instance, current + parsed);
        Ok(())
    }

    pub fn invalidate(&mut self, index: usize) {
        if let Some(r) = self.record.get_mut(index) {
            *r = false;
        }
    }

    pub(super) fn values(&self) -> &[f64] {
        &self.values
    }

    pub(super) fn records(&self) -> &[bool] {
        &self.record
    }

    pub(super) fn raw_at(&self, index: usize) -> Option<f64> {
        if *self.record.get(index)? {
            self.values.get(index).copied()
        } else {
            None
        }
    }

    pub(super) fn set_raw_at(&mut self, index: usize, value: f64) {
        if let (Some(v), Some(r)) = (self.values.get_mut(index), self.record.get_mut(index)) {
            *v = value;
            *r = true;
        }
    }

    pub(super) fn values_mut(&mut self) -> (&mut [f64], &mut [bool]) {
        (&mut self.values, &mut self.record)
    }

    pub(super) fn grow(&mut self) {
        self.values.push(0.0);
        self.record.push(false);
    }

    pub(super) fn remove_position(&mut self, index: usize) {
        if index < self.values.len() {
            self.values.remove(index);
            self.record.remove(index);
        }
    }

    pub(super) fn clear_values(&mut self) {
        self.values.fill(0.0);
        self.record.fill(false);
    }

    pub(super) fn len(&self) -> usize {
        self.values.len()
    }
}
