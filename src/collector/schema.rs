//! Counter schema cache types.
//!
//! The schema poll translates the upstream counter table into
//! [`CounterInfo`] entries; metric definitions absent from the current
//! schema are parked in the collector's archive and restored, with their
//! prior display label and export flag, when a later schema lists them
//! again.

use crate::matrix::MetricProperty;

/// Per-metric metadata from the counter schema.
#[derive(Debug, Clone)]
pub struct CounterInfo {
    /// Raw counter name from the schema (for synthesized metrics, the
    /// shared source counter).
    pub name: String,
    pub description: String,
    /// How post-processing cooks this counter.
    pub property: MetricProperty,
    pub unit: String,
    /// Denominator counter name; empty when no base is required.
    pub denominator: String,
}

/// A declared float counter: template display settings attached to a
/// schema counter name.
#[derive(Debug, Clone)]
pub struct MetricDef {
    pub name: String,
    pub label: String,
    pub exportable: bool,
}

impl MetricDef {
    pub fn new(name: &str, label: &str, exportable: bool) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            exportable,
        }
    }
}
