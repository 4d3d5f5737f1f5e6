//! Object templates: which API table to query and which counters to collect.
//!
//! A template is a YAML document declaring the `query` path, the emitted
//! `object` name, and a `counters` list. Counter declarations use kind
//! markers: `^^name` is an instance key, `^name` an instance label, and an
//! unmarked name a float counter. `name => display` renames the emitted
//! label.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::matrix::ExportOptions;

/// A parsed object template.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Template {
    /// Template name, used as a fallback object name.
    #[serde(default)]
    pub name: String,

    /// API path of the counter table (e.g. "api/cluster/counter/tables/disk").
    #[serde(default)]
    pub query: String,

    /// Object name stamped on emitted matrices.
    #[serde(default)]
    pub object: String,

    /// Counter declarations, plus an optional inline `refine` block.
    #[serde(default)]
    pub counters: Vec<CounterEntry>,

    /// Per-counter type overrides (e.g. force `raw` for a reported `rate`).
    #[serde(rename = "override", default)]
    pub overrides: HashMap<String, String>,

    /// Workload class filter values for QoS instance polls.
    #[serde(default)]
    pub workload_class: Vec<String>,

    /// QoS label declarations (`name` or `name => display`).
    #[serde(default)]
    pub qos_labels: Vec<String>,

    /// Resource tag -> human resource label, for workload-detail latency
    /// synthesis.
    #[serde(default)]
    pub resource_map: HashMap<String, String>,

    /// Extra global labels applied to all instances.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub export_options: ExportOptions,

    /// Upstream request timeout hint, in seconds.
    pub return_timeout: Option<u32>,

    /// Minimum ops delta before a latency sample is trusted.
    pub latency_io_reqd: Option<u32>,

    /// Allow the empty instance key for single-instance cluster tables.
    #[serde(default)]
    pub only_cluster_instance: bool,
}

/// One entry of the `counters` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CounterEntry {
    /// A counter declaration string.
    Decl(String),
    /// The inline `refine` options block.
    Refine { refine: RefineOptions },
}

/// Refinement switches nested under `counters`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RefineOptions {
    /// Keep constituent workloads (default true).
    pub with_constituents: Option<bool>,

    /// Also synthesize per-resource service-time latency (default true).
    pub with_service_latency: Option<bool>,
}

/// Kind of a declared counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Key,
    Label,
    Float,
}

/// A parsed counter declaration.
#[derive(Debug, Clone)]
pub struct CounterDecl {
    pub name: String,
    pub display: String,
    pub kind: CounterKind,
}

impl Template {
    /// Load a template from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading template {}", path.display()))?;
        Self::from_yaml(&data).with_context(|| format!("parsing template {}", path.display()))
    }

    /// Parse a template from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let template: Template = serde_yaml::from_str(data).context("parsing template YAML")?;
        Ok(template)
    }

    /// All counter declarations, in template order.
    pub fn counter_decls(&self) -> Vec<CounterDecl> {
        self.counters
            .iter()
            .filter_map(|entry| match entry {
                CounterEntry::Decl(s) if !s.is_empty() => Some(parse_counter_decl(s)),
                _ => None,
            })
            .collect()
    }

    /// The merged `refine` block, if any entry carried one.
    pub fn refine(&self) -> Option<RefineOptions> {
        self.counters.iter().find_map(|entry| match entry {
            CounterEntry::Refine { refine } => Some(*refine),
            CounterEntry::Decl(_) => None,
        })
    }

    /// The type override for a counter, if declared.
    pub fn override_for(&self, counter: &str) -> Option<&str> {
        self.overrides.get(counter).map(String::as_str)
    }
}

/// Parses one counter declaration string.
pub fn parse_counter_decl(raw: &str) -> CounterDecl {
    let (name_part, display_part) = match raw.split_once("=>") {
        Some((name, display)) => (name.trim(), Some(display.trim())),
        None => (raw.trim(), None),
    };

    let (kind, name) = if let Some(rest) = name_part.strip_prefix("^^") {
        (CounterKind::Key, rest)
    } else if let Some(rest) = name_part.strip_prefix('^') {
        (CounterKind::Label, rest)
    } else {
        (CounterKind::Float, name_part)
    };

    let display = display_part
        .map(|d| d.trim_start_matches('^').to_string())
        .unwrap_or_else(|| name.replace('-', "_"));

    CounterDecl {
        name: name.to_string(),
        display,
        kind,
    }
}

/// Parses a QoS label declaration (`name` or `name => display`); the default
/// display replaces dashes with underscores.
pub fn parse_qos_label(raw: &str) -> (String, String) {
    match raw.split_once("=>") {
        Some((name, display)) => (name.trim().to_string(), display.trim().to_string()),
        None => (raw.trim().to_string(), raw.trim().replace('-', "_")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISK_TEMPLATE: &str = r#"
name: Disk
query: api/cluster/counter/tables/disk:constituent
object: disk
counters:
  - ^^id => instance_id
  - ^name => disk
  - ^speed
  - total_data_disk_busy
  - user_read_latency
  - refine:
      with_constituents: false
override:
  total_data_disk_busy: raw
export_options:
  instance_keys:
    - disk
latency_io_reqd: 15
"#;

    #[test]
    fn test_parse_counter_decl_kinds() {
        let key = parse_counter_decl("^^id => instance_id");
        assert_eq!(key.kind, CounterKind::Key);
        assert_eq!(key.name, "id");
        assert_eq!(key.display, "instance_id");

        let label = parse_counter_decl("^name");
        assert_eq!(label.kind, CounterKind::Label);
        assert_eq!(label.name, "name");
        assert_eq!(label.display, "name");

        let float = parse_counter_decl("total-data-disk-busy");
        assert_eq!(float.kind, CounterKind::Float);
        assert_eq!(float.name, "total-data-disk-busy");
        assert_eq!(float.display, "total_data_disk_busy");
    }

    #[test]
    fn test_template_from_yaml() {
        let t = Template::from_yaml(DISK_TEMPLATE).expect("parse");
        assert_eq!(t.query, "api/cluster/counter/tables/disk:constituent");
        assert_eq!(t.object, "disk");
        assert_eq!(t.latency_io_reqd, Some(15));

        let decls = t.counter_decls();
        assert_eq!(decls.len(), 5);
        assert_eq!(decls[0].kind, CounterKind::Key);
        assert_eq!(decls[3].name, "total_data_disk_busy");

        let refine = t.refine().expect("refine block");
        assert_eq!(refine.with_constituents, Some(false));
        assert_eq!(refine.with_service_latency, None);

        assert_eq!(t.override_for("total_data_disk_busy"), Some("raw"));
        assert_eq!(t.override_for("user_read_latency"), None);
        assert_eq!(t.export_options.instance_keys, vec!["disk".to_string()]);
    }

    #[test]
    fn test_parse_qos_label() {
        assert_eq!(
            parse_qos_label("read-ahead => read_ahead"),
            ("read-ahead".to_string(), "read_ahead".to_string())
        );
        assert_eq!(
            parse_qos_label("wid-class"),
            ("wid-class".to_string(), "wid_class".to_string())
        );
    }

    #[test]
    fn test_empty_template_defaults() {
        let t = Template::from_yaml("name: Empty").expect("parse");
        assert!(t.query.is_empty());
        assert!(t.counter_decls().is_empty());
        assert!(t.refine().is_none());
        assert!(!t.only_cluster_instance);
    }
}
