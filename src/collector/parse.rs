//! JSON record extraction for counter-table responses.
//!
//! A record carries an `id`, a `properties` array of name/value pairs, and a
//! `counters` array. A counter is scalar (`value`), an array counter
//! (`values` + `labels`), or a nested sub-counter layout
//! (`counters[].label` + `counters[].values` against the parent `labels`),
//! which flattens to `parentLabel#subLabel` names.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use super::schema::MetricDef;
use super::ARRAY_KEY_TOKEN;

/// One extracted counter: scalar (`label` empty) or array
/// (comma-joined `value`/`label` vectors).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricResponse {
    pub value: String,
    pub label: String,
    pub is_array: bool,
}

/// Extracts the record's property map: the `properties` array plus the
/// top-level `id`.
pub fn parse_props(record: &Value) -> HashMap<String, Value> {
    let mut props = HashMap::new();
    if let Some(id) = record.get("id") {
        props.insert("id".to_string(), id.clone());
    }
    if let Some(entries) = record.get("properties").and_then(Value::as_array) {
        for entry in entries {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            let value = entry.get("value").cloned().unwrap_or(Value::Null);
            props.insert(name.to_string(), value);
        }
    }
    props
}

/// Looks up a single property by name (`id` reads the top-level field).
pub fn parse_property(record: &Value, name: &str) -> Option<Value> {
    if name == "id" {
        return record.get("id").cloned();
    }
    let entries = record.get("properties")?.as_array()?;
    entries
        .iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(name))
        .map(|entry| entry.get("value").cloned().unwrap_or(Value::Null))
}

/// Extracts every requested counter from the record, early-exiting once all
/// requested metrics have matched.
pub fn parse_metric_responses(
    record: &Value,
    want: &HashMap<String, MetricDef>,
) -> HashMap<String, MetricResponse> {
    let mut responses = HashMap::new();
    let Some(counters) = record.get("counters").and_then(Value::as_array) else {
        return responses;
    };

    for counter in counters {
        if responses.len() == want.len() {
            break;
        }
        let Some(name) = counter.get("name").and_then(Value::as_str) else {
            continue;
        };
        if !want.contains_key(name) {
            continue;
        }
        if let Some(response) = extract_counter(counter) {
            responses.insert(name.to_string(), response);
        }
    }
    responses
}

/// Extracts one named counter from the record.
pub fn parse_metric_response(record: &Value, metric: &str) -> Option<MetricResponse> {
    let counters = record.get("counters")?.as_array()?;
    counters
        .iter()
        .find(|c| c.get("name").and_then(Value::as_str) == Some(metric))
        .and_then(extract_counter)
}

/// Extracts the value shape of one counter object.
fn extract_counter(counter: &Value) -> Option<MetricResponse> {
    if let Some(value) = counter.get("value").filter(|v| !v.is_null()) {
        return Some(MetricResponse {
            value: scalar_string(value),
            label: String::new(),
            is_array: false,
        });
    }

    if let Some(values) = counter.get("values").filter(|v| !v.is_null()) {
        return Some(MetricResponse {
            value: join_array(values),
            label: counter.get("labels").map(join_array).unwrap_or_default(),
            is_array: true,
        });
    }

    let subs = counter.get("counters")?.as_array()?;
    let parent_labels: Vec<String> = counter
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| labels.iter().map(scalar_string).collect())
        .unwrap_or_default();

    let mut final_labels = Vec::new();
    let mut final_values = Vec::new();
    for sub in subs {
        let label = sub.get("label").and_then(Value::as_str).unwrap_or("");
        let Some(values) = sub.get("values").and_then(Value::as_array) else {
            continue;
        };
        if values.len() > parent_labels.len() {
            let counter_name = counter.get("name").and_then(Value::as_str).unwrap_or("");
            warn!(
                counter_name,
                values = values.len(),
                labels = parent_labels.len(),
                "sub-counter values do not match parent labels, discarding"
            );
            return None;
        }
        for (i, value) in values.iter().enumerate() {
            final_labels.push(format!("{}{}{}", parent_labels[i], ARRAY_KEY_TOKEN, label));
            final_values.push(scalar_string(value));
        }
    }

    if final_labels.is_empty() {
        return None;
    }
    Some(MetricResponse {
        value: final_values.join(","),
        label: final_labels.join(","),
        is_array: true,
    })
}

/// String form of a scalar JSON value (numbers keep their source text form).
pub fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Comma-joins a JSON array; a pre-joined string has brackets and blanks
/// stripped.
pub fn join_array(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(scalar_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::String(s) => s
            .chars()
            .filter(|c| !matches!(c, '[' | ']' | ' ' | '\n'))
            .collect(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn want(names: &[&str]) -> HashMap<String, MetricDef> {
        names
            .iter()
            .map(|n| (n.to_string(), MetricDef::new(n, "", true)))
            .collect()
    }

    #[test]
    fn test_parse_props() {
        let record = json!({
            "id": "disk-1",
            "properties": [
                {"name": "node.name", "value": "node-01"},
                {"name": "speed", "value": 10000}
            ]
        });
        let props = parse_props(&record);
        assert_eq!(props.len(), 3);
        assert_eq!(props["id"], json!("disk-1"));
        assert_eq!(props["node.name"], json!("node-01"));
        assert_eq!(props["speed"], json!(10000));
    }

    #[test]
    fn test_parse_property_id_and_named() {
        let record = json!({
            "id": "disk-1",
            "properties": [{"name": "name", "value": "1.0.1"}]
        });
        assert_eq!(parse_property(&record, "id"), Some(json!("disk-1")));
        assert_eq!(parse_property(&record, "name"), Some(json!("1.0.1")));
        assert_eq!(parse_property(&record, "missing"), None);
    }

    #[test]
    fn test_scalar_counter() {
        let record = json!({
            "counters": [{"name": "total_ops", "value": 4711}]
        });
        let resp = parse_metric_response(&record, "total_ops").expect("response");
        assert_eq!(resp.value, "4711");
        assert!(resp.label.is_empty());
        assert!(!resp.is_array);
    }

    #[test]
    fn test_array_counter() {
        let record = json!({
            "counters": [{
                "name": "cpu_busy",
                "values": [10.5, 20.0],
                "labels": ["cpu0", "cpu1"]
            }]
        });
        let resp = parse_metric_response(&record, "cpu_busy").expect("response");
        assert!(resp.is_array);
        assert_eq!(resp.value, "10.5,20.0");
        assert_eq!(resp.label, "cpu0,cpu1");
    }

    #[test]
    fn test_sub_counter_flattening() {
        let record = json!({
            "counters": [{
                "name": "domain_busy",
                "labels": ["idle", "kahuna"],
                "counters": [
                    {"label": "cpu0", "values": [95, 5]},
                    {"label": "cpu1", "values": [90, 10]}
                ]
            }]
        });
        let resp = parse_metric_response(&record, "domain_busy").expect("response");
        assert!(resp.is_array);
        assert_eq!(resp.label, "idle#cpu0,kahuna#cpu0,idle#cpu1,kahuna#cpu1");
        assert_eq!(resp.value, "95,5,90,10");
    }

    #[test]
    fn test_sub_counter_length_mismatch_discarded() {
        let record = json!({
            "counters": [{
                "name": "domain_busy",
                "labels": ["idle"],
                "counters": [{"label": "cpu0", "values": [95, 5]}]
            }]
        });
        assert_eq!(parse_metric_response(&record, "domain_busy"), None);
    }

    #[test]
    fn test_parse_metric_responses_filters_and_collects() {
        let record = json!({
            "counters": [
                {"name": "unwanted", "value": 1},
                {"name": "total_ops", "value": 2},
                {"name": "read_ops", "value": 3}
            ]
        });
        let responses = parse_metric_responses(&record, &want(&["total_ops", "read_ops"]));
        assert_eq!(responses.len(), 2);
        assert_eq!(responses["total_ops"].value, "2");
        assert_eq!(responses["read_ops"].value, "3");
    }

    #[test]
    fn test_join_array_string_form() {
        assert_eq!(join_array(&json!("[10, 20]")), "10,20");
        assert_eq!(join_array(&json!(["a", "b"])), "a,b");
        assert_eq!(join_array(&Value::Null), "");
    }
}
