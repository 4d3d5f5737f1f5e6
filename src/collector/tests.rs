use std::cell::RefCell;
use std::collections::VecDeque;

use serde_json::{json, Value};

use crate::errors::CollectorError;
use crate::matrix::MetricProperty;
use crate::rest::{PerfRecord, RestError, Transport, TransportMetadata};
use crate::template::Template;

use super::{PerfCollector, TIMESTAMP_METRIC};

/// Transport stub that replays queued responses and records hrefs.
#[derive(Debug)]
struct MockTransport {
    fetches: RefCell<VecDeque<Result<Vec<Value>, RestError>>>,
    perf_fetches: RefCell<VecDeque<Result<Vec<PerfRecord>, RestError>>>,
    hrefs: RefCell<Vec<String>>,
    metadata: TransportMetadata,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            fetches: RefCell::new(VecDeque::new()),
            perf_fetches: RefCell::new(VecDeque::new()),
            hrefs: RefCell::new(Vec::new()),
            metadata: TransportMetadata::default(),
        }
    }

    fn push_fetch(&self, records: Vec<Value>) {
        self.fetches.borrow_mut().push_back(Ok(records));
    }

    fn push_fetch_err(&self, err: RestError) {
        self.fetches.borrow_mut().push_back(Err(err));
    }

    fn push_perf(&self, pages: Vec<PerfRecord>) {
        self.perf_fetches.borrow_mut().push_back(Ok(pages));
    }
}

impl Transport for MockTransport {
    fn fetch(&self, href: &str) -> Result<Vec<Value>, RestError> {
        self.hrefs.borrow_mut().push(href.to_string());
        self.metadata.record(1024);
        self.fetches
            .borrow_mut()
            .pop_front()
            .expect("unexpected fetch")
    }

    fn fetch_perf(&self, href: &str) -> Result<Vec<PerfRecord>, RestError> {
        self.hrefs.borrow_mut().push(href.to_string());
        self.metadata.record(4096);
        self.perf_fetches
            .borrow_mut()
            .pop_front()
            .expect("unexpected perf fetch")
    }

    fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }
}

const DISK_TEMPLATE: &str = r#"
name: Disk
query: api/cluster/counter/tables/disk:constituent
object: disk
counters:
  - ^^name => disk
  - ^node.name => node
  - total_data_disk_busy
  - user_read_latency
  - user_read_ops
"#;

const WORKLOAD_DETAIL_TEMPLATE: &str = r#"
name: WorkloadDetail
query: api/cluster/counter/tables/qos_detail
object: qos_detail
counters:
  - ^^name => workload
  - service_time
  - wait_time
qos_labels:
  - workload-name => workload
  - volume
resource_map:
  CPU_dblade: dblade
"#;

fn schema_counter(name: &str, counter_type: &str, denominator: Option<&str>, desc: &str) -> Value {
    let mut counter = json!({
        "name": name,
        "type": counter_type,
        "unit": "per_sec",
        "description": desc,
    });
    if let Some(d) = denominator {
        counter["denominator"] = json!({"name": d});
    }
    counter
}

fn schema_record(counters: Vec<Value>) -> Vec<Value> {
    vec![json!({"name": "disk:constituent", "counter_schemas": counters})]
}

fn disk_schema() -> Vec<Value> {
    schema_record(vec![
        schema_counter("total_data_disk_busy", "rate", None, "Busy time"),
        schema_counter("user_read_latency", "average", Some("user_read_ops"), "Read latency"),
        schema_counter("user_read_ops", "rate", None, "Read ops"),
    ])
}

fn disk_collector(template: &str) -> PerfCollector<MockTransport> {
    let template = Template::from_yaml(template).expect("template");
    PerfCollector::init(MockTransport::new(), template, "cl01").expect("init")
}

fn instance_record(name: &str, node: &str) -> Value {
    json!({
        "id": name,
        "properties": [
            {"name": "name", "value": name},
            {"name": "node.name", "value": node}
        ]
    })
}

#[test]
fn test_init_missing_query() {
    let template = Template::from_yaml("name: X\ncounters:\n  - a\n").expect("template");
    let err = PerfCollector::init(MockTransport::new(), template, "cl01").unwrap_err();
    assert!(matches!(err, CollectorError::MissingParam(p) if p == "query"));
}

#[test]
fn test_init_missing_counters() {
    let template = Template::from_yaml("name: X\nquery: api/q\n").expect("template");
    let err = PerfCollector::init(MockTransport::new(), template, "cl01").unwrap_err();
    assert!(matches!(err, CollectorError::MissingParam(p) if p == "counters"));
}

#[test]
fn test_init_workload_requires_qos_labels() {
    let template = Template::from_yaml(
        "name: Qos\nquery: api/cluster/counter/tables/qos\ncounters:\n  - ops\n",
    )
    .expect("template");
    let err = PerfCollector::init(MockTransport::new(), template, "cl01").unwrap_err();
    assert!(matches!(err, CollectorError::MissingParam(p) if p == "qos_labels"));
}

#[test]
fn test_init_workload_detail_requires_resource_map() {
    let template = Template::from_yaml(
        "name: Detail\nquery: api/cluster/counter/tables/qos_detail\ncounters:\n  - service_time\nqos_labels:\n  - volume\n",
    )
    .expect("template");
    let err = PerfCollector::init(MockTransport::new(), template, "cl01").unwrap_err();
    assert!(matches!(err, CollectorError::MissingParam(p) if p == "resource_map"));
}

#[test]
fn test_poll_counter_builds_schema_cache() {
    let mut c = disk_collector(DISK_TEMPLATE);
    c.client.push_fetch(disk_schema());

    let emitted = c.poll_counter().expect("poll counter");
    assert!(emitted.is_none());

    let busy = &c.perf.counter_info["total_data_disk_busy"];
    assert_eq!(busy.property, MetricProperty::Rate);
    assert!(busy.denominator.is_empty());

    let latency = &c.perf.counter_info["user_read_latency"];
    assert_eq!(latency.property, MetricProperty::Average);
    assert_eq!(latency.denominator, "user_read_ops");

    // The artificial timestamp metric exists, raw and unexported.
    let ts = c.matrix.get_metric(TIMESTAMP_METRIC).expect("timestamp");
    assert_eq!(ts.property(), MetricProperty::Raw);
    assert!(!ts.is_exportable());
}

#[test]
fn test_poll_counter_registers_undeclared_denominator() {
    let mut c = disk_collector(DISK_TEMPLATE);
    // Schema reports a denominator the template never declared.
    c.client.push_fetch(schema_record(vec![
        schema_counter("user_read_latency", "average", Some("base_for_read"), ""),
        schema_counter("base_for_read", "rate", None, ""),
        schema_counter("total_data_disk_busy", "rate", None, ""),
        schema_counter("user_read_ops", "rate", None, ""),
    ]));

    c.poll_counter().expect("poll counter");

    let base = c.prop.metrics.get("base_for_read").expect("denominator registered");
    assert!(!base.exportable);
    assert!(c.perf.counter_info.contains_key("base_for_read"));
}

#[test]
fn test_poll_counter_override_forces_type() {
    let template = format!("{DISK_TEMPLATE}override:\n  total_data_disk_busy: raw\n");
    let mut c = disk_collector(&template);
    c.client.push_fetch(disk_schema());

    c.poll_counter().expect("poll counter");
    assert_eq!(
        c.perf.counter_info["total_data_disk_busy"].property,
        MetricProperty::Raw
    );
}

#[test]
fn test_poll_counter_string_counter_becomes_label() {
    let mut c = disk_collector(DISK_TEMPLATE);
    c.client.push_fetch(schema_record(vec![
        schema_counter("total_data_disk_busy", "string", None, ""),
        schema_counter("user_read_latency", "average", Some("user_read_ops"), ""),
        schema_counter("user_read_ops", "rate", None, ""),
    ]));

    c.poll_counter().expect("poll counter");

    assert!(c.prop.instance_labels.contains_key("total_data_disk_busy"));
    assert!(!c.prop.metrics["total_data_disk_busy"].exportable);
}

#[test]
fn test_poll_counter_archive_and_restore() {
    let mut c = disk_collector(DISK_TEMPLATE);

    // First schema lists everything.
    c.client.push_fetch(disk_schema());
    c.poll_counter().expect("first poll");
    assert!(c.prop.metrics.contains_key("total_data_disk_busy"));
    assert!(c.archived.is_empty());

    // Second schema drops total_data_disk_busy: archived, not lost.
    c.client.push_fetch(schema_record(vec![
        schema_counter("user_read_latency", "average", Some("user_read_ops"), ""),
        schema_counter("user_read_ops", "rate", None, ""),
    ]));
    c.poll_counter().expect("second poll");
    assert!(!c.prop.metrics.contains_key("total_data_disk_busy"));
    assert!(c.archived.contains_key("total_data_disk_busy"));

    // Third schema restores it with display settings intact.
    c.client.push_fetch(disk_schema());
    c.poll_counter().expect("third poll");
    let restored = &c.prop.metrics["total_data_disk_busy"];
    assert_eq!(restored.label, "total_data_disk_busy");
    assert!(restored.exportable);
    assert!(c.archived.is_empty());
}

#[test]
fn test_poll_counter_idempotent() {
    let mut c = disk_collector(DISK_TEMPLATE);
    c.client.push_fetch(disk_schema());
    c.poll_counter().expect("first poll");
    let metrics_before = c.prop.metrics.len();
    let info_before = c.perf.counter_info.len();

    c.client.push_fetch(disk_schema());
    c.poll_counter().expect("second poll");
    assert_eq!(c.prop.metrics.len(), metrics_before);
    assert_eq!(c.perf.counter_info.len(), info_before);
}

#[test]
fn test_poll_counter_table_not_found_rejects() {
    let mut c = disk_collector(DISK_TEMPLATE);
    c.client
        .push_fetch_err(RestError::TableNotFound("disk:constituent".to_string()));

    let err = c.poll_counter().unwrap_err();
    assert!(err.is_request_rejected());
}

#[test]
fn test_poll_instance_add_and_remove() {
    let mut c = disk_collector(DISK_TEMPLATE);

    c.client
        .push_fetch(vec![instance_record("1.0.0", "n1"), instance_record("1.0.1", "n1")]);
    c.poll_instance().expect("first poll");
    assert_eq!(c.matrix.instances().len(), 2);
    assert!(c.matrix.get_instance("1.0.0").is_some());

    // Second poll: 1.0.0 gone, 1.0.2 new.
    c.client
        .push_fetch(vec![instance_record("1.0.1", "n1"), instance_record("1.0.2", "n2")]);
    c.poll_instance().expect("second poll");
    assert_eq!(c.matrix.instances().len(), 2);
    assert!(c.matrix.get_instance("1.0.0").is_none());
    assert!(c.matrix.get_instance("1.0.1").is_some());
    assert!(c.matrix.get_instance("1.0.2").is_some());
}

#[test]
fn test_poll_instance_empty_is_no_instance() {
    let mut c = disk_collector(DISK_TEMPLATE);
    c.client.push_fetch(Vec::new());

    let err = c.poll_instance().unwrap_err();
    assert!(err.is_retryable_empty());
}

#[test]
fn test_poll_instance_workload_keys_by_uuid() {
    let template = Template::from_yaml(
        r#"
name: Qos
query: api/cluster/counter/tables/qos
object: qos
counters:
  - ^^name => workload
  - ops
qos_labels:
  - volume
"#,
    )
    .expect("template");
    let mut c = PerfCollector::init(MockTransport::new(), template, "cl01").expect("init");

    c.client.push_fetch(vec![
        json!({"uuid": "wid-1", "name": "w1", "volume": "vol1"}),
        json!({"uuid": "wid-2", "name": "w2", "volume": "vol2"}),
    ]);
    c.poll_instance().expect("poll instance");

    assert!(c.matrix.get_instance("wid-1").is_some());
    assert_eq!(
        c.matrix.get_instance("wid-1").expect("wid-1").get_label("volume"),
        Some("vol1")
    );

    let href = c.client.hrefs.borrow().last().cloned().expect("href");
    assert!(href.starts_with("api/storage/qos/workloads?"));
    assert!(href.contains("workload_class=user_defined|system_defined"));
}

#[test]
fn test_poll_instance_constituent_suppression() {
    let template = Template::from_yaml(
        r#"
name: Qos
query: api/cluster/counter/tables/qos
object: qos
counters:
  - ^^name => workload
  - ops
  - refine:
      with_constituents: false
qos_labels:
  - volume
"#,
    )
    .expect("template");
    let mut c = PerfCollector::init(MockTransport::new(), template, "cl01").expect("init");

    c.client.push_fetch(vec![
        json!({"uuid": "wid-1", "name": "w1", "volume": "vol1"}),
        json!({"uuid": "wid-2", "name": "w2", "volume": "vol__0001"}),
    ]);
    c.poll_instance().expect("poll instance");

    assert_eq!(c.matrix.instances().len(), 1);
    assert!(c.matrix.get_instance("wid-2").is_none());
}

#[test]
fn test_poll_data_without_instances_is_no_instance() {
    let mut c = disk_collector(DISK_TEMPLATE);
    let err = c.poll_data().unwrap_err();
    assert!(err.is_retryable_empty());
}

#[test]
fn test_poll_data_without_timestamp_metric_is_config_error() {
    let mut c = disk_collector(DISK_TEMPLATE);
    c.client.push_fetch(vec![instance_record("1.0.0", "n1")]);
    c.poll_instance().expect("poll instance");

    let err = c.poll_data().unwrap_err();
    assert!(matches!(err, CollectorError::Config(_)));
}

#[test]
fn test_poll_data_filter_is_sorted_and_deterministic() {
    let mut c = disk_collector(DISK_TEMPLATE);
    c.client.push_fetch(disk_schema());
    c.poll_counter().expect("poll counter");
    c.client.push_fetch(vec![instance_record("1.0.0", "n1")]);
    c.poll_instance().expect("poll instance");

    c.client.push_perf(vec![PerfRecord {
        timestamp: 1_000_000_000,
        records: json!([]),
    }]);
    c.poll_data().expect("poll data");

    let href = c.client.hrefs.borrow().last().cloned().expect("href");
    assert!(href.contains(
        "counters.name=total_data_disk_busy|user_read_latency|user_read_ops"
    ));
}

#[test]
fn test_workload_detail_counter_synthesis() {
    let mut c = {
        let template = Template::from_yaml(WORKLOAD_DETAIL_TEMPLATE).expect("template");
        PerfCollector::init(MockTransport::new(), template, "cl01").expect("init")
    };

    c.client.push_fetch(vec![json!({
        "name": "qos_detail",
        "counter_schemas": [
            schema_counter("service_time", "average", Some("visits"), "service time"),
            schema_counter("wait_time", "average", Some("visits"), "wait time"),
        ]
    })]);
    c.poll_counter().expect("poll counter");

    // visits is not registered as a denominator for workload-detail.
    assert!(!c.prop.metrics.contains_key("visits"));

    // Synthesized layer metric with resource label and ops denominator.
    let synthesized = c
        .matrix
        .get_metric("CPU_dbladeresource_latency")
        .expect("synthesized metric");
    assert_eq!(synthesized.get_label("resource"), Some("dblade"));
    assert_eq!(synthesized.label(), "resource_latency");

    let info = &c.perf.counter_info["CPU_dbladeresource_latency"];
    assert_eq!(info.denominator, "ops");
    assert_eq!(info.property, MetricProperty::Average);

    // ops registered as a rate counter; shared sources are not exported.
    assert_eq!(c.perf.counter_info["ops"].property, MetricProperty::Rate);
    assert!(!c.matrix.get_metric("service_time").expect("service_time").is_exportable());
    assert!(!c.matrix.get_metric("wait_time").expect("wait_time").is_exportable());
}
