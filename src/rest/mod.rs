//! REST transport: the boundary between the collector and the array's
//! management API.
//!
//! The collector consumes the [`Transport`] trait so tests can drive poll
//! cycles with canned responses. [`HttpClient`] is the production
//! implementation: a blocking reqwest client with basic auth that follows
//! pagination links and classifies the vendor's table/API-not-found error
//! codes.

use std::cell::Cell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::ClusterConfig;

/// Vendor error code for a missing counter table.
const TABLE_NOT_FOUND_CODE: &str = "8585320";

/// Vendor error code for an unknown API endpoint.
const API_NOT_FOUND_CODE: &str = "3";

/// Errors raised by the transport.
#[derive(Error, Debug)]
pub enum RestError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("API not found: {0}")]
    ApiNotFound(String),

    #[error("unexpected status {status} from {href}: {body}")]
    Http {
        href: String,
        status: u16,
        body: String,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("decoding response from {href}: {source}")]
    Decode {
        href: String,
        source: serde_json::Error,
    },
}

impl RestError {
    /// Whether the upstream rejected the request as unknown (table or API
    /// missing on this cluster version).
    pub fn is_not_found(&self) -> bool {
        matches!(self, RestError::TableNotFound(_) | RestError::ApiNotFound(_))
    }
}

/// Byte and call counters owned by a client; the collector reads and resets
/// them at the start of each phase. Single-threaded by design.
#[derive(Debug, Default)]
pub struct TransportMetadata {
    bytes_rx: Cell<u64>,
    num_calls: Cell<u64>,
}

impl TransportMetadata {
    pub fn record(&self, bytes: u64) {
        self.bytes_rx.set(self.bytes_rx.get() + bytes);
        self.num_calls.set(self.num_calls.get() + 1);
    }

    pub fn reset(&self) {
        self.bytes_rx.set(0);
        self.num_calls.set(0);
    }

    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.get()
    }

    pub fn num_calls(&self) -> u64 {
        self.num_calls.get()
    }
}

/// One page of a performance data fetch, stamped with the fetch time.
#[derive(Debug, Clone)]
pub struct PerfRecord {
    /// Fetch timestamp in nanoseconds since the epoch.
    pub timestamp: i64,
    /// The page's `records` array.
    pub records: Value,
}

/// Transport consumed by the collector.
pub trait Transport {
    /// Fetches all records behind `href`, following pagination.
    fn fetch(&self, href: &str) -> Result<Vec<Value>, RestError>;

    /// Fetches performance data pages behind `href`, each stamped with its
    /// fetch timestamp.
    fn fetch_perf(&self, href: &str) -> Result<Vec<PerfRecord>, RestError>;

    /// The client's byte/call counters.
    fn metadata(&self) -> &TransportMetadata;
}

/// Builds a counter-table href with deterministic parameter ordering.
#[derive(Debug, Clone, Default)]
pub struct HrefBuilder {
    api_path: String,
    fields: Vec<String>,
    filter: Vec<String>,
    return_timeout: Option<u32>,
}

impl HrefBuilder {
    pub fn new(api_path: &str) -> Self {
        Self {
            api_path: api_path.to_string(),
            ..Default::default()
        }
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn filter(mut self, filter: Vec<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn return_timeout(mut self, timeout: Option<u32>) -> Self {
        self.return_timeout = timeout;
        self
    }

    pub fn build(self) -> String {
        let mut href = format!("{}?return_records=true", self.api_path);
        if !self.fields.is_empty() {
            href.push_str("&fields=");
            href.push_str(&self.fields.join(","));
        }
        for f in &self.filter {
            href.push('&');
            href.push_str(f);
        }
        if let Some(timeout) = self.return_timeout {
            href.push_str(&format!("&return_timeout={timeout}"));
        }
        href
    }
}

/// Blocking HTTP client against the array management endpoint.
pub struct HttpClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    username: String,
    password: String,
    metadata: TransportMetadata,
}

impl HttpClient {
    pub fn new(cfg: &ClusterConfig) -> anyhow::Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            cfg.timeout
        };

        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(cfg.insecure)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            metadata: TransportMetadata::default(),
        })
    }

    /// Performs one GET and returns the decoded JSON body.
    fn get_page(&self, href: &str) -> Result<Value, RestError> {
        let url = format!("{}/{}", self.endpoint, href.trim_start_matches('/'));
        debug!(url = url.as_str(), "GET");

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()?;

        let status = response.status();
        let body = response.text()?;
        self.metadata.record(body.len() as u64);

        if !status.is_success() {
            return Err(classify_error(href, status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(|source| RestError::Decode {
            href: href.to_string(),
            source,
        })
    }

    /// Follows `_links.next.href` pagination, calling `page` per page.
    fn for_each_page(
        &self,
        href: &str,
        mut page: impl FnMut(&Value),
    ) -> Result<(), RestError> {
        let mut next = Some(href.to_string());
        while let Some(href) = next.take() {
            let body = self.get_page(&href)?;
            page(&body);
            next = body
                .pointer("/_links/next/href")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(())
    }
}

impl Transport for HttpClient {
    fn fetch(&self, href: &str) -> Result<Vec<Value>, RestError> {
        let mut records = Vec::new();
        self.for_each_page(href, |body| {
            if let Some(page_records) = body.get("records").and_then(Value::as_array) {
                records.extend(page_records.iter().cloned());
            }
        })?;
        Ok(records)
    }

    fn fetch_perf(&self, href: &str) -> Result<Vec<PerfRecord>, RestError> {
        let mut pages = Vec::new();
        self.for_each_page(href, |body| {
            if let Some(page_records) = body.get("records") {
                pages.push(PerfRecord {
                    timestamp: now_ns(),
                    records: page_records.clone(),
                });
            }
        })?;
        Ok(pages)
    }

    fn metadata(&self) -> &TransportMetadata {
        &self.metadata
    }
}

/// Maps a non-success response to a typed error using the vendor error code.
fn classify_error(href: &str, status: u16, body: &str) -> RestError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/code"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let message = parsed
        .as_ref()
        .and_then(|v| v.pointer("/error/message"))
        .and_then(Value::as_str)
        .unwrap_or(body)
        .to_string();

    match code {
        TABLE_NOT_FOUND_CODE => RestError::TableNotFound(message),
        API_NOT_FOUND_CODE => RestError::ApiNotFound(message),
        _ => RestError::Http {
            href: href.to_string(),
            status,
            body: message,
        },
    }
}

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
