//! Observability plumbing — request ids, reporting categories, metrics
//! sinks, and per-request tracing spans.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::{field, Span};
use uuid::Uuid;

use crate::http::RequestHead;

/// Inbound/outbound header carrying the internal request id.
pub const REQUEST_ID_HEADER: &str = "x-smoke-request-id";
/// Inbound/outbound header carrying the caller's trace id.
pub const TRACE_ID_HEADER: &str = "x-smoke-trace-id";

/// Mints fresh, monotonic-unique internal request ids.
///
/// Ids are `<uuid-v4-base>-<8-hex counter>`: globally fresh through the
/// per-process base, monotonic through the counter.
#[derive(Debug)]
pub struct RequestIdMinter {
    base: String,
    counter: AtomicU64,
}

impl RequestIdMinter {
    pub fn new() -> Self {
        Self {
            base: Uuid::new_v4().to_string(),
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the next id. Never repeats within a process.
    pub fn mint(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n:08x}", self.base)
    }
}

impl Default for RequestIdMinter {
    fn default() -> Self {
        Self::new()
    }
}

/// The bucket a request's counts and latencies are published under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReportingCategory {
    /// The hard-coded `/ping` shortcut.
    Ping,
    /// Router miss: no operation for (path, method).
    UnknownOperation,
    /// Selection failed for a reason other than a plain miss.
    ErrorDeterminingOperation,
    /// A selected operation, by its stable name.
    Operation(String),
}

impl fmt::Display for ReportingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => f.write_str("ping"),
            Self::UnknownOperation => f.write_str("unknownOperation"),
            Self::ErrorDeterminingOperation => f.write_str("errorDeterminingOperation"),
            Self::Operation(name) => f.write_str(name),
        }
    }
}

/// The sink the framework publishes counters and latency samples into.
///
/// Implementations are supplied by the embedding process; the default
/// discards everything.
pub trait MetricsSink: Send + Sync {
    /// One request finished under `category`; `success` is the outcome.
    fn record_count(&self, category: &ReportingCategory, success: bool);

    /// Wall-clock latency of one request under `category`.
    fn record_latency(&self, category: &ReportingCategory, elapsed: Duration);
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_count(&self, _category: &ReportingCategory, _success: bool) {}
    fn record_latency(&self, _category: &ReportingCategory, _elapsed: Duration) {}
}

/// Flags gating which samples are emitted, per category.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReportingConfiguration {
    pub report_counts: bool,
    pub report_latencies: bool,
    pub report_ping: bool,
    pub report_unknown_operation: bool,
    pub report_error_determining_operation: bool,
}

impl Default for ReportingConfiguration {
    fn default() -> Self {
        Self {
            report_counts: true,
            report_latencies: true,
            report_ping: true,
            report_unknown_operation: true,
            report_error_determining_operation: true,
        }
    }
}

impl ReportingConfiguration {
    fn category_enabled(&self, category: &ReportingCategory) -> bool {
        match category {
            ReportingCategory::Ping => self.report_ping,
            ReportingCategory::UnknownOperation => self.report_unknown_operation,
            ReportingCategory::ErrorDeterminingOperation => {
                self.report_error_determining_operation
            }
            ReportingCategory::Operation(_) => true,
        }
    }

    /// Publishes one finished request through `sink`, honouring the flags.
    pub fn publish(
        &self,
        sink: &dyn MetricsSink,
        category: &ReportingCategory,
        success: bool,
        elapsed: Duration,
    ) {
        if !self.category_enabled(category) {
            return;
        }
        if self.report_counts {
            sink.record_count(category, success);
        }
        if self.report_latencies {
            sink.record_latency(category, elapsed);
        }
    }
}

/// Builds the per-request server span, recording the request attributes and
/// surfacing any caller-supplied correlation headers.
///
/// With tracing disabled this returns a disabled span so downstream
/// recording is free.
pub fn request_span(server_name: &str, head: &RequestHead, enabled: bool) -> Span {
    if !enabled {
        return Span::none();
    }

    let span = tracing::info_span!(
        "server_request",
        server = %server_name,
        http.method = %head.method,
        http.target = %head.uri,
        http.flavor = %head.version,
        http.user_agent = field::Empty,
        http.request_content_length = field::Empty,
        http.status_code = field::Empty,
        http.response_content_length = field::Empty,
        status = field::Empty,
        error.message = field::Empty,
        caller_request_id = field::Empty,
        trace_id = field::Empty,
    );

    if let Some(agent) = head.headers.get("user-agent") {
        span.record("http.user_agent", agent);
    }
    if let Some(len) = head.content_length() {
        span.record("http.request_content_length", len as u64);
    }
    if let Some(caller_id) = head.headers.get(REQUEST_ID_HEADER) {
        span.record("caller_request_id", caller_id);
    }
    if let Some(trace_id) = head.headers.get(TRACE_ID_HEADER) {
        span.record("trace_id", trace_id);
    }
    span
}

/// Records the completion attributes on a request span.
pub fn record_completion(span: &Span, status: u16, response_content_length: usize) {
    span.record("http.status_code", status);
    span.record("http.response_content_length", response_content_length as u64);
}

/// Records failure attributes on a request span.
pub fn record_failure(span: &Span, error: &dyn fmt::Display) {
    span.record("status", "error");
    span.record("error.message", tracing::field::display(error));
}
