//! Span data model: ids, kinds, status, attributes and events.
//!
//! These are plain data types with no I/O. A [`SpanRecord`] is owned by the
//! [`TraceEngine`](crate::TraceEngine) that started it until the engine hands it
//! to an exporter on flush.

use indexmap::IndexMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use opentelemetry::trace::{SpanId, TraceId};

/// Ordered attribute map. Insertion order is preserved through to the wire format.
pub type Attributes = IndexMap<String, AttributeValue>;

/// Builds an [`Attributes`] map from key/value pairs.
///
/// ```
/// use otel_apm_lite::span::{attributes, AttributeValue};
///
/// let attrs = attributes([("http.method", "GET")]);
/// assert_eq!(attrs["http.method"], AttributeValue::from("GET"));
/// ```
pub fn attributes<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Attributes
where
    K: Into<String>,
    V: Into<AttributeValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Generates a random, valid (non-zero) 16-byte trace id.
pub fn new_trace_id() -> TraceId {
    loop {
        let id = TraceId::from_bytes(rand::random::<[u8; 16]>());
        if id != TraceId::INVALID {
            return id;
        }
    }
}

/// Generates a random, valid (non-zero) 8-byte span id.
pub fn new_span_id() -> SpanId {
    loop {
        let id = SpanId::from_bytes(rand::random::<[u8; 8]>());
        if id != SpanId::INVALID {
            return id;
        }
    }
}

/// Nanoseconds since the Unix epoch; times before the epoch clamp to zero.
pub fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Server,
    Client,
    Internal,
}

impl SpanKind {
    /// OTLP `SpanKind` enum value.
    pub fn otlp_code(self) -> i32 {
        match self {
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    /// OTLP `Status.code` value: UNSET=0, OK=1, ERROR=2.
    pub fn otlp_code(self) -> i32 {
        match self {
            SpanStatus::Unset => 0,
            SpanStatus::Ok => 1,
            SpanStatus::Error => 2,
        }
    }
}

/// A span attribute value: a scalar or an array of strings.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    StringArray(Vec<String>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(value.into())
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Int(value.into())
    }
}

impl From<u16> for AttributeValue {
    fn from(value: u16) -> Self {
        AttributeValue::Int(value.into())
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        AttributeValue::StringArray(value)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(value: Vec<&str>) -> Self {
        AttributeValue::StringArray(value.into_iter().map(str::to_string).collect())
    }
}

/// A timestamped annotation on a span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: SystemTime,
    pub attributes: Attributes,
}

/// One timed unit of work within a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub attributes: Attributes,
    pub status: SpanStatus,
    pub events: Vec<SpanEvent>,
}

impl SpanRecord {
    pub(crate) fn new(
        trace_id: TraceId,
        parent_span_id: Option<SpanId>,
        name: impl Into<String>,
        kind: SpanKind,
        attributes: Attributes,
    ) -> Self {
        Self {
            trace_id,
            span_id: new_span_id(),
            parent_span_id,
            name: name.into(),
            kind,
            start_time: SystemTime::now(),
            end_time: None,
            attributes,
            status: SpanStatus::Unset,
            events: Vec::new(),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    /// Elapsed time between start and end, or zero for unended spans.
    pub fn duration(&self) -> Duration {
        self.end_time
            .and_then(|end| end.duration_since(self.start_time).ok())
            .unwrap_or_default()
    }

    pub fn handle(&self) -> SpanHandle {
        SpanHandle {
            trace_id: self.trace_id,
            span_id: self.span_id,
        }
    }
}

/// Opaque reference to a span held by a [`TraceEngine`](crate::TraceEngine).
///
/// Handles outlive the span they point to; operations on a stale handle are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanHandle {
    trace_id: TraceId,
    span_id: SpanId,
}

impl SpanHandle {
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_valid_and_distinct() {
        let a = new_trace_id();
        let b = new_trace_id();
        assert_ne!(a, TraceId::INVALID);
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 32);
        assert_eq!(new_span_id().to_string().len(), 16);
    }

    #[test]
    fn test_otlp_codes() {
        assert_eq!(SpanStatus::Unset.otlp_code(), 0);
        assert_eq!(SpanStatus::Ok.otlp_code(), 1);
        assert_eq!(SpanStatus::Error.otlp_code(), 2);
        assert_eq!(SpanKind::Internal.otlp_code(), 1);
        assert_eq!(SpanKind::Server.otlp_code(), 2);
        assert_eq!(SpanKind::Client.otlp_code(), 3);
    }

    #[test]
    fn test_attributes_preserve_order() {
        let attrs = attributes([("b", 1), ("a", 2), ("c", 3)]);
        let keys: Vec<_> = attrs.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_duration_of_unended_span_is_zero() {
        let span = SpanRecord::new(new_trace_id(), None, "op", SpanKind::Internal, Attributes::new());
        assert!(!span.is_ended());
        assert_eq!(span.duration(), Duration::ZERO);
    }
}
