//! W3C Trace Context propagation.
//!
//! Parses and renders the `traceparent` header
//! (`00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`) using the
//! OpenTelemetry `TraceContextPropagator`, so inbound SERVER spans can join a
//! remote trace and outbound CLIENT calls can carry the current span onward.

use crate::constants::TRACEPARENT_HEADER;
use crate::span::{SpanId, TraceId};
use opentelemetry::{
    propagation::TextMapPropagator,
    trace::{SpanContext, TraceContextExt, TraceFlags, TraceState},
    Context,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;

/// Remote parent extracted from a `traceparent` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub sampled: bool,
}

impl TraceParent {
    /// Parses a single `traceparent` value. Returns `None` for malformed or all-zero ids.
    pub fn parse(value: &str) -> Option<Self> {
        let carrier = HashMap::from([(TRACEPARENT_HEADER.to_string(), value.trim().to_string())]);
        extract(&carrier)
    }

    /// Renders the header value.
    pub fn to_header_value(&self) -> String {
        let flags = if self.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, flags.to_u8())
    }
}

/// Extracts a remote parent from a header carrier. Header names are matched case-insensitively.
pub fn extract(headers: &HashMap<String, String>) -> Option<TraceParent> {
    let carrier: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect();

    let cx = TraceContextPropagator::new().extract(&carrier);
    let span = cx.span();
    let span_context = span.span_context();
    if !span_context.is_valid() {
        return None;
    }
    Some(TraceParent {
        trace_id: span_context.trace_id(),
        span_id: span_context.span_id(),
        sampled: span_context.is_sampled(),
    })
}

/// Writes `traceparent` for the given span into a header carrier.
pub fn inject(parent: &TraceParent, headers: &mut HashMap<String, String>) {
    let flags = if parent.sampled {
        TraceFlags::SAMPLED
    } else {
        TraceFlags::default()
    };
    let span_context = SpanContext::new(
        parent.trace_id,
        parent.span_id,
        flags,
        false,
        TraceState::default(),
    );
    let cx = Context::new().with_remote_span_context(span_context);
    TraceContextPropagator::new().inject_context(&cx, headers);
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_parse_valid_header() {
        let parent = TraceParent::parse(HEADER).unwrap();
        assert_eq!(
            parent.trace_id,
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert_eq!(parent.span_id, SpanId::from_hex("00f067aa0ba902b7").unwrap());
        assert!(parent.sampled);
        assert_eq!(parent.to_header_value(), HEADER);
    }

    #[test]
    fn test_parse_unsampled() {
        let parent =
            TraceParent::parse("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00").unwrap();
        assert!(!parent.sampled);
        assert!(parent.to_header_value().ends_with("-00"));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(TraceParent::parse("").is_none());
        assert!(TraceParent::parse("garbage").is_none());
        assert!(
            TraceParent::parse("00-00000000000000000000000000000000-00f067aa0ba902b7-01").is_none()
        );
        assert!(TraceParent::parse("00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01").is_none());
    }

    #[test]
    fn test_extract_is_case_insensitive() {
        let headers = HashMap::from([("Traceparent".to_string(), HEADER.to_string())]);
        assert!(extract(&headers).is_some());
        assert!(extract(&HashMap::new()).is_none());
    }

    #[test]
    fn test_inject() {
        let parent = TraceParent::parse(HEADER).unwrap();
        let mut headers = HashMap::new();
        inject(&parent, &mut headers);
        assert_eq!(headers.get("traceparent").map(String::as_str), Some(HEADER));
    }
}
