//! OTLP/HTTP JSON span export.
//!
//! A batch of finished spans is converted into a single `resourceSpans` envelope
//! (one resource carrying `service.name`, one instrumentation scope) and POSTed to
//! `{endpoint}/v1/traces` with the `X-API-Key` header.
//!
//! # Output Format
//!
//! ```json
//! {
//!   "resourceSpans": [{
//!     "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "checkout"}}]},
//!     "scopeSpans": [{
//!       "scope": {"name": "otel-apm-lite", "version": "0.1.0"},
//!       "spans": [{
//!         "traceId": "...", "spanId": "...", "name": "GET /orders", "kind": 2,
//!         "startTimeUnixNano": "...", "endTimeUnixNano": "...",
//!         "attributes": [], "status": {"code": 0}, "events": []
//!       }]
//!     }]
//!   }]
//! }
//! ```

use crate::constants::{attributes as attr_keys, routes, API_KEY_HEADER, SCOPE_NAME, SCOPE_VERSION};
use crate::error::{ApmError, Result};
use crate::span::{unix_nanos, AttributeValue, Attributes, SpanEvent, SpanRecord};
use async_trait::async_trait;
use bon::bon;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client as ReqwestClient,
};
use serde::Serialize;
use std::{fmt::Debug, time::Duration};

/// Ships batches of spans somewhere.
///
/// Implementations return errors; callers decide how to report them. The
/// [`TraceEngine`](crate::TraceEngine) logs and drops them.
#[async_trait]
pub trait SpanExporter: Send + Sync + Debug {
    async fn export(&self, batch: Vec<SpanRecord>) -> Result<()>;
}

/// Exporter used when the agent is inactive. Accepts and drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

#[async_trait]
impl SpanExporter for NoopExporter {
    async fn export(&self, _batch: Vec<SpanRecord>) -> Result<()> {
        Ok(())
    }
}

/// Exporter that POSTs OTLP JSON to the backend.
#[derive(Debug, Clone)]
pub struct HttpSpanExporter {
    client: ReqwestClient,
    url: String,
    headers: HeaderMap,
    service_name: String,
}

#[bon]
impl HttpSpanExporter {
    /// Creates an exporter for `{endpoint}/v1/traces`.
    ///
    /// A client is built with `timeout` (default 5s) unless one is supplied.
    #[builder]
    pub fn new(
        #[builder(into)] endpoint: String,
        #[builder(into)] api_key: String,
        #[builder(into)] service_name: String,
        client: Option<ReqwestClient>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let client = match client {
            Some(client) => client,
            None => ReqwestClient::builder()
                .timeout(timeout.unwrap_or(crate::constants::defaults::REQUEST_TIMEOUT))
                .build()?,
        };
        let mut api_key = HeaderValue::from_str(&api_key)?;
        api_key.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(API_KEY_HEADER, api_key);
        Ok(Self {
            client,
            url: format!("{}{}", endpoint.trim_end_matches('/'), routes::TRACES),
            headers,
            service_name,
        })
    }
}

#[async_trait]
impl SpanExporter for HttpSpanExporter {
    async fn export(&self, batch: Vec<SpanRecord>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let request = build_request(&self.service_name, &batch);
        let body = serde_json::to_vec(&request)?;

        tracing::debug!(url = %self.url, spans = batch.len(), "Exporting spans");
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Could not read response body".to_string());
            return Err(ApmError::Status {
                endpoint: self.url.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceRequest {
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    pub resource: Resource,
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ScopeSpans {
    pub scope: InstrumentationScope,
    pub spans: Vec<OtlpSpan>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSpan {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: i32,
    pub start_time_unix_nano: String,
    pub end_time_unix_nano: String,
    pub attributes: Vec<KeyValue>,
    pub status: Status,
    pub events: Vec<OtlpEvent>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OtlpEvent {
    pub name: String,
    pub time_unix_nano: String,
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Status {
    pub code: i32,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

/// OTLP `AnyValue`. 64-bit integers are carried as strings, per the protobuf JSON mapping.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue {
    StringValue(String),
    IntValue(String),
    DoubleValue(f64),
    BoolValue(bool),
}

impl From<&AttributeValue> for AnyValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => AnyValue::StringValue(s.clone()),
            AttributeValue::Int(i) => AnyValue::IntValue(i.to_string()),
            AttributeValue::Double(f) if f.is_finite() => AnyValue::DoubleValue(*f),
            AttributeValue::Double(f) => AnyValue::StringValue(f.to_string()),
            AttributeValue::Bool(b) => AnyValue::BoolValue(*b),
            // string arrays travel as their JSON text
            AttributeValue::StringArray(items) => {
                AnyValue::StringValue(serde_json::to_string(items).unwrap_or_default())
            }
        }
    }
}

fn convert_attributes(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.into(),
        })
        .collect()
}

fn convert_event(event: &SpanEvent) -> OtlpEvent {
    OtlpEvent {
        name: event.name.clone(),
        time_unix_nano: unix_nanos(event.timestamp).to_string(),
        attributes: convert_attributes(&event.attributes),
    }
}

fn convert_span(span: &SpanRecord) -> OtlpSpan {
    let end_time = span.end_time.unwrap_or(span.start_time);
    OtlpSpan {
        trace_id: span.trace_id.to_string(),
        span_id: span.span_id.to_string(),
        parent_span_id: span.parent_span_id.map(|id| id.to_string()),
        name: span.name.clone(),
        kind: span.kind.otlp_code(),
        start_time_unix_nano: unix_nanos(span.start_time).to_string(),
        end_time_unix_nano: unix_nanos(end_time).to_string(),
        attributes: convert_attributes(&span.attributes),
        status: Status {
            code: span.status.otlp_code(),
        },
        events: span.events.iter().map(convert_event).collect(),
    }
}

/// Builds the wire envelope for a batch: one resource, one scope, all spans.
pub fn build_request(service_name: &str, spans: &[SpanRecord]) -> ExportTraceRequest {
    ExportTraceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Resource {
                attributes: vec![KeyValue {
                    key: attr_keys::SERVICE_NAME.to_string(),
                    value: AnyValue::StringValue(service_name.to_string()),
                }],
            },
            scope_spans: vec![ScopeSpans {
                scope: InstrumentationScope {
                    name: SCOPE_NAME.to_string(),
                    version: SCOPE_VERSION.to_string(),
                },
                spans: spans.iter().map(convert_span).collect(),
            }],
        }],
    }
}
