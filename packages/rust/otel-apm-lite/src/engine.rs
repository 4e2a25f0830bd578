//! Span lifecycle: start, annotate, end and flush.
//!
//! A [`TraceEngine`] belongs to one in-flight request or job. It is not shared
//! between threads; hosts running several workers create one engine per worker
//! (see [`Apm::engine`](crate::Apm::engine)).
//!
//! # Lifecycle
//!
//! 1. [`start_trace`](TraceEngine::start_trace) (or
//!    [`start_trace_with_parent`](TraceEngine::start_trace_with_parent) for inbound
//!    requests) creates the trace id and the root SERVER span.
//! 2. [`start_span`](TraceEngine::start_span) opens child spans under the current
//!    active span. Without a trace it transparently starts one.
//! 3. [`end_span`](TraceEngine::end_span) closes a span. Unknown or already-ended
//!    handles are ignored.
//! 4. [`flush`](TraceEngine::flush) hands every held span to the exporter and resets
//!    the engine, whether or not the export succeeded.
//!
//! ```no_run
//! use otel_apm_lite::{span::{attributes, SpanStatus}, NoopExporter, TraceEngine};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let mut engine = TraceEngine::builder().exporter(Arc::new(NoopExporter)).build();
//! let root = engine.start_trace("GET /orders", attributes([("http.method", "GET")]));
//! let query = engine.start_span("db.query", attributes([("db.system", "postgresql")]));
//! engine.end_span(query, Default::default(), SpanStatus::Ok);
//! engine.end_span(root, attributes([("http.status_code", 200)]), SpanStatus::Ok);
//! engine.flush().await;
//! # }
//! ```

use crate::constants::attributes as attr_keys;
use crate::error::log_failure;
use crate::exporter::SpanExporter;
use crate::propagation::TraceParent;
use crate::span::{
    new_trace_id, AttributeValue, Attributes, SpanEvent, SpanHandle, SpanId, SpanKind, SpanRecord,
    SpanStatus, TraceId,
};
use crate::stack::ExceptionInfo;
use bon::bon;
use indexmap::IndexMap;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

/// Owns the spans of one trace until they are flushed.
#[derive(Debug)]
pub struct TraceEngine {
    exporter: Arc<dyn SpanExporter>,
    sample_rate: f64,
    slow_threshold: Duration,
    trace_id: Option<TraceId>,
    root_span_id: Option<SpanId>,
    sampled: bool,
    spans: IndexMap<SpanId, SpanRecord>,
    active: Vec<SpanId>,
}

#[bon]
impl TraceEngine {
    /// Creates an engine.
    ///
    /// `sample_rate` defaults to 1.0 (export everything); `slow_threshold`
    /// defaults to zero (no slow flag).
    #[builder]
    pub fn new(
        exporter: Arc<dyn SpanExporter>,
        sample_rate: Option<f64>,
        slow_threshold: Option<Duration>,
    ) -> Self {
        let sample_rate = sample_rate
            .filter(|rate| !rate.is_nan())
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        Self {
            exporter,
            sample_rate,
            slow_threshold: slow_threshold.unwrap_or_default(),
            trace_id: None,
            root_span_id: None,
            sampled: true,
            spans: IndexMap::new(),
            active: Vec::new(),
        }
    }
}

impl TraceEngine {
    /// Starts a new trace with a root SERVER span.
    pub fn start_trace(&mut self, name: impl Into<String>, attributes: Attributes) -> SpanHandle {
        let sampled = self.sample_rate >= 1.0 || rand::random::<f64>() < self.sample_rate;
        self.begin_trace(new_trace_id(), None, sampled, name, attributes)
    }

    /// Starts a trace that continues a remote one described by a `traceparent` header.
    ///
    /// The remote sampling decision is honoured. A missing or malformed header
    /// starts a fresh trace.
    pub fn start_trace_with_parent(
        &mut self,
        name: impl Into<String>,
        attributes: Attributes,
        traceparent: Option<&str>,
    ) -> SpanHandle {
        match traceparent.and_then(TraceParent::parse) {
            Some(parent) => self.begin_trace(
                parent.trace_id,
                Some(parent.span_id),
                parent.sampled,
                name,
                attributes,
            ),
            None => {
                if let Some(value) = traceparent {
                    tracing::debug!(traceparent = value, "Ignoring invalid traceparent header");
                }
                self.start_trace(name, attributes)
            }
        }
    }

    fn begin_trace(
        &mut self,
        trace_id: TraceId,
        remote_parent: Option<SpanId>,
        sampled: bool,
        name: impl Into<String>,
        attributes: Attributes,
    ) -> SpanHandle {
        if self.trace_id.is_some() {
            tracing::debug!("Starting a new trace before the previous one was flushed");
        }
        let root = SpanRecord::new(trace_id, remote_parent, name, SpanKind::Server, attributes);
        let handle = root.handle();
        self.trace_id = Some(trace_id);
        self.root_span_id = Some(root.span_id);
        self.sampled = sampled;
        self.active = vec![root.span_id];
        self.spans.insert(root.span_id, root);
        handle
    }

    /// Starts an INTERNAL span under the current active span (or the root).
    ///
    /// Without an active trace, starts one instead and returns its root span.
    pub fn start_span(&mut self, name: impl Into<String>, attributes: Attributes) -> SpanHandle {
        self.open_span(name, attributes, SpanKind::Internal, None)
    }

    /// Starts a CLIENT span for an outbound call. Pair with [`traceparent`](Self::traceparent).
    pub fn start_client_span(&mut self, name: impl Into<String>, attributes: Attributes) -> SpanHandle {
        self.open_span(name, attributes, SpanKind::Client, None)
    }

    /// Starts an INTERNAL span under an explicit parent. An unknown parent falls
    /// back to the current active span.
    pub fn start_span_with_parent(
        &mut self,
        name: impl Into<String>,
        attributes: Attributes,
        parent: &SpanHandle,
    ) -> SpanHandle {
        let parent_id = self.lookup(parent).map(|span| span.span_id);
        self.open_span(name, attributes, SpanKind::Internal, parent_id)
    }

    fn open_span(
        &mut self,
        name: impl Into<String>,
        attributes: Attributes,
        kind: SpanKind,
        parent: Option<SpanId>,
    ) -> SpanHandle {
        let Some(trace_id) = self.trace_id else {
            return self.start_trace(name, attributes);
        };
        let parent = parent
            .or_else(|| self.active.last().copied())
            .or(self.root_span_id);
        let span = SpanRecord::new(trace_id, parent, name, kind, attributes);
        let handle = span.handle();
        self.active.push(span.span_id);
        self.spans.insert(span.span_id, span);
        handle
    }

    /// Ends a span, merging `attributes` and setting `status`.
    ///
    /// `SpanStatus::Unset` leaves an earlier status (e.g. ERROR from
    /// [`record_exception`](Self::record_exception)) in place. Unknown or already
    /// ended handles are ignored.
    pub fn end_span(&mut self, handle: SpanHandle, attributes: Attributes, status: SpanStatus) {
        let slow_threshold = self.slow_threshold;
        let Some(span) = self.lookup_mut(&handle) else {
            tracing::debug!(span_id = %handle.span_id(), "end_span on unknown span");
            return;
        };
        if span.is_ended() {
            tracing::debug!(span_id = %handle.span_id(), "end_span on already ended span");
            return;
        }

        let now = SystemTime::now();
        span.end_time = Some(now.max(span.start_time));
        span.attributes.extend(attributes);
        if status != SpanStatus::Unset {
            span.status = status;
        }
        if !slow_threshold.is_zero() && span.duration() >= slow_threshold {
            span.attributes
                .insert(attr_keys::SLOW.to_string(), AttributeValue::Bool(true));
        }

        let span_id = span.span_id;
        self.active.retain(|id| *id != span_id);
    }

    /// Merges attributes into a live span.
    pub fn set_attributes(&mut self, handle: &SpanHandle, attributes: Attributes) {
        if let Some(span) = self.lookup_mut(handle) {
            if !span.is_ended() {
                span.attributes.extend(attributes);
            }
        }
    }

    /// Appends an event to a span.
    pub fn add_event(&mut self, handle: &SpanHandle, name: impl Into<String>, attributes: Attributes) {
        if let Some(span) = self.lookup_mut(handle) {
            span.events.push(SpanEvent {
                name: name.into(),
                timestamp: SystemTime::now(),
                attributes,
            });
        }
    }

    /// Marks a span as failed and attaches an `exception` event.
    pub fn record_exception(&mut self, handle: &SpanHandle, exception: &ExceptionInfo) {
        let Some(span) = self.lookup_mut(handle) else {
            return;
        };
        span.status = SpanStatus::Error;
        let mut attributes = Attributes::new();
        attributes.insert(
            attr_keys::EXCEPTION_TYPE.to_string(),
            exception.type_name.clone().into(),
        );
        attributes.insert(
            attr_keys::EXCEPTION_MESSAGE.to_string(),
            exception.message.clone().into(),
        );
        attributes.insert(
            attr_keys::EXCEPTION_STACKTRACE.to_string(),
            exception.stack.clone().into(),
        );
        span.events.push(SpanEvent {
            name: "exception".to_string(),
            timestamp: SystemTime::now(),
            attributes,
        });
    }

    /// The `traceparent` header value for propagating `handle` to a downstream call.
    pub fn traceparent(&self, handle: &SpanHandle) -> Option<String> {
        self.lookup(handle).map(|span| {
            TraceParent {
                trace_id: span.trace_id,
                span_id: span.span_id,
                sampled: self.sampled,
            }
            .to_header_value()
        })
    }

    /// The innermost span that has been started and not yet ended.
    pub fn current_span(&self) -> Option<SpanHandle> {
        self.active
            .last()
            .and_then(|id| self.spans.get(id))
            .map(SpanRecord::handle)
    }

    pub fn root_span(&self) -> Option<SpanHandle> {
        self.root_span_id
            .and_then(|id| self.spans.get(&id))
            .map(SpanRecord::handle)
    }

    pub fn trace_id(&self) -> Option<TraceId> {
        self.trace_id
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Read access to a held span.
    pub fn span(&self, handle: &SpanHandle) -> Option<&SpanRecord> {
        self.lookup(handle)
    }

    /// Number of spans currently held.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Exports every held span and resets the engine.
    ///
    /// Unended spans are closed at the current time. State is cleared before the
    /// export runs, so a failed export never leaks into the next trace. Unsampled
    /// traces are dropped without exporting.
    pub async fn flush(&mut self) {
        let spans = std::mem::take(&mut self.spans);
        let sampled = self.sampled;
        self.active.clear();
        self.trace_id = None;
        self.root_span_id = None;
        self.sampled = true;

        if spans.is_empty() {
            return;
        }
        if !sampled {
            tracing::debug!(spans = spans.len(), "Dropping unsampled trace");
            return;
        }

        let now = SystemTime::now();
        let batch: Vec<SpanRecord> = spans
            .into_values()
            .map(|mut span| {
                if span.end_time.is_none() {
                    span.end_time = Some(now.max(span.start_time));
                }
                span
            })
            .collect();

        log_failure("export", self.exporter.export(batch).await);
    }

    fn lookup(&self, handle: &SpanHandle) -> Option<&SpanRecord> {
        self.spans
            .get(&handle.span_id())
            .filter(|span| span.trace_id == handle.trace_id())
    }

    fn lookup_mut(&mut self, handle: &SpanHandle) -> Option<&mut SpanRecord> {
        self.spans
            .get_mut(&handle.span_id())
            .filter(|span| span.trace_id == handle.trace_id())
    }
}
