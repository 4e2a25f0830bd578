//! Lightweight in-process APM: request tracing exported as OTLP/HTTP JSON, and
//! remote-controlled live breakpoints that capture local variables on demand.
//!
//! # Architecture
//!
//! - [`sanitizer`]: bounded, failure-proof conversion of captured values to JSON
//! - [`span`]: span data model
//! - [`exporter`]: OTLP JSON export over HTTP
//! - [`engine`]: per-request span lifecycle ([`TraceEngine`])
//! - [`propagation`]: W3C `traceparent` handling
//! - [`breakpoints`]: breakpoint descriptors, cache, location matching and poller
//! - [`control_plane`]: breakpoint control plane client
//! - [`snapshot`]: capture orchestration and the [`snapshot!`] macro
//! - [`request`]: request context attached to snapshots
//! - [`apm`]: the [`Apm`] facade and logging setup
//!
//! # Quick Start
//!
//! ```no_run
//! use otel_apm_lite::{snapshot, span::{attributes, SpanStatus}, Apm, ApmConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     otel_apm_lite::init_logging(None);
//!     let apm = Apm::start(ApmConfig::from_env());
//!
//!     let mut engine = apm.engine();
//!     let root = engine.start_trace("GET /orders/42", attributes([("http.method", "GET")]));
//!
//!     let order_id = 42;
//!     snapshot!(apm, "lookup", { "order_id" => order_id }).await;
//!
//!     engine.end_span(root, attributes([("http.status_code", 200)]), SpanStatus::Ok);
//!     engine.flush().await;
//!     apm.shutdown().await;
//! }
//! ```
//!
//! # Failure model
//!
//! Nothing here returns an error to the host. Network calls are bounded by a
//! timeout, and failures are logged through `tracing` at warn level and dropped.
//! Without an API key, or with `APM_ENABLED=false`, every component is a no-op.

pub mod apm;
pub mod breakpoints;
pub mod config;
pub mod constants;
pub mod control_plane;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod propagation;
pub mod request;
pub mod sanitizer;
pub mod snapshot;
pub mod span;
pub mod stack;

pub use apm::{init_logging, Apm};
pub use breakpoints::{BreakpointCache, BreakpointDescriptor, LocationKey};
pub use config::{ApmConfig, RouteFilter};
pub use control_plane::{ControlPlane, HttpControlPlane};
pub use engine::TraceEngine;
pub use error::{ApmError, Result};
pub use exporter::{HttpSpanExporter, NoopExporter, SpanExporter};
pub use propagation::TraceParent;
pub use request::RequestContext;
pub use sanitizer::{Sanitizer, Variable, Variables};
pub use snapshot::{CaptureOutcome, Snapshot, SnapshotCapture};
pub use span::{AttributeValue, Attributes, SpanHandle, SpanKind, SpanStatus};
pub use stack::{CallSite, ExceptionInfo};

#[cfg(doctest)]
#[macro_use]
extern crate doc_comment;

#[cfg(doctest)]
use doc_comment::doctest;

#[cfg(doctest)]
doctest!("../README.md", readme);
