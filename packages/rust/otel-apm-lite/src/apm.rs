//! Agent facade: wires configuration, exporters, the breakpoint cache and poller,
//! and snapshot capture into one handle the host application keeps for its
//! lifetime.
//!
//! ```no_run
//! use otel_apm_lite::{span::{attributes, SpanStatus}, Apm, ApmConfig};
//!
//! # async fn example() {
//! otel_apm_lite::init_logging(None);
//! let apm = Apm::start(ApmConfig::from_env());
//!
//! if apm.should_trace("/orders") {
//!     let mut engine = apm.engine();
//!     let root = engine.start_trace("GET /orders", attributes([("http.method", "GET")]));
//!     engine.end_span(root, attributes([("http.status_code", 200)]), SpanStatus::Ok);
//!     engine.flush().await;
//! }
//!
//! apm.shutdown().await;
//! # }
//! ```

use crate::breakpoints::{start_poller, BreakpointCache, PollerHandle};
use crate::config::{ApmConfig, RouteFilter};
use crate::constants::env_vars;
use crate::control_plane::{ControlPlane, DisabledControlPlane, HttpControlPlane};
use crate::engine::TraceEngine;
use crate::error::log_failure;
use crate::exporter::{HttpSpanExporter, NoopExporter, SpanExporter};
use crate::request::RequestContext;
use crate::sanitizer::{Sanitizer, Variables};
use crate::snapshot::{CaptureOutcome, SnapshotCapture};
use crate::stack::CallSite;
use parking_lot::Mutex;
use std::{env, sync::Arc};
use tracing_subscriber::layer::SubscriberExt;

/// The running agent.
///
/// When the configuration is inactive (disabled, or no API key) every part is
/// built in no-op mode: no poller runs, engines export nothing and captures
/// are skipped.
#[derive(Debug)]
pub struct Apm {
    config: ApmConfig,
    active: bool,
    exporter: Arc<dyn SpanExporter>,
    snapshots: SnapshotCapture,
    route_filter: RouteFilter,
    poller: Mutex<Option<PollerHandle>>,
}

impl Apm {
    /// Builds the agent and, when snapshots are enabled, starts the breakpoint
    /// poller on the current tokio runtime.
    pub fn start(config: ApmConfig) -> Self {
        let active = config.is_active();
        let api_key = config.api_key.clone().unwrap_or_default();

        let exporter: Arc<dyn SpanExporter> = if active && config.traces_enabled {
            let exporter = HttpSpanExporter::builder()
                .endpoint(config.endpoint.clone())
                .api_key(api_key.clone())
                .service_name(config.service_name.clone())
                .timeout(config.request_timeout)
                .build();
            match log_failure("exporter setup", exporter) {
                Some(exporter) => Arc::new(exporter),
                None => Arc::new(NoopExporter),
            }
        } else {
            Arc::new(NoopExporter)
        };

        let snapshots_on = active && config.snapshots_enabled;
        let control_plane: Arc<dyn ControlPlane> = if snapshots_on {
            let control_plane = HttpControlPlane::builder()
                .endpoint(config.endpoint.clone())
                .api_key(api_key)
                .timeout(config.request_timeout)
                .build();
            match log_failure("control plane setup", control_plane) {
                Some(control_plane) => Arc::new(control_plane),
                None => Arc::new(DisabledControlPlane),
            }
        } else {
            Arc::new(DisabledControlPlane)
        };

        let cache = Arc::new(BreakpointCache::new(
            config.breakpoint_ttl,
            config.registration_ttl,
        ));

        let poller = if snapshots_on {
            match tokio::runtime::Handle::try_current() {
                Ok(_) => Some(start_poller(
                    Arc::clone(&control_plane),
                    Arc::clone(&cache),
                    config.service_name.clone(),
                    config.poll_interval,
                )),
                Err(e) => {
                    tracing::warn!(error = %e, "No tokio runtime, breakpoint poller not started");
                    None
                }
            }
        } else {
            None
        };

        let snapshots = SnapshotCapture::builder()
            .control_plane(control_plane)
            .cache(cache)
            .service_name(config.service_name.clone())
            .sanitizer(Sanitizer::new(config.max_depth, config.max_string_length))
            .enabled(snapshots_on)
            .build();

        if active {
            tracing::info!(
                service = %config.service_name,
                endpoint = %config.endpoint,
                traces = config.traces_enabled,
                snapshots = config.snapshots_enabled,
                "APM agent started"
            );
        } else {
            tracing::debug!("APM agent inactive");
        }

        Self {
            route_filter: config.route_filter(),
            config,
            active,
            exporter,
            snapshots,
            poller: Mutex::new(poller),
        }
    }

    pub fn config(&self) -> &ApmConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// A fresh engine for one request or job.
    pub fn engine(&self) -> TraceEngine {
        TraceEngine::builder()
            .exporter(Arc::clone(&self.exporter))
            .sample_rate(self.config.effective_sample_rate())
            .slow_threshold(self.config.slow_threshold)
            .build()
    }

    /// Whether a request to `path` should be traced at all.
    pub fn should_trace(&self, path: &str) -> bool {
        self.active && self.config.traces_enabled && self.route_filter.should_trace(path)
    }

    pub fn snapshots(&self) -> &SnapshotCapture {
        &self.snapshots
    }

    /// See [`SnapshotCapture::capture`]. Usually invoked through [`snapshot!`](crate::snapshot).
    pub async fn capture(
        &self,
        site: CallSite,
        context: Option<RequestContext>,
        label: Option<&str>,
        variables: &Variables,
    ) -> CaptureOutcome {
        self.snapshots.capture(site, context, label, variables).await
    }

    /// See [`SnapshotCapture::capture_at`].
    pub async fn capture_at(
        &self,
        file: &str,
        line: u32,
        context: Option<RequestContext>,
        variables: &Variables,
    ) -> CaptureOutcome {
        self.snapshots.capture_at(file, line, context, variables).await
    }

    /// Waits for snapshot submissions in flight, stops the poller and drops
    /// cached breakpoint state.
    pub async fn shutdown(&self) {
        self.snapshots.drain().await;
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.shutdown().await;
        }
        self.snapshots.cache().clear();
    }
}

/// Installs a global `tracing` subscriber for the agent's own logs.
///
/// The filter is read from `env_var_name`, else `RUST_LOG` when set, else
/// `APM_LOG_LEVEL`. Output is JSON when `APM_LOG_FORMAT=json`. Returns false if
/// a global subscriber was already installed.
pub fn init_logging(env_var_name: Option<&str>) -> bool {
    let env_var_name = env_var_name.unwrap_or_else(|| {
        if env::var("RUST_LOG").is_ok() {
            "RUST_LOG"
        } else {
            env_vars::LOG_LEVEL
        }
    });

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var(env_var_name)
        .from_env_lossy();

    let subscriber = tracing_subscriber::registry::Registry::default().with(env_filter);

    let is_json = env::var(env_vars::LOG_FORMAT)
        .unwrap_or_default()
        .eq_ignore_ascii_case("json");

    let result = if is_json {
        tracing::subscriber::set_global_default(
            subscriber.with(tracing_subscriber::fmt::layer().with_target(false).json()),
        )
    } else {
        tracing::subscriber::set_global_default(
            subscriber.with(tracing_subscriber::fmt::layer().with_target(false).with_ansi(false)),
        )
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{Attributes, SpanStatus};
    use crate::snapshot::SkipReason;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(Some("APM_TEST_LOG"));
        assert!(!init_logging(Some("APM_TEST_LOG")));
    }

    #[tokio::test]
    async fn test_inactive_agent_is_noop() {
        let apm = Apm::start(ApmConfig::builder().build());
        assert!(!apm.is_active());
        assert!(!apm.should_trace("/orders"));

        let mut engine = apm.engine();
        let root = engine.start_trace("GET /", Attributes::new());
        engine.end_span(root, Attributes::new(), SpanStatus::Ok);
        engine.flush().await;

        let outcome = crate::snapshot!(apm, { "x" => 1 }).await;
        assert_eq!(outcome, CaptureOutcome::Skipped(SkipReason::Inactive));
        apm.shutdown().await;
    }

    #[tokio::test]
    async fn test_should_trace_respects_ignored_routes() {
        let config = ApmConfig::builder()
            .api_key("k")
            .endpoint("http://127.0.0.1:9")
            .snapshots_enabled(false)
            .build();
        let apm = Apm::start(config);
        assert!(apm.should_trace("/orders"));
        assert!(!apm.should_trace("/health"));
        assert!(!apm.should_trace("/telescope/requests"));

        let apm = Apm::start(
            ApmConfig::builder()
                .api_key("k")
                .traces_enabled(false)
                .snapshots_enabled(false)
                .build(),
        );
        assert!(!apm.should_trace("/orders"));
    }

    #[tokio::test]
    async fn test_active_agent_polls_and_exports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/snapshots/active/checkout"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"breakpoints": []})))
            .expect(1..)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/traces"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let apm = Apm::start(
            ApmConfig::builder()
                .api_key("k")
                .endpoint(server.uri())
                .service_name("checkout")
                .poll_interval(Duration::from_secs(60))
                .build(),
        );

        let mut engine = apm.engine();
        let root = engine.start_trace("GET /orders", Attributes::new());
        engine.end_span(root, Attributes::new(), SpanStatus::Ok);
        engine.flush().await;

        for _ in 0..50 {
            if apm.snapshots().cache().active("checkout").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(apm.snapshots().cache().active("checkout").is_some());

        apm.shutdown().await;
        assert!(apm.snapshots().cache().active("checkout").is_none());
    }
}
