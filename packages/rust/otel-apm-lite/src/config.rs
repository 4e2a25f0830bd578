//! Agent configuration.
//!
//! [`ApmConfig`] is built either programmatically through its builder or from the
//! process environment with [`ApmConfig::from_env`]. Every field has a default, so
//! an empty environment yields a valid (but inactive, since there is no API key)
//! configuration.
//!
//! # Environment Variables
//!
//! - `APM_ENABLED`: master switch (default: true)
//! - `APM_API_KEY`: API key; the agent is inactive without one
//! - `APM_ENDPOINT`: backend base URL (default: `http://localhost:4318`)
//! - `APM_SERVICE_NAME` / `OTEL_SERVICE_NAME`: service name
//! - `APM_SAMPLE_RATE`: fraction of traces exported (default: 1.0)
//! - `APM_TRACES_ENABLED`, `APM_SNAPSHOTS_ENABLED`: feature toggles
//! - `APM_IGNORED_ROUTES`: comma-separated route globs
//! - `APM_SLOW_THRESHOLD_MS`: slow span threshold (default: 1000)
//! - `APM_SNAPSHOT_POLL_INTERVAL`: breakpoint poll interval in seconds (default: 10)
//! - `APM_SNAPSHOT_MAX_DEPTH`, `APM_SNAPSHOT_MAX_STRING_LENGTH`: sanitizer bounds
//! - `APM_BREAKPOINT_TTL`, `APM_REGISTRATION_TTL`: cache TTLs in seconds
//! - `APM_REQUEST_TIMEOUT_MS`: outbound request timeout (default: 5000)
//!
//! ```
//! use otel_apm_lite::ApmConfig;
//!
//! let config = ApmConfig::builder()
//!     .api_key("secret")
//!     .service_name("checkout")
//!     .sample_rate(0.25)
//!     .build();
//! assert!(config.is_active());
//! ```

use crate::constants::{defaults, env_vars};
use bon::Builder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::{env, str::FromStr, time::Duration};

/// Configuration for the APM agent.
#[derive(Builder, Debug, Clone)]
pub struct ApmConfig {
    /// Master switch. When false every component is a no-op.
    #[builder(default = defaults::ENABLED)]
    pub enabled: bool,

    /// Static API key sent as `X-API-Key`.
    #[builder(into)]
    pub api_key: Option<String>,

    /// Base URL of the backend. Trace export and control-plane routes are appended to it.
    #[builder(into, default = defaults::ENDPOINT.to_string())]
    pub endpoint: String,

    #[builder(into, default = defaults::SERVICE_NAME.to_string())]
    pub service_name: String,

    /// Fraction of traces to export. Clamped to `[0.0, 1.0]` when read.
    #[builder(default = defaults::SAMPLE_RATE)]
    pub sample_rate: f64,

    #[builder(default = true)]
    pub traces_enabled: bool,

    #[builder(default = true)]
    pub snapshots_enabled: bool,

    /// Route globs that should never be traced, without the leading `/`.
    #[builder(default = defaults::IGNORED_ROUTES.iter().map(|s| s.to_string()).collect())]
    pub ignored_routes: Vec<String>,

    /// Spans lasting at least this long get `apm.slow = true`. Zero disables the check.
    #[builder(default = defaults::SLOW_THRESHOLD)]
    pub slow_threshold: Duration,

    /// Requested poll interval; snapped to a supported bucket by the poller.
    #[builder(default = defaults::POLL_INTERVAL)]
    pub poll_interval: Duration,

    #[builder(default = defaults::MAX_DEPTH)]
    pub max_depth: usize,

    #[builder(default = defaults::MAX_STRING_LENGTH)]
    pub max_string_length: usize,

    #[builder(default = defaults::BREAKPOINT_TTL)]
    pub breakpoint_ttl: Duration,

    #[builder(default = defaults::REGISTRATION_TTL)]
    pub registration_ttl: Duration,

    #[builder(default = defaults::REQUEST_TIMEOUT)]
    pub request_timeout: Duration,
}

impl Default for ApmConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ApmConfig {
    /// Builds a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let service_name = env::var(env_vars::SERVICE_NAME)
            .or_else(|_| env::var(env_vars::OTEL_SERVICE_NAME))
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| defaults::SERVICE_NAME.to_string());

        let ignored_routes = env::var(env_vars::IGNORED_ROUTES)
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|_| {
                defaults::IGNORED_ROUTES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        Self {
            enabled: env_bool(env_vars::ENABLED, defaults::ENABLED),
            api_key: env::var(env_vars::API_KEY)
                .ok()
                .filter(|s| !s.trim().is_empty()),
            endpoint: env::var(env_vars::ENDPOINT)
                .unwrap_or_else(|_| defaults::ENDPOINT.to_string()),
            service_name,
            sample_rate: env_parse(env_vars::SAMPLE_RATE, defaults::SAMPLE_RATE),
            traces_enabled: env_bool(env_vars::TRACES_ENABLED, true),
            snapshots_enabled: env_bool(env_vars::SNAPSHOTS_ENABLED, true),
            ignored_routes,
            slow_threshold: Duration::from_millis(env_parse(
                env_vars::SLOW_THRESHOLD_MS,
                defaults::SLOW_THRESHOLD.as_millis() as u64,
            )),
            poll_interval: Duration::from_secs(env_parse(
                env_vars::POLL_INTERVAL,
                defaults::POLL_INTERVAL.as_secs(),
            )),
            max_depth: env_parse(env_vars::MAX_DEPTH, defaults::MAX_DEPTH),
            max_string_length: env_parse(env_vars::MAX_STRING_LENGTH, defaults::MAX_STRING_LENGTH),
            breakpoint_ttl: Duration::from_secs(env_parse(
                env_vars::BREAKPOINT_TTL,
                defaults::BREAKPOINT_TTL.as_secs(),
            )),
            registration_ttl: Duration::from_secs(env_parse(
                env_vars::REGISTRATION_TTL,
                defaults::REGISTRATION_TTL.as_secs(),
            )),
            request_timeout: Duration::from_millis(env_parse(
                env_vars::REQUEST_TIMEOUT_MS,
                defaults::REQUEST_TIMEOUT.as_millis() as u64,
            )),
        }
    }

    /// True when the agent should do any work at all: enabled and holding an API key.
    pub fn is_active(&self) -> bool {
        self.enabled
            && self
                .api_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty())
    }

    /// The sample rate, clamped to `[0.0, 1.0]`. NaN counts as 0.
    pub fn effective_sample_rate(&self) -> f64 {
        if self.sample_rate.is_nan() {
            0.0
        } else {
            self.sample_rate.clamp(0.0, 1.0)
        }
    }

    /// Compiles [`ignored_routes`](Self::ignored_routes).
    pub fn route_filter(&self) -> RouteFilter {
        RouteFilter::new(&self.ignored_routes)
    }

    /// One-off check of `path` against the ignored routes. Hot paths should keep
    /// a [`RouteFilter`] instead, as [`Apm`](crate::Apm) does.
    pub fn should_trace_route(&self, path: &str) -> bool {
        self.route_filter().should_trace(path)
    }
}

/// Compiled ignored-route globs.
#[derive(Debug, Clone)]
pub struct RouteFilter {
    globs: Option<GlobSet>,
}

impl RouteFilter {
    pub fn new(patterns: &[String]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut count = 0;
        for pattern in patterns {
            let trimmed = pattern.trim().trim_start_matches('/');
            if trimmed.is_empty() {
                continue;
            }
            match Glob::new(trimmed) {
                Ok(glob) => {
                    builder.add(glob);
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!(pattern = trimmed, error = %e, "Invalid ignored route pattern, skipping");
                }
            }
        }

        let globs = if count == 0 {
            None
        } else {
            match builder.build() {
                Ok(set) => Some(set),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to build ignored route globs");
                    None
                }
            }
        };
        Self { globs }
    }

    /// Returns true if the path matches none of the ignored patterns.
    pub fn should_trace(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');
        match &self.globs {
            Some(globs) => !globs.is_match(path),
            None => true,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name).map(|s| s.trim().to_lowercase()).as_deref() {
        Ok("true") | Ok("1") | Ok("yes") | Ok("on") => true,
        Ok("false") | Ok("0") | Ok("no") | Ok("off") => false,
        Ok(value) => {
            tracing::warn!(name, value, "Invalid boolean in env, using default");
            default
        }
        Err(_) => default,
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(name, value = %value, "Invalid value in env, using default");
                default
            }
        },
        Err(_) => default,
    }
}
