//! Environment variable names, defaults, wire routes and attribute keys.

/// Environment variable names for configuration.
pub mod env_vars {
    /// Master switch for the agent ("true"/"false").
    pub const ENABLED: &str = "APM_ENABLED";

    /// API key sent as `X-API-Key` on every control-plane and export request.
    pub const API_KEY: &str = "APM_API_KEY";

    /// Base URL of the telemetry backend and breakpoint control plane.
    pub const ENDPOINT: &str = "APM_ENDPOINT";

    /// Service name for spans and breakpoints.
    pub const SERVICE_NAME: &str = "APM_SERVICE_NAME";

    /// Standard OpenTelemetry service name (used as fallback).
    pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

    /// Fraction of traces to export, in `[0.0, 1.0]`.
    pub const SAMPLE_RATE: &str = "APM_SAMPLE_RATE";

    /// Toggle for the trace engine.
    pub const TRACES_ENABLED: &str = "APM_TRACES_ENABLED";

    /// Toggle for live breakpoint snapshots.
    pub const SNAPSHOTS_ENABLED: &str = "APM_SNAPSHOTS_ENABLED";

    /// Comma-separated list of route globs that are never traced.
    pub const IGNORED_ROUTES: &str = "APM_IGNORED_ROUTES";

    /// Duration in milliseconds above which a span is flagged as slow.
    pub const SLOW_THRESHOLD_MS: &str = "APM_SLOW_THRESHOLD_MS";

    /// Breakpoint poll interval in seconds.
    pub const POLL_INTERVAL: &str = "APM_SNAPSHOT_POLL_INTERVAL";

    /// Maximum nesting depth for captured variables.
    pub const MAX_DEPTH: &str = "APM_SNAPSHOT_MAX_DEPTH";

    /// Maximum length of captured strings.
    pub const MAX_STRING_LENGTH: &str = "APM_SNAPSHOT_MAX_STRING_LENGTH";

    /// TTL in seconds for the active breakpoint cache.
    pub const BREAKPOINT_TTL: &str = "APM_BREAKPOINT_TTL";

    /// TTL in seconds for the registered-locations set.
    pub const REGISTRATION_TTL: &str = "APM_REGISTRATION_TTL";

    /// Timeout in milliseconds for every outbound request.
    pub const REQUEST_TIMEOUT_MS: &str = "APM_REQUEST_TIMEOUT_MS";

    /// Log filter used by [`init_logging`](crate::init_logging) when `RUST_LOG` is unset.
    pub const LOG_LEVEL: &str = "APM_LOG_LEVEL";

    /// Set to "json" for JSON formatted logs.
    pub const LOG_FORMAT: &str = "APM_LOG_FORMAT";
}

/// Default values for configuration parameters.
pub mod defaults {
    use std::time::Duration;

    pub const ENABLED: bool = true;

    pub const ENDPOINT: &str = "http://localhost:4318";

    /// Default service name if not provided.
    pub const SERVICE_NAME: &str = "unknown_service";

    pub const SAMPLE_RATE: f64 = 1.0;

    pub const IGNORED_ROUTES: &[&str] = &["health", "up", "_debugbar/*", "telescope/*"];

    pub const SLOW_THRESHOLD: Duration = Duration::from_millis(1000);

    pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

    pub const MAX_DEPTH: usize = 3;

    pub const MAX_STRING_LENGTH: usize = 1000;

    /// Active breakpoints are re-fetched at least this often.
    pub const BREAKPOINT_TTL: Duration = Duration::from_secs(60 * 60);

    /// Registered locations are forgotten after this long.
    pub const REGISTRATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Supported poll interval buckets, ascending.
pub const POLL_BUCKETS: &[u64] = &[1, 5, 10, 15, 30, 60, 300, 600];

/// Header carrying the API key (`X-API-Key`; lowercase for `HeaderName::from_static`).
pub const API_KEY_HEADER: &str = "x-api-key";

/// W3C trace context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Instrumentation scope reported with every export batch.
pub const SCOPE_NAME: &str = env!("CARGO_PKG_NAME");
pub const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Control-plane routes, relative to the configured endpoint.
pub mod routes {
    pub const TRACES: &str = "/v1/traces";
    pub const ACTIVE_BREAKPOINTS: &str = "/sdk/snapshots/active";
    pub const AUTO_REGISTER: &str = "/sdk/snapshots/auto-register";
    pub const CAPTURE: &str = "/sdk/snapshots/capture";
}

/// Span attribute keys set by the engine itself.
pub mod attributes {
    pub const SLOW: &str = "apm.slow";
    pub const EXCEPTION_TYPE: &str = "exception.type";
    pub const EXCEPTION_MESSAGE: &str = "exception.message";
    pub const EXCEPTION_STACKTRACE: &str = "exception.stacktrace";
    pub const SERVICE_NAME: &str = "service.name";
}
