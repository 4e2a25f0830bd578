//! Snapshot capture at live breakpoints.
//!
//! A capture call goes through these gates, in order, and gives up quietly at
//! the first one that fails:
//!
//! 1. the agent is active and snapshots are enabled;
//! 2. the enclosing function of the call site is known;
//! 3. the location is registered with the control plane (auto-registering it on
//!    first sight);
//! 4. a breakpoint resolves for the location, is enabled, has not expired and
//!    has not reached its capture limit.
//!
//! Only then are the variables sanitized and the snapshot handed to a background
//! task, which resolves the stack and submits it. The caller never waits for
//! the control plane on this step; a failure is logged and dropped.
//! [`SnapshotCapture::drain`] waits for submissions still in flight.
//!
//! ```no_run
//! use otel_apm_lite::{snapshot, Apm, ApmConfig};
//!
//! # async fn example(apm: &Apm) {
//! let order_id = 42;
//! snapshot!(apm, "before_save", { "order_id" => order_id, "coupon" => "SPRING" }).await;
//! # }
//! ```

use crate::breakpoints::{BreakpointCache, BreakpointDescriptor, BreakpointId, LocationKey, RegistrationRequest, Refusal};
use crate::control_plane::ControlPlane;
use crate::error::log_failure;
use crate::request::{self, RequestContext};
use crate::sanitizer::{Sanitizer, Variables};
use crate::stack::{CallSite, UnresolvedStack};
use bon::bon;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// One captured diagnostic record, as submitted to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub breakpoint_id: BreakpointId,
    pub service_name: String,
    pub file_path: String,
    pub function_name: String,
    pub label: Option<String>,
    pub line_number: u32,
    pub variables: Map<String, Value>,
    pub stack_trace: String,
    pub request_context: RequestContext,
    pub captured_at: DateTime<Utc>,
}

/// What happened to a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Handed to the background submitter.
    Submitted,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Inactive,
    UnknownLocation,
    RegistrationFailed,
    NoBreakpoint,
    Disabled,
    Expired,
    LimitReached,
    /// Only reported when there is no runtime to submit in the background.
    SubmitFailed,
}

impl From<Refusal> for SkipReason {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Disabled => SkipReason::Disabled,
            Refusal::Expired => SkipReason::Expired,
            Refusal::LimitReached => SkipReason::LimitReached,
        }
    }
}

#[derive(Debug)]
pub struct SnapshotCapture {
    control_plane: Arc<dyn ControlPlane>,
    cache: Arc<BreakpointCache>,
    sanitizer: Sanitizer,
    service_name: String,
    enabled: bool,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

#[bon]
impl SnapshotCapture {
    #[builder]
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        cache: Arc<BreakpointCache>,
        #[builder(into)] service_name: String,
        #[builder(default)] sanitizer: Sanitizer,
        #[builder(default = true)] enabled: bool,
    ) -> Self {
        Self {
            control_plane,
            cache,
            sanitizer,
            service_name,
            enabled,
            in_flight: Mutex::new(Vec::new()),
        }
    }
}

impl SnapshotCapture {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn cache(&self) -> &Arc<BreakpointCache> {
        &self.cache
    }

    /// Waits for every background submission started so far.
    pub async fn drain(&self) {
        let handles = std::mem::take(&mut *self.in_flight.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Snapshot submission task failed");
            }
        }
    }

    /// Captures at a detected call site (see [`call_site!`](crate::call_site)).
    ///
    /// `context` overrides the request context of the current task.
    pub async fn capture(
        &self,
        site: CallSite,
        context: Option<RequestContext>,
        label: Option<&str>,
        variables: &Variables,
    ) -> CaptureOutcome {
        if !self.enabled {
            return CaptureOutcome::Skipped(SkipReason::Inactive);
        }
        let Some(key) = LocationKey::for_call_site(&site, label) else {
            tracing::debug!(location = %site, "Capture skipped, enclosing function unknown");
            return CaptureOutcome::Skipped(SkipReason::UnknownLocation);
        };

        if !self.cache.is_registered(&self.service_name, &key) {
            if let Err(reason) = self.register(&site, label, key.clone()).await {
                return CaptureOutcome::Skipped(reason);
            }
        }

        let Some(breakpoint) = self.cache.resolve(&self.service_name, &site, label) else {
            tracing::trace!(location = %key, "No active breakpoint");
            return CaptureOutcome::Skipped(SkipReason::NoBreakpoint);
        };
        self.submit(breakpoint, site, context, label, variables).await
    }

    /// Captures at a known `file:line`, matching breakpoints by position only.
    /// No auto-registration happens on this path.
    pub async fn capture_at(
        &self,
        file: &str,
        line: u32,
        context: Option<RequestContext>,
        variables: &Variables,
    ) -> CaptureOutcome {
        if !self.enabled {
            return CaptureOutcome::Skipped(SkipReason::Inactive);
        }
        let Some(breakpoint) = self.cache.resolve_by_file_line(&self.service_name, file, line) else {
            tracing::trace!(file, line, "No active breakpoint");
            return CaptureOutcome::Skipped(SkipReason::NoBreakpoint);
        };
        let site = CallSite::new(file, line, breakpoint.function_name.as_deref());
        let label = breakpoint.label.clone();
        self.submit(breakpoint, site, context, label.as_deref(), variables).await
    }

    async fn register(&self, site: &CallSite, label: Option<&str>, key: LocationKey) -> Result<(), SkipReason> {
        let request = RegistrationRequest {
            service_name: self.service_name.clone(),
            file_path: site.file.clone(),
            line_number: site.line,
            function_name: site.function.clone().unwrap_or_default(),
            label: label.map(str::to_string),
        };
        match log_failure("auto-register", self.control_plane.auto_register(&request).await) {
            Some(descriptor) => {
                self.cache.insert_descriptor(&self.service_name, descriptor);
                self.cache.register(&self.service_name, key);
                Ok(())
            }
            None => Err(SkipReason::RegistrationFailed),
        }
    }

    async fn submit(
        &self,
        breakpoint: BreakpointDescriptor,
        site: CallSite,
        context: Option<RequestContext>,
        label: Option<&str>,
        variables: &Variables,
    ) -> CaptureOutcome {
        let now = Utc::now();
        if let Err(refusal) = breakpoint.admits(now) {
            tracing::debug!(breakpoint = %breakpoint.id, ?refusal, "Capture refused");
            return CaptureOutcome::Skipped(refusal.into());
        }

        let request_context = context
            .or_else(request::current)
            .unwrap_or_else(RequestContext::cli);

        let stack = UnresolvedStack::capture();
        let mut snapshot = Snapshot {
            breakpoint_id: breakpoint.id,
            service_name: self.service_name.clone(),
            file_path: site.file.clone(),
            function_name: site.function.clone().unwrap_or_default(),
            label: label.map(str::to_string),
            line_number: site.line,
            variables: self.sanitizer.sanitize_variables(variables),
            stack_trace: site.to_string(),
            request_context,
            captured_at: now,
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            snapshot.stack_trace = format!("{}\n{}", snapshot.stack_trace, stack.resolve());
            return match log_failure("snapshot submit", self.control_plane.submit_capture(&snapshot).await) {
                Some(()) => CaptureOutcome::Submitted,
                None => CaptureOutcome::Skipped(SkipReason::SubmitFailed),
            };
        };

        let control_plane = Arc::clone(&self.control_plane);
        let handle = runtime.spawn(async move {
            match tokio::task::spawn_blocking(move || stack.resolve()).await {
                Ok(frames) => snapshot.stack_trace = format!("{}\n{}", snapshot.stack_trace, frames),
                Err(e) => tracing::debug!(error = %e, "Stack resolution failed"),
            }
            log_failure("snapshot submit", control_plane.submit_capture(&snapshot).await);
        });

        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.push(handle);
        CaptureOutcome::Submitted
    }
}

/// Captures a snapshot at the current call site.
///
/// The first argument is anything with a `capture(CallSite, Option<RequestContext>,
/// Option<&str>, &Variables)` method, i.e. an [`Apm`](crate::Apm) or a
/// [`SnapshotCapture`]. Evaluates to a future yielding a [`CaptureOutcome`].
#[macro_export]
macro_rules! snapshot {
    ($capture:expr, { $($name:expr => $value:expr),* $(,)? }) => {
        $capture.capture(
            $crate::call_site!(),
            ::std::option::Option::None,
            ::std::option::Option::None,
            &$crate::variables! { $($name => $value),* },
        )
    };
    ($capture:expr, $label:expr, { $($name:expr => $value:expr),* $(,)? }) => {
        $capture.capture(
            $crate::call_site!(),
            ::std::option::Option::None,
            ::std::option::Option::Some($label),
            &$crate::variables! { $($name => $value),* },
        )
    };
}
