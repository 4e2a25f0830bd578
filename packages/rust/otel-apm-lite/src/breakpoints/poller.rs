//! Background refresh of the breakpoint cache.

use super::BreakpointCache;
use crate::constants::POLL_BUCKETS;
use crate::control_plane::ControlPlane;
use crate::error::log_failure;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

/// Snaps a requested interval to the largest supported bucket not above it.
///
/// Anything below the smallest bucket uses the smallest; anything above the
/// largest uses the largest.
pub fn snap_poll_interval(requested: Duration) -> Duration {
    let secs = requested.as_secs();
    let bucket = POLL_BUCKETS
        .iter()
        .rev()
        .find(|bucket| **bucket <= secs)
        .or_else(|| POLL_BUCKETS.first())
        .copied()
        .unwrap_or(1);
    Duration::from_secs(bucket)
}

/// Fetches the active breakpoints once and swaps them into the cache.
///
/// On failure the cache is left as it was. Returns whether the refresh succeeded.
pub async fn refresh_once(control_plane: &dyn ControlPlane, cache: &BreakpointCache, service_name: &str) -> bool {
    match log_failure("breakpoint fetch", control_plane.fetch_active(service_name).await) {
        Some(breakpoints) => {
            tracing::trace!(service = service_name, count = breakpoints.len(), "Refreshed breakpoints");
            cache.replace(service_name, breakpoints);
            true
        }
        None => false,
    }
}

/// Handle to a running poller. Dropping it stops the task.
#[derive(Debug)]
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl PollerHandle {
    /// The effective (snapped) poll interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Signals the task to stop and waits for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "Breakpoint poller ended abnormally");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawns a task that refreshes `service_name`'s breakpoints immediately and then
/// on every tick of the snapped interval.
pub fn start_poller(
    control_plane: Arc<dyn ControlPlane>,
    cache: Arc<BreakpointCache>,
    service_name: String,
    requested_interval: Duration,
) -> PollerHandle {
    let interval = snap_poll_interval(requested_interval);
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            service = %service_name,
            interval_seconds = interval.as_secs(),
            "Breakpoint poller: starting"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    refresh_once(control_plane.as_ref(), &cache, &service_name).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(service = %service_name, "Breakpoint poller: stopped");
    });

    PollerHandle {
        shutdown,
        task: Some(task),
        interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::{test_support::descriptor, BreakpointDescriptor, RegistrationRequest};
    use crate::error::{ApmError, Result};
    use crate::snapshot::Snapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct ScriptedControlPlane {
        calls: AtomicUsize,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ControlPlane for ScriptedControlPlane {
        async fn fetch_active(&self, _service_name: &str) -> Result<Vec<BreakpointDescriptor>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|n| call >= n) {
                return Err(ApmError::Status {
                    endpoint: "test".to_string(),
                    status: 502,
                    body: String::new(),
                });
            }
            Ok(vec![descriptor(call as i64, "f", None, "a.rs", 1)])
        }

        async fn auto_register(&self, _request: &RegistrationRequest) -> Result<BreakpointDescriptor> {
            Err(ApmError::Disabled)
        }

        async fn submit_capture(&self, _snapshot: &Snapshot) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_snap_poll_interval() {
        let snap = |secs| snap_poll_interval(Duration::from_secs(secs)).as_secs();
        assert_eq!(snap(7), 5);
        assert_eq!(snap(1000), 600);
        assert_eq!(snap(10), 10);
        assert_eq!(snap(59), 30);
        assert_eq!(snap(600), 600);
        assert_eq!(snap(1), 1);
        assert_eq!(snap(0), 1);
        assert_eq!(snap_poll_interval(Duration::from_millis(1500)).as_secs(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_cache() {
        let control_plane = ScriptedControlPlane {
            fail_after: Some(1),
            ..Default::default()
        };
        let cache = BreakpointCache::default();

        assert!(refresh_once(&control_plane, &cache, "svc").await);
        let before = cache.active("svc").unwrap();

        assert!(!refresh_once(&control_plane, &cache, "svc").await);
        assert_eq!(cache.active("svc").unwrap().as_ref(), before.as_ref());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_fetches_immediately_then_on_interval() {
        let control_plane = Arc::new(ScriptedControlPlane::default());
        let cache = Arc::new(BreakpointCache::default());
        let handle = start_poller(
            control_plane.clone(),
            cache.clone(),
            "svc".to_string(),
            Duration::from_secs(7),
        );
        assert_eq!(handle.interval(), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(control_plane.calls.load(Ordering::SeqCst), 1);
        assert!(cache.active("svc").is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(control_plane.calls.load(Ordering::SeqCst), 2);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(control_plane.calls.load(Ordering::SeqCst), 2);
    }
}
