//! Process-wide breakpoint state, shared between request paths and the poller.
//!
//! Two collections are held per service name:
//!
//! - active breakpoints, replaced wholesale by every successful poll and
//!   considered stale after `breakpoint_ttl`;
//! - registered locations, the [`LocationKey`]s already auto-registered in this
//!   process, each forgotten `registration_ttl` after its last registration.
//!
//! Both are stored as `Arc` snapshots. Writers build a new map and swap it in
//! under a short write lock; readers clone the current `Arc` and work on it
//! lock-free, so they never observe a half-applied refresh.

use super::{location, BreakpointDescriptor, LocationKey};
use crate::stack::CallSite;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
struct Timed<T> {
    value: T,
    stored_at: Instant,
}

impl<T> Timed<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

type ActiveMap = HashMap<String, Timed<Arc<[BreakpointDescriptor]>>>;
type RegisteredMap = HashMap<String, Arc<HashMap<LocationKey, Instant>>>;

#[derive(Debug)]
pub struct BreakpointCache {
    breakpoint_ttl: Duration,
    registration_ttl: Duration,
    active: RwLock<Arc<ActiveMap>>,
    registered: RwLock<Arc<RegisteredMap>>,
}

impl Default for BreakpointCache {
    fn default() -> Self {
        Self::new(
            crate::constants::defaults::BREAKPOINT_TTL,
            crate::constants::defaults::REGISTRATION_TTL,
        )
    }
}

impl BreakpointCache {
    pub fn new(breakpoint_ttl: Duration, registration_ttl: Duration) -> Self {
        Self {
            breakpoint_ttl,
            registration_ttl,
            active: RwLock::new(Arc::new(HashMap::new())),
            registered: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Replaces the active breakpoints of `service` with a freshly fetched set.
    pub fn replace(&self, service: &str, breakpoints: Vec<BreakpointDescriptor>) {
        let entry = Timed::new(Arc::<[BreakpointDescriptor]>::from(breakpoints));
        let mut guard = self.active.write();
        let mut next = ActiveMap::clone(&guard);
        next.insert(service.to_string(), entry);
        *guard = Arc::new(next);
    }

    /// Adds or replaces (by id) a single descriptor, e.g. one returned by auto-registration.
    ///
    /// The set keeps the refresh time of the last poll: one registration reply
    /// says nothing about the freshness of the other breakpoints.
    pub fn insert_descriptor(&self, service: &str, descriptor: BreakpointDescriptor) {
        let mut guard = self.active.write();
        let mut next = ActiveMap::clone(&guard);
        let entry = match next.get(service).filter(|e| e.is_fresh(self.breakpoint_ttl)) {
            Some(existing) => {
                let mut breakpoints: Vec<_> = existing
                    .value
                    .iter()
                    .filter(|bp| bp.id != descriptor.id)
                    .cloned()
                    .collect();
                breakpoints.push(descriptor);
                Timed {
                    value: Arc::from(breakpoints),
                    stored_at: existing.stored_at,
                }
            }
            None => Timed::new(Arc::from(vec![descriptor])),
        };
        next.insert(service.to_string(), entry);
        *guard = Arc::new(next);
    }

    /// The current active breakpoints for `service`, or `None` if never fetched or expired.
    pub fn active(&self, service: &str) -> Option<Arc<[BreakpointDescriptor]>> {
        let snapshot = Arc::clone(&self.active.read());
        snapshot
            .get(service)
            .filter(|entry| entry.is_fresh(self.breakpoint_ttl))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Resolves a call site by `function:label`, falling back to `file:line`.
    pub fn resolve(&self, service: &str, site: &CallSite, label: Option<&str>) -> Option<BreakpointDescriptor> {
        let breakpoints = self.active(service)?;
        location::resolve(&breakpoints, site, label).cloned()
    }

    pub fn resolve_by_file_line(&self, service: &str, file: &str, line: u32) -> Option<BreakpointDescriptor> {
        let breakpoints = self.active(service)?;
        location::resolve_by_file_line(&breakpoints, file, line).cloned()
    }

    pub fn is_registered(&self, service: &str, key: &LocationKey) -> bool {
        let snapshot = Arc::clone(&self.registered.read());
        snapshot
            .get(service)
            .and_then(|keys| keys.get(key))
            .is_some_and(|registered_at| registered_at.elapsed() < self.registration_ttl)
    }

    /// Marks `key` as registered now. Expired locations of the service are dropped.
    pub fn register(&self, service: &str, key: LocationKey) {
        let mut guard = self.registered.write();
        let mut next = RegisteredMap::clone(&guard);
        let mut keys = next
            .get(service)
            .map(|keys| keys.as_ref().clone())
            .unwrap_or_default();
        keys.retain(|_, registered_at| registered_at.elapsed() < self.registration_ttl);
        keys.insert(key, Instant::now());
        next.insert(service.to_string(), Arc::new(keys));
        *guard = Arc::new(next);
    }

    /// Drops everything.
    pub fn clear(&self) {
        *self.active.write() = Arc::new(HashMap::new());
        *self.registered.write() = Arc::new(HashMap::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoints::test_support::descriptor;
    use std::thread;

    #[test]
    fn test_replace_swaps_whole_set() {
        let cache = BreakpointCache::default();
        assert!(cache.active("checkout").is_none());

        cache.replace("checkout", vec![descriptor(1, "a", None, "a.rs", 1)]);
        let before = cache.active("checkout").unwrap();

        cache.replace(
            "checkout",
            vec![descriptor(2, "b", None, "b.rs", 2), descriptor(3, "c", None, "c.rs", 3)],
        );
        assert_eq!(before.len(), 1);
        assert_eq!(cache.active("checkout").unwrap().len(), 2);
        assert!(cache.active("billing").is_none());
    }

    #[test]
    fn test_expired_entries_are_ignored() {
        let cache = BreakpointCache::new(Duration::ZERO, Duration::ZERO);
        cache.replace("checkout", vec![descriptor(1, "a", None, "a.rs", 1)]);
        assert!(cache.active("checkout").is_none());

        let key = LocationKey::file("a.rs", 1);
        cache.register("checkout", key.clone());
        assert!(!cache.is_registered("checkout", &key));
    }

    #[test]
    fn test_resolve_through_cache() {
        let cache = BreakpointCache::default();
        cache.replace("checkout", vec![descriptor(1, "orders::create", Some("x"), "src/orders.rs", 10)]);

        let site = CallSite::new("src/moved.rs", 99, Some("orders::create"));
        assert!(cache.resolve("checkout", &site, Some("x")).is_some());
        assert!(cache.resolve("billing", &site, Some("x")).is_none());
        assert!(cache.resolve_by_file_line("checkout", "src/orders.rs", 10).is_some());
        assert!(cache.resolve_by_file_line("checkout", "src/orders.rs", 11).is_none());
    }

    #[test]
    fn test_insert_descriptor_replaces_same_id() {
        let cache = BreakpointCache::default();
        cache.insert_descriptor("checkout", descriptor(1, "a", None, "a.rs", 1));
        cache.insert_descriptor("checkout", descriptor(2, "b", None, "b.rs", 2));
        let mut updated = descriptor(1, "a", None, "a.rs", 1);
        updated.enabled = false;
        cache.insert_descriptor("checkout", updated);

        let active = cache.active("checkout").unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().any(|bp| !bp.enabled));
    }

    #[test]
    fn test_registration() {
        let cache = BreakpointCache::default();
        let key = LocationKey::Function {
            function: "orders::create".to_string(),
            label: None,
        };
        assert!(!cache.is_registered("checkout", &key));
        cache.register("checkout", key.clone());
        assert!(cache.is_registered("checkout", &key));
        assert!(!cache.is_registered("billing", &key));

        cache.clear();
        assert!(!cache.is_registered("checkout", &key));
    }

    #[test]
    fn test_each_registration_has_its_own_ttl() {
        let cache = BreakpointCache::new(Duration::from_secs(60), Duration::from_millis(300));
        let first = LocationKey::file("a.rs", 1);
        let second = LocationKey::file("b.rs", 2);

        cache.register("checkout", first.clone());
        thread::sleep(Duration::from_millis(200));
        cache.register("checkout", second.clone());
        thread::sleep(Duration::from_millis(200));

        assert!(!cache.is_registered("checkout", &first));
        assert!(cache.is_registered("checkout", &second));

        cache.register("checkout", first.clone());
        assert!(cache.is_registered("checkout", &first));
    }

    #[test]
    fn test_concurrent_readers_see_complete_sets() {
        let cache = Arc::new(BreakpointCache::default());
        cache.replace("svc", vec![descriptor(0, "f", None, "a.rs", 1)]);

        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for n in 1..200usize {
                    let set = (0..n as i64).map(|i| descriptor(i, "f", None, "a.rs", 1)).collect();
                    cache.replace("svc", set);
                }
            })
        };
        for _ in 0..200 {
            let active = cache.active("svc").unwrap();
            let len = active.len() as i64;
            assert!(active.iter().map(|bp| bp.id.clone()).eq(
                (0..len).map(crate::breakpoints::BreakpointId::Numeric)
            ));
        }
        writer.join().unwrap();
    }
}
