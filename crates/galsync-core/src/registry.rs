//! Sync session registry
//!
//! Tracks in-flight sync sessions per domain and enforces each domain's cap.
//! A slot is held by a [`SessionGuard`] and released when the guard drops.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Active sync sessions, keyed by domain.
#[derive(Debug, Default)]
pub struct SyncSessionRegistry {
    active: Mutex<HashMap<String, HashSet<String>>>,
}

impl SyncSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot for `session_id`, or `None` when `domain` is at `capacity`.
    ///
    /// A capacity of 0 is unlimited.
    pub fn try_register(
        &self,
        domain: &str,
        session_id: &str,
        capacity: u32,
    ) -> Option<SessionGuard<'_>> {
        let mut active = self.active.lock();
        let sessions = active.entry(domain.to_string()).or_default();
        if capacity > 0 && sessions.len() >= capacity as usize {
            debug!(domain, active = sessions.len(), capacity, "sync capacity reached");
            return None;
        }
        sessions.insert(session_id.to_string());
        Some(SessionGuard {
            registry: self,
            domain: domain.to_string(),
            session_id: session_id.to_string(),
        })
    }

    pub fn active_count(&self, domain: &str) -> usize {
        self.active.lock().get(domain).map_or(0, HashSet::len)
    }

    fn release(&self, domain: &str, session_id: &str) {
        let mut active = self.active.lock();
        if let Some(sessions) = active.get_mut(domain) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                active.remove(domain);
            }
        }
    }
}

/// A registered sync session.
#[derive(Debug)]
pub struct SessionGuard<'r> {
    registry: &'r SyncSessionRegistry,
    domain: String,
    session_id: String,
}

impl SessionGuard<'_> {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.domain, &self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_per_domain() {
        let registry = SyncSessionRegistry::new();
        let a = registry.try_register("example.com", "u1/example.com/1", 1);
        assert!(a.is_some());
        assert!(registry
            .try_register("example.com", "u2/example.com/2", 1)
            .is_none());
        assert!(registry
            .try_register("other.com", "u1/other.com/3", 1)
            .is_some());
        assert_eq!(registry.active_count("example.com"), 1);
    }

    #[test]
    fn test_guard_releases_slot_on_drop() {
        let registry = SyncSessionRegistry::new();
        {
            let _guard = registry.try_register("example.com", "s1", 1).unwrap();
            assert_eq!(registry.active_count("example.com"), 1);
        }
        assert_eq!(registry.active_count("example.com"), 0);
        assert!(registry.try_register("example.com", "s2", 1).is_some());
    }

    #[test]
    fn test_zero_capacity_is_unlimited() {
        let registry = SyncSessionRegistry::new();
        let guards: Vec<_> = (0..50)
            .map(|i| registry.try_register("example.com", &format!("s{i}"), 0))
            .collect();
        assert!(guards.iter().all(Option::is_some));
        assert_eq!(registry.active_count("example.com"), 50);
    }

    #[test]
    fn test_slot_released_when_task_panics() {
        let registry = SyncSessionRegistry::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = registry.try_register("example.com", "s1", 1).unwrap();
            panic!("sync failed");
        }));
        assert!(result.is_err());
        assert_eq!(registry.active_count("example.com"), 0);
    }
}
