//! Single-flight guard per resource
//!
//! The controller runtime already serializes reconciles of one object. This
//! guard makes the rule hold for every caller of the reconciler: while a
//! guard for a key is alive, no second guard for that key is handed out.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Set of resource keys with a running cycle
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` as running. `None` when a cycle for it is already running.
    pub fn try_acquire(&self, key: &str) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key: key.to_string(),
        })
    }
}

/// Releases the key on drop, also when the cycle panics or is cancelled
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_running(in_flight: &InFlight, key: &str) -> bool {
        in_flight.keys.lock().unwrap().contains(key)
    }

    #[test]
    fn test_single_flight_per_key() {
        let in_flight = InFlight::new();
        let guard = in_flight.try_acquire("ns/a").unwrap();
        assert!(is_running(&in_flight, "ns/a"));
        assert!(in_flight.try_acquire("ns/a").is_none());

        // other keys are independent
        let other = in_flight.try_acquire("ns/b");
        assert!(other.is_some());

        drop(guard);
        assert!(!is_running(&in_flight, "ns/a"));
        assert!(in_flight.try_acquire("ns/a").is_some());
    }

    #[tokio::test]
    async fn test_released_when_task_is_cancelled() {
        let in_flight = InFlight::new();
        let inner = in_flight.clone();
        let task = tokio::spawn(async move {
            let _guard = inner.try_acquire("ns/a");
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(is_running(&in_flight, "ns/a"));

        task.abort();
        let _ = task.await;
        assert!(!is_running(&in_flight, "ns/a"));
    }
}
