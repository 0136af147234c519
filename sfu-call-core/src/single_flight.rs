//! Keyed single-flight runner
//!
//! A request for a key that is already running is dropped, not queued.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// Keyed single-flight runner
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    running: Arc<Mutex<HashSet<String>>>,
}

/// Marks a key as running until dropped
#[derive(Debug)]
pub struct FlightGuard {
    key: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.key);
    }
}

impl SingleFlight {
    /// Create an empty runner
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if it is already running
    #[must_use]
    pub fn try_acquire(&self, key: &str) -> Option<FlightGuard> {
        let mut running = self.running.lock();
        if !running.insert(key.to_string()) {
            return None;
        }
        Some(FlightGuard {
            key: key.to_string(),
            running: self.running.clone(),
        })
    }

    /// Whether `key` is running
    #[must_use]
    pub fn is_running(&self, key: &str) -> bool {
        self.running.lock().contains(key)
    }

    /// Run `fut` under `key`; returns `None` without polling `fut` if the key
    /// is already running
    ///
    /// The key is released when `fut` completes or the returned future is
    /// dropped.
    pub async fn run<F, T>(&self, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let Some(_guard) = self.try_acquire(key) else {
            tracing::debug!(key, "Already in flight, ignoring request");
            return None;
        };
        Some(fut.await)
    }
}
