//! Per-node one-shot response latches.
//!
//! A waiter inserts a latch keyed by node id, the notification parser
//! signals it on any sensor reading from that node, and the waiter removes
//! it on exit. A signal for a node with no registered latch is dropped —
//! the poll loop re-probes next interval.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};

/// Registry of in-flight response waits.
#[derive(Debug, Default)]
pub struct ResponseSignals {
    latches: DashMap<String, Arc<Notify>>,
}

impl ResponseSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `node_id` responds or the timeout elapses. Returns
    /// whether the latch was signaled.
    ///
    /// `Notify` stores a permit, so a signal landing between registration
    /// and the await still completes the wait.
    pub async fn wait(&self, node_id: &str, wait_for: Duration) -> bool {
        let latch = self
            .latches
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .value()
            .clone();

        let signaled = timeout(wait_for, latch.notified()).await.is_ok();
        self.latches.remove(node_id);
        signaled
    }

    /// Signal the latch for `node_id`, if one is registered.
    pub fn signal(&self, node_id: &str) {
        if let Some(latch) = self.latches.get(node_id) {
            latch.notify_one();
        }
    }

    /// Number of in-flight waits (diagnostics).
    pub fn pending(&self) -> usize {
        self.latches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_signal_completes_wait() {
        let signals = Arc::new(ResponseSignals::new());

        let waiter = {
            let signals = signals.clone();
            tokio::spawn(async move { signals.wait("3", Duration::from_secs(5)).await })
        };
        // Let the waiter register its latch.
        tokio::task::yield_now().await;
        signals.signal("3");

        assert!(waiter.await.unwrap());
        assert_eq!(signals.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_false() {
        let signals = ResponseSignals::new();
        assert!(!signals.wait("1", Duration::from_millis(100)).await);
        assert_eq!(signals.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_without_latch_is_dropped() {
        let signals = ResponseSignals::new();
        // Nobody is waiting yet; this must not leave a phantom latch.
        signals.signal("7");
        assert_eq!(signals.pending(), 0);
        assert!(!signals.wait("7", Duration::from_millis(100)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latches_are_per_node() {
        let signals = Arc::new(ResponseSignals::new());

        let waiter = {
            let signals = signals.clone();
            tokio::spawn(async move { signals.wait("2", Duration::from_millis(200)).await })
        };
        tokio::task::yield_now().await;
        signals.signal("5");

        assert!(!waiter.await.unwrap());
    }
}
