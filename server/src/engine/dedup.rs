use std::time::Duration;

use dashmap::DashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Ids of messages this instance recently authored or delivered.
///
/// Not a durable log: the whole set is dropped on a fixed schedule, so an id older
/// than one clear period can in principle be delivered again. Cross-instance
/// delivery is therefore at-least-once with a "seen recently" filter.
#[derive(Default)]
pub struct DedupCache {
    seen: DashSet<String>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str) {
        self.seen.insert(id.to_string());
    }

    /// Record `id` and report whether it was new. Atomic per id.
    pub fn check_and_record(&self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&self) {
        self.seen.clear();
    }

    /// Clear the cache every `period` until cancelled.
    pub async fn run_clear_loop(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let cleared = self.len();
                    self.clear();
                    debug!(cleared, "dedup cache cleared");
                }
            }
        }
        info!("dedup clear loop stopped");
    }
}
