use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::bans::BanStore;
use super::events::CloseReason;
use super::registry::RoomRegistry;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle connections whose teardown signal was sent.
    pub signalled: usize,
    /// Idle connections with a signal already pending or a pump already gone.
    pub skipped: usize,
    /// Connections active within the grace period.
    pub fresh: usize,
    pub bans_purged: usize,
}

/// Periodic sweep that asks idle connections to close.
///
/// It only signals. Registry removal happens on the connection's own
/// disconnect path once its write pump has closed the socket.
pub struct IdleReaper {
    registry: Arc<RoomRegistry>,
    bans: Arc<dyn BanStore>,
    grace: Duration,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<RoomRegistry>,
        bans: Arc<dyn BanStore>,
        grace: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            bans,
            grace,
            interval,
        }
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for room_id in self.registry.room_ids() {
            self.registry.for_each(&room_id, |conn| {
                if conn.idle_for(now) <= self.grace {
                    report.fresh += 1;
                } else if conn.signal_teardown(CloseReason::Idle) {
                    debug!(%room_id, client_id = %conn.client_id, "idle connection signalled");
                    report.signalled += 1;
                } else {
                    report.skipped += 1;
                }
            });
        }

        report.bans_purged = self.bans.purge_expired();
        report
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report.signalled > 0 || report.skipped > 0 {
                        info!(
                            signalled = report.signalled,
                            skipped = report.skipped,
                            fresh = report.fresh,
                            "idle sweep"
                        );
                    }
                }
            }
        }
        info!("idle reaper stopped");
    }
}
