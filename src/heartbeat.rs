// Heartbeat monitor - two-phase liveness check over all sessions
//
// Each sweep: a session that has not answered since the previous sweep is
// closed and removed; every other session is marked pending and probed.
// A silent session is therefore evicted on its second sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::{ClientRegistry, SendOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: Vec<u64>,
}

pub struct HeartbeatMonitor {
    registry: Arc<ClientRegistry>,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ClientRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Run one probe round
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for handle in self.registry.handles().await {
            if !handle.take_alive() {
                report.evicted.push(handle.id());
                continue;
            }
            match handle.probe() {
                SendOutcome::Queued => report.probed += 1,
                // A backed-up queue still gets one more interval to drain
                SendOutcome::Full => debug!(session = handle.id(), "Probe skipped, queue full"),
                SendOutcome::Closed => {}
            }
        }

        for id in &report.evicted {
            if self.registry.remove(*id).await.is_some() {
                info!(session = id, "Session unresponsive, terminated");
            }
        }

        report
    }

    /// Sweep every interval, first sweep one interval after start
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                debug!(probed = report.probed, evicted = report.evicted.len(), "Heartbeat sweep");
            }
        })
    }
}
