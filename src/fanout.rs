// Broadcast fan-out of location updates to viewer sessions

use std::sync::Arc;
use tracing::{trace, warn};

use crate::registry::{ClientRegistry, SendOutcome};

/// What happened to one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Sessions the frame was queued on
    pub delivered: usize,
    /// Eligible sessions whose queue was full
    pub lagging: usize,
    /// Eligible sessions that were closing
    pub closing: usize,
}

/// Queue `frame` on every viewer (or unidentified) session.
///
/// Runs under the registry read lock: a session removed before this call is
/// never visited, and none can be removed while it runs. Queueing never
/// blocks, so a slow viewer only loses its own frames.
pub async fn broadcast(registry: &ClientRegistry, frame: &Arc<str>) -> FanoutReport {
    let mut report = FanoutReport::default();
    registry
        .for_each(|session| {
            if !session.role.receives_broadcasts() {
                return;
            }
            match session.handle.send_text(Arc::clone(frame)) {
                SendOutcome::Queued => report.delivered += 1,
                SendOutcome::Full => {
                    report.lagging += 1;
                    warn!(session = session.handle.id(), "Viewer lagging, update skipped");
                }
                SendOutcome::Closed => report.closing += 1,
            }
        })
        .await;
    trace!(delivered = report.delivered, "Broadcast complete");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientRole, Outbound, TransportKind};

    fn frame(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[tokio::test]
    async fn test_viewers_and_unknown_receive_trackers_do_not() {
        let registry = ClientRegistry::new(8);
        let (viewer, mut viewer_rx) = registry.register(TransportKind::WebSocket, None).await;
        let (tracker, mut tracker_rx) = registry.register(TransportKind::WebSocket, None).await;
        let (_anon, mut anon_rx) = registry.register(TransportKind::Tcp, None).await;
        registry.set_role(viewer.id(), ClientRole::Viewer).await;
        registry.set_role(tracker.id(), ClientRole::Tracker).await;

        let report = broadcast(&registry, &frame("u1")).await;
        assert_eq!(report.delivered, 2);

        assert_eq!(viewer_rx.try_recv().unwrap(), Outbound::Text(frame("u1")));
        assert_eq!(anon_rx.try_recv().unwrap(), Outbound::Text(frame("u1")));
        assert!(tracker_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_removed_viewer_gets_nothing() {
        let registry = ClientRegistry::new(8);
        let (viewer, mut viewer_rx) = registry.register(TransportKind::WebSocket, None).await;
        let (tracker, _tracker_rx) = registry.register(TransportKind::WebSocket, None).await;
        registry.set_role(viewer.id(), ClientRole::Viewer).await;
        registry.set_role(tracker.id(), ClientRole::Tracker).await;
        registry.remove(viewer.id()).await;

        let report = broadcast(&registry, &frame("u1")).await;
        assert_eq!(report, FanoutReport::default());
        assert!(viewer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_per_session_order_preserved() {
        let registry = ClientRegistry::new(16);
        let (_v, mut rx) = registry.register(TransportKind::WebSocket, None).await;
        for i in 0..5 {
            broadcast(&registry, &frame(&format!("u{}", i))).await;
        }
        for i in 0..5 {
            assert_eq!(rx.try_recv().unwrap(), Outbound::Text(frame(&format!("u{}", i))));
        }
    }

    #[tokio::test]
    async fn test_lagging_viewer_skipped_others_served() {
        let registry = ClientRegistry::new(1);
        let (slow, _slow_rx) = registry.register(TransportKind::WebSocket, None).await;
        let (_fast, mut fast_rx) = registry.register(TransportKind::WebSocket, None).await;
        slow.send_text(frame("backlog"));

        let report = broadcast(&registry, &frame("u1")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.lagging, 1);
        assert_eq!(fast_rx.try_recv().unwrap(), Outbound::Text(frame("u1")));
    }

    #[tokio::test]
    async fn test_closing_session_skipped() {
        let registry = ClientRegistry::new(8);
        let (h, _rx) = registry.register(TransportKind::WebSocket, None).await;
        h.close();
        let report = broadcast(&registry, &frame("u1")).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.closing, 1);
    }
}
