use std::time::Duration;

use tokio::time::interval;
use tracing::{trace, warn};

use crate::broadcast::Broadcaster;
use crate::registry::Registry;
use crate::relay;

/// Queue a websocket ping to every open connection on a fixed cadence.
/// Any inbound frame refreshes a connection's last-seen timestamp, so a
/// live client never ages out.
pub async fn run_pinger(registry: Registry, every: Duration) {
    let mut ticker = interval(every);
    loop {
        ticker.tick().await;
        let pinged = registry.ping_all().await;
        trace!(pinged, "liveness ping sweep");
    }
}

/// Force-close connections that have stopped responding. Reaped
/// connections go through the same teardown path as a client disconnect,
/// so the registry and presence stay consistent.
pub async fn run_reaper(
    registry: Registry,
    broadcaster: Broadcaster,
    every: Duration,
    idle_timeout: Duration,
) {
    let mut ticker = interval(every);
    loop {
        ticker.tick().await;
        for conn in registry.idle_connections(idle_timeout).await {
            warn!(%conn, "reaping unresponsive connection");
            relay::teardown(&registry, &broadcaster, conn).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnId, Outbound};
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn reap_path_unregisters_and_announces_offline() {
        let registry = Registry::new();
        let broadcaster = Broadcaster::new(registry.clone());

        let (tx_stale, mut rx_stale) = unbounded_channel();
        let stale = ConnId::new();
        registry.register(stale, "alice", "lobby", tx_stale).await;

        let (tx_live, mut rx_live) = unbounded_channel();
        let live = ConnId::new();
        registry.register(live, "bob", "lobby", tx_live).await;
        registry.touch(live).await;

        // Everything idle for zero seconds is stale except freshly touched
        // entries are too; drive teardown directly for the stale one the
        // way the reaper loop does.
        for conn in registry.idle_connections(Duration::ZERO).await {
            if conn == stale {
                relay::teardown(&registry, &broadcaster, conn).await;
            }
        }

        // The reaped connection was told to close.
        assert_eq!(rx_stale.recv().await, Some(Outbound::Close));
        assert!(registry.room_of(stale).await.is_none());
        assert_eq!(registry.counts().await.connections, 1);

        // The survivor saw the offline presence broadcast.
        let Some(Outbound::Frame(frame)) = rx_live.recv().await else {
            panic!("expected a presence frame");
        };
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "presence_update");
        assert_eq!(value["user_handle"], "alice");
        assert_eq!(value["status"], "offline");
    }
}
