pub mod presence;
pub mod protocol;
pub mod signals;
mod ws;

use axum::{Router, routing::get};
use tracing::info;

use crate::AppState;
use crate::broadcast::Broadcaster;
use crate::registry::{ConnId, Outbound, Registry};

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::relay_ws))
}

/// Shared cleanup path for client disconnects, socket errors and the
/// reaper: drop the connection from every index, announce the departure,
/// ask the pump to close the socket. Idempotent, so the reaper and the
/// socket loop may both run it.
pub async fn teardown(registry: &Registry, broadcaster: &Broadcaster, conn: ConnId) {
    if let Some((user, room, tx)) = registry.unregister(conn).await {
        let _ = tx.send(Outbound::Close);
        if let Some(room) = &room {
            presence::offline(broadcaster, room, &user, None).await;
        }
        info!(%conn, %user, ?room, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn teardown_queues_close_then_releases_the_channel() {
        let registry = Registry::new();
        let broadcaster = Broadcaster::new(registry.clone());
        let (tx, mut rx) = unbounded_channel();
        let conn = ConnId::new();
        registry.register(conn, "alice", "lobby", tx).await;

        teardown(&registry, &broadcaster, conn).await;

        // The pump sees the close frame first and end-of-channel right
        // after, so it can flush the frame and exit without being aborted.
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert_eq!(rx.recv().await, None);
    }
}
