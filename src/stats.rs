use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{Json, Router, debug_handler, extract::State, routing::get};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::registry::Registry;
use crate::{AppResult, AppState, Settings, store};

/// Read-only introspection snapshot. Served in-channel (`get_stats`) and
/// over HTTP for operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub connected_users: usize,
    pub open_connections: usize,
    pub active_rooms: usize,
    pub rooms: BTreeMap<String, usize>,
    /// Room messages queued but not yet offered to live subscribers.
    pub pending_outbox: i64,
}

pub async fn snapshot(
    registry: &Registry,
    pool: &SqlitePool,
    started: Instant,
) -> Result<StatsSnapshot> {
    let counts = registry.counts().await;
    let pending_outbox = store::count_undelivered(pool).await?;
    Ok(StatsSnapshot {
        uptime_seconds: started.elapsed().as_secs(),
        connected_users: counts.users,
        open_connections: counts.connections,
        active_rooms: counts.rooms.len(),
        rooms: counts.rooms,
        pending_outbox,
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(http_stats))
        .route("/health", get(http_health))
}

#[debug_handler(state = crate::AppState)]
async fn http_stats(
    State(registry): State<Registry>,
    State(db_pool): State<SqlitePool>,
    State(settings): State<Arc<Settings>>,
) -> AppResult<Json<StatsSnapshot>> {
    let snapshot = snapshot(&registry, &db_pool, settings.started).await?;
    Ok(Json(snapshot))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    uptime_seconds: u64,
}

#[debug_handler(state = crate::AppState)]
async fn http_health(State(settings): State<Arc<Settings>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        uptime_seconds: settings.started.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnId;
    use crate::store::testutil::{insert_room_message, memory_pool};
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn snapshot_counts_users_rooms_connections_and_queue_depth() {
        let pool = memory_pool().await;
        let registry = Registry::new();
        for (user, room) in [("alice", "lobby"), ("alice", "lobby"), ("bob", "ops")] {
            let (tx, rx) = unbounded_channel();
            std::mem::forget(rx);
            registry.register(ConnId::new(), user, room, tx).await;
        }
        insert_room_message(&pool, "lobby", "alice", "pending", 100).await;

        let stats = snapshot(&registry, &pool, Instant::now()).await.unwrap();
        assert_eq!(stats.connected_users, 2);
        assert_eq!(stats.open_connections, 3);
        assert_eq!(stats.active_rooms, 2);
        assert_eq!(stats.rooms.get("lobby"), Some(&2));
        assert_eq!(stats.rooms.get("ops"), Some(&1));
        assert_eq!(stats.pending_outbox, 1);
    }

    #[tokio::test]
    async fn snapshot_surfaces_store_errors() {
        let pool = memory_pool().await;
        let registry = Registry::new();
        sqlx::query("DROP TABLE room_messages")
            .execute(&pool)
            .await
            .unwrap();

        assert!(snapshot(&registry, &pool, Instant::now()).await.is_err());
    }
}
