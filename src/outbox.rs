use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::time::{interval, sleep};
use tracing::{debug, warn};

use crate::broadcast::Broadcaster;
use crate::now_unix;
use crate::relay::protocol::ServerMessage;
use crate::store;

/// Bridges the durable outbox to live push delivery. Polls on a fixed
/// interval, broadcasts whatever the store says is pending, then sets the
/// delivered marker. Stateless across ticks: every tick re-reads the
/// store, so a failed tick heals on the next one.
pub struct OutboxBridge {
    pool: SqlitePool,
    broadcaster: Broadcaster,
    poll_interval: Duration,
    delivery_grace: Duration,
    batch_size: i64,
    busy: AtomicBool,
}

impl OutboxBridge {
    pub fn new(
        pool: SqlitePool,
        broadcaster: Broadcaster,
        poll_interval: Duration,
        delivery_grace: Duration,
        batch_size: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            broadcaster,
            poll_interval,
            delivery_grace,
            batch_size,
            busy: AtomicBool::new(false),
        })
    }

    /// Tick forever. A tick is spawned only when the previous one has
    /// finished; a store slower than the poll interval therefore skips
    /// ticks instead of double-broadcasting rows whose delivered marker
    /// has not committed yet.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if self.busy.swap(true, Ordering::AcqRel) {
                debug!("previous outbox tick still in flight, skipping");
                continue;
            }
            self.spawn_tick();
        }
    }

    fn spawn_tick(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            // The guard clears the flag on every exit path, a panicking
            // tick included.
            let _busy = BusyGuard(Arc::clone(&bridge));
            if let Err(err) = bridge.tick().await {
                warn!(error = %err, "outbox tick abandoned");
            }
        })
    }

    /// One poll cycle: room messages in queued-time order, then pending
    /// direct messages. Any store error abandons the rest of the tick.
    pub async fn tick(&self) -> Result<()> {
        self.deliver_room_messages().await?;
        self.deliver_direct_messages().await?;
        Ok(())
    }

    async fn deliver_room_messages(&self) -> Result<()> {
        let pending = store::undelivered_room_messages(&self.pool, self.batch_size).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut offered = Vec::with_capacity(pending.len());
        for row in pending {
            let id = row.id;
            let room = row.room_id.clone();
            let sent = self
                .broadcaster
                .room(&room, &ServerMessage::NewMessage { message: row }, None)
                .await;
            debug!(id, room = %room, sent, "room message broadcast");
            offered.push(id);
        }

        // Grace delay before marking, so subscribers arriving while the
        // broadcast ran still received the push.
        sleep(self.delivery_grace).await;
        for id in offered {
            store::mark_delivered(&self.pool, id, now_unix()).await?;
        }
        Ok(())
    }

    async fn deliver_direct_messages(&self) -> Result<()> {
        for row in store::pending_direct_messages(&self.pool).await? {
            let im_id = row.id;
            let from_user = row.from_user.clone();
            let to_user = row.to_user.clone();
            let reached = self
                .broadcaster
                .user(&to_user, &ServerMessage::NewIm { im: row })
                .await;
            if reached > 0 {
                self.broadcaster
                    .user(
                        &from_user,
                        &ServerMessage::ImDelivered {
                            im_id,
                            to_user: to_user.clone(),
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }
}

struct BusyGuard(Arc<OutboxBridge>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}
