use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

/// Opaque id assigned to every connection at handshake time. Connections
/// are indexed by this id everywhere; the live socket half stays in the
/// per-connection pump task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What travels down a connection's outbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized server message, sent as a text frame.
    Frame(String),
    /// Websocket ping, used by the liveness supervisor.
    Ping,
    /// Close the socket and stop the pump.
    Close,
}

struct ConnEntry {
    user: String,
    room: Option<String>,
    tx: UnboundedSender<Outbound>,
    last_seen: Instant,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, ConnEntry>,
    rooms: HashMap<String, HashSet<ConnId>>,
    users: HashMap<String, HashSet<ConnId>>,
}

/// Point-in-time registry totals, input to the stats snapshot.
#[derive(Debug, Clone)]
pub struct RegistryCounts {
    pub users: usize,
    pub connections: usize,
    pub rooms: BTreeMap<String, usize>,
}

/// In-memory index of every open connection: user-handle -> connections,
/// room -> subscribed connections, connection -> metadata. All mutation
/// happens under one lock, so the two indices can never be observed
/// half-updated.
#[derive(Default, Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        conn: ConnId,
        user: &str,
        room: &str,
        tx: UnboundedSender<Outbound>,
    ) {
        let mut inner = self.inner.write().await;
        inner.conns.insert(
            conn,
            ConnEntry {
                user: user.to_owned(),
                room: Some(room.to_owned()),
                tx,
                last_seen: Instant::now(),
            },
        );
        inner.rooms.entry(room.to_owned()).or_default().insert(conn);
        inner.users.entry(user.to_owned()).or_default().insert(conn);
        debug!(%conn, user, room, "registered connection");
    }

    /// Remove a connection from every index. Returns the owner, the last
    /// known room, and the outbound sender so the caller can announce the
    /// departure and close the socket. Idempotent: a second call for the
    /// same id returns `None`.
    pub async fn unregister(
        &self,
        conn: ConnId,
    ) -> Option<(String, Option<String>, UnboundedSender<Outbound>)> {
        let mut inner = self.inner.write().await;
        let entry = inner.conns.remove(&conn)?;
        if let Some(room) = &entry.room {
            remove_from_bucket(&mut inner.rooms, room, conn);
        }
        remove_from_bucket(&mut inner.users, &entry.user, conn);
        debug!(%conn, user = %entry.user, "unregistered connection");
        Some((entry.user, entry.room, entry.tx))
    }

    /// Atomically move a connection between room buckets. `new_room = None`
    /// leaves the connection registered but subscribed to no room. Returns
    /// the previous room, or `None` if the connection is unknown.
    pub async fn switch_room(
        &self,
        conn: ConnId,
        new_room: Option<&str>,
    ) -> Option<Option<String>> {
        let mut inner = self.inner.write().await;
        let old = {
            let entry = inner.conns.get_mut(&conn)?;
            let old = entry.room.take();
            entry.room = new_room.map(str::to_owned);
            old
        };
        if let Some(old_room) = &old {
            remove_from_bucket(&mut inner.rooms, old_room, conn);
        }
        if let Some(new_room) = new_room {
            inner.rooms.entry(new_room.to_owned()).or_default().insert(conn);
        }
        Some(old)
    }

    pub async fn room_of(&self, conn: ConnId) -> Option<String> {
        self.inner.read().await.conns.get(&conn)?.room.clone()
    }

    /// Queue a frame to every connection in a room, except `exclude`.
    /// A closed channel is logged and skipped; it never aborts the rest of
    /// the fan-out. Returns the number of successful sends.
    pub async fn send_to_room(&self, room: &str, frame: &str, exclude: Option<ConnId>) -> usize {
        let inner = self.inner.read().await;
        let Some(bucket) = inner.rooms.get(room) else {
            return 0;
        };
        let mut sent = 0;
        for conn in bucket {
            if Some(*conn) == exclude {
                continue;
            }
            if let Some(entry) = inner.conns.get(conn) {
                if entry.tx.send(Outbound::Frame(frame.to_owned())).is_ok() {
                    sent += 1;
                } else {
                    debug!(%conn, room, "send to closed connection skipped");
                }
            }
        }
        sent
    }

    /// Queue a frame to every connection a user currently holds.
    pub async fn send_to_user(&self, user: &str, frame: &str) -> usize {
        let inner = self.inner.read().await;
        let Some(bucket) = inner.users.get(user) else {
            return 0;
        };
        let mut sent = 0;
        for conn in bucket {
            if let Some(entry) = inner.conns.get(conn) {
                if entry.tx.send(Outbound::Frame(frame.to_owned())).is_ok() {
                    sent += 1;
                } else {
                    debug!(%conn, user, "send to closed connection skipped");
                }
            }
        }
        sent
    }

    pub async fn send_to_conn(&self, conn: ConnId, out: Outbound) -> bool {
        let inner = self.inner.read().await;
        match inner.conns.get(&conn) {
            Some(entry) => entry.tx.send(out).is_ok(),
            None => false,
        }
    }

    /// Refresh a connection's liveness timestamp.
    pub async fn touch(&self, conn: ConnId) {
        if let Some(entry) = self.inner.write().await.conns.get_mut(&conn) {
            entry.last_seen = Instant::now();
        }
    }

    /// Queue a websocket ping to every connection. Returns how many were
    /// reachable.
    pub async fn ping_all(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .conns
            .values()
            .filter(|entry| entry.tx.send(Outbound::Ping).is_ok())
            .count()
    }

    /// Connections whose last-seen timestamp is older than `max_idle`.
    pub async fn idle_connections(&self, max_idle: Duration) -> Vec<ConnId> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        inner
            .conns
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > max_idle)
            .map(|(conn, _)| *conn)
            .collect()
    }

    /// Ask every open connection to close. Used on shutdown.
    pub async fn close_all(&self) {
        let inner = self.inner.read().await;
        for entry in inner.conns.values() {
            let _ = entry.tx.send(Outbound::Close);
        }
    }

    pub async fn counts(&self) -> RegistryCounts {
        let inner = self.inner.read().await;
        RegistryCounts {
            users: inner.users.len(),
            connections: inner.conns.len(),
            rooms: inner
                .rooms
                .iter()
                .map(|(room, bucket)| (room.clone(), bucket.len()))
                .collect(),
        }
    }
}

fn remove_from_bucket(
    buckets: &mut HashMap<String, HashSet<ConnId>>,
    key: &str,
    conn: ConnId,
) {
    if let Some(bucket) = buckets.get_mut(key) {
        bucket.remove(&conn);
        if bucket.is_empty() {
            buckets.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    async fn connect(
        registry: &Registry,
        user: &str,
        room: &str,
    ) -> (ConnId, UnboundedReceiver<Outbound>) {
        let (tx, rx) = unbounded_channel();
        let conn = ConnId::new();
        registry.register(conn, user, room, tx).await;
        (conn, rx)
    }

    #[tokio::test]
    async fn register_populates_both_indices() {
        let registry = Registry::new();
        let (conn, _rx) = connect(&registry, "alice", "lobby").await;

        let counts = registry.counts().await;
        assert_eq!(counts.users, 1);
        assert_eq!(counts.connections, 1);
        assert_eq!(counts.rooms.get("lobby"), Some(&1));
        assert_eq!(registry.room_of(conn).await.as_deref(), Some("lobby"));
    }

    #[tokio::test]
    async fn unregister_clears_both_indices() {
        let registry = Registry::new();
        let (conn, _rx) = connect(&registry, "alice", "lobby").await;

        let (user, room, _tx) = registry.unregister(conn).await.unwrap();
        assert_eq!(user, "alice");
        assert_eq!(room.as_deref(), Some("lobby"));

        let counts = registry.counts().await;
        assert_eq!(counts.users, 0);
        assert_eq!(counts.connections, 0);
        assert!(counts.rooms.is_empty());

        // Second unregister is a no-op.
        assert!(registry.unregister(conn).await.is_none());
    }

    #[tokio::test]
    async fn switch_room_is_atomic() {
        let registry = Registry::new();
        let (conn, _rx) = connect(&registry, "alice", "lobby").await;

        let old = registry.switch_room(conn, Some("ops")).await.unwrap();
        assert_eq!(old.as_deref(), Some("lobby"));

        let counts = registry.counts().await;
        assert!(counts.rooms.get("lobby").is_none());
        assert_eq!(counts.rooms.get("ops"), Some(&1));
        assert_eq!(registry.room_of(conn).await.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn leave_room_keeps_connection_registered() {
        let registry = Registry::new();
        let (conn, _rx) = connect(&registry, "alice", "lobby").await;

        let old = registry.switch_room(conn, None).await.unwrap();
        assert_eq!(old.as_deref(), Some("lobby"));

        let counts = registry.counts().await;
        assert_eq!(counts.connections, 1);
        assert_eq!(counts.users, 1);
        assert!(counts.rooms.is_empty());
        assert!(registry.room_of(conn).await.is_none());
    }

    #[tokio::test]
    async fn multiple_devices_share_one_user_bucket() {
        let registry = Registry::new();
        let (_a, mut rx_a) = connect(&registry, "alice", "lobby").await;
        let (_b, mut rx_b) = connect(&registry, "alice", "ops").await;

        let counts = registry.counts().await;
        assert_eq!(counts.users, 1);
        assert_eq!(counts.connections, 2);

        let sent = registry.send_to_user("alice", "hi").await;
        assert_eq!(sent, 2);
        assert_eq!(rx_a.recv().await, Some(Outbound::Frame("hi".into())));
        assert_eq!(rx_b.recv().await, Some(Outbound::Frame("hi".into())));
    }

    #[tokio::test]
    async fn room_send_honors_exclusion() {
        let registry = Registry::new();
        let (a, mut rx_a) = connect(&registry, "alice", "lobby").await;
        let (_b, mut rx_b) = connect(&registry, "bob", "lobby").await;

        let sent = registry.send_to_room("lobby", "hello", Some(a)).await;
        assert_eq!(sent, 1);
        assert_eq!(rx_b.recv().await, Some(Outbound::Frame("hello".into())));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_channel_does_not_abort_fanout() {
        let registry = Registry::new();
        let (_a, rx_a) = connect(&registry, "alice", "lobby").await;
        let (_b, mut rx_b) = connect(&registry, "bob", "lobby").await;
        drop(rx_a);

        let sent = registry.send_to_room("lobby", "hello", None).await;
        assert_eq!(sent, 1);
        assert_eq!(rx_b.recv().await, Some(Outbound::Frame("hello".into())));
    }

    #[tokio::test]
    async fn idle_connections_reports_stale_entries() {
        let registry = Registry::new();
        let (conn, _rx) = connect(&registry, "alice", "lobby").await;

        assert!(registry.idle_connections(Duration::from_secs(60)).await.is_empty());
        let idle = registry.idle_connections(Duration::ZERO).await;
        assert_eq!(idle, vec![conn]);

        registry.touch(conn).await;
        assert!(
            registry
                .idle_connections(Duration::from_millis(50))
                .await
                .is_empty()
        );
    }
}
