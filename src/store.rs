use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;

/// A queued room message, owned by the durable store. The relay treats
/// `cipher_blob` as opaque; only the delivery marker is ever written back.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RoomMessage {
    pub id: i64,
    pub room_id: String,
    pub sender_handle: String,
    pub cipher_blob: String,
    pub filter_version: i64,
    pub queued_at: i64,
    pub delivered_at: Option<i64>,
    pub is_hidden: bool,
}

/// A queued direct message: status runs queued -> sent -> read.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DirectMessage {
    pub id: i64,
    pub from_user: String,
    pub to_user: String,
    pub cipher_blob: String,
    pub status: String,
    pub queued_at: i64,
    pub read_at: Option<i64>,
}

/// Create the relay's tables if they do not exist. Idempotent; run once at
/// startup (and per test pool).
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS room_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id TEXT NOT NULL,
            sender_handle TEXT NOT NULL,
            cipher_blob TEXT NOT NULL,
            filter_version INTEGER NOT NULL DEFAULT 1,
            queued_at INTEGER NOT NULL,
            delivered_at INTEGER,
            deleted_at INTEGER,
            is_hidden INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_room_messages_pending
         ON room_messages (room_id, delivered_at, deleted_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS direct_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            from_user TEXT NOT NULL,
            to_user TEXT NOT NULL,
            cipher_blob TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            queued_at INTEGER NOT NULL,
            read_at INTEGER
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS typing_state (
            user_handle TEXT NOT NULL,
            counterpart TEXT NOT NULL,
            is_typing INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_handle, counterpart)
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Room messages never offered to live subscribers, oldest first.
/// Deleted and hidden rows are never broadcast.
pub async fn undelivered_room_messages(
    pool: &SqlitePool,
    limit: i64,
) -> Result<Vec<RoomMessage>> {
    let rows = sqlx::query_as::<_, RoomMessage>(
        "SELECT id, room_id, sender_handle, cipher_blob, filter_version,
                queued_at, delivered_at, is_hidden
         FROM room_messages
         WHERE delivered_at IS NULL AND deleted_at IS NULL AND is_hidden = 0
         ORDER BY queued_at ASC
         LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Set the delivered marker. The `IS NULL` guard makes the transition
/// one-way and exactly-once; returns whether this call won it.
pub async fn mark_delivered(pool: &SqlitePool, id: i64, now: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE room_messages SET delivered_at = ? WHERE id = ? AND delivered_at IS NULL",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Number of room messages still awaiting live delivery. Surfaced by the
/// stats endpoint as a queue-depth gauge.
pub async fn count_undelivered(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM room_messages
         WHERE delivered_at IS NULL AND deleted_at IS NULL AND is_hidden = 0",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Direct messages handed off but not yet read.
pub async fn pending_direct_messages(pool: &SqlitePool) -> Result<Vec<DirectMessage>> {
    let rows = sqlx::query_as::<_, DirectMessage>(
        "SELECT id, from_user, to_user, cipher_blob, status, queued_at, read_at
         FROM direct_messages
         WHERE status = 'sent'
         ORDER BY queued_at ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Record a read receipt. Only touches the row when id, sender and
/// recipient all match and it is still unread; returns whether a row
/// transitioned.
pub async fn mark_im_read(
    pool: &SqlitePool,
    id: i64,
    from_user: &str,
    to_user: &str,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE direct_messages SET status = 'read', read_at = ?
         WHERE id = ? AND from_user = ? AND to_user = ? AND read_at IS NULL",
    )
    .bind(now)
    .bind(id)
    .bind(from_user)
    .bind(to_user)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Ephemeral typing flag, upserted on every typing event.
pub async fn upsert_typing(
    pool: &SqlitePool,
    user: &str,
    counterpart: &str,
    is_typing: bool,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO typing_state (user_handle, counterpart, is_typing, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (user_handle, counterpart)
         DO UPDATE SET is_typing = excluded.is_typing, updated_at = excluded.updated_at",
    )
    .bind(user)
    .bind(counterpart)
    .bind(is_typing)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}
