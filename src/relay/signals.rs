use sqlx::SqlitePool;
use tracing::warn;

use crate::broadcast::Broadcaster;
use crate::{now_unix, store};

use super::protocol::ServerMessage;

/// Forward a typing event to the addressed counterpart. The flag is also
/// upserted into the store best-effort; persistence failure only logs.
/// The event goes to every connection the counterpart holds and never to
/// the typist's own.
pub async fn typing(
    pool: &SqlitePool,
    broadcaster: &Broadcaster,
    from_user: &str,
    conversation_with: &str,
    is_typing: bool,
) {
    if let Err(err) = store::upsert_typing(pool, from_user, conversation_with, is_typing, now_unix()).await {
        warn!(error = %err, from_user, "failed to persist typing state");
    }

    if conversation_with == from_user {
        return;
    }
    broadcaster
        .user(
            conversation_with,
            &ServerMessage::Typing {
                from_user: from_user.to_owned(),
                is_typing,
            },
        )
        .await;
}

/// Record a read receipt from `reader` and, if a row actually
/// transitioned, tell every connection of the original sender. A receipt
/// that matches no unread row is a no-op, not an error.
pub async fn read_receipt(
    pool: &SqlitePool,
    broadcaster: &Broadcaster,
    reader: &str,
    message_id: i64,
    from_user: &str,
) {
    match store::mark_im_read(pool, message_id, from_user, reader, now_unix()).await {
        Ok(true) => {
            broadcaster
                .user(
                    from_user,
                    &ServerMessage::ReadReceipt {
                        message_id,
                        read_by: reader.to_owned(),
                    },
                )
                .await;
        }
        Ok(false) => {}
        Err(err) => warn!(error = %err, message_id, "failed to record read receipt"),
    }
}
