use crate::broadcast::Broadcaster;
use crate::registry::ConnId;

use super::protocol::ServerMessage;

/// Presence is purely derived from registry transitions; nothing here is
/// persisted.
pub async fn announce(
    broadcaster: &Broadcaster,
    room: &str,
    user: &str,
    status: &str,
    exclude: Option<ConnId>,
) -> usize {
    broadcaster
        .room(
            room,
            &ServerMessage::PresenceUpdate {
                room_id: room.to_owned(),
                user_handle: user.to_owned(),
                status: status.to_owned(),
            },
            exclude,
        )
        .await
}

pub async fn online(broadcaster: &Broadcaster, room: &str, user: &str, exclude: Option<ConnId>) {
    announce(broadcaster, room, user, "online", exclude).await;
}

pub async fn offline(broadcaster: &Broadcaster, room: &str, user: &str, exclude: Option<ConnId>) {
    announce(broadcaster, room, user, "offline", exclude).await;
}
