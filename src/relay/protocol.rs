use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;
use crate::store::{DirectMessage, RoomMessage};

/// Everything a client may send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Typing {
        conversation_with: String,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: i64,
        from_user: String,
    },
    GetStats,
    JoinRoom {
        room_id: String,
    },
    LeaveRoom,
    PresenceUpdate {
        status: String,
    },
}

/// Everything the server pushes to clients. Room and direct message
/// payloads are the store rows serialized as-is.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        user_handle: String,
        room_id: String,
    },
    NewMessage {
        message: RoomMessage,
    },
    NewIm {
        im: DirectMessage,
    },
    ImDelivered {
        im_id: i64,
        to_user: String,
    },
    PresenceUpdate {
        room_id: String,
        user_handle: String,
        status: String,
    },
    Typing {
        from_user: String,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: i64,
        read_by: String,
    },
    RoomJoined {
        room_id: String,
    },
    ServerStats {
        stats: StatsSnapshot,
    },
    Pong,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_parse_from_wire_form() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"typing","conversation_with":"bob","is_typing":true}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Typing { ref conversation_with, is_typing: true }
                if conversation_with == "bob"
        ));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_room","room_id":"ops"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinRoom { ref room_id } if room_id == "ops"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shrug"}"#).is_err());
    }

    #[test]
    fn server_messages_tag_with_snake_case() {
        let frame = serde_json::to_value(ServerMessage::ImDelivered {
            im_id: 7,
            to_user: "bob".into(),
        })
        .unwrap();
        assert_eq!(frame["type"], "im_delivered");
        assert_eq!(frame["im_id"], 7);
    }
}
