use tracing::error;

use crate::registry::{ConnId, Registry};
use crate::relay::protocol::ServerMessage;

/// Typed fan-out over the registry. Serializes a server message once and
/// offers it to every connection in scope; per-connection failures are
/// logged inside the registry and skipped. Counts are diagnostics, never
/// correctness inputs.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Registry,
}

impl Broadcaster {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub async fn room(&self, room: &str, msg: &ServerMessage, exclude: Option<ConnId>) -> usize {
        let Some(frame) = encode(msg) else { return 0 };
        self.registry.send_to_room(room, &frame, exclude).await
    }

    pub async fn user(&self, user: &str, msg: &ServerMessage) -> usize {
        let Some(frame) = encode(msg) else { return 0 };
        self.registry.send_to_user(user, &frame).await
    }
}

fn encode(msg: &ServerMessage) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(frame) => Some(frame),
        Err(err) => {
            error!(error = %err, "failed to encode server message");
            None
        }
    }
}
