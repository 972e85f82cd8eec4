//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from the client core to the remote thread authority.
///
/// Every message that expects a reply carries a client-generated
/// `correlation_id`; the authority echoes it back so the reply can be
/// matched to the originating request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Keepalive
    Ping,

    // Thread lifecycle
    CreateThread {
        correlation_id: String,
    },
    SwitchThread {
        correlation_id: String,
        thread_id: String,
    },
    DeleteThread {
        correlation_id: String,
        thread_id: String,
    },

    // Chat
    PostMessage {
        correlation_id: String,
        thread_id: String,
        content: String,
    },
}

impl ClientMessage {
    /// The correlation id attached to this message, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Ping => None,
            ClientMessage::CreateThread { correlation_id }
            | ClientMessage::SwitchThread { correlation_id, .. }
            | ClientMessage::DeleteThread { correlation_id, .. }
            | ClientMessage::PostMessage { correlation_id, .. } => Some(correlation_id),
        }
    }
}
