//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, ThreadSummary};

/// Messages sent from the remote thread authority to the client core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Keepalive
    Pong,

    // Thread lifecycle replies
    ThreadCreated {
        correlation_id: String,
        thread: ThreadSummary,
    },
    ThreadSwitched {
        correlation_id: String,
        thread_id: String,
    },
    ThreadDeleted {
        correlation_id: String,
        thread_id: String,
    },

    // Chat. `correlation_id` is present when the appended message originated
    // from this client; absent for messages that originated elsewhere.
    MessageAppended {
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        message: ChatMessage,
    },

    // Errors. A `correlation_id` ties the error back to the request that
    // caused it; without one the error is connection-scoped.
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl ServerMessage {
    /// The correlation id echoed back by the authority, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Pong => None,
            ServerMessage::ThreadCreated { correlation_id, .. }
            | ServerMessage::ThreadSwitched { correlation_id, .. }
            | ServerMessage::ThreadDeleted { correlation_id, .. } => Some(correlation_id),
            ServerMessage::MessageAppended { correlation_id, .. }
            | ServerMessage::Error { correlation_id, .. } => correlation_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ServerMessage;
    use crate::types::{ChatMessage, MessageRole};

    #[test]
    fn roundtrip_message_appended() {
        let msg = ServerMessage::MessageAppended {
            correlation_id: Some("corr-9".to_string()),
            message: ChatMessage {
                id: "srv-1".to_string(),
                thread_id: "thread-1".to_string(),
                role: MessageRole::User,
                content: "hello".to_string(),
                timestamp: "2026-01-01T00:00:00Z".to_string(),
            },
        };

        let json = serde_json::to_string(&msg).expect("serialize");
        let reparsed: ServerMessage = serde_json::from_str(&json).expect("deserialize");
        match reparsed {
            ServerMessage::MessageAppended {
                correlation_id,
                message,
            } => {
                assert_eq!(correlation_id.as_deref(), Some("corr-9"));
                assert_eq!(message.id, "srv-1");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn error_without_correlation_is_connection_scoped() {
        let json = r#"{"type":"error","code":"internal","message":"boom"}"#;
        let parsed: ServerMessage = serde_json::from_str(json).expect("deserialize");
        assert_eq!(parsed.correlation_id(), None);
    }
}
