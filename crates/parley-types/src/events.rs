use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationPayload, MessagePayload, UserPayload, UserProfile};

/// Events pushed to a user's live sessions over the WebSocket gateway.
/// Every event is addressed to a specific user and rendered from that user's
/// perspective before it is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the session is bound to a verified identity.
    Ready { user: UserProfile },

    /// The recipient's own view of a conversation changed (new message,
    /// read transition). Carries the embedded last message.
    ConversationUpdated { conversation: ConversationPayload },

    /// A new message landed in one of the recipient's conversations.
    /// Always preceded by the ConversationUpdated that explains it.
    MessageDelivered { message: MessagePayload },

    /// A single message transitioned to read.
    MessageRead { message: MessagePayload },

    /// A batch of messages transitioned to read in one operation.
    MessagesRead { messages: Vec<MessagePayload> },

    /// The recipient's denormalized conversation count changed.
    ConversationsCountUpdated { conversations_count: i64 },

    /// Someone is typing to the recipient, directly or in a shared
    /// conversation. Ephemeral, never persisted.
    Typing {
        conversation: Option<Uuid>,
        user: UserPayload,
    },
}

/// Commands sent from client to server over the WebSocket.
/// The session is authenticated at upgrade time, so commands carry no
/// credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Indicate typing to a user or inside a conversation.
    Typing {
        to: Option<Uuid>,
        conversation: Option<Uuid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_with_type_and_data() {
        let event = GatewayEvent::ConversationsCountUpdated {
            conversations_count: 3,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ConversationsCountUpdated");
        assert_eq!(json["data"]["conversations_count"], 3);
    }

    #[test]
    fn typing_command_parses_with_either_target() {
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"Typing","data":{"to":"00000000-0000-4000-8000-000000000001","conversation":null}}"#,
        )
        .unwrap();
        match cmd {
            GatewayCommand::Typing { to, conversation } => {
                assert!(to.is_some());
                assert!(conversation.is_none());
            }
        }
    }
}
