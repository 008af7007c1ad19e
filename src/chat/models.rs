//! The core models for a chat transcript.
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "bot")]
    Bot,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageStatus {
    /// User messages are complete from the moment they are created.
    Complete,
    /// A bot message that is still receiving fragments.
    Streaming,
    Finished {
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

impl MessageStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, MessageStatus::Streaming)
    }

    pub fn is_stream_failed(&self) -> bool {
        matches!(self, MessageStatus::Failed { .. } | MessageStatus::Cancelled)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
}

impl Message {
    pub fn user(content: &str) -> Self {
        Message {
            role: Role::User,
            content: content.to_string(),
            status: MessageStatus::Complete,
        }
    }

    /// Empty bot message waiting for its first fragment.
    pub fn bot_placeholder() -> Self {
        Message {
            role: Role::Bot,
            content: String::new(),
            status: MessageStatus::Streaming,
        }
    }

    pub fn is_open_bot(&self) -> bool {
        self.role == Role::Bot && self.status.is_open()
    }
}

/// Ordered, append-only list of messages.
#[derive(Default, Debug, Clone)]
pub struct Transcript(Vec<Message>);

impl Transcript {
    pub fn new_with_messages(messages: Vec<Message>) -> Self {
        Self(messages)
    }

    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    pub fn push(&mut self, msg: Message) {
        self.0.push(msg)
    }

    pub fn last(&self) -> Option<&Message> {
        self.0.last()
    }

    // Only the last message may be mutated, everything before it is
    // settled.
    pub(crate) fn last_mut(&mut self) -> Option<&mut Message> {
        self.0.last_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), r#""user""#);
        assert_eq!(serde_json::to_string(&Role::Bot).unwrap(), r#""bot""#);
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::user("Hi");
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"role":"user","content":"Hi","status":{"state":"complete"}}"#
        );

        let msg = Message {
            role: Role::Bot,
            content: "Hello".to_string(),
            status: MessageStatus::Finished {
                finish_reason: Some("stop".to_string()),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"role":"bot","content":"Hello","status":{"state":"finished","finish_reason":"stop"}}"#
        );
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_bot_placeholder_is_open() {
        let msg = Message::bot_placeholder();
        assert!(msg.is_open_bot());
        assert!(msg.content.is_empty());
        assert!(!Message::user("Hi").is_open_bot());
    }

    #[test]
    fn test_status_stream_failed() {
        assert!(MessageStatus::Cancelled.is_stream_failed());
        assert!(
            MessageStatus::Failed {
                reason: "dropped".to_string()
            }
            .is_stream_failed()
        );
        assert!(!MessageStatus::Streaming.is_stream_failed());
        assert!(!MessageStatus::Finished { finish_reason: None }.is_stream_failed());
    }
}
