//! Conversation message domain model.
//!
//! Contains the `Message` sum type and its role-specific structs.
//! Constructors take `SystemTime` explicitly; callers own the clock.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::proofs::NonEmptyString;

/// Message role as seen by the generation endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of an assistant reply.
///
/// User and system messages are complete by construction; only assistant
/// replies pass through `Streaming` and can end up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Streaming,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessage {
    id: MessageId,
    content: NonEmptyString,
    timestamp: SystemTime,
}

impl SystemMessage {
    #[must_use]
    pub fn new(id: MessageId, content: NonEmptyString, timestamp: SystemTime) -> Self {
        Self {
            id,
            content,
            timestamp,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    id: MessageId,
    content: NonEmptyString,
    timestamp: SystemTime,
}

impl UserMessage {
    #[must_use]
    pub fn new(id: MessageId, content: NonEmptyString, timestamp: SystemTime) -> Self {
        Self {
            id,
            content,
            timestamp,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }

    /// Replace the content in place. Edits replace content, not provenance:
    /// `timestamp` keeps the original creation time.
    pub fn replace_content(&mut self, content: NonEmptyString) {
        self.content = content;
    }
}

/// An assistant reply. Mutable only while `Streaming`: content grows
/// monotonically via [`AssistantMessage::append_delta`] until the reply is
/// finalized or fails, after which it is an immutable value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    id: MessageId,
    content: String,
    status: MessageStatus,
    timestamp: SystemTime,
}

impl AssistantMessage {
    /// An empty reply in `Streaming` state, appended before generation
    /// starts and filled in by streamed deltas.
    #[must_use]
    pub fn placeholder(id: MessageId, timestamp: SystemTime) -> Self {
        Self {
            id,
            content: String::new(),
            status: MessageStatus::Streaming,
            timestamp,
        }
    }

    #[must_use]
    pub fn complete(id: MessageId, content: NonEmptyString, timestamp: SystemTime) -> Self {
        Self {
            id,
            content: content.into_inner(),
            status: MessageStatus::Complete,
            timestamp,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn append_delta(&mut self, delta: &str) {
        debug_assert_eq!(self.status, MessageStatus::Streaming);
        self.content.push_str(delta);
    }

    pub fn finalize(&mut self) {
        self.status = MessageStatus::Complete;
    }

    pub fn fail(&mut self) {
        self.status = MessageStatus::Failed;
    }
}

/// A complete message.
///
/// This is a real sum type (not a `Role` tag + "sometimes-meaningful" fields):
/// only assistant replies carry a delivery status, and only user and system
/// messages prove their content non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    System(SystemMessage),
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl Message {
    #[must_use]
    pub fn system(id: MessageId, content: NonEmptyString, timestamp: SystemTime) -> Self {
        Self::System(SystemMessage::new(id, content, timestamp))
    }

    #[must_use]
    pub fn user(id: MessageId, content: NonEmptyString, timestamp: SystemTime) -> Self {
        Self::User(UserMessage::new(id, content, timestamp))
    }

    #[must_use]
    pub fn reply_placeholder(id: MessageId, timestamp: SystemTime) -> Self {
        Self::Assistant(AssistantMessage::placeholder(id, timestamp))
    }

    #[must_use]
    pub fn id(&self) -> MessageId {
        match self {
            Message::System(m) => m.id,
            Message::User(m) => m.id,
            Message::Assistant(m) => m.id,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Message::System(_) => Role::System,
            Message::User(_) => Role::User,
            Message::Assistant(_) => Role::Assistant,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Message::System(m) => m.content(),
            Message::User(m) => m.content(),
            Message::Assistant(m) => m.content(),
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        match self {
            Message::System(m) => m.timestamp,
            Message::User(m) => m.timestamp,
            Message::Assistant(m) => m.timestamp,
        }
    }

    /// User and system messages are complete by construction.
    #[must_use]
    pub fn status(&self) -> MessageStatus {
        match self {
            Message::System(_) | Message::User(_) => MessageStatus::Complete,
            Message::Assistant(m) => m.status(),
        }
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.status() == MessageStatus::Streaming
    }

    #[must_use]
    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Message::User(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            _ => None,
        }
    }
}

/// Prompt-context projection of a message: what the generation endpoint
/// receives. Status and identity stay behind; only role and text travel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role(),
            content: message.content().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::{ChatTurn, Message, MessageStatus, Role};
    use crate::ids::MessageId;
    use crate::proofs::NonEmptyString;

    fn user(id: u64, text: &str) -> Message {
        Message::user(
            MessageId::new(id),
            NonEmptyString::new(text).unwrap(),
            SystemTime::UNIX_EPOCH,
        )
    }

    #[test]
    fn placeholder_starts_empty_and_streaming() {
        let msg = Message::reply_placeholder(MessageId::new(1), SystemTime::UNIX_EPOCH);
        assert_eq!(msg.content(), "");
        assert_eq!(msg.status(), MessageStatus::Streaming);
        assert!(msg.is_streaming());
    }

    #[test]
    fn deltas_grow_monotonically() {
        let mut msg = Message::reply_placeholder(MessageId::new(1), SystemTime::UNIX_EPOCH);
        let Message::Assistant(reply) = &mut msg else {
            unreachable!()
        };
        reply.append_delta("Hello");
        reply.append_delta(", world");
        reply.finalize();
        assert_eq!(msg.content(), "Hello, world");
        assert_eq!(msg.status(), MessageStatus::Complete);
    }

    #[test]
    fn edit_preserves_timestamp() {
        let mut msg = user(1, "before");
        let created = msg.timestamp();
        let Message::User(inner) = &mut msg else {
            unreachable!()
        };
        inner.replace_content(NonEmptyString::new("after").unwrap());
        assert_eq!(msg.content(), "after");
        assert_eq!(msg.timestamp(), created);
    }

    #[test]
    fn user_messages_are_always_complete() {
        let msg = user(1, "hi");
        assert_eq!(msg.status(), MessageStatus::Complete);
    }

    #[test]
    fn chat_turn_projects_role_and_content() {
        let turn = ChatTurn::from(&user(7, "brainstorm taglines"));
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.content, "brainstorm taglines");
    }
}
