//! Core domain types for Muse - no IO, no async.
//!
//! Everything the conversation engine and the generation endpoint client
//! share lives here: message identities, the message sum type, content
//! proof types, and the normalized streaming event vocabulary.

mod ids;
mod message;
mod proofs;

pub use ids::{MessageId, SessionToken};
pub use message::{
    AssistantMessage, ChatTurn, Message, MessageStatus, Role, SystemMessage, UserMessage,
};
pub use proofs::{EmptyStringError, NonEmptyString};

/// Normalized streaming event emitted by a generation endpoint.
///
/// Every endpoint implementation reduces its wire protocol to this
/// vocabulary. A well-behaved stream is zero or more `TextDelta`s followed
/// by exactly one `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text content delta, applied in arrival order.
    TextDelta(String),
    /// Stream completed.
    Done,
    /// Stream terminated with an error; partial content stays visible.
    Error(String),
}

/// Reason a stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFinishReason {
    Done,
    Error(String),
}
