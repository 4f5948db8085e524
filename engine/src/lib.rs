//! Conversation core for Muse - the state machine behind the in-app
//! campaign-brainstorm chat.
//!
//! Three pieces cooperate here, with no UI dependencies:
//!
//! - [`History`] owns the ordered message sequence and its identities.
//! - An active generation session drives one streamed reply from the
//!   generation endpoint into the trailing placeholder message.
//! - [`Chat`] is the mutation coordinator: the single entry point for every
//!   structural change (submit, edit, reload, delete, clear, stop), which
//!   serializes user edits against in-flight streams so a stale delta can
//!   never resurrect content the user already edited away.
//!
//! The UI layer only ever sees immutable snapshots plus a coarse
//! [`ChatStatus`]; it never holds a live reference into the history.

mod config;
mod coordinator;
mod endpoint;
mod history;
mod session;


// Re-export from crates for public API
pub use muse_providers::{self, ApiKey, EndpointConfig, RequestOptions};
pub use muse_types::{
    ChatTurn, EmptyStringError, Message, MessageId, MessageStatus, NonEmptyString, Role,
    SessionToken, StreamEvent, StreamFinishReason,
};

pub use config::{ApiSection, ChatSection, ConfigError, DEFAULT_MODEL, MuseConfig, config_path};
pub use coordinator::{Chat, ChatError, ChatStatus};
pub use endpoint::{GenerationEndpoint, GenerationRequest, HttpGenerationEndpoint};
pub use history::{History, HistoryError};

/// Capacity of the per-session stream event channel.
pub(crate) const STREAM_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum events applied per [`Chat::process_events`] call, so a fast
/// stream cannot starve the caller's loop.
pub(crate) const DEFAULT_STREAM_EVENT_BUDGET: usize = 256;
