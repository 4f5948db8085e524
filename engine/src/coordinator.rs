//! The mutation coordinator: single entry point for every structural change
//! to the conversation.
//!
//! Every operation follows the same discipline: validate against the
//! current history first (a rejected mutation leaves the conversation
//! untouched), cancel any active generation session *synchronously before*
//! touching the history, then mutate and - where the operation calls for it
//! - start a new session. Because cancellation happens before the mutation
//! and every streamed event is checked against the current session token,
//! no delta belonging to a stale session can ever be applied after a
//! truncation.

use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::{AbortHandle, Abortable};
use tokio::sync::mpsc;

use muse_types::{
    ChatTurn, Message, MessageId, NonEmptyString, Role, SessionToken, StreamEvent,
    StreamFinishReason,
};

use crate::endpoint::{GenerationEndpoint, GenerationRequest};
use crate::history::{History, HistoryError};
use crate::session::{ActiveGeneration, OperationState};
use crate::{DEFAULT_STREAM_EVENT_BUDGET, STREAM_EVENT_CHANNEL_CAPACITY};

/// Rejection reasons for structural mutations.
///
/// Each of these leaves the conversation exactly as it was; generation
/// failures are not among them - they surface on the reply itself as
/// [`MessageStatus::Failed`](muse_types::MessageStatus::Failed) plus
/// [`Chat::last_error`].
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message {0} not found")]
    NotFound(MessageId),
    #[error("operation not supported for {role} message {id}")]
    InvalidRole { id: MessageId, role: Role },
    /// A generation is already in flight; new submissions are rejected
    /// rather than queued.
    #[error("a generation is already in progress")]
    Busy,
    #[error(transparent)]
    EmptyMessage(#[from] muse_types::EmptyStringError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Coarse conversation phase for the UI: gate the send button, show the
/// "generating..." indicator and stop affordance, surface an error banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    /// No session active; ready for input.
    Ready,
    /// A session was started but no content has arrived yet.
    Submitted,
    /// Deltas are arriving.
    Streaming,
    /// No session active and the last generation failed.
    Error,
}

struct CancelledGeneration {
    target: MessageId,
    removed: bool,
}

/// A single conversation and its at-most-one generation session.
///
/// All mutations run on one logical thread of control: callers invoke the
/// operations below and periodically drain streamed events with
/// [`Chat::process_events`]. Spawning the transport task requires a running
/// tokio runtime.
pub struct Chat {
    history: History,
    state: OperationState,
    next_token: u64,
    endpoint: Arc<dyn GenerationEndpoint>,
    last_error: Option<String>,
}

impl Chat {
    #[must_use]
    pub fn new(endpoint: Arc<dyn GenerationEndpoint>) -> Self {
        Self {
            history: History::new(),
            state: OperationState::Idle,
            next_token: 0,
            endpoint,
            last_error: None,
        }
    }

    /// A conversation seeded with a system message at position 0. The seed
    /// rides along in every prompt context but is not editable.
    #[must_use]
    pub fn with_system_prompt(endpoint: Arc<dyn GenerationEndpoint>, prompt: NonEmptyString) -> Self {
        let mut chat = Self::new(endpoint);
        let id = chat.history.allocate_id();
        chat.history
            .append(Message::system(id, prompt, SystemTime::now()))
            .expect("seeding an empty conversation cannot violate invariants");
        chat
    }

    /// Immutable copy of the conversation for rendering.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.history.snapshot()
    }

    #[must_use]
    pub fn status(&self) -> ChatStatus {
        match &self.state {
            OperationState::Generating(active) if active.received_any() => ChatStatus::Streaming,
            OperationState::Generating(_) => ChatStatus::Submitted,
            OperationState::Idle if self.last_error.is_some() => ChatStatus::Error,
            OperationState::Idle => ChatStatus::Ready,
        }
    }

    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.state.is_generating()
    }

    /// The most recent generation failure, until the next mutation.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// True only for an existing user message.
    #[must_use]
    pub fn can_edit(&self, id: MessageId) -> bool {
        self.history
            .get(id)
            .is_some_and(|m| m.role() == Role::User)
    }

    /// True only for an existing assistant reply.
    #[must_use]
    pub fn can_reload(&self, id: MessageId) -> bool {
        self.history
            .get(id)
            .is_some_and(|m| m.role() == Role::Assistant)
    }

    /// Send a new user message and start generating the reply.
    ///
    /// Returns immediately; completion is observed through status changes
    /// on the trailing reply. Rejected with [`ChatError::Busy`] while a
    /// session is active - at most one outstanding generation, never a
    /// queue.
    pub fn submit(&mut self, text: impl Into<String>) -> Result<(), ChatError> {
        let content = NonEmptyString::new(text)?;
        if self.state.is_generating() {
            return Err(ChatError::Busy);
        }
        self.last_error = None;

        let now = SystemTime::now();
        let id = self.history.allocate_id();
        self.history.append(Message::user(id, content, now))?;
        self.start_generation(now)
    }

    /// Replace a user message's content, discard everything after it, and
    /// regenerate. Editing to the identical content is a no-op.
    pub fn edit_user_message(
        &mut self,
        id: MessageId,
        new_text: impl Into<String>,
    ) -> Result<(), ChatError> {
        let content = NonEmptyString::new(new_text)?;
        let index = self.history.find_index(id).ok_or(ChatError::NotFound(id))?;
        let message = &self.history.messages()[index];
        if message.role() != Role::User {
            return Err(ChatError::InvalidRole {
                id,
                role: message.role(),
            });
        }
        if message.content() == content.as_str() {
            return Ok(());
        }

        self.cancel_active();
        self.last_error = None;

        // Cancelling can only shorten the tail; the edited message keeps
        // its index.
        self.history.replace_content(id, content)?;
        self.history.truncate_after(index);
        self.start_generation(SystemTime::now())
    }

    /// Regenerate an assistant reply in place: the reply and everything
    /// after it are discarded and a fresh session streams a replacement.
    pub fn reload_assistant_message(&mut self, id: MessageId) -> Result<(), ChatError> {
        let index = self.history.find_index(id).ok_or(ChatError::NotFound(id))?;
        let role = self.history.messages()[index].role();
        if role != Role::Assistant {
            return Err(ChatError::InvalidRole { id, role });
        }

        let cancelled = self.cancel_active();
        self.last_error = None;

        match self.history.find_index(id) {
            Some(0) => self.history.clear(),
            Some(index) => self.history.truncate_after(index - 1),
            // The reload target was the in-flight placeholder and the
            // cancel policy already removed it; the history ends exactly
            // where regeneration should start from.
            None => {
                debug_assert!(
                    cancelled.is_some_and(|c| c.removed && c.target == id),
                    "validated message disappeared without a cancel"
                );
            }
        }
        self.start_generation(SystemTime::now())
    }

    /// Regenerate the last message if it is an assistant reply; otherwise
    /// there is nothing to regenerate and this is a no-op.
    pub fn reload_last(&mut self) -> Result<(), ChatError> {
        match self.history.last() {
            Some(message) if message.role() == Role::Assistant => {
                let id = message.id();
                self.reload_assistant_message(id)
            }
            _ => Ok(()),
        }
    }

    /// Remove a message and all its descendants. No regeneration.
    pub fn delete_message(&mut self, id: MessageId) -> Result<(), ChatError> {
        if self.history.find_index(id).is_none() {
            return Err(ChatError::NotFound(id));
        }

        self.cancel_active();
        self.last_error = None;

        match self.history.find_index(id) {
            Some(0) => self.history.clear(),
            Some(index) => self.history.truncate_after(index - 1),
            // Deleting the in-flight placeholder: the cancel already
            // removed it and nothing came after it.
            None => {}
        }
        Ok(())
    }

    /// Reset the conversation to empty, cancelling any active session.
    pub fn clear_all(&mut self) {
        self.cancel_active();
        self.history.clear();
        self.last_error = None;
    }

    /// Stop the in-flight generation, keeping whatever has streamed so far
    /// as a complete reply. A reply that never received content is removed
    /// entirely. No-op when idle.
    pub fn stop(&mut self) {
        self.cancel_active();
    }

    /// Drain pending events from the active session, up to a budget.
    ///
    /// Consecutive text deltas are coalesced before application to keep a
    /// fast stream from monopolizing the caller's loop.
    pub fn process_events(&mut self) {
        let mut processed = 0usize;
        let mut pending: Option<StreamEvent> = None;

        while processed < DEFAULT_STREAM_EVENT_BUDGET || pending.is_some() {
            let event = if let Some(event) = pending.take() {
                event
            } else {
                let OperationState::Generating(active) = &mut self.state else {
                    return;
                };
                match active.try_recv_event() {
                    Ok(event) => event,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        tracing::warn!("stream channel disconnected");
                        StreamEvent::Error("stream disconnected".to_string())
                    }
                }
            };

            let event = match event {
                StreamEvent::TextDelta(mut text) => {
                    processed = processed.saturating_add(1);
                    while processed < DEFAULT_STREAM_EVENT_BUDGET {
                        let OperationState::Generating(active) = &mut self.state else {
                            break;
                        };
                        match active.try_recv_event() {
                            Ok(StreamEvent::TextDelta(more)) => {
                                text.push_str(&more);
                                processed = processed.saturating_add(1);
                            }
                            Ok(other) => {
                                pending = Some(other);
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                    StreamEvent::TextDelta(text)
                }
                other => {
                    processed = processed.saturating_add(1);
                    other
                }
            };

            let Some(token) = self.current_token() else {
                return;
            };
            self.handle_event(token, event);
        }
    }

    pub(crate) fn current_token(&self) -> Option<SessionToken> {
        match &self.state {
            OperationState::Generating(active) => Some(active.token()),
            OperationState::Idle => None,
        }
    }

    /// Apply one streamed event attributed to session `token`.
    ///
    /// Events from a cancelled or superseded session carry a stale token
    /// and are dropped here silently - the only race the single-threaded
    /// model has to defend against.
    pub(crate) fn handle_event(&mut self, token: SessionToken, event: StreamEvent) {
        let target = match &self.state {
            OperationState::Generating(active) if active.token() == token => active.target(),
            _ => {
                tracing::trace!(%token, "discarding event from stale session");
                return;
            }
        };

        match event {
            StreamEvent::TextDelta(text) => {
                if let Err(e) = self.history.append_delta(target, &text) {
                    tracing::warn!(%target, error = %e, "dropping undeliverable delta");
                    return;
                }
                if let OperationState::Generating(active) = &mut self.state {
                    active.mark_received();
                }
            }
            StreamEvent::Done => self.finish_generation(StreamFinishReason::Done),
            StreamEvent::Error(err) => self.finish_generation(StreamFinishReason::Error(err)),
        }
    }

    /// Settle the active session into `Idle`.
    fn finish_generation(&mut self, reason: StreamFinishReason) {
        let state = std::mem::replace(&mut self.state, OperationState::Idle);
        let OperationState::Generating(active) = state else {
            return;
        };
        active.abort();
        let target = active.target();

        match reason {
            StreamFinishReason::Done => {
                // A reply completed without any content is removed like a
                // cancelled one: nothing to show, no failure to surface.
                if !self.history.drop_placeholder(target)
                    && let Err(e) = self.history.finalize_reply(target)
                {
                    tracing::warn!(%target, error = %e, "failed to finalize reply");
                }
            }
            StreamFinishReason::Error(err) => {
                // Failure stays visible: partial content is kept and the
                // reply is marked failed. Retry is explicit, via reload.
                if let Err(e) = self.history.fail_reply(target) {
                    tracing::warn!(%target, error = %e, "failed to mark reply as failed");
                }
                tracing::warn!(%target, error = %err, "generation failed");
                self.last_error = Some(err);
            }
        }
    }

    /// Cancel the active session, if any, applying the stop policy to its
    /// placeholder. Must run before any structural mutation.
    fn cancel_active(&mut self) -> Option<CancelledGeneration> {
        let state = std::mem::replace(&mut self.state, OperationState::Idle);
        let OperationState::Generating(active) = state else {
            return None;
        };
        active.abort();
        let target = active.target();

        // Keep what streamed so far; an untouched placeholder is removed
        // so no permanently-empty reply lingers.
        let removed = self.history.drop_placeholder(target);
        if !removed && let Err(e) = self.history.finalize_reply(target) {
            tracing::warn!(%target, error = %e, "failed to finalize cancelled reply");
        }
        Some(CancelledGeneration { target, removed })
    }

    /// Append the trailing placeholder and spawn the transport task for a
    /// new session. The prompt context is everything currently in history.
    fn start_generation(&mut self, now: SystemTime) -> Result<(), ChatError> {
        let turns: Vec<ChatTurn> = self.history.messages().iter().map(ChatTurn::from).collect();

        let target = self.history.allocate_id();
        self.history.append(Message::reply_placeholder(target, now))?;

        self.next_token += 1;
        let token = SessionToken::new(self.next_token);

        let (tx, rx) = mpsc::channel(STREAM_EVENT_CHANNEL_CAPACITY);
        let (abort_handle, abort_registration) = AbortHandle::new_pair();

        let endpoint = Arc::clone(&self.endpoint);
        let request = GenerationRequest { turns };
        let task = async move {
            let result = endpoint.stream_reply(request, tx.clone()).await;
            if let Err(e) = result {
                tracing::warn!("generation request failed: {e}");
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        };
        tokio::spawn(async move {
            let _ = Abortable::new(task, abort_registration).await;
        });

        self.state =
            OperationState::Generating(ActiveGeneration::new(token, target, rx, abort_handle));
        Ok(())
    }
}
