//! The history store: canonical owner of the conversation sequence.
//!
//! Only the mutation coordinator touches these primitives. The UI renders
//! from [`History::snapshot`] copies and never holds a live reference.
//!
//! # Invariants
//!
//! 1. No two messages share an id.
//! 2. At most one message is streaming, and if present it is the last one.
//! 3. Every assistant reply is preceded by at least one user message
//!    (a seeded system message may sit at position 0).
//! 4. No two consecutive assistant replies without an intervening user
//!    message - regeneration replaces, it never appends.

use muse_types::{Message, MessageId, MessageStatus, NonEmptyString, Role};

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// An attempted mutation would break an ordering/uniqueness invariant.
    /// Unreachable through the coordinator's public API; reaching it means a
    /// coordinator bug, not bad user input.
    #[error("conversation invariant violated: {0}")]
    InvariantViolation(&'static str),
    #[error("message {0} not found")]
    NotFound(MessageId),
}

/// Ordered message sequence plus the id allocator.
///
/// Ids are handed out monotonically and never reused, even after
/// truncation discards the messages that carried them.
#[derive(Debug, Default)]
pub struct History {
    messages: Vec<Message>,
    next_id: u64,
}

impl History {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_id(&mut self) -> MessageId {
        let id = MessageId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append a message, enforcing the conversation invariants.
    pub fn append(&mut self, message: Message) -> Result<(), HistoryError> {
        if self.messages.iter().any(|m| m.id() == message.id()) {
            return Err(HistoryError::InvariantViolation("duplicate message id"));
        }
        if self.messages.last().is_some_and(Message::is_streaming) {
            return Err(HistoryError::InvariantViolation(
                "cannot append while a reply is still streaming",
            ));
        }
        match message.role() {
            Role::System => {
                if !self.messages.is_empty() {
                    return Err(HistoryError::InvariantViolation(
                        "seeded system message must come first",
                    ));
                }
            }
            Role::User => {}
            Role::Assistant => {
                if !self.messages.iter().any(|m| m.role() == Role::User) {
                    return Err(HistoryError::InvariantViolation(
                        "assistant reply requires a preceding user message",
                    ));
                }
                if self.messages.last().is_some_and(|m| m.role() == Role::Assistant) {
                    return Err(HistoryError::InvariantViolation(
                        "consecutive assistant replies",
                    ));
                }
            }
        }

        self.messages.push(message);
        Ok(())
    }

    /// Keep messages `[0..index]` inclusive, discard the rest.
    /// No-op when `index` already is the last valid index.
    pub fn truncate_after(&mut self, index: usize) {
        if index + 1 < self.messages.len() {
            self.messages.truncate(index + 1);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// In-place content replacement for a user message (edits replace
    /// content, not provenance).
    pub fn replace_content(
        &mut self,
        id: MessageId,
        content: NonEmptyString,
    ) -> Result<(), HistoryError> {
        match self.get_mut(id)? {
            Message::User(user) => {
                user.replace_content(content);
                Ok(())
            }
            _ => Err(HistoryError::InvariantViolation(
                "content replacement targets a user message",
            )),
        }
    }

    /// Append a streamed delta to the trailing reply. Content grows
    /// monotonically; deltas are applied in arrival order.
    pub fn append_delta(&mut self, id: MessageId, delta: &str) -> Result<(), HistoryError> {
        match self.get_mut(id)? {
            Message::Assistant(reply) if reply.status() == MessageStatus::Streaming => {
                reply.append_delta(delta);
                Ok(())
            }
            _ => Err(HistoryError::InvariantViolation(
                "delta target must be a streaming reply",
            )),
        }
    }

    pub fn finalize_reply(&mut self, id: MessageId) -> Result<(), HistoryError> {
        match self.get_mut(id)? {
            Message::Assistant(reply) => {
                reply.finalize();
                Ok(())
            }
            _ => Err(HistoryError::InvariantViolation(
                "only assistant replies carry a status",
            )),
        }
    }

    pub fn fail_reply(&mut self, id: MessageId) -> Result<(), HistoryError> {
        match self.get_mut(id)? {
            Message::Assistant(reply) => {
                reply.fail();
                Ok(())
            }
            _ => Err(HistoryError::InvariantViolation(
                "only assistant replies carry a status",
            )),
        }
    }

    /// Remove the trailing reply if it is `id` and still empty/streaming.
    /// Returns whether anything was removed. Covers the
    /// cancelled-before-any-content policy: no permanently-empty bubble.
    pub fn drop_placeholder(&mut self, id: MessageId) -> bool {
        let is_empty_placeholder = self.messages.last().is_some_and(|m| {
            m.id() == id && m.is_streaming() && m.content().is_empty()
        });
        if is_empty_placeholder {
            self.messages.pop();
        }
        is_empty_placeholder
    }

    #[must_use]
    pub fn find_index(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == id)
    }

    #[must_use]
    pub fn is_last(&self, id: MessageId) -> bool {
        self.messages.last().is_some_and(|m| m.id() == id)
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id() == id)
    }

    fn get_mut(&mut self, id: MessageId) -> Result<&mut Message, HistoryError> {
        self.messages
            .iter_mut()
            .find(|m| m.id() == id)
            .ok_or(HistoryError::NotFound(id))
    }

    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Immutable copy of the current sequence for the UI to render.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use muse_types::{Message, MessageId, MessageStatus, NonEmptyString, Role};

    use super::{History, HistoryError};

    fn non_empty(text: &str) -> NonEmptyString {
        NonEmptyString::new(text).unwrap()
    }

    fn history_with_turn() -> (History, MessageId, MessageId) {
        let mut history = History::new();
        let user = history.allocate_id();
        history
            .append(Message::user(user, non_empty("hi"), SystemTime::UNIX_EPOCH))
            .unwrap();
        let reply = history.allocate_id();
        history
            .append(Message::reply_placeholder(reply, SystemTime::UNIX_EPOCH))
            .unwrap();
        (history, user, reply)
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut history = History::new();
        let a = history.allocate_id();
        let b = history.allocate_id();
        assert_ne!(a, b);
        history.clear();
        let c = history.allocate_id();
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut history = History::new();
        let id = history.allocate_id();
        history
            .append(Message::user(id, non_empty("a"), SystemTime::UNIX_EPOCH))
            .unwrap();
        let result = history.append(Message::user(id, non_empty("b"), SystemTime::UNIX_EPOCH));
        assert!(matches!(result, Err(HistoryError::InvariantViolation(_))));
    }

    #[test]
    fn rejects_append_while_streaming() {
        let (mut history, _, _) = history_with_turn();
        let id = history.allocate_id();
        let result = history.append(Message::user(id, non_empty("more"), SystemTime::UNIX_EPOCH));
        assert!(matches!(result, Err(HistoryError::InvariantViolation(_))));
    }

    #[test]
    fn rejects_assistant_without_preceding_user() {
        let mut history = History::new();
        let id = history.allocate_id();
        let result = history.append(Message::reply_placeholder(id, SystemTime::UNIX_EPOCH));
        assert!(matches!(result, Err(HistoryError::InvariantViolation(_))));
    }

    #[test]
    fn rejects_consecutive_assistant_replies() {
        let (mut history, _, reply) = history_with_turn();
        history.append_delta(reply, "done").unwrap();
        history.finalize_reply(reply).unwrap();
        let id = history.allocate_id();
        let result = history.append(Message::reply_placeholder(id, SystemTime::UNIX_EPOCH));
        assert!(matches!(result, Err(HistoryError::InvariantViolation(_))));
    }

    #[test]
    fn rejects_system_message_after_start() {
        let mut history = History::new();
        let user = history.allocate_id();
        history
            .append(Message::user(user, non_empty("hi"), SystemTime::UNIX_EPOCH))
            .unwrap();
        let id = history.allocate_id();
        let result = history.append(Message::system(
            id,
            non_empty("late seed"),
            SystemTime::UNIX_EPOCH,
        ));
        assert!(matches!(result, Err(HistoryError::InvariantViolation(_))));
    }

    #[test]
    fn truncate_after_keeps_prefix_inclusive() {
        let (mut history, _, reply) = history_with_turn();
        history.append_delta(reply, "x").unwrap();
        history.finalize_reply(reply).unwrap();
        history.truncate_after(0);
        assert_eq!(history.len(), 1);
        assert_eq!(history.messages()[0].role(), Role::User);
    }

    #[test]
    fn truncate_after_last_index_is_noop() {
        let (mut history, _, _) = history_with_turn();
        history.truncate_after(1);
        assert_eq!(history.len(), 2);
        history.truncate_after(5);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn replace_content_edits_user_in_place() {
        let (mut history, user, _) = history_with_turn();
        history.replace_content(user, non_empty("edited")).unwrap();
        assert_eq!(history.get(user).unwrap().content(), "edited");
    }

    #[test]
    fn replace_content_on_missing_id_is_not_found() {
        let mut history = History::new();
        let result = history.replace_content(MessageId::new(99), non_empty("x"));
        assert!(matches!(result, Err(HistoryError::NotFound(_))));
    }

    #[test]
    fn deltas_require_a_streaming_reply() {
        let (mut history, user, reply) = history_with_turn();
        assert!(history.append_delta(user, "x").is_err());

        history.append_delta(reply, "ok").unwrap();
        history.finalize_reply(reply).unwrap();
        let result = history.append_delta(reply, "late");
        assert!(matches!(result, Err(HistoryError::InvariantViolation(_))));
    }

    #[test]
    fn drop_placeholder_only_removes_empty_streaming_tail() {
        let (mut history, _, reply) = history_with_turn();
        history.append_delta(reply, "partial").unwrap();
        assert!(!history.drop_placeholder(reply));
        assert_eq!(history.len(), 2);

        let (mut history, _, reply) = history_with_turn();
        assert!(history.drop_placeholder(reply));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn find_index_and_is_last() {
        let (history, user, reply) = history_with_turn();
        assert_eq!(history.find_index(user), Some(0));
        assert_eq!(history.find_index(reply), Some(1));
        assert_eq!(history.find_index(MessageId::new(42)), None);
        assert!(history.is_last(reply));
        assert!(!history.is_last(user));
    }

    #[test]
    fn snapshot_is_detached_from_later_mutations() {
        let (mut history, _, reply) = history_with_turn();
        let snapshot = history.snapshot();
        history.append_delta(reply, "after snapshot").unwrap();
        assert_eq!(snapshot[1].content(), "");
        assert_eq!(history.messages()[1].content(), "after snapshot");
    }

    #[test]
    fn failed_reply_keeps_partial_content() {
        let (mut history, _, reply) = history_with_turn();
        history.append_delta(reply, "half an ans").unwrap();
        history.fail_reply(reply).unwrap();
        let message = history.get(reply).unwrap();
        assert_eq!(message.status(), MessageStatus::Failed);
        assert_eq!(message.content(), "half an ans");
    }
}
