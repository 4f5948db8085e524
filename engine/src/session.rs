//! Generation session state.

use futures_util::future::AbortHandle;
use tokio::sync::mpsc;

use muse_types::{MessageId, SessionToken, StreamEvent};

/// An in-flight generation - existence proves a session is active.
///
/// Owns the receiving half of the session's event channel and the abort
/// handle of the transport task. Dropping it (or calling [`abort`]) is the
/// out-of-band cancel; the token is what keeps any stragglers harmless.
///
/// [`abort`]: ActiveGeneration::abort
#[derive(Debug)]
pub(crate) struct ActiveGeneration {
    token: SessionToken,
    target: MessageId,
    receiver: mpsc::Receiver<StreamEvent>,
    abort_handle: AbortHandle,
    received_any: bool,
}

impl ActiveGeneration {
    pub(crate) fn new(
        token: SessionToken,
        target: MessageId,
        receiver: mpsc::Receiver<StreamEvent>,
        abort_handle: AbortHandle,
    ) -> Self {
        Self {
            token,
            target,
            receiver,
            abort_handle,
            received_any: false,
        }
    }

    pub(crate) fn token(&self) -> SessionToken {
        self.token
    }

    /// Id of the trailing placeholder reply this session is populating.
    pub(crate) fn target(&self) -> MessageId {
        self.target
    }

    pub(crate) fn received_any(&self) -> bool {
        self.received_any
    }

    pub(crate) fn mark_received(&mut self) {
        self.received_any = true;
    }

    pub(crate) fn try_recv_event(&mut self) -> Result<StreamEvent, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Ask the transport task to stop. Best-effort at the transport level;
    /// the state-level guarantee comes from the token check on every event.
    pub(crate) fn abort(&self) {
        self.abort_handle.abort();
    }
}

/// Coordinator state machine: `Idle` <-> `Generating`.
///
/// Structural mutations are only applied from `Idle`; anything arriving
/// while `Generating` either cancels the session first (edit/reload/delete/
/// clear/stop) or is rejected (submit).
#[derive(Debug)]
pub(crate) enum OperationState {
    Idle,
    Generating(ActiveGeneration),
}

impl OperationState {
    pub(crate) fn is_generating(&self) -> bool {
        matches!(self, OperationState::Generating(_))
    }
}
