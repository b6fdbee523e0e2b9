//! Per-connection session handle: identity, bounded mailbox, lifecycle.
//!
//! The socket itself is driven by the two loops in `server.rs`; this module
//! only owns what the hub needs to reach a connection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::jwt::Identity;

use super::envelope::Envelope;
use super::error::GatewayError;

/// Connection identifier (`conn_` prefixed ULID).
pub type ConnId = String;

/// Outbound queue item. Shared so fan-out serializes nothing per member.
pub type Outbound = Arc<Envelope>;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

struct Lifecycle {
    state: AtomicU8,
    cancel: CancellationToken,
}

/// Cheap, cloneable handle to one live connection.
#[derive(Clone)]
pub struct SessionHandle {
    conn_id: ConnId,
    identity: Identity,
    mailbox: mpsc::Sender<Outbound>,
    lifecycle: Arc<Lifecycle>,
}

impl SessionHandle {
    /// Create a session and the receiving end of its mailbox.
    ///
    /// `cancel` is usually a child of the hub's shutdown token, so hub-wide
    /// shutdown reaches every session without the hub tracking them.
    pub fn new(
        identity: Identity,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (mailbox, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            conn_id: chat_common::id::prefixed_ulid(chat_common::id::prefix::CONNECTION),
            identity,
            mailbox,
            lifecycle: Arc::new(Lifecycle {
                state: AtomicU8::new(OPEN),
                cancel,
            }),
        };
        (handle, rx)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        match self.lifecycle.state.load(Ordering::Acquire) {
            OPEN => SessionState::Open,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    /// Fires once the session starts closing, for whatever reason.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.lifecycle.cancel
    }

    /// Queue an envelope without waiting. A full mailbox closes the session:
    /// a slow reader is dropped instead of stalling the sender.
    pub fn enqueue(&self, envelope: Outbound) -> Result<(), GatewayError> {
        if self.state() != SessionState::Open || self.lifecycle.cancel.is_cancelled() {
            return Err(GatewayError::Closed(self.conn_id.clone()));
        }

        match self.mailbox.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    conn_id = %self.conn_id,
                    user_id = %self.identity.user_id,
                    "mailbox full, closing connection"
                );
                self.close();
                Err(GatewayError::Capacity(self.conn_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(GatewayError::Closed(self.conn_id.clone()))
            }
        }
    }

    /// Move `Open -> Closing` and cancel both loops. Returns `true` only for
    /// the call that performed the transition; later calls are no-ops.
    pub fn close(&self) -> bool {
        let first = self
            .lifecycle
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.lifecycle.cancel.cancel();
        first
    }

    /// Final transition once both socket loops have exited.
    pub fn mark_closed(&self) {
        self.close();
        self.lifecycle.state.store(CLOSED, Ordering::Release);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("conn_id", &self.conn_id)
            .field("user_id", &self.identity.user_id)
            .field("state", &self.state())
            .finish()
    }
}
