//! Observable state transitions and per-command outcomes.

use chrono::{DateTime, Local};

use crate::negotiator::NegotiationState;

/// Everything a UI layer may want to reflect
#[derive(Debug, Clone)]
pub enum Event {
    /// The handshake moved to a new state
    StateChanged(NegotiationState),
    /// Power-on finished and commands are flowing
    Started,
    /// The connection context was dropped
    Disconnected,
    /// A control write completed, successfully or not
    CommandCompleted(CommandOutcome),
}

/// Record of one completed control write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub sequence: u8,
    pub label: Option<String>,
    pub submitted_at: DateTime<Local>,
    pub completed_at: DateTime<Local>,
    /// Why the write failed, if it did
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Time from submission to write completion, queueing included
    pub fn elapsed(&self) -> chrono::Duration {
        self.completed_at - self.submitted_at
    }
}
