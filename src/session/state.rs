//! Session lifecycle state machine.
//!
//! Transitions are checked so that a session can never, for example, report
//! Ready again after it started closing. Observers read the state through the
//! owning [`super::SecureSession`]; nothing outside this module mutates it.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct SessionStateError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Lifecycle of one relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, transport not yet opened.
    Fresh,
    /// Transport open, application handshake in flight.
    Handshaking,
    /// Authenticated; frames may flow.
    Ready,
    /// Shutting down after error, idle expiry or explicit close.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Validates and applies a transition, returning the new state.
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let legal = matches!(
            (self, next),
            (Fresh, Handshaking)
                | (Handshaking, Ready)
                | (Fresh | Handshaking | Ready, Closing)
                | (Fresh | Handshaking | Ready | Closing, Closed)
        );
        if legal {
            Ok(next)
        } else {
            Err(SessionStateError {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_ready(self) -> bool {
        self == SessionState::Ready
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}
