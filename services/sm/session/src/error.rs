//! Error types for stream management sessions.

use crate::negotiator::NegotiationState;
use sm_wire::WireError;
use std::time::Duration;
use thiserror::Error;

/// Stream management errors
#[derive(Error, Debug)]
pub enum SmError {
    /// Peer sent a malformed stream management element
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),

    /// Peer answered enable or resume with `<failed/>`
    #[error("stream management rejected: {}", condition.as_deref().unwrap_or("no condition"))]
    Rejected {
        /// Stanza error condition carried by `<failed/>`
        condition: Option<String>,
    },

    /// Peer answered with something other than the expected response
    #[error("unexpected response <{0}/>")]
    UnexpectedResponse(String),

    /// Negotiation step issued out of order
    #[error("{operation} not allowed while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// Negotiator state at the time
        state: NegotiationState,
    },

    /// Underlying transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No response arrived in time
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Resume store failed
    #[error("resume store error: {0}")]
    Store(#[from] StoreError),
}

impl SmError {
    /// Whether a resume attempt that hit this error should fall back to enable
    pub fn is_resume_fallback(&self) -> bool {
        matches!(
            self,
            SmError::Rejected { .. }
                | SmError::UnexpectedResponse(_)
                | SmError::Transport(_)
                | SmError::Timeout(_)
        )
    }
}

/// Transport errors reported by a [`crate::Transport`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Stream closed by the peer or the host
    #[error("stream closed")]
    Closed,

    /// Any other transport failure
    #[error("{0}")]
    Other(String),
}

/// Resume store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
