//! Call-related error types.

use thiserror::Error;

pub use crate::state::InvalidTransition;

/// Why local media capture could not be acquired.
///
/// Each variant carries a distinct human-actionable cause; callers surface
/// them to the user verbatim and never retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to use the capture device was denied")]
    PermissionDenied,

    #[error("no usable capture device is available")]
    DeviceUnavailable,

    #[error("media capture requires a secure context")]
    InsecureContext,
}

/// Failures of the external relay channel.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("relay channel closed")]
    Closed,
}

/// Failures of the media transport endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("description exchange failed: {0}")]
    Description(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Failure writing the durable call record.
#[derive(Debug, Error)]
#[error("call record write failed: {0}")]
pub struct RecordError(pub String);

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),

    #[error("signaling unreachable: {0}")]
    SignalingUnreachable(#[from] RelayError),

    #[error("negotiation failure: {0}")]
    NegotiationFailure(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("another call is already in progress")]
    CallInProgress,

    #[error("no active call")]
    NoActiveCall,
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        Self::NegotiationFailure(err.to_string())
    }
}
