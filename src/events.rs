//! Outward call notifications.
//!
//! The control loop reports progress on an unbounded channel returned by
//! [`CallController::start`](crate::controller::CallController::start);
//! the embedding application renders these however it likes. Exactly one
//! [`CallEvent::Ended`] is delivered per call attempt, always last.

use chrono::{DateTime, Utc};

use crate::error::MediaError;
use crate::state::{CallPhase, FailureReason};
use crate::types::{CallId, CallStatus};

/// Terminal summary of a call attempt.
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub call_id: CallId,
    pub status: CallStatus,
    pub duration_seconds: u32,
    /// Set when the call never completed.
    pub failure: Option<FailureReason>,
    /// The actionable capture failure when `failure` is `MediaUnavailable`:
    /// permission denied, no device, or insecure context.
    pub media_error: Option<MediaError>,
}

/// Progress notifications for one call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The lifecycle phase changed; carries a snapshot of the new phase.
    PhaseChanged(CallPhase),
    /// A usable media path exists; the duration clock started.
    Connected { connected_at: DateTime<Utc> },
    /// Transient connectivity loss while connected. The call continues.
    ConnectionDegraded,
    /// Connectivity recovered after a transient loss.
    ConnectionRecovered,
    /// The remote party left.
    RemoteLeft,
    /// The call reached a terminal state. Always the final event.
    Ended(CallSummary),
}
