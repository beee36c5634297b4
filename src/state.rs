//! Call lifecycle state machine and the per-call session object.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{CandidateInit, SdpKind};
use crate::role::CallRole;
use crate::types::{CallId, ParticipantId, SessionId};

/// Current phase of a call.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallPhase {
    /// No resources held.
    #[default]
    Idle,
    /// Local media request in flight.
    AcquiringMedia,
    /// Subscribed to the relay, announcing presence or awaiting the offer.
    WaitingForPeer { since: DateTime<Utc> },
    /// Descriptions and/or candidates are being exchanged.
    Negotiating,
    /// A usable path exists; media flows and the duration clock runs.
    Connected { connected_at: DateTime<Utc> },
    /// Terminal: the call completed (locally or remotely ended, or lost).
    Ended {
        ended_at: DateTime<Utc>,
        duration_secs: i64,
    },
    /// Terminal: the call never completed.
    Failed {
        reason: FailureReason,
        failed_at: DateTime<Utc>,
    },
}

impl CallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Failed { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Seconds of connected time, available once the call has ended.
    pub fn duration_secs(&self) -> Option<i64> {
        match self {
            Self::Ended { duration_secs, .. } => Some(*duration_secs),
            _ => None,
        }
    }
}

/// Why a call never completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MediaUnavailable,
    SignalingUnreachable,
    NegotiationFailure,
    ConnectivityLost,
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    MediaRequested,
    MediaReady,
    NegotiationStarted,
    PathEstablished,
    RemoteLeft,
    LocalHangup,
    /// Terminal transport failure while connected.
    ConnectivityLost,
    /// The call cannot complete (from any pre-connected phase).
    CallFailed { reason: FailureReason },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Which description a side has committed to.
///
/// Slots only advance (absent, then offer, then answer) — once an answer is
/// set it is never replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DescriptionSlot {
    #[default]
    Absent,
    Offer,
    Answer,
}

impl DescriptionSlot {
    fn rank_of(kind: SdpKind) -> Self {
        match kind {
            SdpKind::Offer => Self::Offer,
            SdpKind::Answer => Self::Answer,
        }
    }
}

/// The negotiation's root object.
///
/// Owned exclusively by one negotiator for its lifetime; created at call
/// start and destroyed at cleanup. Never reused across calls.
#[derive(Debug)]
pub struct CallSession {
    pub call_id: CallId,
    pub session_id: SessionId,
    pub local: ParticipantId,
    pub remote: ParticipantId,
    pub role: CallRole,
    pub phase: CallPhase,
    local_description: DescriptionSlot,
    remote_description: DescriptionSlot,
    pending_candidates: VecDeque<CandidateInit>,
}

impl CallSession {
    pub fn new(
        call_id: CallId,
        session_id: SessionId,
        local: ParticipantId,
        remote: ParticipantId,
        role: CallRole,
    ) -> Self {
        Self {
            call_id,
            session_id,
            local,
            remote,
            role,
            phase: CallPhase::Idle,
            local_description: DescriptionSlot::Absent,
            remote_description: DescriptionSlot::Absent,
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn local_description(&self) -> DescriptionSlot {
        self.local_description
    }

    pub fn remote_description(&self) -> DescriptionSlot {
        self.remote_description
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description != DescriptionSlot::Absent
    }

    /// Advance the local description slot. Returns false if the slot would
    /// not move forward (duplicate or regressing set — ignored by callers).
    pub fn advance_local(&mut self, kind: SdpKind) -> bool {
        let next = DescriptionSlot::rank_of(kind);
        if next > self.local_description {
            self.local_description = next;
            true
        } else {
            false
        }
    }

    /// Advance the remote description slot, same monotonic rule.
    pub fn advance_remote(&mut self, kind: SdpKind) -> bool {
        let next = DescriptionSlot::rank_of(kind);
        if next > self.remote_description {
            self.remote_description = next;
            true
        } else {
            false
        }
    }

    /// Queue a candidate that arrived before the remote description.
    pub fn push_pending(&mut self, candidate: CandidateInit) {
        debug_assert!(
            !self.has_remote_description(),
            "candidates must be applied directly once the remote description is set"
        );
        self.pending_candidates.push_back(candidate);
    }

    /// Take the queued candidates in arrival order.
    pub fn drain_pending(&mut self) -> Vec<CandidateInit> {
        self.pending_candidates.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn clear_pending(&mut self) {
        self.pending_candidates.clear();
    }

    /// Apply a phase transition. Returns an error if the transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_phase = match (&self.phase, transition) {
            (CallPhase::Idle, CallTransition::MediaRequested) => CallPhase::AcquiringMedia,
            (CallPhase::AcquiringMedia, CallTransition::MediaReady) => CallPhase::WaitingForPeer {
                since: Utc::now(),
            },
            (CallPhase::WaitingForPeer { .. }, CallTransition::NegotiationStarted) => {
                CallPhase::Negotiating
            }
            (CallPhase::Negotiating, CallTransition::PathEstablished) => CallPhase::Connected {
                connected_at: Utc::now(),
            },
            (
                CallPhase::AcquiringMedia
                | CallPhase::WaitingForPeer { .. }
                | CallPhase::Negotiating,
                CallTransition::CallFailed { reason },
            ) => CallPhase::Failed {
                reason,
                failed_at: Utc::now(),
            },
            (
                CallPhase::AcquiringMedia
                | CallPhase::WaitingForPeer { .. }
                | CallPhase::Negotiating,
                CallTransition::LocalHangup | CallTransition::RemoteLeft,
            ) => CallPhase::Ended {
                ended_at: Utc::now(),
                duration_secs: 0,
            },
            (
                CallPhase::Connected { connected_at },
                CallTransition::LocalHangup
                | CallTransition::RemoteLeft
                | CallTransition::ConnectivityLost,
            ) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallPhase::Ended {
                    ended_at: Utc::now(),
                    duration_secs: duration.max(0),
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_phase: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.phase = new_phase;
        Ok(())
    }
}
