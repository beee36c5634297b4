//! Relay event contract for call signaling.
//!
//! Sessions rendezvous on a relay topic derived from the session id and
//! exchange five named events: `join`, `session-offer`, `session-answer`,
//! `ice-candidate` and `leave`. Every payload carries the sender's
//! participant id so receivers can drop their own echoes. Wire names are
//! load-bearing — both sides of a call must agree on them — and are pinned
//! by tests below.

use serde::{Deserialize, Serialize};

use crate::types::ParticipantId;

/// Whether a session description is the opening offer or the answer to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as produced by the transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One connectivity candidate, ready to hand to the transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    /// The candidate string (e.g. "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host").
    pub candidate: String,
    /// Media stream identification tag, if the transport provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media description index, if the transport provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl CandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// A named relay event with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Presence announcement while waiting for the peer.
    Join { from: ParticipantId },
    /// The initiator's session description.
    SessionOffer {
        from: ParticipantId,
        sdp: SessionDescription,
    },
    /// The responder's session description.
    SessionAnswer {
        from: ParticipantId,
        sdp: SessionDescription,
    },
    /// One connectivity candidate.
    IceCandidate {
        from: ParticipantId,
        candidate: CandidateInit,
    },
    /// Graceful departure notice.
    Leave { from: ParticipantId },
}

impl RelayEvent {
    /// The wire name of this event.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::SessionOffer { .. } => "session-offer",
            Self::SessionAnswer { .. } => "session-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Leave { .. } => "leave",
        }
    }

    /// The sender recorded in the payload.
    pub fn from(&self) -> &ParticipantId {
        match self {
            Self::Join { from }
            | Self::SessionOffer { from, .. }
            | Self::SessionAnswer { from, .. }
            | Self::IceCandidate { from, .. }
            | Self::Leave { from } => from,
        }
    }

    /// Whether this event was sent by `id` (self-echo check).
    pub fn is_from(&self, id: &ParticipantId) -> bool {
        self.from() == id
    }
}

/// An inbound event together with the topic it was delivered on.
///
/// The relay is best-effort; a negotiator compares the frame topic against
/// its own session topic and discards frames for foreign sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub topic: String,
    pub event: RelayEvent,
}
