//! Role resolution: which side of a session produces the offer.
//!
//! Exactly one side of every pair must initiate, and both sides must reach
//! that conclusion independently, without a coordination message. An explicit
//! designation (the application event that started the call names a caller)
//! is honored unconditionally; symmetric joins fall back to a lexicographic
//! tie-break on the participant ids. This removes offer glare structurally —
//! there is no collision to detect and no rollback path.

use serde::Serialize;

use crate::types::ParticipantId;

/// Which side of the session this participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Produces the offer.
    Initiator,
    /// Waits for the offer and answers it.
    Responder,
}

impl CallRole {
    pub const fn is_initiator(self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// Resolve the local role for a `(local, remote)` pair.
///
/// Participant ids are distinct platform users; with `explicit` absent the
/// lexicographically smaller id initiates, so both sides compute the same
/// split from the same pair.
pub fn resolve_role(
    local: &ParticipantId,
    remote: &ParticipantId,
    explicit: Option<CallRole>,
) -> CallRole {
    if let Some(role) = explicit {
        return role;
    }
    if local < remote {
        CallRole::Initiator
    } else {
        CallRole::Responder
    }
}
