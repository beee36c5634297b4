//! Media transport endpoint interface and connection health mapping.
//!
//! The transport (in production a WebRTC peer connection) builds and applies
//! session descriptions, applies remote candidates, emits its own local
//! candidates as it discovers them, and reports connectivity. The call core
//! never interprets SDP; it only moves descriptions and candidates between
//! the transport and the relay in the right order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::media::MediaTrack;
use crate::protocol::{CandidateInit, SessionDescription};
use crate::types::MediaKind;

/// Raw connectivity signal from the transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHealth {
    New,
    Checking,
    Connected,
    /// Temporarily unreachable; may recover on its own.
    Disconnected,
    Failed,
    Closed,
}

/// The three buckets the call core acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBucket {
    /// Still negotiating or checking paths; also covers transient loss.
    Progressing,
    /// A usable path exists.
    Connected,
    /// No path was found, or a previously-good path was lost for good.
    Failed,
}

impl TransportHealth {
    /// Map the raw signal to an actionable bucket.
    ///
    /// `Disconnected` is transient: flaky networks produce blips that
    /// recover, so it must not end the call. Only `Failed` and `Closed`
    /// are terminal.
    pub const fn bucket(self) -> HealthBucket {
        match self {
            Self::New | Self::Checking | Self::Disconnected => HealthBucket::Progressing,
            Self::Connected => HealthBucket::Connected,
            Self::Failed | Self::Closed => HealthBucket::Failed,
        }
    }
}

/// Asynchronous notifications from the transport endpoint.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local connectivity candidate to forward to the peer.
    LocalCandidate(CandidateInit),
    /// Connectivity changed.
    Health(TransportHealth),
}

/// The local media transport endpoint for one session.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local capture track before negotiation starts.
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TransportError>;

    /// Build and commit the local offer.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Build and commit the local answer to a previously set remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn apply_candidate(&self, candidate: &CandidateInit) -> Result<(), TransportError>;

    /// Swap the outgoing track of `kind` without renegotiation.
    async fn replace_track(
        &self,
        kind: MediaKind,
        track: Arc<dyn MediaTrack>,
    ) -> Result<(), TransportError>;

    /// Stop rendering the remote party's media; local resources stay up.
    async fn clear_remote(&self);

    /// Close the endpoint and release its resources. Safe to call twice.
    async fn close(&self);
}

/// Opens one transport endpoint per session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
    ) -> Result<(Box<dyn PeerTransport>, mpsc::Receiver<TransportEvent>), TransportError>;
}
