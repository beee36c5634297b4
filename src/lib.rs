//! Peer-to-peer call negotiation core for the SkillBridge platform.
//!
//! Two participants who cannot see each other's network location establish a
//! direct audio/video session using only a best-effort broadcast relay as a
//! rendezvous mechanism. This crate owns the hard part of that flow: peer
//! discovery, ordered exchange of session descriptions and connectivity
//! candidates despite asynchronous arrival, glare-free role assignment,
//! buffering of early candidates, connection health tracking, and teardown
//! that releases media devices and relay resources on every exit path.
//!
//! # Architecture
//!
//! - [`CallController`]: user intents (start, accept, decline, hang up,
//!   toggles, source switch) and the per-call control loop
//! - [`Negotiator`]: description/candidate exchange and resource teardown
//! - [`resolve_role`]: deterministic initiator selection (explicit or
//!   lexicographic tie-break)
//! - [`CallSession`] & [`CallPhase`]: the call lifecycle state machine
//! - [`RelayEvent`]: the five-event signaling contract on the relay topic
//! - [`RelayChannel`], [`MediaSource`], [`PeerTransport`],
//!   [`CallRecordSink`]: interfaces to the external collaborators
//!
//! The relay transport itself, media codecs and the surrounding platform
//! screens are out of scope; they live behind the collaborator traits.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiator;
pub mod protocol;
pub mod records;
pub mod relay;
pub mod role;
pub mod state;
pub mod transport;
pub mod types;

pub use config::CallConfig;
pub use controller::{CallController, CallSetup};
pub use error::{CallError, MediaError, RecordError, RelayError, TransportError};
pub use events::{CallEvent, CallSummary};
pub use media::{MediaSource, MediaTrack};
pub use negotiator::{Negotiator, Progress};
pub use protocol::{CandidateInit, RelayEvent, RelayFrame, SdpKind, SessionDescription};
pub use records::{CallRecord, CallRecordSink};
pub use relay::{RelayChannel, RelayPublisher, RelaySubscription};
pub use role::{CallRole, resolve_role};
pub use state::{
    CallPhase, CallSession, CallTransition, DescriptionSlot, FailureReason, InvalidTransition,
};
pub use transport::{
    HealthBucket, PeerTransport, TransportEvent, TransportFactory, TransportHealth,
};
pub use types::{CallId, CallStatus, MediaKind, ParticipantId, SessionId};
