//! Session negotiation: description exchange, candidate queueing and
//! resource teardown.
//!
//! A negotiator owns the transport endpoint, the relay publisher and the
//! local capture tracks for exactly one session. Every handler runs on the
//! call's single control task, so candidate queueing and the
//! "is the remote description set yet" check are never interleaved.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::CallConfig;
use crate::error::{CallError, RelayError};
use crate::events::CallEvent;
use crate::media::MediaTrack;
use crate::protocol::{CandidateInit, RelayEvent, RelayFrame, SdpKind, SessionDescription};
use crate::relay::RelayPublisher;
use crate::role::CallRole;
use crate::state::{CallPhase, CallSession, CallTransition, DescriptionSlot, InvalidTransition};
use crate::transport::{HealthBucket, PeerTransport, TransportEvent, TransportHealth};
use crate::types::{MediaKind, ParticipantId};

/// What a handled event means for the call as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Continue,
    /// A usable path was just established.
    Connected,
    /// The remote party left the session.
    RemoteLeft,
    /// The transport reported terminal failure.
    ConnectionFailed,
}

pub struct Negotiator {
    topic: String,
    transport: Box<dyn PeerTransport>,
    publisher: Box<dyn RelayPublisher>,
    tracks: Vec<Arc<dyn MediaTrack>>,
    /// Originals switched out by a source switch, kept for auto-revert.
    originals: HashMap<MediaKind, Arc<dyn MediaTrack>>,
    config: CallConfig,
    events: mpsc::UnboundedSender<CallEvent>,
    offer_in_flight: bool,
    peer_present: bool,
    degraded: bool,
    cleaned_up: bool,
}

impl Negotiator {
    pub fn new(
        topic: String,
        transport: Box<dyn PeerTransport>,
        publisher: Box<dyn RelayPublisher>,
        tracks: Vec<Arc<dyn MediaTrack>>,
        config: CallConfig,
        events: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            topic,
            transport,
            publisher,
            tracks,
            originals: HashMap::new(),
            config,
            events,
            offer_in_flight: false,
            peer_present: false,
            degraded: false,
            cleaned_up: false,
        }
    }

    /// Announce local presence on the session topic.
    pub async fn announce(&self, session: &CallSession) -> Result<(), RelayError> {
        self.publisher
            .send(&RelayEvent::Join {
                from: session.local.clone(),
            })
            .await
    }

    /// Best-effort departure notice; failures are logged, never surfaced.
    pub async fn send_leave(&self, session: &CallSession) {
        let leave = RelayEvent::Leave {
            from: session.local.clone(),
        };
        if let Err(e) = self.publisher.send(&leave).await {
            warn!("session {}: leave notice not delivered: {e}", session.session_id);
        }
    }

    /// Handle one inbound relay frame.
    pub async fn handle_frame(
        &mut self,
        session: &mut CallSession,
        frame: RelayFrame,
    ) -> Result<Progress, CallError> {
        if frame.topic != self.topic {
            debug!(
                "session {}: discarding frame for foreign topic {}",
                session.session_id, frame.topic
            );
            return Ok(Progress::Continue);
        }
        if session.phase.is_terminal() {
            debug!(
                "session {}: discarding {} for dead session",
                session.session_id,
                frame.event.event_name()
            );
            return Ok(Progress::Continue);
        }
        if frame.event.is_from(&session.local) {
            return Ok(Progress::Continue);
        }
        match frame.event {
            RelayEvent::Join { from } => {
                self.on_join(session, &from).await?;
                Ok(Progress::Continue)
            }
            RelayEvent::SessionOffer { from, sdp } => {
                self.on_offer(session, &from, sdp).await?;
                Ok(Progress::Continue)
            }
            RelayEvent::SessionAnswer { from, sdp } => {
                self.on_answer(session, &from, sdp).await?;
                Ok(Progress::Continue)
            }
            RelayEvent::IceCandidate { from, candidate } => {
                self.on_candidate(session, &from, candidate).await;
                Ok(Progress::Continue)
            }
            RelayEvent::Leave { from } => {
                if from == session.remote {
                    self.on_remote_leave(session).await;
                    Ok(Progress::RemoteLeft)
                } else {
                    debug!("session {}: ignoring leave from {from}", session.session_id);
                    Ok(Progress::Continue)
                }
            }
        }
    }

    /// Handle a transport notification (local candidate or health change).
    pub async fn handle_transport_event(
        &mut self,
        session: &mut CallSession,
        event: TransportEvent,
    ) -> Result<Progress, CallError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let event = RelayEvent::IceCandidate {
                    from: session.local.clone(),
                    candidate,
                };
                // Candidates are plentiful; losing one is not fatal.
                if let Err(e) = self.publisher.send(&event).await {
                    warn!(
                        "session {}: local candidate not delivered: {e}",
                        session.session_id
                    );
                }
                Ok(Progress::Continue)
            }
            TransportEvent::Health(health) => self.on_health(session, health).map_err(Into::into),
        }
    }

    async fn on_join(
        &mut self,
        session: &mut CallSession,
        from: &ParticipantId,
    ) -> Result<(), CallError> {
        if *from != session.remote {
            debug!(
                "session {}: ignoring join from unknown participant {from}",
                session.session_id
            );
            return Ok(());
        }
        let first_sighting = !self.peer_present;
        self.peer_present = true;
        if first_sighting {
            debug!("session {}: peer {from} is present", session.session_id);
        }
        match session.role {
            CallRole::Initiator => self.maybe_create_offer(session).await,
            CallRole::Responder => {
                // Reply once so a late-subscribing initiator learns we exist
                // even after our announcement window closed.
                if first_sighting
                    && let Err(e) = self.announce(session).await
                {
                    warn!(
                        "session {}: join reply not delivered: {e}",
                        session.session_id
                    );
                }
                Ok(())
            }
        }
    }

    /// Build and send the offer if this side owns it and has not yet done so.
    pub async fn maybe_create_offer(&mut self, session: &mut CallSession) -> Result<(), CallError> {
        if session.role != CallRole::Initiator
            || self.offer_in_flight
            || session.local_description() != DescriptionSlot::Absent
        {
            return Ok(());
        }
        self.offer_in_flight = true;
        let result = self.create_and_send_offer(session).await;
        self.offer_in_flight = false;
        result
    }

    async fn create_and_send_offer(&mut self, session: &mut CallSession) -> Result<(), CallError> {
        let offer = self.transport.create_offer().await?;
        session.advance_local(SdpKind::Offer);
        self.send_signal(&RelayEvent::SessionOffer {
            from: session.local.clone(),
            sdp: offer,
        })
        .await?;
        info!("session {}: offer sent", session.session_id);
        self.enter_negotiating(session)?;
        Ok(())
    }

    async fn on_offer(
        &mut self,
        session: &mut CallSession,
        from: &ParticipantId,
        sdp: SessionDescription,
    ) -> Result<(), CallError> {
        if session.role == CallRole::Initiator {
            warn!(
                "session {}: ignoring offer from {from}; local side owns the offer",
                session.session_id
            );
            return Ok(());
        }
        if sdp.kind != SdpKind::Offer {
            warn!(
                "session {}: session-offer event carried a {:?} description",
                session.session_id, sdp.kind
            );
            return Ok(());
        }
        self.peer_present = true;
        if !session.advance_remote(SdpKind::Offer) {
            debug!("session {}: duplicate offer ignored", session.session_id);
            return Ok(());
        }
        self.transport.set_remote_description(&sdp).await?;
        self.enter_negotiating(session)?;
        self.drain_pending(session).await;

        let answer = self.transport.create_answer().await?;
        session.advance_local(SdpKind::Answer);
        self.send_signal(&RelayEvent::SessionAnswer {
            from: session.local.clone(),
            sdp: answer,
        })
        .await?;
        info!("session {}: answer sent", session.session_id);
        Ok(())
    }

    async fn on_answer(
        &mut self,
        session: &mut CallSession,
        from: &ParticipantId,
        sdp: SessionDescription,
    ) -> Result<(), CallError> {
        if session.role != CallRole::Initiator {
            debug!(
                "session {}: ignoring answer from {from} on responder side",
                session.session_id
            );
            return Ok(());
        }
        if session.local_description() != DescriptionSlot::Offer {
            debug!(
                "session {}: answer with no offer outstanding ignored",
                session.session_id
            );
            return Ok(());
        }
        if sdp.kind != SdpKind::Answer {
            warn!(
                "session {}: session-answer event carried a {:?} description",
                session.session_id, sdp.kind
            );
            return Ok(());
        }
        if !session.advance_remote(SdpKind::Answer) {
            debug!("session {}: duplicate answer ignored", session.session_id);
            return Ok(());
        }
        self.transport.set_remote_description(&sdp).await?;
        self.drain_pending(session).await;
        info!("session {}: answer applied", session.session_id);
        Ok(())
    }

    async fn on_candidate(
        &mut self,
        session: &mut CallSession,
        from: &ParticipantId,
        candidate: CandidateInit,
    ) {
        if !session.has_remote_description() {
            debug!(
                "session {}: queueing early candidate from {from}",
                session.session_id
            );
            session.push_pending(candidate);
            return;
        }
        // An individual bad candidate must never abort the session.
        if let Err(e) = self.transport.apply_candidate(&candidate).await {
            warn!(
                "session {}: dropping candidate from {from}: {e}",
                session.session_id
            );
        }
    }

    async fn on_remote_leave(&mut self, session: &mut CallSession) {
        info!("session {}: remote party left", session.session_id);
        self.transport.clear_remote().await;
        let _ = self.events.send(CallEvent::RemoteLeft);
    }

    fn on_health(
        &mut self,
        session: &mut CallSession,
        health: TransportHealth,
    ) -> Result<Progress, InvalidTransition> {
        debug!(
            "session {}: transport health {health:?}",
            session.session_id
        );
        match health.bucket() {
            HealthBucket::Connected => {
                if matches!(session.phase, CallPhase::Negotiating) {
                    session.apply_transition(CallTransition::PathEstablished)?;
                    self.degraded = false;
                    self.emit_phase(session);
                    Ok(Progress::Connected)
                } else {
                    if self.degraded {
                        self.degraded = false;
                        info!("session {}: connectivity recovered", session.session_id);
                        let _ = self.events.send(CallEvent::ConnectionRecovered);
                    }
                    Ok(Progress::Continue)
                }
            }
            HealthBucket::Progressing => {
                if session.phase.is_connected() && !self.degraded {
                    self.degraded = true;
                    warn!(
                        "session {}: transient connectivity loss, waiting for recovery",
                        session.session_id
                    );
                    let _ = self.events.send(CallEvent::ConnectionDegraded);
                }
                Ok(Progress::Continue)
            }
            HealthBucket::Failed => Ok(Progress::ConnectionFailed),
        }
    }

    /// Flip the enabled flag on every local track of `kind` without
    /// renegotiation. Returns the new enabled state.
    pub fn toggle(&mut self, kind: MediaKind) -> bool {
        let mut enabled_now = false;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            let next = !track.is_enabled();
            track.set_enabled(next);
            enabled_now = next;
        }
        enabled_now
    }

    /// Replace the outgoing track of `kind` at the transport level.
    ///
    /// The first switch per kind retains the original so it can be restored
    /// when the replacement ends.
    pub async fn switch_source(
        &mut self,
        session: &CallSession,
        kind: MediaKind,
        new_track: Arc<dyn MediaTrack>,
    ) -> Result<(), CallError> {
        self.transport.replace_track(kind, new_track.clone()).await?;
        info!(
            "session {}: outgoing {kind} track replaced",
            session.session_id
        );
        if let Some(pos) = self.tracks.iter().position(|t| t.kind() == kind) {
            let current = self.tracks[pos].clone();
            self.tracks[pos] = new_track;
            self.originals.entry(kind).or_insert(current);
        } else {
            self.tracks.push(new_track);
        }
        Ok(())
    }

    /// Restore the pre-switch track of `kind`, stopping the replacement.
    pub async fn revert_source(&mut self, session: &CallSession, kind: MediaKind) {
        let Some(original) = self.originals.remove(&kind) else {
            return;
        };
        info!(
            "session {}: {kind} source ended, reverting to original track",
            session.session_id
        );
        if let Err(e) = self.transport.replace_track(kind, original.clone()).await {
            warn!(
                "session {}: failed to restore {kind} track: {e}",
                session.session_id
            );
        }
        if let Some(pos) = self.tracks.iter().position(|t| t.kind() == kind) {
            let ended = std::mem::replace(&mut self.tracks[pos], original);
            ended.stop();
        } else {
            self.tracks.push(original);
        }
    }

    /// Release every resource this negotiator owns. Idempotent and legal
    /// from any phase; every exit path funnels through here.
    pub async fn cleanup(&mut self, session: &mut CallSession) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        debug!("session {}: cleaning up", session.session_id);
        for track in self.tracks.drain(..) {
            track.stop();
        }
        for (_, track) in self.originals.drain() {
            track.stop();
        }
        session.clear_pending();
        self.transport.close().await;
        self.publisher.unsubscribe().await;
    }

    async fn drain_pending(&mut self, session: &mut CallSession) {
        let queued = session.drain_pending();
        if queued.is_empty() {
            return;
        }
        debug!(
            "session {}: applying {} queued candidates",
            session.session_id,
            queued.len()
        );
        for candidate in queued {
            if let Err(e) = self.transport.apply_candidate(&candidate).await {
                warn!(
                    "session {}: dropping queued candidate: {e}",
                    session.session_id
                );
            }
        }
    }

    fn enter_negotiating(
        &self,
        session: &mut CallSession,
    ) -> Result<(), InvalidTransition> {
        if matches!(session.phase, CallPhase::WaitingForPeer { .. }) {
            session.apply_transition(CallTransition::NegotiationStarted)?;
            self.emit_phase(session);
        }
        Ok(())
    }

    async fn send_signal(&self, event: &RelayEvent) -> Result<(), RelayError> {
        let mut attempt = 0u32;
        loop {
            match self.publisher.send(event).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.signaling_attempts.max(1) {
                        return Err(e);
                    }
                    warn!(
                        "relay send of {} failed (attempt {attempt}): {e}",
                        event.event_name()
                    );
                    tokio::time::sleep(self.config.signaling_retry_delay).await;
                }
            }
        }
    }

    fn emit_phase(&self, session: &CallSession) {
        let _ = self
            .events
            .send(CallEvent::PhaseChanged(session.phase.clone()));
    }
}
