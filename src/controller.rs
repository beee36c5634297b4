//! Call orchestration: user intents, the per-call control loop, the
//! duration clock and the call record write.
//!
//! Every call runs as one task that funnels relay frames, transport
//! notifications, user commands and the announce ticker through a single
//! `select!` loop — the single-writer discipline that keeps the candidate
//! queue and description slots free of check-then-act races.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};

use crate::config::CallConfig;
use crate::error::{CallError, MediaError, RelayError};
use crate::events::{CallEvent, CallSummary};
use crate::media::{MediaSource, MediaTrack};
use crate::negotiator::{Negotiator, Progress};
use crate::protocol::RelayFrame;
use crate::records::{CallRecord, CallRecordSink};
use crate::relay::{RelayChannel, RelaySubscription};
use crate::role::{CallRole, resolve_role};
use crate::state::{CallPhase, CallSession, CallTransition, FailureReason};
use crate::transport::{TransportEvent, TransportFactory};
use crate::types::{CallId, CallStatus, MediaKind, ParticipantId, SessionId};

/// Everything needed to begin one call attempt.
#[derive(Debug, Clone)]
pub struct CallSetup {
    pub call_id: CallId,
    pub session_id: SessionId,
    pub local: ParticipantId,
    pub remote: ParticipantId,
    /// Role assigned by the application event that started the call.
    /// `None` means symmetric entry; the tie-break decides.
    pub explicit_role: Option<CallRole>,
    /// Track kinds to capture.
    pub media: Vec<MediaKind>,
}

enum Command {
    Hangup,
    ToggleMute { reply: oneshot::Sender<bool> },
    ToggleVideo { reply: oneshot::Sender<bool> },
    SwitchSource {
        kind: MediaKind,
        track: Arc<dyn MediaTrack>,
    },
}

struct ActiveCall {
    call_id: CallId,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Orchestrates call attempts against the external collaborators.
///
/// The relay subscription and the local media tracks are exclusively owned
/// by one call at a time; starting a second call while one is live fails
/// with [`CallError::CallInProgress`].
pub struct CallController {
    config: CallConfig,
    media: Arc<dyn MediaSource>,
    relay: Arc<dyn RelayChannel>,
    transports: Arc<dyn TransportFactory>,
    records: Arc<dyn CallRecordSink>,
    active: Mutex<Option<ActiveCall>>,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        media: Arc<dyn MediaSource>,
        relay: Arc<dyn RelayChannel>,
        transports: Arc<dyn TransportFactory>,
        records: Arc<dyn CallRecordSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            media,
            relay,
            transports,
            records,
            active: Mutex::new(None),
        })
    }

    /// Begin a call attempt and return its event stream.
    ///
    /// The returned receiver yields progress events and exactly one
    /// [`CallEvent::Ended`], always last.
    pub async fn start(
        &self,
        setup: CallSetup,
    ) -> Result<mpsc::UnboundedReceiver<CallEvent>, CallError> {
        let mut active = self.active.lock().await;
        if let Some(call) = active.as_ref()
            && !call.task.is_finished()
        {
            return Err(CallError::CallInProgress);
        }

        let role = resolve_role(&setup.local, &setup.remote, setup.explicit_role);
        info!(
            "call {}: starting as {role:?} (session {})",
            setup.call_id, setup.session_id
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let runtime = CallRuntime {
            config: self.config.clone(),
            media: self.media.clone(),
            relay: self.relay.clone(),
            transports: self.transports.clone(),
            records: self.records.clone(),
        };
        let call_id = setup.call_id.clone();
        let task = tokio::spawn(run_call(runtime, setup, role, cmd_rx, event_tx));
        *active = Some(ActiveCall {
            call_id,
            commands: cmd_tx,
            task,
        });
        Ok(event_rx)
    }

    /// Responder-side entry: identical to [`start`](Self::start) with the
    /// role pre-seeded, so the resolver never ties-break an accepted call.
    pub async fn accept(
        &self,
        mut setup: CallSetup,
    ) -> Result<mpsc::UnboundedReceiver<CallEvent>, CallError> {
        setup.explicit_role = Some(CallRole::Responder);
        self.start(setup).await
    }

    /// Reject an incoming call before any negotiation begins.
    ///
    /// Writes the call record (`rejected`, zero duration) and acquires no
    /// media and no relay subscription at all.
    pub async fn decline(&self, call_id: &CallId) {
        info!("call {call_id}: declined");
        write_record(&self.records, call_id, CallStatus::Rejected, 0).await;
    }

    /// End the active call: best-effort leave notice, record write, cleanup.
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.command_sender()
            .await?
            .send(Command::Hangup)
            .await
            .map_err(|_| CallError::NoActiveCall)
    }

    /// Flip the local audio track(s). Returns true if audio is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        Ok(!self.toggle(MediaKind::Audio).await?)
    }

    /// Flip the local video track(s). Returns true if video is now off.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        Ok(!self.toggle(MediaKind::Video).await?)
    }

    /// Replace the outgoing track of `kind` (e.g. camera with screen share)
    /// in the established session; no new offer/answer exchange happens. If
    /// the new source ends on its own, the original is restored.
    pub async fn switch_media_source(
        &self,
        kind: MediaKind,
        track: Arc<dyn MediaTrack>,
    ) -> Result<(), CallError> {
        self.command_sender()
            .await?
            .send(Command::SwitchSource { kind, track })
            .await
            .map_err(|_| CallError::NoActiveCall)
    }

    /// Call id of the live call, if any.
    pub async fn active_call_id(&self) -> Option<CallId> {
        let active = self.active.lock().await;
        active
            .as_ref()
            .filter(|call| !call.task.is_finished())
            .map(|call| call.call_id.clone())
    }

    async fn toggle(&self, kind: MediaKind) -> Result<bool, CallError> {
        let (reply, rx) = oneshot::channel();
        let command = match kind {
            MediaKind::Audio => Command::ToggleMute { reply },
            MediaKind::Video => Command::ToggleVideo { reply },
        };
        self.command_sender()
            .await?
            .send(command)
            .await
            .map_err(|_| CallError::NoActiveCall)?;
        rx.await.map_err(|_| CallError::NoActiveCall)
    }

    async fn command_sender(&self) -> Result<mpsc::Sender<Command>, CallError> {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(call) if !call.task.is_finished() => Ok(call.commands.clone()),
            _ => Err(CallError::NoActiveCall),
        }
    }
}

#[derive(Clone)]
struct CallRuntime {
    config: CallConfig,
    media: Arc<dyn MediaSource>,
    relay: Arc<dyn RelayChannel>,
    transports: Arc<dyn TransportFactory>,
    records: Arc<dyn CallRecordSink>,
}

/// Terminal outcome of the control loop.
enum Terminal {
    Hangup,
    /// The call handle was dropped; treated as a local hangup.
    Abandoned,
    RemoteLeft,
    Failed(FailureReason),
}

enum AcquireOutcome {
    Tracks(Vec<Arc<dyn MediaTrack>>),
    Cancelled,
    Failed(MediaError),
}

async fn run_call(
    runtime: CallRuntime,
    setup: CallSetup,
    role: CallRole,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<CallEvent>,
) {
    let mut session = CallSession::new(
        setup.call_id.clone(),
        setup.session_id.clone(),
        setup.local.clone(),
        setup.remote.clone(),
        role,
    );

    if let Err(e) = session.apply_transition(CallTransition::MediaRequested) {
        warn!("call {}: {e}", session.call_id);
        return;
    }
    emit_phase(&events, &session);

    let tracks = match acquire_media(&runtime, &setup, &mut commands).await {
        AcquireOutcome::Tracks(tracks) => tracks,
        AcquireOutcome::Cancelled => {
            info!("call {}: cancelled during media acquisition", session.call_id);
            finalize_without_resources(&runtime, &events, &mut session, None, None).await;
            return;
        }
        AcquireOutcome::Failed(e) => {
            warn!("call {}: media acquisition failed: {e}", session.call_id);
            finalize_without_resources(
                &runtime,
                &events,
                &mut session,
                Some(FailureReason::MediaUnavailable),
                Some(e),
            )
            .await;
            return;
        }
    };

    let (transport, mut transport_events) = match runtime.transports.open().await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("call {}: transport open failed: {e}", session.call_id);
            stop_tracks(&tracks);
            finalize_without_resources(
                &runtime,
                &events,
                &mut session,
                Some(FailureReason::NegotiationFailure),
                None,
            )
            .await;
            return;
        }
    };

    let mut attach_failed = false;
    for track in &tracks {
        if let Err(e) = transport.add_track(track.clone()).await {
            warn!("call {}: attaching {} track failed: {e}", session.call_id, track.kind());
            attach_failed = true;
            break;
        }
    }
    if attach_failed {
        stop_tracks(&tracks);
        transport.close().await;
        finalize_without_resources(
            &runtime,
            &events,
            &mut session,
            Some(FailureReason::NegotiationFailure),
            None,
        )
        .await;
        return;
    }

    let topic = session.session_id.channel_topic();
    let subscription = match subscribe_with_retry(&runtime, &topic).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("call {}: relay unreachable: {e}", session.call_id);
            stop_tracks(&tracks);
            transport.close().await;
            finalize_without_resources(
                &runtime,
                &events,
                &mut session,
                Some(FailureReason::SignalingUnreachable),
                None,
            )
            .await;
            return;
        }
    };

    if let Err(e) = session.apply_transition(CallTransition::MediaReady) {
        warn!("call {}: {e}", session.call_id);
    }
    emit_phase(&events, &session);
    info!("call {}: waiting for peer on {topic}", session.call_id);

    let (mut inbound, publisher) = subscription.split();
    let mut negotiator = Negotiator::new(
        topic,
        transport,
        publisher,
        tracks,
        runtime.config.clone(),
        events.clone(),
    );

    // Watchers report a replaced source ending on their own channel so the
    // command channel stays exclusively with the call handle (its closure
    // means abandonment).
    let (ended_tx, mut source_ended) = mpsc::channel::<MediaKind>(8);
    let mut watchers: Vec<JoinHandle<()>> = Vec::new();
    let outcome = drive(
        &runtime.config,
        &mut session,
        &mut negotiator,
        &mut commands,
        &ended_tx,
        &mut source_ended,
        &mut inbound,
        &mut transport_events,
        &mut watchers,
        &events,
    )
    .await;
    for watcher in watchers {
        watcher.abort();
    }
    finalize(&runtime, &events, &mut session, &mut negotiator, outcome).await;
}

/// Wait for media capture while staying responsive to cancellation.
async fn acquire_media(
    runtime: &CallRuntime,
    setup: &CallSetup,
    commands: &mut mpsc::Receiver<Command>,
) -> AcquireOutcome {
    let media = runtime.media.clone();
    let kinds = setup.media.clone();
    let mut request = tokio::spawn(async move { media.acquire(&kinds).await });
    loop {
        tokio::select! {
            result = &mut request => {
                return match result {
                    Ok(Ok(tracks)) => AcquireOutcome::Tracks(tracks),
                    Ok(Err(e)) => AcquireOutcome::Failed(e),
                    Err(e) => {
                        warn!("media acquisition task failed: {e}");
                        AcquireOutcome::Failed(MediaError::DeviceUnavailable)
                    }
                };
            }
            cmd = commands.recv() => match cmd {
                Some(Command::Hangup) | None => {
                    // If capture resolves after cancellation, stop the
                    // just-acquired tracks immediately.
                    tokio::spawn(async move {
                        if let Ok(Ok(tracks)) = request.await {
                            for track in tracks {
                                track.stop();
                            }
                        }
                    });
                    return AcquireOutcome::Cancelled;
                }
                Some(Command::ToggleMute { reply }) => {
                    let _ = reply.send(false);
                }
                Some(Command::ToggleVideo { reply }) => {
                    let _ = reply.send(false);
                }
                Some(_) => {}
            }
        }
    }
}

async fn subscribe_with_retry(
    runtime: &CallRuntime,
    topic: &str,
) -> Result<RelaySubscription, RelayError> {
    let attempts = runtime.config.signaling_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match runtime.relay.subscribe(topic).await {
            Ok(subscription) => return Ok(subscription),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    return Err(e);
                }
                warn!("relay subscribe to {topic} failed (attempt {attempt}): {e}");
                sleep(runtime.config.signaling_retry_delay).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    config: &CallConfig,
    session: &mut CallSession,
    negotiator: &mut Negotiator,
    commands: &mut mpsc::Receiver<Command>,
    ended_tx: &mpsc::Sender<MediaKind>,
    source_ended: &mut mpsc::Receiver<MediaKind>,
    inbound: &mut mpsc::Receiver<RelayFrame>,
    transport_events: &mut mpsc::Receiver<TransportEvent>,
    watchers: &mut Vec<JoinHandle<()>>,
    events: &mpsc::UnboundedSender<CallEvent>,
) -> Terminal {
    let mut announce = interval(config.announce_interval);
    announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let announce_deadline = Instant::now() + config.announce_window;
    let mut announcing = true;
    let mut announce_failures = 0u32;
    let mut inbound_open = true;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                None => return Terminal::Abandoned,
                Some(Command::Hangup) => return Terminal::Hangup,
                Some(Command::ToggleMute { reply }) => {
                    let _ = reply.send(negotiator.toggle(MediaKind::Audio));
                }
                Some(Command::ToggleVideo { reply }) => {
                    let _ = reply.send(negotiator.toggle(MediaKind::Video));
                }
                Some(Command::SwitchSource { kind, track }) => {
                    match negotiator.switch_source(session, kind, track.clone()).await {
                        Ok(()) => {
                            let tx = ended_tx.clone();
                            watchers.push(tokio::spawn(async move {
                                track.ended().await;
                                let _ = tx.send(kind).await;
                            }));
                        }
                        Err(e) => {
                            warn!("call {}: source switch failed: {e}", session.call_id);
                        }
                    }
                }
            },
            kind = source_ended.recv() => {
                if let Some(kind) = kind {
                    negotiator.revert_source(session, kind).await;
                }
            },
            frame = inbound.recv(), if inbound_open => match frame {
                None => {
                    if session.phase.is_connected() {
                        // Media flows peer-to-peer; losing signaling after
                        // the path is up is survivable.
                        warn!("call {}: relay subscription closed mid-call", session.call_id);
                        inbound_open = false;
                    } else {
                        return Terminal::Failed(FailureReason::SignalingUnreachable);
                    }
                }
                Some(frame) => match negotiator.handle_frame(session, frame).await {
                    Ok(Progress::Continue) => {}
                    Ok(Progress::Connected) => emit_connected(events, session),
                    Ok(Progress::RemoteLeft) => return Terminal::RemoteLeft,
                    Ok(Progress::ConnectionFailed) => {
                        return Terminal::Failed(FailureReason::ConnectivityLost);
                    }
                    Err(e) => {
                        warn!("call {}: negotiation error: {e}", session.call_id);
                        return Terminal::Failed(classify(&e));
                    }
                },
            },
            event = transport_events.recv() => match event {
                None => return Terminal::Failed(FailureReason::ConnectivityLost),
                Some(event) => match negotiator.handle_transport_event(session, event).await {
                    Ok(Progress::Continue) => {}
                    Ok(Progress::Connected) => emit_connected(events, session),
                    Ok(Progress::RemoteLeft) => return Terminal::RemoteLeft,
                    Ok(Progress::ConnectionFailed) => {
                        return Terminal::Failed(FailureReason::ConnectivityLost);
                    }
                    Err(e) => {
                        warn!("call {}: negotiation error: {e}", session.call_id);
                        return Terminal::Failed(classify(&e));
                    }
                },
            },
            _ = announce.tick(), if announcing => {
                if !matches!(session.phase, CallPhase::WaitingForPeer { .. })
                    || Instant::now() >= announce_deadline
                {
                    announcing = false;
                } else if let Err(e) = negotiator.announce(session).await {
                    announce_failures += 1;
                    warn!(
                        "call {}: presence announcement failed ({announce_failures}): {e}",
                        session.call_id
                    );
                    if announce_failures >= config.signaling_attempts.max(1) {
                        return Terminal::Failed(FailureReason::SignalingUnreachable);
                    }
                } else {
                    announce_failures = 0;
                }
            }
        }
    }
}

async fn finalize(
    runtime: &CallRuntime,
    events: &mpsc::UnboundedSender<CallEvent>,
    session: &mut CallSession,
    negotiator: &mut Negotiator,
    outcome: Terminal,
) {
    let failure = match &outcome {
        Terminal::Failed(reason) => Some(*reason),
        _ => None,
    };
    if matches!(outcome, Terminal::Hangup | Terminal::Abandoned) {
        negotiator.send_leave(session).await;
    }
    let transition = match &outcome {
        Terminal::Hangup | Terminal::Abandoned => CallTransition::LocalHangup,
        Terminal::RemoteLeft => CallTransition::RemoteLeft,
        Terminal::Failed(reason) => {
            if session.phase.is_connected() {
                CallTransition::ConnectivityLost
            } else {
                CallTransition::CallFailed { reason: *reason }
            }
        }
    };
    if let Err(e) = session.apply_transition(transition) {
        warn!("call {}: {e}", session.call_id);
    }
    let duration = session
        .phase
        .duration_secs()
        .unwrap_or(0)
        .clamp(0, i64::from(u32::MAX)) as u32;

    // Written before teardown so the final duration is never lost to a
    // failing cleanup.
    write_record(&runtime.records, &session.call_id, CallStatus::Ended, duration).await;
    emit_phase(events, session);
    let _ = events.send(CallEvent::Ended(CallSummary {
        call_id: session.call_id.clone(),
        status: CallStatus::Ended,
        duration_seconds: duration,
        failure,
        media_error: None,
    }));
    negotiator.cleanup(session).await;
    info!("call {}: finished ({duration}s)", session.call_id);
}

/// Terminal bookkeeping for exits before the negotiator exists.
async fn finalize_without_resources(
    runtime: &CallRuntime,
    events: &mpsc::UnboundedSender<CallEvent>,
    session: &mut CallSession,
    failure: Option<FailureReason>,
    media_error: Option<MediaError>,
) {
    let transition = match failure {
        Some(reason) => CallTransition::CallFailed { reason },
        None => CallTransition::LocalHangup,
    };
    if let Err(e) = session.apply_transition(transition) {
        warn!("call {}: {e}", session.call_id);
    }
    write_record(&runtime.records, &session.call_id, CallStatus::Ended, 0).await;
    emit_phase(events, session);
    let _ = events.send(CallEvent::Ended(CallSummary {
        call_id: session.call_id.clone(),
        status: CallStatus::Ended,
        duration_seconds: 0,
        failure,
        media_error,
    }));
}

async fn write_record(
    records: &Arc<dyn CallRecordSink>,
    call_id: &CallId,
    status: CallStatus,
    duration_seconds: u32,
) {
    let record = CallRecord {
        call_id: call_id.clone(),
        status,
        duration_seconds,
    };
    // Tolerated failure: logged, not retried, never fatal to teardown.
    if let Err(e) = records.write(record).await {
        warn!("call {call_id}: record write failed: {e}");
    }
}

fn classify(error: &CallError) -> FailureReason {
    match error {
        CallError::SignalingUnreachable(_) => FailureReason::SignalingUnreachable,
        CallError::MediaUnavailable(_) => FailureReason::MediaUnavailable,
        _ => FailureReason::NegotiationFailure,
    }
}

fn stop_tracks(tracks: &[Arc<dyn MediaTrack>]) {
    for track in tracks {
        track.stop();
    }
}

fn emit_phase(events: &mpsc::UnboundedSender<CallEvent>, session: &CallSession) {
    let _ = events.send(CallEvent::PhaseChanged(session.phase.clone()));
}

fn emit_connected(events: &mpsc::UnboundedSender<CallEvent>, session: &CallSession) {
    if let CallPhase::Connected { connected_at } = session.phase {
        info!("call {}: connected", session.call_id);
        let _ = events.send(CallEvent::Connected { connected_at });
    }
}
