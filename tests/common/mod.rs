//! In-memory fakes for the external collaborators: a loopback relay, a
//! scripted transport, a fake media source and a recording sink.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;

use skillbridge_calls::relay::RELAY_QUEUE_DEPTH;
use skillbridge_calls::{
    CallConfig, CallEvent, CallRecord, CallRecordSink, CandidateInit, MediaError, MediaKind,
    MediaSource, MediaTrack, PeerTransport, RecordError, RelayChannel, RelayError, RelayEvent,
    RelayFrame, RelayPublisher, RelaySubscription, SessionDescription, TransportError,
    TransportEvent, TransportFactory, TransportHealth,
};

/// Config with short intervals so scenarios finish quickly.
pub fn fast_config() -> CallConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    CallConfig {
        announce_interval: Duration::from_millis(25),
        announce_window: Duration::from_millis(500),
        signaling_attempts: 3,
        signaling_retry_delay: Duration::from_millis(10),
    }
}

// ── Relay ──────────────────────────────────────────────────────────────

/// Loopback broadcast relay: every subscriber of a topic receives every
/// frame published on it, including its own.
pub struct InMemoryRelay {
    topics: Mutex<HashMap<String, broadcast::Sender<RelayFrame>>>,
    subscribes: AtomicUsize,
    fail_subscribes: AtomicBool,
}

impl InMemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            subscribes: AtomicUsize::new(0),
            fail_subscribes: AtomicBool::new(false),
        })
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<RelayFrame> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn set_fail_subscribes(&self, fail: bool) {
        self.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// Deliver an arbitrary frame to subscribers of `deliver_on`, regardless
    /// of the topic recorded inside the frame (misdelivery simulation).
    pub fn inject(&self, deliver_on: &str, frame: RelayFrame) {
        let _ = self.sender_for(deliver_on).send(frame);
    }
}

#[async_trait]
impl RelayChannel for InMemoryRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, RelayError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(RelayError::Subscribe("relay offline".into()));
        }
        let sender = self.sender_for(topic);
        let mut source = sender.subscribe();
        let (in_tx, in_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
        let forward = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(frame) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let publisher = LoopbackPublisher {
            topic: topic.to_string(),
            sender,
            forward: Mutex::new(Some(forward)),
        };
        Ok(RelaySubscription::new(in_rx, Box::new(publisher)))
    }
}

struct LoopbackPublisher {
    topic: String,
    sender: broadcast::Sender<RelayFrame>,
    forward: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl RelayPublisher for LoopbackPublisher {
    async fn send(&self, event: &RelayEvent) -> Result<(), RelayError> {
        let frame = RelayFrame {
            topic: self.topic.clone(),
            event: event.clone(),
        };
        self.sender
            .send(frame)
            .map(|_| ())
            .map_err(|e| RelayError::Send(e.to_string()))
    }

    async fn unsubscribe(&self) {
        if let Some(task) = self.forward.lock().unwrap().take() {
            task.abort();
        }
    }
}

// ── Media ──────────────────────────────────────────────────────────────

pub struct FakeMediaSource {
    fail_with: Mutex<Option<MediaError>>,
    acquire_delay: Mutex<Option<Duration>>,
    acquires: AtomicUsize,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMediaSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_with: Mutex::new(None),
            acquire_delay: Mutex::new(None),
            acquires: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_with(&self, err: MediaError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = Some(delay);
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Every track ever handed out.
    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, kinds: &[MediaKind]) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        let delay = *self.acquire_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = *self.fail_with.lock().unwrap() {
            return Err(err);
        }
        let mut out: Vec<Arc<dyn MediaTrack>> = Vec::new();
        for (i, kind) in kinds.iter().enumerate() {
            let track = Arc::new(FakeTrack::new(format!("capture-{i}-{kind}"), *kind));
            self.tracks.lock().unwrap().push(track.clone());
            out.push(track);
        }
        Ok(out)
    }
}

pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
    ended: AtomicBool,
    ended_notify: Notify,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
            ended_notify: Notify::new(),
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Simulate the source ending on its own (e.g. share revoked).
    pub fn trigger_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.ended_notify.notify_waiters();
    }
}

#[async_trait]
impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn ended(&self) {
        loop {
            if self.ended.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.ended_notify.notified();
            if self.ended.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

// ── Transport ──────────────────────────────────────────────────────────

#[derive(Default)]
struct TransportState {
    offers_created: usize,
    answers_created: usize,
    has_local_description: bool,
    remote_description: Option<SessionDescription>,
    applied_candidates: Vec<CandidateInit>,
    added_tracks: Vec<String>,
    replaced: Vec<(MediaKind, String)>,
    closes: usize,
    remote_cleared: bool,
    advanced: bool,
    fail_candidates_containing: Option<String>,
}

/// Inspection and scripting handle for one fake transport endpoint.
pub struct TransportHandle {
    pub label: String,
    auto_connect: bool,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<TransportState>,
}

impl TransportHandle {
    pub async fn emit_health(&self, health: TransportHealth) {
        let _ = self.events.send(TransportEvent::Health(health)).await;
    }

    pub async fn emit_candidate(&self, candidate: CandidateInit) {
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(candidate))
            .await;
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().unwrap().offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().unwrap().answers_created
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote_description.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .applied_candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.state.lock().unwrap().added_tracks.clone()
    }

    pub fn replaced(&self) -> Vec<(MediaKind, String)> {
        self.state.lock().unwrap().replaced.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn remote_cleared(&self) -> bool {
        self.state.lock().unwrap().remote_cleared
    }

    pub fn fail_candidates_containing(&self, needle: &str) {
        self.state.lock().unwrap().fail_candidates_containing = Some(needle.to_string());
    }

    /// Once both descriptions are committed, surface a local candidate and
    /// walk connectivity up to `Connected`.
    async fn maybe_advance(&self) {
        if !self.auto_connect {
            return;
        }
        let ready = {
            let mut st = self.state.lock().unwrap();
            let ready =
                st.has_local_description && st.remote_description.is_some() && !st.advanced;
            if ready {
                st.advanced = true;
            }
            ready
        };
        if !ready {
            return;
        }
        let candidate = CandidateInit::new(format!(
            "candidate:{} 1 UDP 2130706431 10.0.0.1 9 typ host",
            self.label
        ));
        let _ = self
            .events
            .send(TransportEvent::LocalCandidate(candidate))
            .await;
        let _ = self
            .events
            .send(TransportEvent::Health(TransportHealth::Checking))
            .await;
        let _ = self
            .events
            .send(TransportEvent::Health(TransportHealth::Connected))
            .await;
    }
}

struct FakeTransport(Arc<TransportHandle>);

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), TransportError> {
        self.0
            .state
            .lock()
            .unwrap()
            .added_tracks
            .push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        {
            let mut st = self.0.state.lock().unwrap();
            st.offers_created += 1;
            st.has_local_description = true;
        }
        self.0.maybe_advance().await;
        Ok(SessionDescription::offer(format!("v=0 {}-offer", self.0.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        {
            let mut st = self.0.state.lock().unwrap();
            if st.remote_description.is_none() {
                return Err(TransportError::Description(
                    "no remote offer to answer".into(),
                ));
            }
            st.answers_created += 1;
            st.has_local_description = true;
        }
        self.0.maybe_advance().await;
        Ok(SessionDescription::answer(format!(
            "v=0 {}-answer",
            self.0.label
        )))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        {
            let mut st = self.0.state.lock().unwrap();
            st.remote_description = Some(description.clone());
        }
        self.0.maybe_advance().await;
        Ok(())
    }

    async fn apply_candidate(&self, candidate: &CandidateInit) -> Result<(), TransportError> {
        let mut st = self.0.state.lock().unwrap();
        if let Some(needle) = &st.fail_candidates_containing
            && candidate.candidate.contains(needle.as_str())
        {
            return Err(TransportError::Candidate(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        st.applied_candidates.push(candidate.clone());
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: MediaKind,
        track: Arc<dyn MediaTrack>,
    ) -> Result<(), TransportError> {
        self.0
            .state
            .lock()
            .unwrap()
            .replaced
            .push((kind, track.id().to_string()));
        Ok(())
    }

    async fn clear_remote(&self) {
        self.0.state.lock().unwrap().remote_cleared = true;
    }

    async fn close(&self) {
        self.0.state.lock().unwrap().closes += 1;
    }
}

pub struct FakeTransportFactory {
    label_prefix: String,
    auto_connect: bool,
    fail_open: AtomicBool,
    counter: AtomicUsize,
    handles: Mutex<Vec<Arc<TransportHandle>>>,
}

impl FakeTransportFactory {
    /// Endpoints connect on their own once both descriptions are in.
    pub fn new(label_prefix: &str) -> Arc<Self> {
        Self::with_auto_connect(label_prefix, true)
    }

    /// Endpoints stay silent; tests script health themselves.
    pub fn manual(label_prefix: &str) -> Arc<Self> {
        Self::with_auto_connect(label_prefix, false)
    }

    fn with_auto_connect(label_prefix: &str, auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            label_prefix: label_prefix.to_string(),
            auto_connect,
            fail_open: AtomicBool::new(false),
            counter: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn last_handle(&self) -> Arc<TransportHandle> {
        self.handles
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport opened yet")
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn open(
        &self,
    ) -> Result<(Box<dyn PeerTransport>, mpsc::Receiver<TransportEvent>), TransportError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("no endpoint".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        let handle = Arc::new(TransportHandle {
            label: format!("{}{n}", self.label_prefix),
            auto_connect: self.auto_connect,
            events: tx,
            state: Mutex::new(TransportState::default()),
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok((Box::new(FakeTransport(handle)), rx))
    }
}

// ── Records ────────────────────────────────────────────────────────────

pub struct MemoryRecordSink {
    writes: Mutex<Vec<CallRecord>>,
    fail: AtomicBool,
}

impl MemoryRecordSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<CallRecord> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallRecordSink for MemoryRecordSink {
    async fn write(&self, record: CallRecord) -> Result<(), RecordError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RecordError("record store offline".into()));
        }
        self.writes.lock().unwrap().push(record);
        Ok(())
    }
}

// ── Event helpers ──────────────────────────────────────────────────────

/// Wait up to five seconds for an event matching `pred`.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<CallEvent>,
    mut pred: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed before the expected event"),
            }
        }
    })
    .await
    .expect("timed out waiting for call event")
}

/// Assert no event matching `pred` arrives within `window`.
pub async fn assert_no_event_within(
    rx: &mut mpsc::UnboundedReceiver<CallEvent>,
    window: Duration,
    pred: impl Fn(&CallEvent) -> bool,
) {
    let result = tokio::time::timeout(window, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(event) = result {
        panic!("unexpected event arrived: {event:?}");
    }
}

pub fn is_connected(event: &CallEvent) -> bool {
    matches!(event, CallEvent::Connected { .. })
}

pub fn is_ended(event: &CallEvent) -> bool {
    matches!(event, CallEvent::Ended(_))
}
