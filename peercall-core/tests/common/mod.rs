//! Shared fixtures for integration tests
//!
//! `MockPeer` follows the offer/answer state rules of a real peer connection
//! closely enough to catch ordering mistakes: candidates are rejected before a
//! remote description, a remote offer is rejected while a local offer is
//! pending, and rollback is only valid from have-local-offer.

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall_core::{
    CallDependencies, CallEvent, CallId, CallManager, CallManagerConfig, CallState, IceCandidate,
    LocalTrack, MediaKind, MemorySignalBus, PeerConnectionConfig, PeerConnectionFactory,
    PeerConnectionPrimitive, PeerConnectionState, PrimitiveError, PrimitiveEvent,
    IceServerProvider, PrimitiveEventSink, RemoteTrack, SdpType, SessionDescription,
    SignalingState, StaticIceServerProvider, StaticMediaCapture, UserId,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn user(s: &str) -> UserId {
    UserId::new(s).unwrap()
}

struct MockState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    premature_candidates: usize,
    remote_sets: usize,
    tracks: Vec<(String, MediaKind)>,
    offers: Vec<bool>,
    answers: usize,
    rollbacks: usize,
    gathered: u32,
    remote_track_sent: bool,
    closed: bool,
}

/// Scriptable peer connection
pub struct MockPeer {
    pub name: String,
    push_state_events: bool,
    state: Mutex<MockState>,
    sink: Mutex<Option<PrimitiveEventSink>>,
    /// Make offer creation fail
    pub fail_offer: AtomicBool,
    /// Whether connectivity can be established
    pub reachable: AtomicBool,
}

impl MockState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: PeerConnectionState::New,
            local: None,
            remote: None,
            applied_candidates: Vec::new(),
            premature_candidates: 0,
            remote_sets: 0,
            tracks: Vec::new(),
            offers: Vec::new(),
            answers: 0,
            rollbacks: 0,
            gathered: 0,
            remote_track_sent: false,
            closed: false,
        }
    }
}

impl MockPeer {
    pub fn new(name: impl Into<String>, push_state_events: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            push_state_events,
            state: Mutex::new(MockState::new()),
            sink: Mutex::new(None),
            fail_offer: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
        })
    }

    fn emit(&self, event: PrimitiveEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }

    fn gather(&self) {
        let n = {
            let mut state = self.state.lock();
            state.gathered += 1;
            state.gathered
        };
        self.emit(PrimitiveEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:{} {n} udp 2122260223 10.0.0.{n} 5000 typ host", self.name),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
    }

    fn maybe_connect(&self) {
        if !self.reachable.load(Ordering::SeqCst) {
            return;
        }
        let send_track = {
            let mut state = self.state.lock();
            let ready = !state.closed
                && state.local.is_some()
                && state.remote.is_some()
                && state.signaling == SignalingState::Stable
                && !state.applied_candidates.is_empty()
                && state.connection != PeerConnectionState::Connected;
            if !ready {
                return;
            }
            state.connection = PeerConnectionState::Connected;
            let first = !state.remote_track_sent;
            state.remote_track_sent = true;
            first
        };
        if send_track {
            self.emit(PrimitiveEvent::Track(RemoteTrack {
                id: format!("{}-remote-audio", self.name),
                stream_id: format!("{}-remote-stream", self.name),
                kind: MediaKind::Audio,
            }));
        }
        if self.push_state_events {
            self.emit(PrimitiveEvent::ConnectionState(PeerConnectionState::Connected));
        }
    }

    /// Force a raw connection state, as the ICE agent would
    pub fn simulate(&self, state: PeerConnectionState) {
        self.state.lock().connection = state;
        if self.push_state_events {
            self.emit(PrimitiveEvent::ConnectionState(state));
        }
    }

    /// Deliver a remote track, as an ontrack callback would
    pub fn emit_track(&self, track: RemoteTrack) {
        self.emit(PrimitiveEvent::Track(track));
    }

    /// Fire a negotiation-needed event
    pub fn trigger_negotiation_needed(&self) {
        self.emit(PrimitiveEvent::NegotiationNeeded);
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn premature_candidates(&self) -> usize {
        self.state.lock().premature_candidates
    }

    pub fn remote_sets(&self) -> usize {
        self.state.lock().remote_sets
    }

    pub fn signaling(&self) -> SignalingState {
        self.state.lock().signaling
    }

    pub fn offers(&self) -> Vec<bool> {
        self.state.lock().offers.clone()
    }

    pub fn answers(&self) -> usize {
        self.state.lock().answers
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn track_kinds(&self) -> Vec<MediaKind> {
        self.state.lock().tracks.iter().map(|(_, k)| *k).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_attached(&self) -> bool {
        self.sink.lock().is_some()
    }

    fn ensure_open(&self) -> Result<(), PrimitiveError> {
        if self.state.lock().closed {
            Err(PrimitiveError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnectionPrimitive for MockPeer {
    fn attach(&self, sink: PrimitiveEventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn detach(&self) {
        self.sink.lock().take();
    }

    fn supports_state_events(&self) -> bool {
        self.push_state_events
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PrimitiveError> {
        self.ensure_open()?;
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(PrimitiveError::CreateDescription(
                "offer",
                "scripted failure".to_string(),
            ));
        }
        let mut state = self.state.lock();
        state.offers.push(ice_restart);
        Ok(SessionDescription::offer(format!(
            "v=0\r\no={} {} 1 IN IP4 0.0.0.0\r\n",
            self.name,
            state.offers.len()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PrimitiveError::CreateDescription(
                "answer",
                format!("no remote offer in {:?}", state.signaling),
            ));
        }
        state.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no={} {} 1 IN IP4 0.0.0.0\r\n",
            self.name, state.answers
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    state.local = Some(description);
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.local = Some(description);
                }
                (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    state.local = None;
                    state.rollbacks += 1;
                    return Ok(());
                }
                (kind, current) => {
                    return Err(PrimitiveError::SetDescription(
                        "local",
                        format!("{kind:?} in {current:?}"),
                    ))
                }
            }
        }
        self.gather();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            state.remote_sets += 1;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                }
                (kind, current) => {
                    return Err(PrimitiveError::SetDescription(
                        "remote",
                        format!("{kind:?} in {current:?}"),
                    ))
                }
            }
            state.remote = Some(description);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if state.remote.is_none() {
                state.premature_candidates += 1;
                return Err(PrimitiveError::AddCandidate(
                    "remote description not set".to_string(),
                ));
            }
            state.applied_candidates.push(candidate);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack, _stream_id: &str) -> Result<(), PrimitiveError> {
        self.ensure_open()?;
        let first = {
            let mut state = self.state.lock();
            state.tracks.push((track.id().to_string(), track.kind()));
            state.tracks.len() == 1
        };
        if first {
            self.emit(PrimitiveEvent::NegotiationNeeded);
        }
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.state.lock().connection
    }

    async fn close(&self) -> Result<(), PrimitiveError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.connection = PeerConnectionState::Closed;
        Ok(())
    }
}

/// Factory handing out `MockPeer`s and remembering them
pub struct MockFactory {
    name: String,
    push_state_events: bool,
    peers: Mutex<Vec<Arc<MockPeer>>>,
    pub fail_create: AtomicBool,
}

impl MockFactory {
    pub fn new(name: impl Into<String>, push_state_events: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            push_state_events,
            peers: Mutex::new(Vec::new()),
            fail_create: AtomicBool::new(false),
        })
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().clone()
    }

    pub fn last(&self) -> Arc<MockPeer> {
        self.peers.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create(
        &self,
        _config: &PeerConnectionConfig,
    ) -> Result<Arc<dyn PeerConnectionPrimitive>, PrimitiveError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PrimitiveError::Create("scripted failure".to_string()));
        }
        let mut peers = self.peers.lock();
        let peer = MockPeer::new(
            format!("{}{}", self.name, peers.len() + 1),
            self.push_state_events,
        );
        peers.push(peer.clone());
        Ok(peer)
    }
}

/// One side of a call under test
pub struct Party {
    pub user: UserId,
    pub manager: CallManager,
    pub factory: Arc<MockFactory>,
}

pub fn test_config() -> CallManagerConfig {
    CallManagerConfig {
        ice_fetch_timeout: Duration::from_millis(100),
        state_poll_interval: Duration::from_millis(20),
        ice_restart_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

/// Route session logs through the test harness; set RUST_LOG to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn party(name: &str, bus: &MemorySignalBus) -> Party {
    party_with(name, bus, test_config(), true, StaticMediaCapture::with_default_devices())
}

pub fn party_with(
    name: &str,
    bus: &MemorySignalBus,
    config: CallManagerConfig,
    push_state_events: bool,
    media: StaticMediaCapture,
) -> Party {
    party_from(
        name,
        bus,
        config,
        push_state_events,
        media,
        Arc::new(StaticIceServerProvider::default()),
    )
}

pub fn party_with_provider(
    name: &str,
    bus: &MemorySignalBus,
    ice_provider: Arc<dyn IceServerProvider>,
) -> Party {
    party_from(
        name,
        bus,
        test_config(),
        true,
        StaticMediaCapture::with_default_devices(),
        ice_provider,
    )
}

fn party_from(
    name: &str,
    bus: &MemorySignalBus,
    config: CallManagerConfig,
    push_state_events: bool,
    media: StaticMediaCapture,
    ice_provider: Arc<dyn IceServerProvider>,
) -> Party {
    init_tracing();
    let factory = MockFactory::new(name, push_state_events);
    let deps = CallDependencies {
        bus: Arc::new(bus.clone()),
        peer_factory: factory.clone(),
        media: Arc::new(media),
        ice_provider,
    };
    Party {
        user: user(name),
        manager: CallManager::new(user(name), deps, config).unwrap(),
        factory,
    }
}

/// Poll `condition` until it holds or the wait budget runs out
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Run `future` with the wait budget
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future).await.unwrap()
}

/// Collect state transitions of `call_id` until `last` is seen
pub async fn states_until(
    events: &mut broadcast::Receiver<CallEvent>,
    call_id: &CallId,
    last: CallState,
) -> Vec<CallState> {
    let mut states = Vec::new();
    within(async {
        loop {
            match events.recv().await {
                Ok(CallEvent::StateChanged { call_id: id, to, .. }) if &id == call_id => {
                    states.push(to);
                    if to == last {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await;
    states
}
