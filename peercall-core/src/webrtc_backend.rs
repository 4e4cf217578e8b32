//! Peer connection backed by the `webrtc` crate
//!
//! [`WebRtcPeerFactory`] builds one `RTCPeerConnection` per session with the
//! default codecs and interceptors. Callbacks registered on the connection
//! forward into the session's event sink until the session detaches.

use crate::ice::IceServer;
use crate::media::LocalTrack;
use crate::peer::{
    PeerConnectionConfig, PeerConnectionFactory, PeerConnectionPrimitive, PeerConnectionState,
    PrimitiveError, PrimitiveEvent, PrimitiveEventSink, SignalingState,
};
use crate::types::{IceCandidate, MediaKind, RemoteTrack, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

type SharedSink = Arc<Mutex<Option<PrimitiveEventSink>>>;

/// Factory creating `webrtc` peer connections
pub struct WebRtcPeerFactory {
    api: API,
}

impl WebRtcPeerFactory {
    /// Build the API with default codecs and interceptors
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new() -> Result<Self, PrimitiveError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PrimitiveError::Create(e.to_string()))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PrimitiveError::Create(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    #[tracing::instrument(skip(self, config), fields(ice_servers = config.ice_servers.len()))]
    async fn create(
        &self,
        config: &PeerConnectionConfig,
    ) -> Result<Arc<dyn PeerConnectionPrimitive>, PrimitiveError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };

        let peer_connection = self
            .api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| PrimitiveError::Create(e.to_string()))?;

        let connection = WebRtcPeerConnection::new(Arc::new(peer_connection));
        tracing::debug!("Peer connection created");
        Ok(Arc::new(connection))
    }
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

/// A `webrtc` peer connection driven by one call session
pub struct WebRtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    sink: SharedSink,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcPeerConnection {
    /// Wrap a peer connection and register its callbacks
    pub fn new(inner: Arc<RTCPeerConnection>) -> Self {
        let sink: SharedSink = Arc::new(Mutex::new(None));
        register_callbacks(&inner, &sink);
        Self {
            inner,
            sink,
            local_tracks: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying connection
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.inner
    }

    /// Write a media sample for `track`
    ///
    /// Samples for disabled or stopped tracks are dropped, which is how mute
    /// and video-off take effect on the wire.
    ///
    /// # Errors
    ///
    /// Returns error if the track is not attached or the write fails
    pub async fn write_sample(
        &self,
        track: &LocalTrack,
        sample: &Sample,
    ) -> Result<(), PrimitiveError> {
        if !track.is_enabled() {
            return Ok(());
        }
        let rtc_track = self
            .local_tracks
            .lock()
            .get(track.id())
            .cloned()
            .ok_or_else(|| PrimitiveError::AddTrack(format!("track {} not attached", track.id())))?;
        rtc_track
            .write_sample(sample)
            .await
            .map_err(|e| PrimitiveError::AddTrack(e.to_string()))
    }
}

fn emit(sink: &SharedSink, event: PrimitiveEvent) {
    if let Some(sink) = sink.lock().as_ref() {
        let _ = sink.send(event);
    }
}

fn register_callbacks(pc: &Arc<RTCPeerConnection>, sink: &SharedSink) {
    let candidate_sink = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let sink = candidate_sink.clone();
        Box::pin(async move {
            // `None` marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => emit(
                    &sink,
                    PrimitiveEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                ),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
            }
        })
    }));

    let track_sink = sink.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let sink = track_sink.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            emit(
                &sink,
                PrimitiveEvent::Track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }),
            );
        })
    }));

    let state_sink = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let sink = state_sink.clone();
        Box::pin(async move {
            emit(
                &sink,
                PrimitiveEvent::ConnectionState(from_rtc_connection_state(state)),
            );
        })
    }));

    let negotiation_sink = sink.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let sink = negotiation_sink.clone();
        Box::pin(async move {
            emit(&sink, PrimitiveEvent::NegotiationNeeded);
        })
    }));
}

fn from_rtc_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

fn side(description: &SessionDescription) -> &'static str {
    match description.sdp_type {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
        SdpType::Rollback => "rollback",
    }
}

#[async_trait]
impl PeerConnectionPrimitive for WebRtcPeerConnection {
    fn attach(&self, sink: PrimitiveEventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn detach(&self) {
        self.sink.lock().take();
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PrimitiveError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .inner
            .create_offer(Some(options))
            .await
            .map_err(|e| PrimitiveError::CreateDescription("offer", e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError> {
        let answer = self
            .inner
            .create_answer(None)
            .await
            .map_err(|e| PrimitiveError::CreateDescription("answer", e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        let kind = side(&description);
        let rtc = to_rtc_description(description)
            .map_err(|e| PrimitiveError::SetDescription(kind, e.to_string()))?;
        self.inner
            .set_local_description(rtc)
            .await
            .map_err(|e| PrimitiveError::SetDescription(kind, e.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PrimitiveError> {
        let kind = side(&description);
        let rtc = to_rtc_description(description)
            .map_err(|e| PrimitiveError::SetDescription(kind, e.to_string()))?;
        self.inner
            .set_remote_description(rtc)
            .await
            .map_err(|e| PrimitiveError::SetDescription(kind, e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.inner
            .add_ice_candidate(init)
            .await
            .map_err(|e| PrimitiveError::AddCandidate(e.to_string()))
    }

    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), PrimitiveError> {
        let codec = match track.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id().to_string(),
            stream_id.to_string(),
        ));
        self.inner
            .add_track(Arc::clone(&rtc_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PrimitiveError::AddTrack(e.to_string()))?;

        self.local_tracks
            .lock()
            .insert(track.id().to_string(), rtc_track);
        tracing::debug!(track_id = %track.id(), kind = %track.kind(), "Local track added");
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.inner.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> PeerConnectionState {
        from_rtc_connection_state(self.inner.connection_state())
    }

    async fn close(&self) -> Result<(), PrimitiveError> {
        self.local_tracks.lock().clear();
        self.inner
            .close()
            .await
            .map_err(|e| PrimitiveError::Close(e.to_string()))
    }
}
