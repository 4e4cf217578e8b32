//! Call signaling
//!
//! Defines the messages exchanged over the [`SignalBus`] and the
//! [`SignalingController`] that drives one session's peer connection through
//! the offer/answer/candidate exchange.
//!
//! # Negotiation rules
//!
//! - Only one locally-initiated offer is outstanding at a time. A
//!   negotiation-needed trigger while one is pending is dropped.
//! - When both sides offer at once (glare), the participant whose id sorts
//!   lower rolls back its own offer and answers the remote one. The higher
//!   side ignores the incoming offer and waits for the answer to its own.
//! - Remote candidates that arrive before any remote description are held
//!   back and applied in arrival order right after the description is set.
//! - Inbound failures are logged and contained; they never reach the caller.

use crate::bus::SignalBus;
use crate::call::CallError;
use crate::events::SessionNotifier;
use crate::identity::UserId;
use crate::media::{LocalMedia, MediaCapture};
use crate::peer::{PeerConnectionPrimitive, PrimitiveError, SignalingState};
use crate::session::{CallSession, Negotiation};
use crate::types::{
    CallId, CallRole, IceCandidate, MediaConstraints, RemoteStream, RemoteTrack, SdpType,
    SessionDescription,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Maximum SDP string length (reasonable for WebRTC)
const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate string length
const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Signaling protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Invalid SDP
    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    /// Invalid ICE candidate
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Payload does not fit the message kind
    #[error("Payload does not match message kind {0}")]
    PayloadMismatch(SignalKind),

    /// Sender and recipient are the same or not part of the call
    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),
}

/// Signal message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// SDP offer
    #[serde(rename = "offer")]
    Offer,
    /// SDP answer
    #[serde(rename = "answer")]
    Answer,
    /// Trickled ICE candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => f.write_str("offer"),
            Self::Answer => f.write_str("answer"),
            Self::IceCandidate => f.write_str("ice-candidate"),
        }
    }
}

/// Signal payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    /// Offer or answer
    Description(SessionDescription),
    /// ICE candidate
    Candidate(IceCandidate),
}

/// Message exchanged over the signal bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    /// Call the message belongs to
    pub call_id: CallId,
    /// Message kind
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Kind-specific payload
    pub payload: SignalPayload,
    /// Sender
    pub from: UserId,
    /// Recipient
    pub to: UserId,
    /// Sender timestamp in milliseconds, strictly increasing per sender
    ///
    /// Only used to tell duplicates and stale offers apart, not for ordering.
    #[serde(rename = "timestamp")]
    pub sequence_hint: i64,
}

/// Content hash identifying a delivered signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalFingerprint([u8; 32]);

impl SignalMessage {
    /// Check the message is well-formed
    ///
    /// # Errors
    ///
    /// Returns error describing the first problem found
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.from == self.to {
            return Err(SignalingError::InvalidParticipants(format!(
                "{} signals itself",
                self.from
            )));
        }
        if !self.call_id.includes(&self.from) || !self.call_id.includes(&self.to) {
            return Err(SignalingError::InvalidParticipants(format!(
                "{} -> {} is not part of {}",
                self.from, self.to, self.call_id
            )));
        }

        match (&self.kind, &self.payload) {
            (SignalKind::Offer, SignalPayload::Description(d))
                if d.sdp_type == SdpType::Offer =>
            {
                validate_sdp(&d.sdp)
            }
            (SignalKind::Answer, SignalPayload::Description(d))
                if d.sdp_type == SdpType::Answer =>
            {
                validate_sdp(&d.sdp)
            }
            (SignalKind::IceCandidate, SignalPayload::Candidate(c)) => {
                if c.candidate.trim().is_empty() {
                    Err(SignalingError::InvalidCandidate("empty".to_string()))
                } else if c.candidate.len() > MAX_CANDIDATE_LENGTH {
                    Err(SignalingError::InvalidCandidate(format!(
                        "{} bytes",
                        c.candidate.len()
                    )))
                } else {
                    Ok(())
                }
            }
            (kind, _) => Err(SignalingError::PayloadMismatch(*kind)),
        }
    }

    /// Fingerprint used to detect duplicate delivery
    #[must_use]
    pub fn fingerprint(&self) -> SignalFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.call_id.as_str().as_bytes());
        hasher.update(self.from.as_str().as_bytes());
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update(&self.sequence_hint.to_le_bytes());
        // Serializing plain data structs cannot fail
        let payload = serde_json::to_vec(&self.payload).unwrap_or_default();
        hasher.update(&payload);
        SignalFingerprint(*hasher.finalize().as_bytes())
    }
}

/// Most recent fingerprints kept for duplicate detection
pub(crate) const FINGERPRINT_WINDOW: usize = 512;

/// Bounded set of recently delivered signals
///
/// Holds the last `capacity` fingerprints; the oldest is evicted first.
#[derive(Debug)]
pub(crate) struct FingerprintWindow {
    seen: HashSet<SignalFingerprint>,
    order: VecDeque<SignalFingerprint>,
    capacity: usize,
}

impl FingerprintWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `fingerprint`; `false` if it is already in the window
    pub(crate) fn insert(&mut self, fingerprint: SignalFingerprint) -> bool {
        if !self.seen.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

fn validate_sdp(sdp: &str) -> Result<(), SignalingError> {
    if sdp.trim().is_empty() {
        return Err(SignalingError::InvalidSdp("SDP cannot be empty".to_string()));
    }
    if sdp.len() > MAX_SDP_LENGTH {
        return Err(SignalingError::InvalidSdp(format!(
            "SDP exceeds {} bytes",
            MAX_SDP_LENGTH
        )));
    }
    Ok(())
}

/// Drives one session's peer connection through negotiation
///
/// Holds the session's collaborators; all mutable negotiation state lives in
/// the [`CallSession`] passed to each method.
pub struct SignalingController {
    primitive: Arc<dyn PeerConnectionPrimitive>,
    bus: Arc<dyn SignalBus>,
    capture: Arc<dyn MediaCapture>,
}

impl SignalingController {
    /// Create a controller for one session
    pub fn new(
        primitive: Arc<dyn PeerConnectionPrimitive>,
        bus: Arc<dyn SignalBus>,
        capture: Arc<dyn MediaCapture>,
    ) -> Self {
        Self {
            primitive,
            bus,
            capture,
        }
    }

    /// The peer connection this controller drives
    pub fn primitive(&self) -> &Arc<dyn PeerConnectionPrimitive> {
        &self.primitive
    }

    /// Acquire local media, attach it, and send the first offer when initiating
    ///
    /// # Errors
    ///
    /// Returns `MediaAcquisition` if capture is refused and `Negotiation` or
    /// `Signaling` if the initial offer cannot be created or sent
    #[tracing::instrument(skip(self, session), fields(call_id = %session.call_id()))]
    pub async fn start(
        &self,
        session: &mut CallSession,
        is_video: bool,
    ) -> Result<LocalMedia, CallError> {
        let constraints = MediaConstraints::from_video_flag(is_video);
        let media = self.capture.acquire(&constraints).await.map_err(|e| {
            tracing::warn!(error = %e, "Media acquisition failed");
            CallError::MediaAcquisition(e)
        })?;
        session.local_media = Some(media.clone());

        for track in media.tracks() {
            self.primitive
                .add_track(track, media.stream_id())
                .await
                .map_err(CallError::Negotiation)?;
        }
        tracing::debug!(tracks = media.tracks().len(), "Local tracks attached");

        if session.role() == CallRole::Initiator {
            self.create_and_send_offer(session, false).await?;
        }
        Ok(media)
    }

    /// React to the primitive asking for a new offer
    pub async fn handle_negotiation_needed(&self, session: &mut CallSession) {
        if session.is_negotiating() {
            tracing::debug!("Negotiation already in progress, dropping trigger");
            return;
        }
        if session.role() == CallRole::Responder && !session.has_remote_description() {
            tracing::debug!("Responder waits for the remote offer, dropping trigger");
            return;
        }
        let state = self.primitive.signaling_state();
        if state != SignalingState::Stable {
            tracing::debug!(signaling_state = ?state, "Not stable, dropping negotiation trigger");
            return;
        }
        if let Err(e) = self.create_and_send_offer(session, false).await {
            tracing::warn!(error = %e, "Renegotiation offer failed");
        }
    }

    /// Send a fresh offer with the ICE restart flag set
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be created or sent
    pub async fn restart_ice(&self, session: &mut CallSession) -> Result<(), CallError> {
        tracing::info!(call_id = %session.call_id(), "Restarting ICE");
        self.create_and_send_offer(session, true).await
    }

    async fn create_and_send_offer(
        &self,
        session: &mut CallSession,
        ice_restart: bool,
    ) -> Result<(), CallError> {
        let hint = session.next_sequence_hint();
        session.negotiation = Negotiation::LocalOfferPending { hint, ice_restart };

        let created = async {
            let offer = self.primitive.create_offer(ice_restart).await?;
            self.primitive.set_local_description(offer.clone()).await?;
            Ok::<_, PrimitiveError>(offer)
        }
        .await;

        let offer = match created {
            Ok(offer) => offer,
            Err(e) => {
                session.negotiation = Negotiation::Stable;
                tracing::error!(error = %e, ice_restart, "Failed to create offer");
                return Err(CallError::Negotiation(e));
            }
        };

        self.publish(
            session,
            SignalKind::Offer,
            SignalPayload::Description(offer),
            hint,
        )
        .await?;
        tracing::debug!(ice_restart, "Offer sent");
        Ok(())
    }

    /// Process one inbound message
    ///
    /// Messages for other calls or recipients, malformed messages and
    /// duplicates are dropped. Never fails.
    pub async fn handle_inbound_signal(&self, session: &mut CallSession, message: SignalMessage) {
        if &message.call_id != session.call_id() || &message.to != session.local_user() {
            tracing::trace!(call_id = %message.call_id, to = %message.to, "Ignoring signal for another session");
            return;
        }
        if &message.from != session.remote_user() {
            tracing::warn!(from = %message.from, "Ignoring signal from unexpected sender");
            return;
        }
        if let Err(e) = message.validate() {
            tracing::warn!(error = %e, kind = %message.kind, "Dropping malformed signal");
            return;
        }
        if !session.remember(message.fingerprint()) {
            tracing::debug!(kind = %message.kind, hint = message.sequence_hint, "Duplicate signal ignored");
            return;
        }

        tracing::debug!(kind = %message.kind, hint = message.sequence_hint, "Handling signal");
        match (message.kind, message.payload) {
            (SignalKind::Offer, SignalPayload::Description(offer)) => {
                self.handle_offer(session, offer, message.sequence_hint)
                    .await;
            }
            (SignalKind::Answer, SignalPayload::Description(answer)) => {
                self.handle_answer(session, answer).await;
            }
            (SignalKind::IceCandidate, SignalPayload::Candidate(candidate)) => {
                self.handle_remote_candidate(session, candidate).await;
            }
            (kind, _) => {
                tracing::warn!(kind = %kind, "Payload mismatch after validation");
            }
        }
    }

    async fn handle_offer(&self, session: &mut CallSession, offer: SessionDescription, hint: i64) {
        if session
            .last_remote_offer_hint
            .is_some_and(|last| hint <= last)
        {
            tracing::debug!(hint, "Ignoring stale offer");
            return;
        }

        if session.is_negotiating() {
            if session.local_user() < session.remote_user() {
                tracing::info!("Offer collision, yielding local offer");
                if let Err(e) = self
                    .primitive
                    .set_local_description(SessionDescription::rollback())
                    .await
                {
                    tracing::warn!(error = %e, "Rollback failed, dropping remote offer");
                    return;
                }
                session.negotiation = Negotiation::Stable;
            } else {
                tracing::info!("Offer collision, keeping local offer");
                return;
            }
        }

        let state = self.primitive.signaling_state();
        if !matches!(
            state,
            SignalingState::Stable | SignalingState::HaveRemoteOffer
        ) {
            tracing::warn!(signaling_state = ?state, "Cannot accept offer in current state");
            return;
        }

        if let Err(e) = self.primitive.set_remote_description(offer).await {
            tracing::warn!(error = %e, "Failed to apply remote offer");
            return;
        }
        session.remote_description_set = true;
        session.last_remote_offer_hint = Some(hint);
        self.drain_pending_candidates(session).await;

        let hint = session.next_sequence_hint();
        let created = async {
            let answer = self.primitive.create_answer().await?;
            self.primitive.set_local_description(answer.clone()).await?;
            Ok::<_, PrimitiveError>(answer)
        }
        .await;

        match created {
            Ok(answer) => {
                if let Err(e) = self
                    .publish(
                        session,
                        SignalKind::Answer,
                        SignalPayload::Description(answer),
                        hint,
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Failed to send answer");
                } else {
                    tracing::debug!("Answer sent");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to create answer"),
        }
    }

    async fn handle_answer(&self, session: &mut CallSession, answer: SessionDescription) {
        let result = self.primitive.set_remote_description(answer).await;
        session.negotiation = Negotiation::Stable;
        match result {
            Ok(()) => {
                session.remote_description_set = true;
                self.drain_pending_candidates(session).await;
                tracing::debug!("Answer applied");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to apply remote answer"),
        }
    }

    async fn handle_remote_candidate(&self, session: &mut CallSession, candidate: IceCandidate) {
        if session.has_remote_description() {
            if let Err(e) = self.primitive.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply remote candidate");
            }
        } else {
            session.pending_candidates.push_back(candidate);
            tracing::debug!(
                pending = session.pending_candidates.len(),
                "Buffered candidate until remote description"
            );
        }
    }

    async fn drain_pending_candidates(&self, session: &mut CallSession) {
        let count = session.pending_candidates.len();
        while let Some(candidate) = session.pending_candidates.pop_front() {
            if let Err(e) = self.primitive.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to apply buffered candidate");
            }
        }
        if count > 0 {
            tracing::debug!(count, "Applied buffered candidates");
        }
    }

    /// Publish a locally gathered candidate right away
    pub async fn publish_local_candidate(&self, session: &mut CallSession, candidate: IceCandidate) {
        let hint = session.next_sequence_hint();
        if let Err(e) = self
            .publish(
                session,
                SignalKind::IceCandidate,
                SignalPayload::Candidate(candidate),
                hint,
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to send local candidate");
        }
    }

    /// Record a remote track; a track from a new stream replaces the current one
    pub(crate) fn handle_remote_track(
        &self,
        session: &mut CallSession,
        track: RemoteTrack,
        notifier: &SessionNotifier,
    ) {
        let stream = match session.remote_stream.as_mut() {
            Some(stream) if stream.id == track.stream_id => {
                stream.tracks.retain(|t| t.id != track.id);
                stream.tracks.push(track);
                stream.clone()
            }
            _ => {
                let stream = RemoteStream {
                    id: track.stream_id.clone(),
                    tracks: vec![track],
                };
                session.remote_stream = Some(stream.clone());
                stream
            }
        };
        tracing::debug!(stream_id = %stream.id, tracks = stream.tracks.len(), "Remote track attached");
        notifier.remote_stream(&stream);
    }

    /// Release everything the session holds
    ///
    /// Detaches the primitive first so no event fires afterwards. Failures
    /// are logged, never returned.
    #[tracing::instrument(skip(self, session), fields(call_id = %session.call_id()))]
    pub async fn close(&self, session: &mut CallSession) {
        self.primitive.detach();

        if let Some(media) = session.local_media.take() {
            media.stop();
        }

        if let Err(e) = self.primitive.close().await {
            tracing::warn!(error = %e, "Failed to close peer connection");
        }

        if let Err(e) = self.bus.clear(session.call_id()).await {
            tracing::warn!(error = %e, "Failed to clear call signals");
        }

        session.pending_candidates.clear();
        session.seen.clear();
        session.negotiation = Negotiation::Stable;
        tracing::debug!("Signaling closed");
    }

    async fn publish(
        &self,
        session: &CallSession,
        kind: SignalKind,
        payload: SignalPayload,
        sequence_hint: i64,
    ) -> Result<(), CallError> {
        let message = SignalMessage {
            call_id: session.call_id().clone(),
            kind,
            payload,
            from: session.local_user().clone(),
            to: session.remote_user().clone(),
            sequence_hint,
        };
        self.bus
            .publish(session.call_id(), message)
            .await
            .map_err(CallError::Signaling)
    }
}
