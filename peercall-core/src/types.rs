//! Call types and data structures

use crate::identity::{IdentityError, UserId, CALL_ID_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a one-to-one call
///
/// Derived from the two participants: their ids sorted and joined with `_`.
/// Either side computes the same value without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallId {
    key: String,
    low: UserId,
    high: UserId,
}

impl CallId {
    /// Derive the call identifier for two participants
    #[must_use]
    pub fn between(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            key: format!("{low}{CALL_ID_SEPARATOR}{high}"),
            low: low.clone(),
            high: high.clone(),
        }
    }

    /// The two participants, in sorted order
    #[must_use]
    pub fn participants(&self) -> (&UserId, &UserId) {
        (&self.low, &self.high)
    }

    /// Check whether `user` takes part in this call
    #[must_use]
    pub fn includes(&self, user: &UserId) -> bool {
        &self.low == user || &self.high == user
    }

    /// The participant that is not `local`
    ///
    /// Returns `None` if `local` is not a participant of this call.
    #[must_use]
    pub fn remote_for(&self, local: &UserId) -> Option<&UserId> {
        if &self.low == local {
            Some(&self.high)
        } else if &self.high == local {
            Some(&self.low)
        } else {
            None
        }
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

impl FromStr for CallId {
    type Err = IdentityError;

    /// Parse a canonical call identifier (`low_high`, sorted)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once(CALL_ID_SEPARATOR)
            .ok_or_else(|| IdentityError::ReservedSeparator(s.to_string()))?;
        let a = UserId::new(a)?;
        let b = UserId::new(b)?;
        let id = Self::between(&a, &b);
        if id.key != s {
            // Non-canonical order; the sorted form is the only valid spelling
            return Err(IdentityError::ReservedSeparator(s.to_string()));
        }
        Ok(id)
    }
}

impl TryFrom<String> for CallId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CallId> for String {
    fn from(id: CallId) -> Self {
        id.key
    }
}

/// Which side of the negotiation a session starts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Placed the call and sends the first offer
    Initiator,
    /// Accepted the call and waits for the remote offer
    Responder,
}

/// Logical call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No peer connection yet
    Idle,
    /// Media attached, negotiation or ICE checks underway
    Connecting,
    /// Media path is up
    Connected,
    /// Transient connectivity loss
    Reconnecting,
    /// Connectivity is lost for good
    Failed,
    /// Session torn down
    Closed,
}

impl CallState {
    /// Whether no further transition can happen
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// Whether the session is past setup and not yet torn down
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Constraints for a call started with a video toggle
    pub fn from_video_flag(is_video: bool) -> Self {
        if is_video {
            Self::video_call()
        } else {
            Self::audio_only()
        }
    }

    /// Convert to media kinds
    pub fn to_media_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Discard the pending local offer
    Rollback,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// An offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// A rollback of the pending local offer
    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

/// ICE candidate for the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with no media association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Stream the track belongs to
    pub stream_id: String,
    /// Media kind
    pub kind: MediaKind,
}

/// The remote peer's media stream
///
/// A session has at most one; tracks of a different stream replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Stream identifier
    pub id: String,
    /// Tracks attached so far
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Whether the stream carries video
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == MediaKind::Video)
    }
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// An offer arrived for a call with no local session
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        from: UserId,
    },
    /// Logical state transition
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Remote stream attached or replaced
    RemoteStream {
        /// Call identifier
        call_id: CallId,
        /// Current remote stream
        stream: RemoteStream,
    },
    /// Connectivity lost after the reconnect budget was spent
    ConnectionFailed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        reason: String,
    },
}

impl CallEvent {
    /// The call this event belongs to
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::IncomingCall { call_id, .. }
            | Self::StateChanged { call_id, .. }
            | Self::RemoteStream { call_id, .. }
            | Self::ConnectionFailed { call_id, .. } => call_id,
        }
    }
}
