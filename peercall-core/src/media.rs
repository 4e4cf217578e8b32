//! Local media capture
//!
//! Device access is an external capability: the session asks a
//! [`MediaCapture`] for tracks matching the call's constraints and only deals
//! with the resulting [`LocalMedia`] handle. Mute and video toggles flip the
//! tracks' enable flags, which the peer connection backend consults when
//! sending.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Permission to use the device was denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Constraints request no media at all
    #[error("Invalid constraints: {0}")]
    InvalidConstraints(String),
}

/// Capture device descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureDevice {
    /// Device identifier
    pub id: String,
    /// Device name
    pub name: String,
    /// Media kind the device produces
    pub kind: MediaKind,
}

/// A captured local track
///
/// Clones share the enable/stop flags.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    device_id: String,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create an enabled track for a device
    pub fn new(kind: MediaKind, device_id: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4()),
            kind,
            device_id: device_id.into(),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Source device identifier
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether media flows on this track
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.is_stopped()
    }

    /// Enable or disable the track
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether the track was stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the track; stopping is permanent
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Handle to the local media of one call
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    /// Bundle tracks into a stream
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Tracks of one kind
    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// Whether the stream has a video track
    pub fn has_video(&self) -> bool {
        self.tracks_of(MediaKind::Video).next().is_some()
    }

    /// Mute or unmute audio
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.tracks_of(MediaKind::Audio)
            .for_each(|t| t.set_enabled(enabled));
    }

    /// Whether any audio track is enabled
    pub fn is_audio_enabled(&self) -> bool {
        self.tracks_of(MediaKind::Audio).any(LocalTrack::is_enabled)
    }

    /// Enable or disable video
    pub fn set_video_enabled(&self, enabled: bool) {
        self.tracks_of(MediaKind::Video)
            .for_each(|t| t.set_enabled(enabled));
    }

    /// Whether any video track is enabled
    pub fn is_video_enabled(&self) -> bool {
        self.tracks_of(MediaKind::Video).any(LocalTrack::is_enabled)
    }

    /// Flip video on or off, returning the new setting
    pub fn toggle_video(&self) -> bool {
        let enabled = !self.is_video_enabled();
        self.set_video_enabled(enabled);
        enabled
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Media capture capability
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire tracks matching `constraints`
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Capture backed by a fixed device list
///
/// Grants one track per requested kind from the first matching device.
#[derive(Debug, Clone)]
pub struct StaticMediaCapture {
    devices: Vec<CaptureDevice>,
    permission_granted: bool,
}

impl StaticMediaCapture {
    /// Create a capture over the given devices
    #[must_use]
    pub fn new(devices: Vec<CaptureDevice>) -> Self {
        Self {
            devices,
            permission_granted: true,
        }
    }

    /// Default microphone and camera
    #[must_use]
    pub fn with_default_devices() -> Self {
        Self::new(vec![
            CaptureDevice {
                id: "default-audio".to_string(),
                name: "Default Audio Device".to_string(),
                kind: MediaKind::Audio,
            },
            CaptureDevice {
                id: "default-video".to_string(),
                name: "Default Video Device".to_string(),
                kind: MediaKind::Video,
            },
        ])
    }

    /// A capture whose permission prompt is always refused
    #[must_use]
    pub fn denied() -> Self {
        Self {
            devices: Vec::new(),
            permission_granted: false,
        }
    }

    /// Available devices
    #[must_use]
    pub fn devices(&self) -> &[CaptureDevice] {
        &self.devices
    }
}

#[async_trait]
impl MediaCapture for StaticMediaCapture {
    #[tracing::instrument(skip(self))]
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        if !self.permission_granted {
            return Err(MediaError::PermissionDenied(
                "media access refused".to_string(),
            ));
        }

        let kinds = constraints.to_media_kinds();
        if kinds.is_empty() {
            return Err(MediaError::InvalidConstraints(
                "neither audio nor video requested".to_string(),
            ));
        }

        let mut tracks = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let device = self
                .devices
                .iter()
                .find(|d| d.kind == kind)
                .ok_or_else(|| MediaError::DeviceNotFound(format!("no {kind} device")))?;
            tracks.push(LocalTrack::new(kind, device.id.clone()));
        }

        let media = LocalMedia::new(tracks);
        tracing::debug!(stream_id = %media.stream_id(), tracks = media.tracks().len(), "Local media acquired");
        Ok(media)
    }
}
