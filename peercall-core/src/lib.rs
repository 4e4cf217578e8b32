//! Peercall - one-to-one call signaling over WebRTC
//!
//! This library drives a peer connection between two users through a relayed
//! signaling channel. It features:
//!
//! - **Deterministic call identifiers**: both sides derive the same [`CallId`]
//! - **Offer/answer negotiation**: duplicate, stale and early messages are
//!   tolerated; concurrent offers are resolved by a fixed tie-break
//! - **Candidate buffering**: remote candidates wait for the remote description
//! - **Connection supervision**: bounded ICE restarts before a call fails
//! - **Pluggable collaborators**: signal bus, media capture, ICE provisioning
//!   and the peer connection itself are traits
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let deps = CallDependencies {
//!     bus: Arc::new(MemorySignalBus::new()),
//!     peer_factory: Arc::new(WebRtcPeerFactory::new()?),
//!     media: Arc::new(StaticMediaCapture::with_default_devices()),
//!     ice_provider: Arc::new(StaticIceServerProvider::new(default_ice_servers())),
//! };
//! let manager = CallManager::new("alice".parse()?, deps, CallManagerConfig::default())?;
//!
//! // Place a video call
//! let (media, call) = manager.start_call("bob".parse()?, true).await?;
//! media.set_audio_enabled(false);
//! call.close().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Call types and data structures
pub mod types;

/// Participant identity
pub mod identity;

/// ICE server provisioning
pub mod ice;

/// Local media capture
pub mod media;

/// Peer connection capability
pub mod peer;

/// Signal bus abstraction and in-memory relay
pub mod bus;

/// Signaling messages and the per-session negotiation controller
pub mod signaling;

/// Connection state supervision
pub mod supervisor;

/// Call sessions and their tasks
pub mod session;

/// Call management
pub mod call;

mod events;

/// Peer connection backed by the webrtc crate (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

// Re-export main types at crate root
pub use bus::{BusError, MemorySignalBus, SignalBus, SignalStream};
pub use call::{CallDependencies, CallError, CallManager, CallManagerConfig};
pub use events::{RemoteStreamHandler, StateHandler};
pub use ice::{
    default_ice_servers, resolve_ice_servers, IceConfigError, IceServer, IceServerProvider,
    StaticIceServerProvider,
};
pub use identity::{IdentityError, UserId};
pub use media::{CaptureDevice, LocalMedia, LocalTrack, MediaCapture, MediaError, StaticMediaCapture};
pub use peer::{
    PeerConnectionConfig, PeerConnectionFactory, PeerConnectionPrimitive, PeerConnectionState,
    PrimitiveError, PrimitiveEvent, PrimitiveEventSink, SignalingState,
};
pub use session::{CallHandle, CallSession, Negotiation};
pub use signaling::{
    SignalFingerprint, SignalKind, SignalMessage, SignalPayload, SignalingController,
    SignalingError,
};
pub use supervisor::{ConnectionSupervisor, SupervisorAction, DEFAULT_ICE_RESTART_TIMEOUT};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{WebRtcPeerConnection, WebRtcPeerFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bus::{MemorySignalBus, SignalBus};
    pub use crate::call::{CallDependencies, CallError, CallManager, CallManagerConfig};
    pub use crate::ice::{default_ice_servers, IceServer, StaticIceServerProvider};
    pub use crate::identity::UserId;
    pub use crate::media::{LocalMedia, MediaCapture, StaticMediaCapture};
    pub use crate::session::CallHandle;
    pub use crate::types::{CallEvent, CallId, CallState, MediaConstraints, RemoteStream};
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_backend::WebRtcPeerFactory;
}
