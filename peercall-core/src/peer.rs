//! Peer connection capability
//!
//! The session never touches ICE, DTLS or SRTP itself. It drives an opaque
//! [`PeerConnectionPrimitive`] and consumes the events the primitive pushes
//! into the sink handed over by [`PeerConnectionPrimitive::attach`].

use crate::ice::IceServer;
use crate::media::LocalTrack;
use crate::types::{IceCandidate, RemoteTrack, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    /// Offer or answer creation failed
    #[error("Failed to create {0}: {1}")]
    CreateDescription(&'static str, String),

    /// Setting a local or remote description failed
    #[error("Failed to set {0} description: {1}")]
    SetDescription(&'static str, String),

    /// The candidate was rejected
    #[error("Failed to add ICE candidate: {0}")]
    AddCandidate(String),

    /// The track could not be attached
    #[error("Failed to add track: {0}")]
    AddTrack(String),

    /// Operation on a closed connection
    #[error("Peer connection is closed")]
    Closed,

    /// Construction failed
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// Teardown failed
    #[error("Failed to close peer connection: {0}")]
    Close(String),
}

/// Raw connection state reported by the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Transport is healthy
    Connected,
    /// Transport lost, may recover
    Disconnected,
    /// Transport failed
    Failed,
    /// Connection closed
    Closed,
}

/// Offer/answer state of the primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalingState {
    /// No exchange in progress
    Stable,
    /// Local offer applied, waiting for an answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet applied
    HaveRemoteOffer,
    /// Connection closed
    Closed,
}

/// Event pushed by the primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveEvent {
    /// A local candidate was gathered
    IceCandidate(IceCandidate),
    /// A remote track arrived
    Track(RemoteTrack),
    /// Connection state changed
    ConnectionState(PeerConnectionState),
    /// Local changes need a new offer
    NegotiationNeeded,
}

/// Sink the primitive pushes its events into
pub type PrimitiveEventSink = mpsc::UnboundedSender<PrimitiveEvent>;

/// Configuration for a new peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionConfig {
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,
    /// Candidates to pre-gather
    pub ice_candidate_pool_size: u8,
}

/// Peer connection capability
///
/// Implementations wrap a platform peer connection. Events are pushed into
/// the sink given to [`attach`](Self::attach) until [`detach`](Self::detach)
/// is called; after `detach` no event may be delivered.
#[async_trait]
pub trait PeerConnectionPrimitive: Send + Sync {
    /// Start delivering events into `sink`
    fn attach(&self, sink: PrimitiveEventSink);

    /// Stop delivering events
    fn detach(&self);

    /// Whether connection-state changes are pushed as events
    ///
    /// When `false` the session polls [`connection_state`](Self::connection_state).
    fn supports_state_events(&self) -> bool {
        true
    }

    /// Create an offer, optionally restarting ICE
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PrimitiveError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PrimitiveError>;

    /// Apply a local description (including rollback)
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PrimitiveError>;

    /// Apply a remote description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PrimitiveError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PrimitiveError>;

    /// Attach a local track to the connection
    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<(), PrimitiveError>;

    /// Current offer/answer state
    fn signaling_state(&self) -> SignalingState;

    /// Current connection state
    fn connection_state(&self) -> PeerConnectionState;

    /// Close the connection
    async fn close(&self) -> Result<(), PrimitiveError>;
}

/// Creates one primitive per call session
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a new peer connection
    async fn create(
        &self,
        config: &PeerConnectionConfig,
    ) -> Result<Arc<dyn PeerConnectionPrimitive>, PrimitiveError>;
}
