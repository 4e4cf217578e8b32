//! Call management
//!
//! [`CallManager`] is the public entry point. It derives call identifiers,
//! keeps at most one session per call, provisions ICE servers and peer
//! connections, and runs each session on its own task.
//!
//! # Call Flow
//!
//! ```text
//!  start_call / accept_call
//!       │
//!       ├─ retire existing session for the CallId
//!       ├─ resolve ICE servers (timeout, fallback)
//!       ├─ create peer connection, subscribe to the bus
//!       ├─ spawn session task
//!       ▼
//!  capture media, attach tracks, offer (initiator only)
//!       │
//!       ▼
//!  (LocalMedia, CallHandle)
//! ```

use crate::bus::{BusError, SignalBus};
use crate::events::{EventHub, RemoteStreamHandler, SessionNotifier, StateHandler};
use crate::ice::{default_ice_servers, resolve_ice_servers, IceServer, IceServerProvider};
use crate::identity::UserId;
use crate::media::{LocalMedia, MediaCapture, MediaError};
use crate::peer::{PeerConnectionConfig, PeerConnectionFactory, PrimitiveError};
use crate::session::{CallHandle, CallSession, SessionTask};
use crate::signaling::{
    FingerprintWindow, SignalKind, SignalingController, FINGERPRINT_WINDOW,
};
use crate::supervisor::{ConnectionSupervisor, DEFAULT_ICE_RESTART_TIMEOUT};
use crate::types::{CallEvent, CallId, CallRole, CallState, RemoteStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Local media could not be captured
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// The peer connection rejected an operation
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] PrimitiveError),

    /// The signal bus rejected an operation
    #[error("Signaling failed: {0}")]
    Signaling(#[from] BusError),

    /// The session is already closed
    #[error("Call session is closed")]
    SessionClosed,

    /// Too many concurrent calls
    #[error("Concurrent call limit reached: {0}")]
    LimitReached(usize),

    /// The remote participant is not acceptable
    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// Maximum concurrent calls
    pub max_concurrent_calls: usize,
    /// ICE restarts allowed per connectivity incident
    pub max_ice_restarts: u32,
    /// How long an ICE restart may take to reconnect before the call fails
    pub ice_restart_timeout: Duration,
    /// How long to wait for the ICE server provider
    pub ice_fetch_timeout: Duration,
    /// Poll period for primitives without state events
    pub state_poll_interval: Duration,
    /// Capacity of the call event broadcast channel
    pub event_channel_capacity: usize,
    /// Servers used when the provider fails
    pub fallback_ice_servers: Vec<IceServer>,
    /// Candidates to pre-gather per connection
    pub ice_candidate_pool_size: u8,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            max_ice_restarts: 1,
            ice_restart_timeout: DEFAULT_ICE_RESTART_TIMEOUT,
            ice_fetch_timeout: Duration::from_secs(3),
            state_poll_interval: Duration::from_secs(1),
            event_channel_capacity: 100,
            fallback_ice_servers: default_ice_servers(),
            ice_candidate_pool_size: 10,
        }
    }
}

impl CallManagerConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CallError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| CallError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid field
    pub fn validate(&self) -> Result<(), CallError> {
        if self.max_concurrent_calls == 0 {
            return Err(CallError::Config(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(CallError::Config(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.ice_restart_timeout.is_zero() {
            return Err(CallError::Config(
                "ice_restart_timeout must be positive".to_string(),
            ));
        }
        if self.state_poll_interval.is_zero() {
            return Err(CallError::Config(
                "state_poll_interval must be positive".to_string(),
            ));
        }
        if let Some(bad) = self.fallback_ice_servers.iter().find(|s| !s.is_valid()) {
            return Err(CallError::Config(format!(
                "invalid fallback ICE server {:?}",
                bad.urls
            )));
        }
        Ok(())
    }
}

/// External capabilities a manager needs
#[derive(Clone)]
pub struct CallDependencies {
    /// Signal relay
    pub bus: Arc<dyn SignalBus>,
    /// Peer connection factory
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    /// Local media capture
    pub media: Arc<dyn MediaCapture>,
    /// ICE server source
    pub ice_provider: Arc<dyn IceServerProvider>,
}

type SessionMap = Arc<RwLock<HashMap<CallId, CallHandle>>>;

/// Serializes session setup per call so only one open runs at a time
type SetupSlots = parking_lot::Mutex<HashMap<CallId, Arc<tokio::sync::Mutex<()>>>>;

/// Call manager
///
/// Coordinates one-to-one calls for a single local user. At most one session
/// exists per [`CallId`]; starting or accepting a call with the same peer
/// retires the previous session first.
pub struct CallManager {
    local_user: UserId,
    deps: CallDependencies,
    config: CallManagerConfig,
    sessions: SessionMap,
    setup_slots: SetupSlots,
    hub: Arc<EventHub>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    /// Create new call manager
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        local_user: UserId,
        deps: CallDependencies,
        config: CallManagerConfig,
    ) -> Result<Self, CallError> {
        config.validate()?;
        let hub = Arc::new(EventHub::new(config.event_channel_capacity));
        Ok(Self {
            local_user,
            deps,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            setup_slots: parking_lot::Mutex::new(HashMap::new()),
            hub,
            watcher: parking_lot::Mutex::new(None),
        })
    }

    /// The local participant
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Active configuration
    pub fn config(&self) -> &CallManagerConfig {
        &self.config
    }

    /// Place a call to `remote`
    ///
    /// Returns once local media is attached and the offer has been sent.
    ///
    /// # Errors
    ///
    /// Returns error if media capture, peer connection setup or the initial
    /// offer fails. The session is closed in that case.
    #[tracing::instrument(skip(self), fields(local = %self.local_user))]
    pub async fn start_call(
        &self,
        remote: UserId,
        is_video: bool,
    ) -> Result<(LocalMedia, CallHandle), CallError> {
        self.open_session(remote, CallRole::Initiator, is_video)
            .await
    }

    /// Answer a call from `remote`
    ///
    /// The session attaches local media and waits for the remote offer,
    /// including one sent before this call.
    ///
    /// # Errors
    ///
    /// Returns error if media capture or peer connection setup fails
    #[tracing::instrument(skip(self), fields(local = %self.local_user))]
    pub async fn accept_call(
        &self,
        remote: UserId,
        is_video: bool,
    ) -> Result<(LocalMedia, CallHandle), CallError> {
        self.open_session(remote, CallRole::Responder, is_video)
            .await
    }

    async fn open_session(
        &self,
        remote: UserId,
        role: CallRole,
        is_video: bool,
    ) -> Result<(LocalMedia, CallHandle), CallError> {
        if remote == self.local_user {
            return Err(CallError::InvalidParticipant(format!(
                "cannot call yourself ({remote})"
            )));
        }
        let call_id = CallId::between(&self.local_user, &remote);

        // Retire, create and register under the call's slot; a concurrent open
        // for the same peer waits here and then retires this session.
        let slot = self.acquire_slot(&call_id);
        let handle = {
            let _setup = slot.lock().await;
            self.setup_session(call_id.clone(), remote, role, is_video)
                .await
        };
        self.release_slot(&call_id, slot);

        let handle = handle?;
        let media = handle.start(is_video).await?;
        Ok((media, handle))
    }

    fn acquire_slot(&self, call_id: &CallId) -> Arc<tokio::sync::Mutex<()>> {
        self.setup_slots
            .lock()
            .entry(call_id.clone())
            .or_default()
            .clone()
    }

    fn release_slot(&self, call_id: &CallId, slot: Arc<tokio::sync::Mutex<()>>) {
        let mut slots = self.setup_slots.lock();
        // Only the map and this caller hold it: nobody is waiting
        if Arc::strong_count(&slot) == 2 {
            slots.remove(call_id);
        }
    }

    async fn setup_session(
        &self,
        call_id: CallId,
        remote: UserId,
        role: CallRole,
        is_video: bool,
    ) -> Result<CallHandle, CallError> {
        let previous = self.sessions.write().await.remove(&call_id);
        if let Some(previous) = previous {
            tracing::info!(call_id = %call_id, "Retiring existing session");
            previous.close().await;
        }

        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|_, handle| !handle.is_closed());
            if sessions.len() >= self.config.max_concurrent_calls {
                tracing::warn!(
                    active = sessions.len(),
                    max = self.config.max_concurrent_calls,
                    "Concurrent call limit reached"
                );
                return Err(CallError::LimitReached(self.config.max_concurrent_calls));
            }
        }

        let ice_servers = resolve_ice_servers(
            self.deps.ice_provider.as_ref(),
            self.config.ice_fetch_timeout,
            &self.config.fallback_ice_servers,
        )
        .await;

        let primitive = self
            .deps
            .peer_factory
            .create(&PeerConnectionConfig {
                ice_servers,
                ice_candidate_pool_size: self.config.ice_candidate_pool_size,
            })
            .await?;

        let signals = match self.deps.bus.subscribe(&self.local_user).await {
            Ok(signals) => signals,
            Err(e) => {
                let _ = primitive.close().await;
                return Err(e.into());
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        primitive.attach(event_tx);
        let poll_interval =
            (!primitive.supports_state_events()).then_some(self.config.state_poll_interval);

        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (command_tx, command_rx) = mpsc::channel(8);
        let handle = CallHandle::new(call_id.clone(), command_tx, state_rx);

        let task = SessionTask::new(
            CallSession::new(self.local_user.clone(), remote, role),
            SignalingController::new(primitive, self.deps.bus.clone(), self.deps.media.clone()),
            ConnectionSupervisor::new(self.config.max_ice_restarts)
                .with_restart_timeout(self.config.ice_restart_timeout),
            SessionNotifier::new(call_id.clone(), self.hub.clone(), state_tx),
            command_rx,
            signals,
            event_rx,
            poll_interval,
        );
        tokio::spawn(task.run());

        self.sessions
            .write()
            .await
            .insert(call_id.clone(), handle.clone());
        tracing::info!(call_id = %call_id, role = ?role, is_video, "Call session created");
        Ok(handle)
    }

    /// Report offers for calls that have no local session
    ///
    /// Emits [`CallEvent::IncomingCall`] once per distinct offer. Calling it
    /// again replaces the previous watcher.
    ///
    /// # Errors
    ///
    /// Returns error if the bus subscription fails
    pub async fn watch_incoming(&self) -> Result<(), CallError> {
        let mut signals = self.deps.bus.subscribe(&self.local_user).await?;
        let sessions = self.sessions.clone();
        let hub = self.hub.clone();
        let local_user = self.local_user.clone();

        let watcher = tokio::spawn(async move {
            let mut reported = FingerprintWindow::new(FINGERPRINT_WINDOW);
            while let Some(message) = signals.next().await {
                if message.kind != SignalKind::Offer || message.to != local_user {
                    continue;
                }
                if message.validate().is_err() || !reported.insert(message.fingerprint()) {
                    continue;
                }
                let busy = sessions
                    .read()
                    .await
                    .get(&message.call_id)
                    .is_some_and(|h| !h.is_closed());
                if busy {
                    continue;
                }
                tracing::info!(call_id = %message.call_id, from = %message.from, "Incoming call");
                hub.emit(CallEvent::IncomingCall {
                    call_id: message.call_id,
                    from: message.from,
                });
            }
        });

        if let Some(previous) = self.watcher.lock().replace(watcher) {
            previous.abort();
        }
        Ok(())
    }

    /// Register a callback for remote track attachments
    pub fn on_remote_stream<F>(&self, handler: F)
    where
        F: Fn(&CallId, &RemoteStream) + Send + Sync + 'static,
    {
        let handler: RemoteStreamHandler = Arc::new(handler);
        self.hub.on_remote_stream(handler);
    }

    /// Register a callback for every state transition
    pub fn on_state_changed<F>(&self, handler: F)
    where
        F: Fn(&CallId, CallState) + Send + Sync + 'static,
    {
        let handler: StateHandler = Arc::new(handler);
        self.hub.on_state_changed(handler);
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.hub.subscribe()
    }

    /// End a call and wait for its session to close
    ///
    /// Ending an unknown or already ended call does nothing.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn end_call(&self, call_id: &CallId) {
        let handle = self.sessions.read().await.get(call_id).cloned();
        match handle {
            Some(handle) => handle.close().await,
            None => tracing::debug!("No session to end"),
        }
    }

    /// Get call state
    pub async fn get_call_state(&self, call_id: &CallId) -> Option<CallState> {
        self.sessions.read().await.get(call_id).map(CallHandle::state)
    }

    /// Handle for an existing session
    pub async fn call_handle(&self, call_id: &CallId) -> Option<CallHandle> {
        self.sessions.read().await.get(call_id).cloned()
    }

    /// Calls whose session has not closed
    pub async fn active_calls(&self) -> Vec<CallId> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_closed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Close every session and stop the incoming-call watcher
    pub async fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        let handles: Vec<CallHandle> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        tracing::info!(sessions = handles.len(), "Shutting down call manager");
        futures::future::join_all(handles.iter().map(|handle| handle.close())).await;
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}
