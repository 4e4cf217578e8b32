//! Call sessions
//!
//! A [`CallSession`] is the state of one call. It is owned by a single tokio
//! task that takes work from one place at a time: commands from
//! [`CallHandle`]s, messages from the signal bus, events from the peer
//! connection, and poll ticks when the primitive cannot push state changes.
//! Handlers for one session therefore never overlap and need no locks.

use crate::bus::SignalStream;
use crate::call::CallError;
use crate::events::SessionNotifier;
use crate::identity::UserId;
use crate::media::LocalMedia;
use crate::peer::{PeerConnectionState, PrimitiveEvent};
use crate::signaling::{
    FingerprintWindow, SignalFingerprint, SignalingController, FINGERPRINT_WINDOW,
};
use crate::supervisor::{ConnectionSupervisor, SupervisorAction};
use crate::types::{CallId, CallRole, CallState, IceCandidate, RemoteStream};
use futures::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Negotiation progress of the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// No local offer outstanding
    Stable,
    /// A local offer was sent and awaits an answer
    LocalOfferPending {
        /// Sequence hint the offer was sent with
        hint: i64,
        /// Whether the offer restarts ICE
        ice_restart: bool,
    },
}

/// State of one call
#[derive(Debug)]
pub struct CallSession {
    call_id: CallId,
    local_user: UserId,
    remote_user: UserId,
    role: CallRole,
    pub(crate) state: CallState,
    pub(crate) negotiation: Negotiation,
    pub(crate) pending_candidates: VecDeque<IceCandidate>,
    pub(crate) remote_description_set: bool,
    pub(crate) last_remote_offer_hint: Option<i64>,
    pub(crate) restart_attempts: u32,
    pub(crate) remote_stream: Option<RemoteStream>,
    pub(crate) local_media: Option<LocalMedia>,
    last_raw_state: Option<PeerConnectionState>,
    last_sequence_hint: i64,
    pub(crate) seen: FingerprintWindow,
}

impl CallSession {
    /// Create an idle session between `local_user` and `remote_user`
    pub fn new(local_user: UserId, remote_user: UserId, role: CallRole) -> Self {
        Self {
            call_id: CallId::between(&local_user, &remote_user),
            local_user,
            remote_user,
            role,
            state: CallState::Idle,
            negotiation: Negotiation::Stable,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            last_remote_offer_hint: None,
            restart_attempts: 0,
            remote_stream: None,
            local_media: None,
            last_raw_state: None,
            last_sequence_hint: 0,
            seen: FingerprintWindow::new(FINGERPRINT_WINDOW),
        }
    }

    /// Call identifier
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Local participant
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Remote participant
    pub fn remote_user(&self) -> &UserId {
        &self.remote_user
    }

    /// Which side this session started on
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Current logical state
    pub fn state(&self) -> CallState {
        self.state
    }

    /// Current negotiation progress
    pub fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    /// Whether a locally-initiated offer is outstanding
    pub fn is_negotiating(&self) -> bool {
        matches!(self.negotiation, Negotiation::LocalOfferPending { .. })
    }

    /// Whether a remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Candidates waiting for a remote description
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// ICE restarts spent in the current incident
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    /// The active remote stream
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Next outgoing sequence hint: the wall clock in milliseconds, bumped
    /// past the previous hint when the clock stalls or steps back
    pub fn next_sequence_hint(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_sequence_hint = now.max(self.last_sequence_hint + 1);
        self.last_sequence_hint
    }

    /// Record a delivered signal; `false` if it was seen before
    pub(crate) fn remember(&mut self, fingerprint: SignalFingerprint) -> bool {
        self.seen.insert(fingerprint)
    }
}

/// Request sent to a session task
pub(crate) enum SessionCommand {
    Start {
        is_video: bool,
        reply: oneshot::Sender<Result<LocalMedia, CallError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running call session
///
/// Cheap to clone. The session closes when asked to, or once every handle
/// is dropped.
#[derive(Clone)]
pub struct CallHandle {
    call_id: CallId,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    pub(crate) fn new(
        call_id: CallId,
        commands: mpsc::Sender<SessionCommand>,
        state: watch::Receiver<CallState>,
    ) -> Self {
        Self {
            call_id,
            commands,
            state,
        }
    }

    /// Call identifier
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Current logical state
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    /// Whether the session task has finished
    pub fn is_closed(&self) -> bool {
        self.state().is_terminal() || self.commands.is_closed()
    }

    /// Wait until the session reaches `target`
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session ends without reaching it
    pub async fn wait_for_state(&self, target: CallState) -> Result<(), CallError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| CallError::SessionClosed)
    }

    pub(crate) async fn start(&self, is_video: bool) -> Result<LocalMedia, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Start { is_video, reply })
            .await
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Close the session and wait until it has released its resources
    ///
    /// Closing an already closed session is a no-op.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Close { reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    /// Hang up; same as [`close`](Self::close)
    pub async fn cancel(&self) {
        self.close().await;
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("call_id", &self.call_id)
            .field("state", &self.state())
            .finish()
    }
}

/// The task owning one session
pub(crate) struct SessionTask {
    session: CallSession,
    controller: SignalingController,
    supervisor: ConnectionSupervisor,
    notifier: SessionNotifier,
    commands: mpsc::Receiver<SessionCommand>,
    signals: SignalStream,
    events: mpsc::UnboundedReceiver<PrimitiveEvent>,
    poll_interval: Option<Duration>,
    /// Set while an ICE restart waits to reconnect
    restart_deadline: Option<Instant>,
}

impl SessionTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: CallSession,
        controller: SignalingController,
        supervisor: ConnectionSupervisor,
        notifier: SessionNotifier,
        commands: mpsc::Receiver<SessionCommand>,
        signals: SignalStream,
        events: mpsc::UnboundedReceiver<PrimitiveEvent>,
        poll_interval: Option<Duration>,
    ) -> Self {
        Self {
            session,
            controller,
            supervisor,
            notifier,
            commands,
            signals,
            events,
            poll_interval,
            restart_deadline: None,
        }
    }

    /// Process work until the session is closed
    pub(crate) async fn run(mut self) {
        let mut poll = self.poll_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        tracing::debug!(
            call_id = %self.session.call_id(),
            role = ?self.session.role(),
            polling = poll.is_some(),
            "Session task started"
        );

        loop {
            let accepting_signals = self.session.state() != CallState::Idle;
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SessionCommand::Start { is_video, reply }) => {
                        let result = self.start(is_video).await;
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Close { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                    }
                    None => {
                        tracing::debug!(call_id = %self.session.call_id(), "All handles dropped");
                        self.shutdown().await;
                    }
                },
                Some(event) = self.events.recv() => {
                    self.handle_primitive_event(event).await;
                }
                Some(message) = self.signals.next(), if accepting_signals => {
                    self.controller.handle_inbound_signal(&mut self.session, message).await;
                }
                _ = expiry(self.restart_deadline) => {
                    self.restart_deadline = None;
                    self.supervisor
                        .on_restart_timeout(&mut self.session, &self.notifier);
                }
                _ = next_tick(&mut poll) => {
                    self.poll_connection_state().await;
                }
            }

            if self.session.state() == CallState::Failed {
                self.shutdown().await;
            }
            if self.session.state().is_terminal() {
                break;
            }
        }

        tracing::debug!(call_id = %self.session.call_id(), "Session task finished");
    }

    async fn start(&mut self, is_video: bool) -> Result<LocalMedia, CallError> {
        if !self
            .supervisor
            .apply(&mut self.session, CallState::Connecting, &self.notifier)
        {
            return Err(CallError::SessionClosed);
        }

        match self.controller.start(&mut self.session, is_video).await {
            Ok(media) => Ok(media),
            Err(e) => {
                tracing::warn!(call_id = %self.session.call_id(), error = %e, "Call start failed");
                self.supervisor
                    .apply(&mut self.session, CallState::Failed, &self.notifier);
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handle_primitive_event(&mut self, event: PrimitiveEvent) {
        if self.session.state().is_terminal() {
            return;
        }
        match event {
            PrimitiveEvent::IceCandidate(candidate) => {
                self.controller
                    .publish_local_candidate(&mut self.session, candidate)
                    .await;
            }
            PrimitiveEvent::Track(track) => {
                self.controller
                    .handle_remote_track(&mut self.session, track, &self.notifier);
            }
            PrimitiveEvent::ConnectionState(raw) => {
                self.on_connection_state(raw).await;
            }
            PrimitiveEvent::NegotiationNeeded => {
                self.controller
                    .handle_negotiation_needed(&mut self.session)
                    .await;
            }
        }
    }

    async fn poll_connection_state(&mut self) {
        if !self.session.state().is_active() {
            return;
        }
        let raw = self.controller.primitive().connection_state();
        if self.session.last_raw_state != Some(raw) {
            tracing::trace!(raw = ?raw, "Polled connection state changed");
            self.on_connection_state(raw).await;
        }
    }

    async fn on_connection_state(&mut self, raw: PeerConnectionState) {
        self.session.last_raw_state = Some(raw);
        let action = self
            .supervisor
            .on_connection_state(&mut self.session, raw, &self.notifier);
        if action == SupervisorAction::RestartIce {
            match self.controller.restart_ice(&mut self.session).await {
                Ok(()) => {
                    self.restart_deadline =
                        Some(Instant::now() + self.supervisor.restart_timeout());
                }
                Err(e) => self.supervisor.fail(
                    &mut self.session,
                    &format!("ICE restart failed: {e}"),
                    &self.notifier,
                ),
            }
        }
        if self.session.state() != CallState::Reconnecting {
            self.restart_deadline = None;
        }
    }

    async fn shutdown(&mut self) {
        if self.session.state().is_terminal() {
            return;
        }
        self.controller.close(&mut self.session).await;
        self.supervisor
            .apply(&mut self.session, CallState::Closed, &self.notifier);
        tracing::info!(call_id = %self.session.call_id(), "Call closed");
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session(role: CallRole) -> CallSession {
        CallSession::new(
            UserId::new("bob").unwrap(),
            UserId::new("alice").unwrap(),
            role,
        )
    }

    #[test]
    fn test_new_session_is_idle() {
        let s = session(CallRole::Responder);
        assert_eq!(s.call_id().as_str(), "alice_bob");
        assert_eq!(s.remote_user().as_str(), "alice");
        assert_eq!(s.state(), CallState::Idle);
        assert!(!s.is_negotiating());
        assert!(!s.has_remote_description());
        assert_eq!(s.pending_candidate_count(), 0);
        assert!(s.remote_stream().is_none());
    }

    #[test]
    fn test_sequence_hints_strictly_increase() {
        let mut s = session(CallRole::Initiator);
        let mut last = s.next_sequence_hint();
        for _ in 0..1000 {
            let next = s.next_sequence_hint();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_negotiation_guard() {
        let mut s = session(CallRole::Initiator);
        s.negotiation = Negotiation::LocalOfferPending {
            hint: 1,
            ice_restart: false,
        };
        assert!(s.is_negotiating());
        s.negotiation = Negotiation::Stable;
        assert!(!s.is_negotiating());
    }
}
