//! Connection supervision
//!
//! Maps the primitive's raw connection state onto the logical [`CallState`]
//! and owns the bounded ICE restart policy.
//!
//! ```text
//!     Idle
//!       │ start
//!       ▼
//!  Connecting ──────────────┐
//!       │ connected          │ disconnected / failed (budget left)
//!       ▼                    ▼
//!   Connected ◄──────── Reconnecting
//!       │      recovered     │
//!       │ failed (no budget) │ failed (no budget) / closed
//!       ▼                    ▼
//!     Failed ──────────► Closed
//! ```
//!
//! Any state except Closed may move to Closed on an explicit close. Closed
//! is final. An ICE restart that does not bring the connection back within
//! the restart timeout fails the call.

use crate::events::SessionNotifier;
use crate::peer::PeerConnectionState;
use crate::session::CallSession;
use crate::types::CallState;
use std::time::Duration;

/// How long an ICE restart may take before the call fails
pub const DEFAULT_ICE_RESTART_TIMEOUT: Duration = Duration::from_secs(10);

/// What the session loop has to do after a raw state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Nothing further
    None,
    /// Send a fresh offer with the ICE restart flag
    RestartIce,
}

/// Per-session connection supervisor
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSupervisor {
    max_ice_restarts: u32,
    restart_timeout: Duration,
}

impl ConnectionSupervisor {
    /// Create a supervisor allowing `max_ice_restarts` restarts per incident
    #[must_use]
    pub fn new(max_ice_restarts: u32) -> Self {
        Self {
            max_ice_restarts,
            restart_timeout: DEFAULT_ICE_RESTART_TIMEOUT,
        }
    }

    /// Set the deadline for a restart to reach Connected
    #[must_use]
    pub fn with_restart_timeout(mut self, restart_timeout: Duration) -> Self {
        self.restart_timeout = restart_timeout;
        self
    }

    /// Restart budget per connectivity incident
    #[must_use]
    pub fn max_ice_restarts(&self) -> u32 {
        self.max_ice_restarts
    }

    /// Deadline for a restart to reach Connected
    #[must_use]
    pub fn restart_timeout(&self) -> Duration {
        self.restart_timeout
    }

    /// Check if a call state transition is valid
    #[must_use]
    pub fn is_valid_transition(from: CallState, to: CallState) -> bool {
        matches!(
            (from, to),
            (CallState::Idle, CallState::Connecting)
                | (CallState::Connecting, CallState::Connected)
                | (CallState::Connecting, CallState::Reconnecting)
                | (CallState::Connecting, CallState::Failed)
                | (CallState::Connected, CallState::Reconnecting)
                | (CallState::Connected, CallState::Failed)
                | (CallState::Reconnecting, CallState::Connected)
                | (CallState::Reconnecting, CallState::Failed)
        ) || (from != CallState::Closed && to == CallState::Closed)
    }

    /// Move the session to `to`, notifying observers
    ///
    /// Returns `false` and leaves the session untouched when the transition
    /// is not in the table (including same-state transitions).
    pub(crate) fn apply(
        &self,
        session: &mut CallSession,
        to: CallState,
        notifier: &SessionNotifier,
    ) -> bool {
        let from = session.state;
        if !Self::is_valid_transition(from, to) {
            if from != to {
                tracing::debug!(
                    call_id = %session.call_id(),
                    old_state = ?from,
                    new_state = ?to,
                    "Ignoring invalid state transition"
                );
            }
            return false;
        }

        session.state = to;
        tracing::debug!(
            call_id = %session.call_id(),
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        notifier.state_changed(from, to);
        true
    }

    /// Mark the session as failed for good
    pub(crate) fn fail(&self, session: &mut CallSession, reason: &str, notifier: &SessionNotifier) {
        if self.apply(session, CallState::Failed, notifier) {
            tracing::warn!(call_id = %session.call_id(), reason, "Call failed");
            notifier.connection_failed(reason);
        }
    }

    /// Give up on a restart that did not reconnect in time
    pub(crate) fn on_restart_timeout(&self, session: &mut CallSession, notifier: &SessionNotifier) {
        if session.state != CallState::Reconnecting {
            return;
        }
        tracing::warn!(
            call_id = %session.call_id(),
            timeout = ?self.restart_timeout,
            "ICE restart did not reconnect in time"
        );
        self.fail(session, "ICE restart timed out", notifier);
    }

    /// React to a raw connection state reported by the primitive
    pub(crate) fn on_connection_state(
        &self,
        session: &mut CallSession,
        raw: PeerConnectionState,
        notifier: &SessionNotifier,
    ) -> SupervisorAction {
        if !session.state.is_active() {
            tracing::trace!(raw = ?raw, state = ?session.state, "Ignoring raw state outside an active call");
            return SupervisorAction::None;
        }

        match raw {
            PeerConnectionState::New | PeerConnectionState::Connecting => SupervisorAction::None,
            PeerConnectionState::Connected => {
                if self.apply(session, CallState::Connected, notifier) && session.restart_attempts > 0
                {
                    tracing::info!(
                        call_id = %session.call_id(),
                        attempts = session.restart_attempts,
                        "Connection recovered"
                    );
                }
                session.restart_attempts = 0;
                SupervisorAction::None
            }
            PeerConnectionState::Disconnected => {
                self.apply(session, CallState::Reconnecting, notifier);
                SupervisorAction::None
            }
            PeerConnectionState::Failed => {
                if session.restart_attempts < self.max_ice_restarts {
                    session.restart_attempts += 1;
                    self.apply(session, CallState::Reconnecting, notifier);
                    tracing::info!(
                        call_id = %session.call_id(),
                        attempt = session.restart_attempts,
                        max = self.max_ice_restarts,
                        "Connection failed, scheduling ICE restart"
                    );
                    SupervisorAction::RestartIce
                } else {
                    self.fail(session, "ICE connection failed", notifier);
                    SupervisorAction::None
                }
            }
            PeerConnectionState::Closed => {
                self.fail(session, "Peer connection closed", notifier);
                SupervisorAction::None
            }
        }
    }
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new(1)
    }
}
