//! Call notifications
//!
//! Observers either subscribe to the [`CallEvent`] broadcast or register
//! plain callbacks. Both are fed from the session tasks through one
//! [`SessionNotifier`] per session.

use crate::types::{CallEvent, CallId, CallState, RemoteStream};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Callback invoked on every logical state transition
pub type StateHandler = Arc<dyn Fn(&CallId, CallState) + Send + Sync>;

/// Callback invoked on every remote track attachment
pub type RemoteStreamHandler = Arc<dyn Fn(&CallId, &RemoteStream) + Send + Sync>;

/// Fan-out point shared by all sessions of a manager
pub(crate) struct EventHub {
    sender: broadcast::Sender<CallEvent>,
    state_handlers: RwLock<Vec<StateHandler>>,
    stream_handlers: RwLock<Vec<RemoteStreamHandler>>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            state_handlers: RwLock::new(Vec::new()),
            stream_handlers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn on_state_changed(&self, handler: StateHandler) {
        self.state_handlers.write().push(handler);
    }

    pub(crate) fn on_remote_stream(&self, handler: RemoteStreamHandler) {
        self.stream_handlers.write().push(handler);
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        let _ = self.sender.send(event);
    }

    fn state_changed(&self, call_id: &CallId, from: CallState, to: CallState) {
        // Handlers run outside the lock so they may register further handlers
        let handlers = self.state_handlers.read().clone();
        for handler in &handlers {
            handler(call_id, to);
        }
        self.emit(CallEvent::StateChanged {
            call_id: call_id.clone(),
            from,
            to,
        });
    }

    fn remote_stream(&self, call_id: &CallId, stream: &RemoteStream) {
        let handlers = self.stream_handlers.read().clone();
        for handler in &handlers {
            handler(call_id, stream);
        }
        self.emit(CallEvent::RemoteStream {
            call_id: call_id.clone(),
            stream: stream.clone(),
        });
    }
}

/// Notification side of one session
pub(crate) struct SessionNotifier {
    call_id: CallId,
    hub: Arc<EventHub>,
    state_tx: watch::Sender<CallState>,
}

impl SessionNotifier {
    pub(crate) fn new(
        call_id: CallId,
        hub: Arc<EventHub>,
        state_tx: watch::Sender<CallState>,
    ) -> Self {
        Self {
            call_id,
            hub,
            state_tx,
        }
    }

    pub(crate) fn state_changed(&self, from: CallState, to: CallState) {
        let _ = self.state_tx.send_replace(to);
        self.hub.state_changed(&self.call_id, from, to);
    }

    pub(crate) fn remote_stream(&self, stream: &RemoteStream) {
        self.hub.remote_stream(&self.call_id, stream);
    }

    pub(crate) fn connection_failed(&self, reason: &str) {
        self.hub.emit(CallEvent::ConnectionFailed {
            call_id: self.call_id.clone(),
            reason: reason.to_string(),
        });
    }
}
