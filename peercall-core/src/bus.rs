//! Signal bus
//!
//! The relay signaling messages travel over before a direct media path
//! exists. Delivery is per recipient, ordered, and at least once: a
//! subscriber first receives every stored message addressed to it, then live
//! ones. Consumers must tolerate duplicates.

use crate::identity::UserId;
use crate::signaling::SignalMessage;
use crate::types::CallId;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Maximum serialized signal size (64KB)
const MAX_SIGNAL_SIZE: usize = 64 * 1024;

/// Signal bus errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Publishing failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Subscription failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Removing call data failed
    #[error("Clear failed: {0}")]
    ClearFailed(String),

    /// Message exceeds the size limit
    #[error("Signal too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Ordered stream of messages for one recipient
pub type SignalStream = BoxStream<'static, SignalMessage>;

/// Signal bus trait
///
/// Implement this for your relay (database listener, websocket relay, ...).
/// Storage is keyed by [`CallId`]; a session only appends its own messages
/// and removes its own call's data on close.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Publish a message under `call_id`
    async fn publish(&self, call_id: &CallId, message: SignalMessage) -> Result<(), BusError>;

    /// Subscribe to messages addressed to `recipient`
    async fn subscribe(&self, recipient: &UserId) -> Result<SignalStream, BusError>;

    /// Remove everything stored for `call_id`
    async fn clear(&self, call_id: &CallId) -> Result<(), BusError>;
}

#[derive(Default)]
struct BusInner {
    log: Vec<SignalMessage>,
    subscribers: Vec<(UserId, mpsc::UnboundedSender<SignalMessage>)>,
}

/// In-process signal bus
///
/// Stores messages per call until cleared and replays them to new
/// subscribers, the way a database-backed relay does.
#[derive(Clone, Default)]
pub struct MemorySignalBus {
    inner: Arc<Mutex<BusInner>>,
}

impl MemorySignalBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently stored for a call
    #[must_use]
    pub fn stored(&self, call_id: &CallId) -> Vec<SignalMessage> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|m| &m.call_id == call_id)
            .cloned()
            .collect()
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|(_, tx)| !tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl SignalBus for MemorySignalBus {
    #[tracing::instrument(skip(self, message), fields(call_id = %call_id, kind = %message.kind, to = %message.to))]
    async fn publish(&self, call_id: &CallId, message: SignalMessage) -> Result<(), BusError> {
        if &message.call_id != call_id {
            return Err(BusError::PublishFailed(format!(
                "message for {} published under {}",
                message.call_id, call_id
            )));
        }

        let size = serde_json::to_vec(&message)
            .map_err(|e| BusError::PublishFailed(e.to_string()))?
            .len();
        if size > MAX_SIGNAL_SIZE {
            return Err(BusError::MessageTooLarge(size));
        }

        let mut inner = self.inner.lock();
        inner.log.push(message.clone());
        inner.subscribers.retain(|(recipient, tx)| {
            if recipient == &message.to {
                tx.send(message.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
        tracing::trace!("Signal stored and delivered");
        Ok(())
    }

    async fn subscribe(&self, recipient: &UserId) -> Result<SignalStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let mut replayed = 0usize;
        for message in inner.log.iter().filter(|m| &m.to == recipient) {
            if tx.send(message.clone()).is_ok() {
                replayed += 1;
            }
        }
        inner.subscribers.push((recipient.clone(), tx));
        tracing::debug!(recipient = %recipient, replayed, "Subscribed to signal bus");
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn clear(&self, call_id: &CallId) -> Result<(), BusError> {
        let mut inner = self.inner.lock();
        let before = inner.log.len();
        inner.log.retain(|m| &m.call_id != call_id);
        tracing::debug!(call_id = %call_id, removed = before - inner.log.len(), "Cleared call signals");
        Ok(())
    }
}
