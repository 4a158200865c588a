//! Publish/subscribe message bus.
//!
//! The agent only needs three things from its transport: fire-and-forget
//! publish, per-subject subscriptions, and request/reply with a timeout.
//! [`MessageBus`] captures that; [`LocalBus`] is an in-process
//! implementation used by tests and by single-host setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("request on '{0}' timed out")]
    Timeout(String),

    #[error(transparent)]
    Message(#[from] dea_messages::MessageError),
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    /// Inbox to answer on, if the sender expects a reply.
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Stream of messages for one subject.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Bus capability consumed by the agent.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish without waiting. Safe to call while holding instance locks.
    fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<(), BusError>;

    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Publish with a private inbox and wait for the first reply.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, BusError>;

    fn close(&self);
}

/// In-process bus with exact subject matching.
#[derive(Debug, Default)]
pub struct LocalBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
    next_inbox: AtomicU64,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_inbox(&self) -> String {
        let n = self.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("_INBOX.{n}")
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let message = BusMessage {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        };

        let mut subscribers = self.subscribers.write();
        if let Some(senders) = subscribers.get_mut(subject) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
            trace!(subject, receivers = senders.len(), "Published");
            if senders.is_empty() {
                subscribers.remove(subject);
            }
        }
        Ok(())
    }

    fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription {
            subject: subject.to_string(),
            rx,
        })
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        let inbox = self.new_inbox();
        let mut replies = self.subscribe(&inbox)?;
        self.publish(subject, Some(&inbox), payload)?;

        let reply = tokio::time::timeout(timeout, replies.next()).await;
        self.subscribers.write().remove(&inbox);
        reply
            .map_err(|_| BusError::Timeout(subject.to_string()))?
            .ok_or(BusError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders ends every subscription stream.
        self.subscribers.write().clear();
    }
}
