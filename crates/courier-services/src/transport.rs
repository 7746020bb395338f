//! Transport: the publish/subscribe collaborator Courier runs on.
//!
//! Courier does not own connection lifecycle. A `Transport` connects to a
//! broker, subscribes to topic patterns, publishes bytes, and reports
//! inbound traffic as `TransportEvent`s on a channel. Per-topic ordering is
//! whatever the transport provides; Courier adds none of its own.
//!
//! `MemoryBroker` is an in-process broker with MQTT wildcard routing. It is
//! what the test suites run against.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::topic;

/// Inbound traffic from the broker.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection was (re-)established. Subscriptions must be renewed.
    Connected,
    /// A publish matching one of our subscriptions.
    Message { topic: String, payload: Bytes },
}

/// Receiving half handed out by [`Transport::connect`].
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// The capability Courier needs from a pub/sub client.
pub trait Transport: Send + Sync {
    /// Connect to `host:port`. Events for this connection arrive on the
    /// returned receiver, starting with `Connected`.
    fn connect(&self, host: &str, port: u16) -> Result<EventReceiver, TransportError>;

    /// Subscribe to a topic pattern. Subscribing twice is a no-op.
    fn subscribe(&self, pattern: &str) -> Result<(), TransportError>;

    /// Publish bytes to a concrete topic. Fire-and-forget.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connection to {host}:{port} failed: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
}

// ── In-memory broker ──────────────────────────────────────────────────────────

struct Subscriber {
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct BrokerInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    published: Mutex<Vec<(String, Bytes)>>,
}

/// In-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, unconnected client handle on this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(false),
        }
    }

    /// Every publish seen so far, in order.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads published to exactly `topic`, in order.
    pub fn published_on(&self, topic: &str) -> Vec<Bytes> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    /// Patterns currently subscribed by any client.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .subscribers
            .iter()
            .flat_map(|entry| entry.value().patterns.clone())
            .collect()
    }

    /// Simulate a broker restart: every client sees `Connected` again.
    pub fn reconnect_all(&self) {
        for entry in self.inner.subscribers.iter() {
            let _ = entry.value().tx.send(TransportEvent::Connected);
        }
    }

    /// Forget every subscription, as a broker without persistent sessions
    /// does when it restarts. Pair with [`MemoryBroker::reconnect_all`].
    pub fn drop_subscriptions(&self) {
        for mut entry in self.inner.subscribers.iter_mut() {
            entry.value_mut().patterns.clear();
        }
    }

    fn route(&self, topic: &str, payload: &Bytes) -> usize {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), payload.clone()));

        let mut delivered = 0;
        for entry in self.inner.subscribers.iter() {
            let sub = entry.value();
            if sub.patterns.iter().any(|p| topic::matches(p, topic)) {
                let event = TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                if sub.tx.send(event).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// One client connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    id: u64,
    connected: AtomicBool,
}

impl MemoryTransport {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, host: &str, port: u16) -> Result<EventReceiver, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connected);
        self.broker.inner.subscribers.insert(
            self.id,
            Subscriber {
                patterns: Vec::new(),
                tx,
            },
        );
        self.connected.store(true, Ordering::Release);
        tracing::debug!(host, port, client = self.id, "memory transport connected");
        Ok(rx)
    }

    fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mut sub = self
            .broker
            .inner
            .subscribers
            .get_mut(&self.id)
            .ok_or(TransportError::NotConnected)?;
        if !sub.patterns.iter().any(|p| p == pattern) {
            sub.patterns.push(pattern.to_string());
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let delivered = self.broker.route(topic, &payload);
        tracing::trace!(topic, bytes = payload.len(), delivered, "memory publish");
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.broker.inner.subscribers.remove(&self.id);
    }
}
