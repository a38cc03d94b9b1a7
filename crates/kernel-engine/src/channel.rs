//! Namespaced message channel between the engine and its host.
//!
//! A `Transport` moves `Envelope`s (namespace tag + JSON payload) over some
//! substrate: an in-process queue pair, or framed bytes on a socket (see
//! `connection`). An `Endpoint` pairs the outbound transport with the stream
//! of inbound envelopes and is opened per namespace into a sender/receiver.

use std::sync::Arc;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One message on the wire, tagged with the logical channel it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// Transport failure. Fatal to the channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("message encoding error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of a transport.
pub trait Transport: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), ChannelError>;
}

/// Transport backed by an unbounded queue. The consumer (a peer endpoint or
/// a writer task) drains the other end.
#[derive(Debug, Clone)]
pub struct QueueTransport {
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl QueueTransport {
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { outbound }
    }
}

impl Transport for QueueTransport {
    fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.outbound
            .send(envelope)
            .map_err(|_| ChannelError::Closed)
    }
}

/// One side of a connection: where to send, and what has arrived.
pub struct Endpoint {
    transport: Arc<dyn Transport>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl Endpoint {
    pub fn new(transport: Arc<dyn Transport>, inbound: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { transport, inbound }
    }

    /// Bind this endpoint to a namespace.
    pub fn open(self, namespace: &str) -> (ChannelSender, ChannelReceiver) {
        let sender = ChannelSender {
            namespace: Arc::from(namespace),
            transport: self.transport,
        };
        let receiver = ChannelReceiver {
            namespace: Arc::from(namespace),
            inbound: self.inbound,
        };
        (sender, receiver)
    }
}

/// Two endpoints wired back to back in memory.
pub fn memory_pair() -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = Endpoint::new(Arc::new(QueueTransport::new(b_tx)), a_rx);
    let b = Endpoint::new(Arc::new(QueueTransport::new(a_tx)), b_rx);
    (a, b)
}

/// Sends messages tagged with this channel's namespace.
#[derive(Clone)]
pub struct ChannelSender {
    namespace: Arc<str>,
    transport: Arc<dyn Transport>,
}

impl ChannelSender {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), ChannelError> {
        let payload = serde_json::to_value(message)?;
        debug!("[channel] {} send: {}", self.namespace, payload);
        self.transport
            .send(Envelope::new(self.namespace.as_ref(), payload))
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

/// Yields inbound payloads tagged for this channel's namespace.
pub struct ChannelReceiver {
    namespace: Arc<str>,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelReceiver {
    /// Next payload for this namespace. `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        while let Some(envelope) = self.inbound.recv().await {
            if envelope.channel != *self.namespace {
                trace!(
                    "[channel] {} skipping message for {}",
                    self.namespace,
                    envelope.channel
                );
                continue;
            }
            debug!("[channel] {} recv: {}", self.namespace, envelope.payload);
            return Some(envelope.payload);
        }
        None
    }

    /// Next payload that has already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<serde_json::Value> {
        while let Ok(envelope) = self.inbound.try_recv() {
            if envelope.channel == *self.namespace {
                return Some(envelope.payload);
            }
        }
        None
    }
}
