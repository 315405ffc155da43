//! Transport adapter types: envelopes, destinations, declarations, deliveries.
//!
//! The [`Transport`](crate::traits::Transport) trait is the only seam between
//! the framework and a broker. [`memory::MemoryBroker`] is the bundled
//! implementation.

pub mod memory;

use std::fmt;

use bytes::Bytes;

pub use memory::MemoryBroker;

/// Default number of unacknowledged deliveries per consumer.
pub const DEFAULT_PREFETCH: u16 = 10;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Broker-level message properties, carried alongside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Token matching a response to its request.
    pub correlation_id: Option<String>,
    /// Queue the receiver should publish its reply to.
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// Hold time for delayed exchanges, in milliseconds.
    pub delay_ms: Option<u64>,
    pub message_id: Option<String>,
}

/// A message as published to or delivered from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub body: Bytes,
    pub properties: MessageProperties,
}

impl Envelope {
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: MessageProperties::default(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    #[must_use]
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.properties.delay_ms = Some(delay_ms);
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }
}

/// Where a message is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Directly to a named queue (default exchange).
    Queue(String),
    /// To an exchange, routed by `routing_key` according to its kind.
    Exchange { name: String, routing_key: String },
}

impl Destination {
    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    #[must_use]
    pub fn exchange(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Destination::Exchange {
            name: name.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue:{name}"),
            Destination::Exchange { name, routing_key } => {
                write!(f, "exchange:{name}/{routing_key}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// Only one consumer may attach.
    pub exclusive: bool,
    /// Removed once its last consumer stops.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared queue that outlives its consumers.
    #[must_use]
    pub fn normal() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private queue owned by a single consumer, e.g. an RPC reply queue.
    #[must_use]
    pub fn volatile() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::normal()
    }
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Every bound queue receives a copy.
    Fanout,
    /// Queues bound with a matching routing key receive a copy.
    Direct,
    /// Holds each message for its `delay_ms`, then routes like `Direct`.
    Delayed,
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Maximum unsettled deliveries in flight.
    pub prefetch: u16,
    /// Settle deliveries on receipt instead of waiting for `ack`.
    pub auto_ack: bool,
}

impl ConsumeOptions {
    #[must_use]
    pub fn new(consumer_tag: impl Into<String>) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            prefetch: DEFAULT_PREFETCH,
            auto_ack: false,
        }
    }

    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject { requeue: bool },
}

/// Backend hook that applies a settlement to the broker.
pub trait Settle: Send + 'static {
    fn settle(self: Box<Self>, settlement: Settlement);
}

/// A message handed to a consumer.
///
/// Dropping a delivery without settling it requeues the message, matching
/// what a broker does when a channel closes with unacknowledged messages.
pub struct Delivery {
    pub envelope: Envelope,
    /// `true` when this message was delivered before and requeued.
    pub redelivered: bool,
    settle: Option<Box<dyn Settle>>,
}

impl Delivery {
    #[must_use]
    pub fn new(envelope: Envelope, redelivered: bool, settle: Box<dyn Settle>) -> Self {
        Self {
            envelope,
            redelivered,
            settle: Some(settle),
        }
    }

    /// A delivery that is already settled (auto-ack consumers).
    #[must_use]
    pub fn settled(envelope: Envelope, redelivered: bool) -> Self {
        Self {
            envelope,
            redelivered,
            settle: None,
        }
    }

    /// Acknowledge successful processing.
    pub fn ack(mut self) {
        if let Some(settle) = self.settle.take() {
            settle.settle(Settlement::Ack);
        }
    }

    /// Reject the message, optionally putting it back on the queue.
    pub fn reject(mut self, requeue: bool) {
        if let Some(settle) = self.settle.take() {
            settle.settle(Settlement::Reject { requeue });
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.settle.is_none())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle.settle(Settlement::Reject { requeue: true });
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("declaration of {name} conflicts with existing: {reason}")]
    Mismatch { name: String, reason: String },
    #[error("queue {0} is exclusive to another consumer")]
    Exclusive(String),
    #[error("queue {0} was deleted")]
    QueueDeleted(String),
    #[error("broker connection closed")]
    ConnectionClosed,
}
