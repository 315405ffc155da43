use std::sync::Arc;

use async_trait::async_trait;

use crate::transport::{
    ConsumeOptions, Delivery, Destination, Envelope, ExchangeKind, QueueOptions, TransportError,
};

/// Pluggable message-broker backend.
/// Implementations: in-memory broker (single process, tests); AMQP brokers
/// plug in behind the same contract.
///
/// Guarantees at-least-once delivery per broker semantics and no ordering
/// across different queues. Connection retry is the caller's concern: a lost
/// connection surfaces as an error from [`Transport::consume`] and callers
/// restart consumption.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declare a queue. Declaring an existing queue with the same options is a no-op.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), TransportError>;

    /// Declare an exchange. Declaring an existing exchange of the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError>;

    /// Bind a queue to an exchange under a routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish one message to a queue or an exchange.
    async fn publish(&self, destination: &Destination, envelope: Envelope)
        -> Result<(), TransportError>;

    /// Consume a queue, handing each delivery to `handler`.
    ///
    /// Runs until the transport fails; it only returns on error. Up to
    /// `options.prefetch` deliveries may be unsettled at once.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError>;
}

/// Receives deliveries from [`Transport::consume`].
///
/// Each delivery is handled on its own task; the handler settles it with
/// [`Delivery::ack`] or [`Delivery::reject`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery);
}
