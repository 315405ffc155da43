//! Notify publisher: one-way domain events on the service's fanout exchange.
//!
//! Publishing returns once the transport accepted the message. Nothing is
//! buffered or replayed; a failed publish is reported to the caller and lost.

use std::sync::Arc;

use relaybus_core::{encode, Event, Request, RequestMethod, WireError, CONTENT_TYPE_JSON};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::listen::CONTENT_TYPE_MSGPACK;
use crate::metrics::{MetricsRegistry, EVENT_PUBLISH_TOTAL};
use crate::service::config::NodeConfig;
use crate::traits::Transport;
use crate::transport::{Destination, Envelope, ExchangeKind, TransportError};

/// URI on the webhook service that accepts customer notifications.
pub const WEBHOOK_SEND_URI: &str = "/v1/webhooks";

/// Errors returned by [`NotifyHandler`].
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Body posted to the webhook service for every customer-facing event.
#[derive(Debug, Serialize)]
struct WebhookMessage<'a, T: Serialize> {
    customer_id: Uuid,
    data_type: &'a str,
    data: WebhookData<'a, T>,
}

#[derive(Debug, Serialize)]
struct WebhookData<'a, T: Serialize> {
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a T,
}

/// Publishes events to `<ns>.<svc>.event`.
pub struct NotifyHandler {
    transport: Arc<dyn Transport>,
    publisher: String,
    exchange: String,
    webhook_queue: String,
    metrics: Arc<MetricsRegistry>,
}

impl NotifyHandler {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &NodeConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let namespace = config.namespace();
        Self {
            transport,
            publisher: config.service_name.clone(),
            exchange: namespace.event_exchange(&config.service_name),
            webhook_queue: namespace.request_queue(&config.webhook_service),
            metrics,
        }
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declares the event exchange. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the declaration fails.
    pub async fn declare(&self) -> Result<(), TransportError> {
        self.transport
            .declare_exchange(&self.exchange, ExchangeKind::Fanout)
            .await
    }

    /// Publishes one event with a raw payload.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError` if encoding or publishing fails.
    pub async fn publish_event(
        &self,
        event_type: &str,
        data_type: &str,
        data: Vec<u8>,
    ) -> Result<(), NotifyError> {
        let event = Event::new(event_type, self.publisher.clone(), data_type, data);
        let envelope = Envelope::new(encode(&event)?).with_content_type(CONTENT_TYPE_MSGPACK);
        self.transport
            .publish(&Destination::exchange(self.exchange.clone(), ""), envelope)
            .await?;
        self.metrics
            .counter(EVENT_PUBLISH_TOTAL, &[("event_type", event_type)])
            .increment(1);
        debug!(exchange = %self.exchange, event_type, "event published");
        Ok(())
    }

    /// Publishes `body` as a JSON event.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError` if encoding or publishing fails.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        body: &T,
    ) -> Result<(), NotifyError> {
        let data = serde_json::to_vec(body).map_err(WireError::from)?;
        self.publish_event(event_type, CONTENT_TYPE_JSON, data).await
    }

    /// Publishes the event and forwards it to the webhook service for the
    /// owning customer.
    ///
    /// The webhook forward is fire-and-forget: its failures are logged and
    /// do not affect the result.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError` if the event itself cannot be published.
    pub async fn publish_webhook_event<T: Serialize>(
        &self,
        customer_id: Uuid,
        event_type: &str,
        body: &T,
    ) -> Result<(), NotifyError> {
        self.publish_json(event_type, body).await?;

        let message = WebhookMessage {
            customer_id,
            data_type: CONTENT_TYPE_JSON,
            data: WebhookData {
                event_type,
                data: body,
            },
        };
        if let Err(e) = self.forward_webhook(&message).await {
            warn!(%customer_id, event_type, error = %e, "webhook forward failed");
        }
        Ok(())
    }

    async fn forward_webhook<T: Serialize>(
        &self,
        message: &WebhookMessage<'_, T>,
    ) -> Result<(), NotifyError> {
        let request = Request::json(RequestMethod::Post, WEBHOOK_SEND_URI, message)?
            .from_publisher(self.publisher.clone());
        let envelope = Envelope::new(encode(&request)?).with_content_type(CONTENT_TYPE_MSGPACK);
        self.transport
            .publish(&Destination::queue(self.webhook_queue.clone()), envelope)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relaybus_core::{decode, Namespace};
    use tokio::sync::mpsc;

    use super::*;
    use crate::traits::DeliveryHandler;
    use crate::transport::{ConsumeOptions, Delivery, MemoryBroker, QueueOptions};

    struct Forward(mpsc::UnboundedSender<Delivery>);

    #[async_trait::async_trait]
    impl DeliveryHandler for Forward {
        async fn handle(&self, delivery: Delivery) {
            let _ = self.0.send(delivery);
        }
    }

    fn notify(broker: &MemoryBroker, metrics: &Arc<MetricsRegistry>) -> NotifyHandler {
        NotifyHandler::new(
            Arc::new(broker.clone()),
            &NodeConfig::new("relay", "transfer-manager"),
            Arc::clone(metrics),
        )
    }

    async fn consume(broker: &MemoryBroker, queue: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = broker.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            broker
                .consume(&queue, ConsumeOptions::new("test"), Arc::new(Forward(tx)))
                .await
        });
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn each_bound_queue_gets_one_copy() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let notify = notify(&broker, &metrics);
        notify.declare().await.unwrap();
        notify.declare().await.unwrap();

        for q in ["relay.a.subscribe", "relay.b.subscribe"] {
            broker.declare_queue(q, QueueOptions::normal()).await.unwrap();
            broker.bind_queue(q, notify.exchange(), "").await.unwrap();
        }
        let mut a = consume(&broker, "relay.a.subscribe").await;
        let mut b = consume(&broker, "relay.b.subscribe").await;

        notify
            .publish_json("transfer_created", &serde_json::json!({"id": "x"}))
            .await
            .unwrap();

        for rx in [&mut a, &mut b] {
            let delivery = next(rx).await;
            let event: Event = decode(&delivery.envelope.body).unwrap();
            assert_eq!(event.event_type, "transfer_created");
            assert_eq!(event.publisher, "transfer-manager");
            assert_eq!(event.data_type, CONTENT_TYPE_JSON);
            delivery.ack();
        }
        assert!(tokio::time::timeout(Duration::from_millis(50), a.recv()).await.is_err());
        assert!(metrics
            .render()
            .contains("event_type=\"transfer_created\""));
    }

    #[tokio::test]
    async fn publish_before_declare_fails() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let err = notify(&broker, &metrics)
            .publish_event("x", "", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NotifyError::Transport(TransportError::ExchangeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn webhook_event_is_forwarded() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let notify = notify(&broker, &metrics);
        notify.declare().await.unwrap();
        broker
            .declare_queue("relay.webhook-manager.request", QueueOptions::normal())
            .await
            .unwrap();
        let mut webhooks = consume(&broker, "relay.webhook-manager.request").await;

        let customer = Uuid::new_v4();
        notify
            .publish_webhook_event(customer, "transfer_created", &serde_json::json!({"id": 1}))
            .await
            .unwrap();

        let delivery = next(&mut webhooks).await;
        let request: Request = decode(&delivery.envelope.body).unwrap();
        assert_eq!(request.method, RequestMethod::Post);
        assert_eq!(request.uri, WEBHOOK_SEND_URI);
        let body: serde_json::Value = request.decode_json().unwrap();
        assert_eq!(body["customer_id"], customer.to_string());
        assert_eq!(body["data"]["type"], "transfer_created");
        assert_eq!(body["data"]["data"]["id"], 1);
        delivery.ack();
    }

    #[tokio::test]
    async fn missing_webhook_service_does_not_fail_publish() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let notify = notify(&broker, &metrics);
        notify.declare().await.unwrap();
        notify
            .publish_webhook_event(Uuid::new_v4(), "transfer_created", &1)
            .await
            .unwrap();
    }
}
