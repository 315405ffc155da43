//! Forwards notifications to customer webhook endpoints.
//!
//! Two inputs reach the forwarder: `POST /v1/webhooks` requests sent by
//! [`NotifyHandler::publish_webhook_event`](crate::notify::NotifyHandler::publish_webhook_event),
//! and events from the subscribe queue. Both carry a JSON resource with a
//! `webhook_uri` (and optionally `webhook_method`); resources without one are
//! ignored. Deliveries are keyed by a content hash so a redelivered
//! notification is not sent twice while it is still remembered.
//!
//! `POST /v1/webhook_destinations` sends a caller-supplied payload to an
//! explicit URI and reports the delivery outcome in its status.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use quick_cache::sync::{Cache, GuardResult};
use relaybus_core::{Event, RequestMethod, CONTENT_TYPE_JSON};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notify::WEBHOOK_SEND_URI;

/// Request URI that delivers to an explicit destination.
pub const WEBHOOK_DESTINATION_URI: &str = "/v1/webhook_destinations";
use crate::service::router::{HandlerError, RouteTableBuilder};
use crate::subscribe::EventRouterBuilder;
use crate::webhook::{HttpSend, ReqwestSender, WebhookClient, WebhookError, WebhookJob};

/// Number of recent delivery hashes remembered for de-duplication.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Body of `POST /v1/webhooks`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookMessage {
    pub customer_id: Uuid,
    #[serde(default)]
    pub data_type: String,
    pub data: WebhookData,
}

/// The `{type, data}` document delivered to the customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookData {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// Body of `POST /v1/webhook_destinations`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookDestination {
    pub customer_id: Uuid,
    pub uri: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub data_type: String,
    /// Sent as its JSON encoding.
    #[serde(default)]
    pub data: Value,
}

/// Outcome of one forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered(u16),
    Duplicate,
    NoDestination,
}

/// Resolves destinations and hands jobs to the [`WebhookClient`].
pub struct WebhookForwarder<S = ReqwestSender> {
    client: WebhookClient<S>,
    recent: Cache<[u8; 32], ()>,
}

impl<S: HttpSend + 'static> WebhookForwarder<S> {
    #[must_use]
    pub fn new(client: WebhookClient<S>, dedup_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            client,
            recent: Cache::new(dedup_capacity.max(1)),
        })
    }

    /// Delivers `{type, data}` to the `webhook_uri` named in `data`.
    ///
    /// # Errors
    ///
    /// Returns the delivery error once retries are exhausted.
    pub async fn forward(&self, message: &WebhookData) -> Result<Forwarded, WebhookError> {
        let Some(uri) = message.data.get("webhook_uri").and_then(Value::as_str) else {
            return Ok(Forwarded::NoDestination);
        };
        if uri.is_empty() {
            return Ok(Forwarded::NoDestination);
        }
        let method = message
            .data
            .get("webhook_method")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or("POST");
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| WebhookError::InvalidRequest(e.to_string()))?;
        let body = serde_json::to_vec(message)
            .map_err(|e| WebhookError::InvalidRequest(e.to_string()))?;

        let key = dedup_key(uri, &method, &body);
        if !self.claim(key) {
            debug!(uri, event_type = %message.event_type, "duplicate webhook skipped");
            return Ok(Forwarded::Duplicate);
        }

        let job = WebhookJob::new(method, uri).with_payload(CONTENT_TYPE_JSON, Bytes::from(body));
        match self.client.deliver(&job).await {
            Ok(response) => {
                info!(uri, event_type = %message.event_type, status = response.status, "webhook sent");
                Ok(Forwarded::Delivered(response.status))
            }
            Err(e) => {
                self.recent.remove(&key);
                Err(e)
            }
        }
    }

    /// Records `key` unless it is already present. Check and insert happen
    /// under one cache guard, so concurrent duplicates claim it only once.
    fn claim(&self, key: [u8; 32]) -> bool {
        match self.recent.get_value_or_guard(&key, Some(Duration::ZERO)) {
            GuardResult::Guard(guard) => {
                let _ = guard.insert(());
                true
            }
            GuardResult::Value(()) | GuardResult::Timeout => false,
        }
    }

    /// Sends `destination.data` to `destination.uri` without de-duplication.
    ///
    /// # Errors
    ///
    /// `WebhookError::InvalidRequest` for an empty URI or unknown method, or
    /// the delivery error once retries are exhausted.
    pub async fn send_to_uri(&self, destination: &WebhookDestination) -> Result<u16, WebhookError> {
        if destination.uri.trim().is_empty() {
            return Err(WebhookError::InvalidRequest("destination uri is empty".to_string()));
        }
        let method = if destination.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(destination.method.to_ascii_uppercase().as_bytes())
                .map_err(|e| WebhookError::InvalidRequest(e.to_string()))?
        };
        let body = serde_json::to_vec(&destination.data)
            .map_err(|e| WebhookError::InvalidRequest(e.to_string()))?;
        let job = WebhookJob::new(method, destination.uri.as_str())
            .with_payload(destination.data_type.as_str(), Bytes::from(body));
        let response = self.client.deliver(&job).await?;
        info!(
            customer_id = %destination.customer_id,
            uri = %destination.uri,
            status = response.status,
            "webhook sent to destination"
        );
        Ok(response.status)
    }

    /// Forwards a JSON event from the subscribe queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not JSON or delivery fails.
    pub async fn forward_event(&self, event: &Event) -> anyhow::Result<Forwarded> {
        let data: Value = event.decode_json()?;
        let message = WebhookData {
            event_type: event.event_type.clone(),
            data,
        };
        Ok(self.forward(&message).await?)
    }

    /// Adds `POST /v1/webhooks` and `POST /v1/webhook_destinations` to
    /// `builder`.
    ///
    /// `/v1/webhooks` logs delivery failures and still succeeds.
    /// `/v1/webhook_destinations` answers 400 for a malformed destination and
    /// 500 when delivery fails.
    #[must_use]
    pub fn register(self: &Arc<Self>, builder: RouteTableBuilder) -> RouteTableBuilder {
        let forwarder = Arc::clone(self);
        let destinations = Arc::clone(self);
        let pattern = format!("^{WEBHOOK_SEND_URI}$");
        let destination_pattern = format!("^{WEBHOOK_DESTINATION_URI}$");
        builder
            .json(
                "webhooks",
                RequestMethod::Post,
                &pattern,
                move |_, _, message: WebhookMessage| {
                    let forwarder = Arc::clone(&forwarder);
                    async move {
                        match forwarder.forward(&message.data).await {
                            Ok(outcome) => debug!(customer_id = %message.customer_id, ?outcome, "webhook request handled"),
                            Err(e) => warn!(customer_id = %message.customer_id, error = %e, "webhook delivery failed"),
                        }
                        Ok::<_, HandlerError>(serde_json::json!({}))
                    }
                },
            )
            .json(
                "webhook_destinations",
                RequestMethod::Post,
                &destination_pattern,
                move |_, _, destination: WebhookDestination| {
                    let forwarder = Arc::clone(&destinations);
                    async move {
                        match forwarder.send_to_uri(&destination).await {
                            Ok(_) => Ok(serde_json::json!({})),
                            Err(WebhookError::InvalidRequest(reason)) => Err(HandlerError::bad_request(reason)),
                            Err(e) => {
                                warn!(customer_id = %destination.customer_id, uri = %destination.uri, error = %e, "webhook delivery failed");
                                Err(HandlerError::internal(e.to_string()))
                            }
                    }
                }
            },
        )
    }

    /// Subscribes the forwarder to `event_type`.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, builder: EventRouterBuilder, event_type: &str) -> EventRouterBuilder {
        let forwarder = Arc::clone(self);
        builder.on_type(event_type, move |event| {
            let forwarder = Arc::clone(&forwarder);
            async move {
                forwarder.forward_event(&event).await?;
                Ok::<_, anyhow::Error>(())
            }
        })
    }
}

fn dedup_key(uri: &str, method: &Method, body: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(uri.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relaybus_core::Request;

    use super::*;
    use crate::service::router::{Inbound, RouteTable};
    use crate::webhook::{WebhookConfig, WebhookResponse};

    #[derive(Default)]
    struct Recorder {
        fail: bool,
        calls: AtomicU32,
        jobs: Mutex<Vec<WebhookJob>>,
    }

    #[async_trait]
    impl HttpSend for Arc<Recorder> {
        async fn send(&self, job: &WebhookJob, _timeout: Duration) -> Result<WebhookResponse, WebhookError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(WebhookError::Connect("refused".to_string()));
            }
            self.jobs.lock().push(job.clone());
            Ok(WebhookResponse {
                status: 204,
                body: Bytes::new(),
            })
        }
    }

    fn forwarder(recorder: &Arc<Recorder>) -> Arc<WebhookForwarder<Arc<Recorder>>> {
        let config = WebhookConfig {
            retry_pause: Duration::from_millis(1),
            ..WebhookConfig::default()
        };
        WebhookForwarder::new(WebhookClient::with_sender(Arc::clone(recorder), config), 16)
    }

    fn hangup(uri: &str) -> WebhookData {
        WebhookData {
            event_type: "call_hangup".to_string(),
            data: serde_json::json!({"id": "c1", "webhook_uri": uri, "webhook_method": "put"}),
        }
    }

    #[tokio::test]
    async fn delivers_type_and_data_to_resource_uri() {
        let recorder = Arc::new(Recorder::default());
        let outcome = forwarder(&recorder).forward(&hangup("https://hooks.test/a")).await.unwrap();
        assert_eq!(outcome, Forwarded::Delivered(204));

        let jobs = recorder.jobs.lock();
        assert_eq!(jobs[0].method, Method::PUT);
        assert_eq!(jobs[0].uri, "https://hooks.test/a");
        assert_eq!(jobs[0].content_type(), Some(CONTENT_TYPE_JSON));
        let sent: WebhookData = serde_json::from_slice(jobs[0].payload.as_ref().unwrap()).unwrap();
        assert_eq!(sent, hangup("https://hooks.test/a"));
    }

    #[tokio::test]
    async fn duplicates_are_skipped() {
        let recorder = Arc::new(Recorder::default());
        let forwarder = forwarder(&recorder);
        forwarder.forward(&hangup("https://hooks.test/a")).await.unwrap();
        assert_eq!(
            forwarder.forward(&hangup("https://hooks.test/a")).await.unwrap(),
            Forwarded::Duplicate
        );
        forwarder.forward(&hangup("https://hooks.test/b")).await.unwrap();
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_delivery_can_be_retried_later() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let forwarder = forwarder(&recorder);
        assert!(forwarder.forward(&hangup("https://hooks.test/a")).await.is_err());
        assert!(forwarder.forward(&hangup("https://hooks.test/a")).await.is_err());
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn resource_without_uri_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        let message = WebhookData {
            event_type: "call_created".to_string(),
            data: serde_json::json!({"id": "c1"}),
        };
        assert_eq!(
            forwarder(&recorder).forward(&message).await.unwrap(),
            Forwarded::NoDestination
        );
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn webhooks_route_accepts_notify_body() {
        let recorder = Arc::new(Recorder::default());
        let table = forwarder(&recorder)
            .register(RouteTable::builder("webhook-manager"))
            .build()
            .unwrap();

        let body = serde_json::json!({
            "customer_id": Uuid::new_v4(),
            "data_type": CONTENT_TYPE_JSON,
            "data": {"type": "transfer_created", "data": {"id": "t1", "webhook_uri": "https://hooks.test/t"}},
        });
        let request = Request::json(RequestMethod::Post, WEBHOOK_SEND_URI, &body).unwrap();
        let response = table.dispatch(Inbound::from(request)).await.response;
        assert_eq!(response.status_code, 200);
        assert_eq!(recorder.jobs.lock()[0].uri, "https://hooks.test/t");
    }

    #[tokio::test]
    async fn destination_route_delivers_payload_as_given() {
        let recorder = Arc::new(Recorder::default());
        let table = forwarder(&recorder)
            .register(RouteTable::builder("webhook-manager"))
            .build()
            .unwrap();

        let body = serde_json::json!({
            "customer_id": Uuid::new_v4(),
            "uri": "https://hooks.test/d",
            "method": "PUT",
            "data_type": CONTENT_TYPE_JSON,
            "data": "test webhook.",
        });
        let request = Request::json(RequestMethod::Post, WEBHOOK_DESTINATION_URI, &body).unwrap();
        let response = table.dispatch(Inbound::from(request.clone())).await.response;
        assert_eq!(response.status_code, 200);

        // Destinations are not de-duplicated.
        table.dispatch(Inbound::from(request)).await;
        let jobs = recorder.jobs.lock();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].method, Method::PUT);
        assert_eq!(jobs[0].uri, "https://hooks.test/d");
        assert_eq!(jobs[0].payload.as_deref(), Some(&b"\"test webhook.\""[..]));
    }

    #[tokio::test]
    async fn destination_route_reports_bad_input_and_failure() {
        let recorder = Arc::new(Recorder::default());
        let table = forwarder(&recorder)
            .register(RouteTable::builder("webhook-manager"))
            .build()
            .unwrap();
        let send = |body: serde_json::Value| {
            let table = table.clone();
            async move {
                let request = Request::json(RequestMethod::Post, WEBHOOK_DESTINATION_URI, &body).unwrap();
                table.dispatch(Inbound::from(request)).await.response.status_code
            }
        };

        let no_uri = serde_json::json!({"customer_id": Uuid::new_v4(), "uri": "", "data": {}});
        assert_eq!(send(no_uri).await, 400);
        let bad_json = Request::with_data(
            RequestMethod::Post,
            WEBHOOK_DESTINATION_URI,
            CONTENT_TYPE_JSON,
            b"invalid json".to_vec(),
        );
        assert_eq!(table.dispatch(Inbound::from(bad_json)).await.response.status_code, 400);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);

        let failing = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let table = forwarder(&failing)
            .register(RouteTable::builder("webhook-manager"))
            .build()
            .unwrap();
        let body = serde_json::json!({"customer_id": Uuid::new_v4(), "uri": "https://hooks.test/d", "data": "x"});
        let request = Request::json(RequestMethod::Post, WEBHOOK_DESTINATION_URI, &body).unwrap();
        assert_eq!(table.dispatch(Inbound::from(request)).await.response.status_code, 500);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_are_delivered_once() {
        let recorder = Arc::new(Recorder::default());
        let forwarder = forwarder(&recorder);
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let forwarder = Arc::clone(&forwarder);
                tokio::spawn(async move { forwarder.forward(&hangup("https://hooks.test/a")).await })
            })
            .collect();
        let mut delivered = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() == Forwarded::Delivered(204) {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn forwards_json_events() {
        let recorder = Arc::new(Recorder::default());
        let event = Event::json(
            "call_hangup",
            "call-manager",
            &serde_json::json!({"webhook_uri": "https://hooks.test/e"}),
        )
        .unwrap();
        assert_eq!(
            forwarder(&recorder).forward_event(&event).await.unwrap(),
            Forwarded::Delivered(204)
        );
        assert_eq!(recorder.jobs.lock()[0].method, Method::POST);
    }
}
