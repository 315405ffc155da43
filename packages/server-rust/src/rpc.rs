//! RPC client: synchronous-looking calls over the broker.
//!
//! Every call gets a random correlation token and registers a slot in the
//! pending-call table before the request is published. The reply consumer
//! resolves the slot when a response with that token arrives on this
//! client's private reply queue; a timeout or a dropped caller removes the
//! slot, so abandoned calls leave nothing behind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use relaybus_core::{decode, encode, Namespace, Request, RequestMethod, Response, WireError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::listen::CONTENT_TYPE_MSGPACK;
use crate::metrics::{MetricsRegistry, REQUEST_PROCESS_TIME};
use crate::service::config::NodeConfig;
use crate::service::consumer::ConsumeLoop;
use crate::service::shutdown::ShutdownController;
use crate::traits::{DeliveryHandler, Transport};
use crate::transport::{
    ConsumeOptions, Delivery, Destination, Envelope, ExchangeKind, QueueOptions, TransportError,
};

/// Errors returned by [`RpcClient`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("no response from {target} within {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    /// Returned by the typed helpers for non-2xx responses.
    #[error("request failed with status {code}")]
    Status { code: u16 },
    #[error("rpc client closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Pending-call table
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PendingCalls {
    calls: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl PendingCalls {
    fn insert(self: &Arc<Self>, token: String) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(token.clone(), tx);
        PendingCall {
            table: Arc::clone(self),
            token,
            rx,
        }
    }

    /// Hands `response` to the waiting caller. Returns `false` for unknown tokens.
    fn resolve(&self, token: &str, response: Response) -> bool {
        match self.calls.lock().remove(token) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

/// A registered call; removes its table entry when dropped.
struct PendingCall {
    table: Arc<PendingCalls>,
    token: String,
    rx: oneshot::Receiver<Response>,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.calls.lock().remove(&self.token);
    }
}

struct ReplyConsumer {
    pending: Arc<PendingCalls>,
}

#[async_trait]
impl DeliveryHandler for ReplyConsumer {
    async fn handle(&self, delivery: Delivery) {
        let Some(token) = delivery.envelope.properties.correlation_id.as_deref() else {
            warn!("reply without correlation id dropped");
            return;
        };
        match decode::<Response>(&delivery.envelope.body) {
            Ok(response) => {
                if !self.pending.resolve(token, response) {
                    debug!(token, "reply for unknown or expired call dropped");
                }
            }
            Err(e) => warn!(token, error = %e, "undecodable reply dropped"),
        }
    }
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// Issues requests to other services' request queues and awaits replies.
///
/// One client owns one private reply queue; share it behind an `Arc`.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    namespace: Namespace,
    publisher: String,
    reply_queue: String,
    default_timeout: Duration,
    pending: Arc<PendingCalls>,
    metrics: Arc<MetricsRegistry>,
    stop: ShutdownController,
    consumer: Mutex<Option<JoinHandle<u64>>>,
}

impl RpcClient {
    /// Declares a private reply queue and starts consuming it.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the reply queue or the delay exchange
    /// cannot be declared.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: &NodeConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Arc<Self>, RpcError> {
        let namespace = config.namespace();
        let reply_queue = namespace.reply_queue(&config.service_name);
        transport
            .declare_queue(&reply_queue, QueueOptions::volatile())
            .await?;
        transport
            .declare_exchange(&namespace.delay_exchange(), ExchangeKind::Delayed)
            .await?;

        let pending = Arc::new(PendingCalls::default());
        let stop = ShutdownController::new();
        let consume = ConsumeLoop {
            transport: Arc::clone(&transport),
            queue: reply_queue.clone(),
            options: ConsumeOptions {
                auto_ack: true,
                ..ConsumeOptions::new(reply_queue.clone()).with_prefetch(config.prefetch)
            },
            handler: Arc::new(ReplyConsumer {
                pending: Arc::clone(&pending),
            }),
            restart_delay: config.consume_restart_delay(),
            redeclare: Some(QueueOptions::volatile()),
        };
        let consumer = tokio::spawn(consume.run(stop.signal()));
        stop.mark_ready();
        info!(reply_queue = %reply_queue, "rpc client connected");

        Ok(Arc::new(Self {
            transport,
            namespace,
            publisher: config.service_name.clone(),
            reply_queue,
            default_timeout: config.request_timeout(),
            pending,
            metrics,
            stop,
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    #[must_use]
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Request queue of `service` in this client's namespace.
    #[must_use]
    pub fn queue_for(&self, service: &str) -> String {
        self.namespace.request_queue(service)
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Sends a request built from its parts and waits for the response.
    ///
    /// `timeout` defaults to the configured request timeout.
    ///
    /// # Errors
    ///
    /// See [`RpcClient::send`].
    pub async fn call(
        &self,
        target_queue: &str,
        method: RequestMethod,
        uri: &str,
        data_type: &str,
        data: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Response, RpcError> {
        let request = Request::with_data(method, uri, data_type, data);
        self.send(target_queue, request, timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Publishes `request` to `target_queue` and waits for the correlated response.
    ///
    /// Non-2xx responses are returned as `Ok`; inspect `status_code`.
    ///
    /// # Errors
    ///
    /// - `RpcError::Wire` if the request cannot be encoded
    /// - `RpcError::Transport` if publishing fails
    /// - `RpcError::Timeout` if no response arrives within `timeout`
    /// - `RpcError::Closed` if the client shut down while waiting
    pub async fn send(
        &self,
        target_queue: &str,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, RpcError> {
        let method = request.method.clone();
        let request = request.from_publisher(self.publisher.clone());
        let body = encode(&request)?;

        let token = Uuid::new_v4().to_string();
        let mut call = self.pending.insert(token.clone());
        let envelope = Envelope::new(body)
            .with_correlation_id(token)
            .with_reply_to(self.reply_queue.clone())
            .with_content_type(CONTENT_TYPE_MSGPACK);

        let start = Instant::now();
        self.transport
            .publish(&Destination::queue(target_queue), envelope)
            .await?;
        let outcome = tokio::time::timeout(timeout, &mut call.rx).await;
        self.metrics
            .histogram(
                REQUEST_PROCESS_TIME,
                &[("target", target_queue), ("method", method.as_str())],
            )
            .record(start.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                debug!(target = target_queue, uri = %request.uri, ?timeout, "rpc call timed out");
                Err(RpcError::Timeout {
                    target: target_queue.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Publishes `request` through the delay exchange; it reaches
    /// `target_queue` after `delay`. No response is awaited.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Wire` or `RpcError::Transport` if publishing fails.
    pub async fn send_delayed(
        &self,
        target_queue: &str,
        request: Request,
        delay: Duration,
    ) -> Result<(), RpcError> {
        let request = request.from_publisher(self.publisher.clone());
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let envelope = Envelope::new(encode(&request)?)
            .with_delay_ms(delay_ms)
            .with_content_type(CONTENT_TYPE_MSGPACK);
        self.transport
            .publish(
                &Destination::exchange(self.namespace.delay_exchange(), target_queue),
                envelope,
            )
            .await?;
        debug!(target = target_queue, delay_ms, "delayed request published");
        Ok(())
    }

    /// Sends `body` as JSON and decodes a JSON response.
    ///
    /// # Errors
    ///
    /// Everything [`RpcClient::send`] returns, plus `RpcError::Status` for
    /// non-2xx responses and `RpcError::Wire` if the response is not valid `Res`.
    pub async fn call_json<Req, Res>(
        &self,
        target_queue: &str,
        method: RequestMethod,
        uri: &str,
        body: &Req,
    ) -> Result<Res, RpcError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let request = Request::json(method, uri, body)?;
        let response = self.send(target_queue, request, self.default_timeout).await?;
        if !response.is_success() {
            return Err(RpcError::Status {
                code: response.status_code,
            });
        }
        Ok(response.decode_json()?)
    }

    /// Stops the reply consumer. Pending calls fail with `RpcError::Closed`.
    pub async fn close(&self) {
        self.stop.trigger();
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.pending.calls.lock().clear();
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
