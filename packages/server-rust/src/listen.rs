//! Listen handler: consumes a service's request queue and replies through the
//! dispatch pipeline.
//!
//! Each delivery is decoded, dispatched through the route table, answered on
//! the caller's reply queue with the same correlation id, and acknowledged.
//! Every outcome, including an undecodable body, produces a reply when the
//! caller asked for one.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use relaybus_core::{decode, encode, Request, Response};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsRegistry;
use crate::service::config::NodeConfig;
use crate::service::consumer::ConsumeLoop;
use crate::service::middleware::{build_dispatch_pipeline, DispatchService};
use crate::service::registry::{ManagedService, ServiceContext};
use crate::service::router::{status, Inbound, RouteTable};
use crate::service::shutdown::ShutdownController;
use crate::service::worker::panic_message;
use crate::traits::{DeliveryHandler, Transport};
use crate::transport::{
    ConsumeOptions, Delivery, Destination, Envelope, ExchangeKind, QueueOptions, TransportError,
};

/// Content type of `MsgPack` broker bodies.
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

/// Consumes `<ns>.<svc>.request` and serves it with a route table.
pub struct ListenHandler {
    transport: Arc<dyn Transport>,
    queue: String,
    delay_exchange: String,
    prefetch: u16,
    restart_delay: Duration,
    dispatcher: DispatchService,
    task: Mutex<Option<JoinHandle<u64>>>,
}

impl ListenHandler {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &NodeConfig,
        table: RouteTable,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let namespace = config.namespace();
        Self {
            transport,
            queue: namespace.request_queue(&config.service_name),
            delay_exchange: namespace.delay_exchange(),
            prefetch: config.prefetch,
            restart_delay: config.consume_restart_delay(),
            dispatcher: build_dispatch_pipeline(table, metrics),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Dispatches one request through the pipeline. Never fails.
    pub async fn dispatch(&self, request: Request) -> Response {
        dispatch(&self.dispatcher, request.into()).await
    }

    /// Declares the request queue and binds it to the delay exchange.
    ///
    /// Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns the transport error if a declaration fails.
    pub async fn declare(&self) -> Result<(), TransportError> {
        self.transport
            .declare_queue(&self.queue, QueueOptions::normal())
            .await?;
        self.transport
            .declare_exchange(&self.delay_exchange, ExchangeKind::Delayed)
            .await?;
        self.transport
            .bind_queue(&self.queue, &self.delay_exchange, &self.queue)
            .await
    }

    /// Declares the queue and starts the background consumption loop.
    ///
    /// # Errors
    ///
    /// Returns the transport error if declaring the queue fails.
    pub async fn run(&self, shutdown: Arc<ShutdownController>) -> Result<(), TransportError> {
        self.declare().await?;

        let handler = RequestConsumer {
            transport: Arc::clone(&self.transport),
            dispatcher: self.dispatcher.clone(),
            shutdown: Arc::clone(&shutdown),
        };
        let consume = ConsumeLoop {
            transport: Arc::clone(&self.transport),
            queue: self.queue.clone(),
            options: ConsumeOptions::new(format!("{}-listen", self.queue)).with_prefetch(self.prefetch),
            handler: Arc::new(handler),
            restart_delay: self.restart_delay,
            redeclare: None,
        };

        let handle = tokio::spawn(consume.run(shutdown.signal()));
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!(queue = %self.queue, "listen handler running");
        Ok(())
    }
}

#[async_trait]
impl ManagedService for ListenHandler {
    fn name(&self) -> &'static str {
        "listen"
    }

    async fn start(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        self.run(Arc::clone(&ctx.shutdown)).await?;
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if terminate {
                handle.abort();
            }
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Runs the pipeline; a panicking handler becomes a 500.
async fn dispatch(dispatcher: &DispatchService, inbound: Inbound) -> Response {
    let method = inbound.request.method.clone();
    let uri = inbound.request.uri.clone();
    match AssertUnwindSafe(dispatcher.clone().oneshot(inbound))
        .catch_unwind()
        .await
    {
        Ok(Ok(dispatched)) => dispatched.response,
        Ok(Err(never)) => match never {},
        Err(panic) => {
            error!(%method, uri = %uri, panic = panic_message(&*panic), "handler panicked");
            Response::status(status::INTERNAL_SERVER_ERROR)
        }
    }
}

// ---------------------------------------------------------------------------
// RequestConsumer
// ---------------------------------------------------------------------------

struct RequestConsumer {
    transport: Arc<dyn Transport>,
    dispatcher: DispatchService,
    shutdown: Arc<ShutdownController>,
}

impl RequestConsumer {
    async fn reply(&self, reply_to: &str, correlation_id: Option<String>, response: &Response) {
        let body = match encode(response) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to encode response");
                return;
            }
        };
        let mut envelope = Envelope::new(body).with_content_type(CONTENT_TYPE_MSGPACK);
        if let Some(correlation_id) = correlation_id {
            envelope = envelope.with_correlation_id(correlation_id);
        }
        if let Err(e) = self
            .transport
            .publish(&Destination::queue(reply_to), envelope)
            .await
        {
            warn!(reply_to, error = %e, "failed to publish response");
        }
    }
}

#[async_trait]
impl DeliveryHandler for RequestConsumer {
    async fn handle(&self, delivery: Delivery) {
        let _in_flight = self.shutdown.track();
        let properties = &delivery.envelope.properties;
        let correlation_id = properties.correlation_id.clone();
        let reply_to = properties.reply_to.clone();

        let response = match decode::<Request>(&delivery.envelope.body) {
            Ok(request) => {
                let inbound = Inbound {
                    request,
                    correlation_id: correlation_id.clone(),
                };
                dispatch(&self.dispatcher, inbound).await
            }
            Err(e) => {
                warn!(error = %e, "undecodable request");
                Response::status(status::BAD_REQUEST)
            }
        };

        match reply_to {
            Some(reply_to) => self.reply(&reply_to, correlation_id, &response).await,
            None => debug!(status = response.status_code, "no reply destination; response dropped"),
        }
        delivery.ack();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
