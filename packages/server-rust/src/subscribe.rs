//! Event subscriber: one durable queue bound to many publishers' exchanges.
//!
//! Deliveries are decoded into [`Event`]s and routed by [`EventRouter`]:
//! exact `(publisher, type)` handlers first, then handlers for the type from
//! any publisher, then regex patterns over the type. Matched events run on the
//! [`WorkerPool`]; unmatched and malformed events are logged and acknowledged.
//! Handler errors are logged and dropped; delivery may repeat, so handlers
//! must be idempotent.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use relaybus_core::{decode, Event};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{MetricsRegistry, SUBSCRIBE_EVENT_PROCESS_TIME, SUBSCRIBE_EVENT_UNHANDLED_TOTAL};
use crate::service::config::NodeConfig;
use crate::service::consumer::ConsumeLoop;
use crate::service::registry::{ManagedService, ServiceContext};
use crate::service::router::RouteError;
use crate::service::shutdown::ShutdownController;
use crate::service::worker::{Backpressure, PoolError, WorkerPool};
use crate::traits::{DeliveryHandler, Transport};
use crate::transport::{ConsumeOptions, Delivery, ExchangeKind, QueueOptions, TransportError};

// ---------------------------------------------------------------------------
// EventRouter
// ---------------------------------------------------------------------------

type EventFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type EventHandlerFn = Arc<dyn Fn(Event) -> EventFuture + Send + Sync>;

fn boxed<F, Fut>(handler: F) -> EventHandlerFn
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event: Event| -> EventFuture { Box::pin(handler(event)) })
}

/// Selects the handler for an event.
#[derive(Default)]
pub struct EventRouter {
    exact: HashMap<(String, String), EventHandlerFn>,
    by_type: HashMap<String, EventHandlerFn>,
    patterns: Vec<(Regex, EventHandlerFn)>,
}

impl EventRouter {
    #[must_use]
    pub fn builder() -> EventRouterBuilder {
        EventRouterBuilder {
            router: EventRouter::default(),
            error: None,
        }
    }

    fn resolve(&self, event: &Event) -> Option<EventHandlerFn> {
        self.exact
            .get(&(event.publisher.clone(), event.event_type.clone()))
            .or_else(|| self.by_type.get(&event.event_type))
            .or_else(|| {
                self.patterns
                    .iter()
                    .find(|(pattern, _)| pattern.is_match(&event.event_type))
                    .map(|(_, handler)| handler)
            })
            .cloned()
    }

    /// Returns `true` if some handler would receive `event`.
    #[must_use]
    pub fn handles(&self, event: &Event) -> bool {
        self.resolve(event).is_some()
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("exact", &self.exact.keys().collect::<Vec<_>>())
            .field("by_type", &self.by_type.keys().collect::<Vec<_>>())
            .field(
                "patterns",
                &self.patterns.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub struct EventRouterBuilder {
    router: EventRouter,
    error: Option<RouteError>,
}

impl EventRouterBuilder {
    /// Handles `event_type` from `publisher` only.
    #[must_use]
    pub fn on<F, Fut>(mut self, publisher: &str, event_type: &str, handler: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.router
            .exact
            .insert((publisher.to_string(), event_type.to_string()), boxed(handler));
        self
    }

    /// Handles `event_type` from any publisher.
    #[must_use]
    pub fn on_type<F, Fut>(mut self, event_type: &str, handler: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.router
            .by_type
            .insert(event_type.to_string(), boxed(handler));
        self
    }

    /// Handles any event whose type matches `pattern`; patterns are tried in
    /// registration order after exact matches.
    #[must_use]
    pub fn on_pattern<F, Fut>(mut self, pattern: &str, handler: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match Regex::new(pattern) {
            Ok(regex) => self.router.patterns.push((regex, boxed(handler))),
            Err(source) => {
                self.error.get_or_insert(RouteError::InvalidPattern {
                    name: pattern.to_string(),
                    source,
                });
            }
        }
        self
    }

    /// # Errors
    ///
    /// Returns the first invalid pattern.
    pub fn build(self) -> Result<EventRouter, RouteError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.router),
        }
    }
}

// ---------------------------------------------------------------------------
// SubscribeHandler
// ---------------------------------------------------------------------------

/// Consumes `<ns>.<svc>.subscribe` and runs event handlers on a worker pool.
pub struct SubscribeHandler {
    transport: Arc<dyn Transport>,
    queue: String,
    targets: Vec<String>,
    prefetch: u16,
    restart_delay: Duration,
    drain_timeout: Duration,
    router: Arc<EventRouter>,
    workers: usize,
    queue_capacity: usize,
    backpressure: Backpressure,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    metrics: Arc<MetricsRegistry>,
    task: Mutex<Option<JoinHandle<u64>>>,
}

impl SubscribeHandler {
    /// Creates the handler. Nothing is declared and no worker runs until
    /// [`SubscribeHandler::run`].
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &NodeConfig,
        router: EventRouter,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            transport,
            queue: config.namespace().subscribe_queue(&config.service_name),
            targets: config.targets(),
            prefetch: config.prefetch,
            restart_delay: config.consume_restart_delay(),
            drain_timeout: config.drain_timeout(),
            router: Arc::new(router),
            workers: config.event_workers,
            queue_capacity: config.event_queue_capacity,
            backpressure: config.backpressure,
            pool: Mutex::new(None),
            metrics,
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Declares the subscribe queue and binds it to every target exchange.
    ///
    /// # Errors
    ///
    /// Returns the transport error if a declaration or binding fails.
    pub async fn declare(&self) -> Result<(), TransportError> {
        self.transport
            .declare_queue(&self.queue, QueueOptions::normal())
            .await?;
        for target in &self.targets {
            self.transport
                .declare_exchange(target, ExchangeKind::Fanout)
                .await?;
            self.transport.bind_queue(&self.queue, target, "").await?;
            debug!(queue = %self.queue, exchange = %target, "subscribed");
        }
        Ok(())
    }

    /// Declares and starts the background consumption loop on a fresh worker
    /// pool. A loop that is already running is stopped and drained first, so
    /// `run` may follow [`SubscribeHandler::stop`].
    ///
    /// # Errors
    ///
    /// Returns the transport error if [`SubscribeHandler::declare`] fails.
    pub async fn run(&self, shutdown: Arc<ShutdownController>) -> Result<(), TransportError> {
        self.declare().await?;
        if !self.stop(true).await {
            warn!(queue = %self.queue, "previous event handlers aborted on restart");
        }

        let pool = Arc::new(WorkerPool::start(
            self.workers,
            self.queue_capacity,
            self.backpressure,
        ));
        *self.pool.lock() = Some(Arc::clone(&pool));
        let handler = EventConsumer {
            router: Arc::clone(&self.router),
            pool,
            metrics: Arc::clone(&self.metrics),
            shutdown: Arc::clone(&shutdown),
        };
        let consume = ConsumeLoop {
            transport: Arc::clone(&self.transport),
            queue: self.queue.clone(),
            options: ConsumeOptions::new(format!("{}-subscribe", self.queue))
                .with_prefetch(self.prefetch),
            handler: Arc::new(handler),
            restart_delay: self.restart_delay,
            redeclare: None,
        };
        let handle = tokio::spawn(consume.run(shutdown.signal()));
        *self.task.lock() = Some(handle);
        info!(queue = %self.queue, targets = ?self.targets, "subscribe handler running");
        Ok(())
    }

    /// Stops consuming and drains the worker pool.
    ///
    /// Deliveries not yet handed to the pool are requeued. Returns `false` if
    /// in-flight handlers had to be aborted.
    pub async fn stop(&self, drain: bool) -> bool {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let pool = self.pool.lock().take();
        let Some(pool) = pool else {
            return true;
        };
        let timeout = if drain { self.drain_timeout } else { Duration::ZERO };
        pool.shutdown(timeout).await
    }
}

#[async_trait]
impl ManagedService for SubscribeHandler {
    fn name(&self) -> &'static str {
        "subscribe"
    }

    async fn start(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        self.run(Arc::clone(&ctx.shutdown)).await?;
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        if !self.stop(!terminate).await {
            warn!(queue = %self.queue, "event handlers aborted at shutdown");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventConsumer
// ---------------------------------------------------------------------------

struct EventConsumer {
    router: Arc<EventRouter>,
    pool: Arc<WorkerPool>,
    metrics: Arc<MetricsRegistry>,
    shutdown: Arc<ShutdownController>,
}

#[async_trait]
impl DeliveryHandler for EventConsumer {
    async fn handle(&self, delivery: Delivery) {
        let event = match decode::<Event>(&delivery.envelope.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "undecodable event skipped");
                delivery.ack();
                return;
            }
        };

        let Some(handler) = self.router.resolve(&event) else {
            self.metrics
                .counter(
                    SUBSCRIBE_EVENT_UNHANDLED_TOTAL,
                    &[("publisher", &event.publisher), ("type", &event.event_type)],
                )
                .increment(1);
            debug!(publisher = %event.publisher, event_type = %event.event_type, "unhandled event");
            delivery.ack();
            return;
        };

        let metrics = Arc::clone(&self.metrics);
        let in_flight = self.shutdown.track();
        let task = async move {
            let _in_flight = in_flight;
            let publisher = event.publisher.clone();
            let event_type = event.event_type.clone();
            let start = Instant::now();
            let result = handler(event).await;
            metrics
                .histogram(
                    SUBSCRIBE_EVENT_PROCESS_TIME,
                    &[("publisher", &publisher), ("type", &event_type)],
                )
                .record(start.elapsed().as_secs_f64() * 1000.0);
            if let Err(e) = result {
                warn!(%publisher, %event_type, error = %e, "event handler failed");
            }
        };

        match self.pool.submit(task).await {
            Ok(()) => delivery.ack(),
            Err(PoolError::Saturated) => {
                warn!("worker pool saturated; event dropped");
                delivery.reject(false);
            }
            Err(PoolError::Closed) => {
                debug!("worker pool closed; event returned to queue");
                delivery.reject(true);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use relaybus_core::{encode, Namespace};
    use tokio::sync::mpsc;

    use super::*;
    use crate::notify::NotifyHandler;
    use crate::transport::{Destination, Envelope, MemoryBroker};

    fn event(publisher: &str, event_type: &str) -> Event {
        Event::new(event_type, publisher, "", Vec::new())
    }

    fn recording_router(tx: &mpsc::UnboundedSender<String>) -> EventRouter {
        let (a, b, c) = (tx.clone(), tx.clone(), tx.clone());
        EventRouter::builder()
            .on("call-manager", "call_hangup", move |_| {
                let tx = a.clone();
                async move {
                    let _ = tx.send("exact".to_string());
                    Ok(())
                }
            })
            .on_type("call_hangup", move |_| {
                let tx = b.clone();
                async move {
                    let _ = tx.send("type".to_string());
                    Ok(())
                }
            })
            .on_pattern("^conference_", move |e| {
                let tx = c.clone();
                async move {
                    let _ = tx.send(format!("pattern:{}", e.event_type));
                    Ok(())
                }
            })
            .build()
            .unwrap()
    }

    #[test]
    fn resolution_order() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = recording_router(&tx);
        assert!(router.handles(&event("call-manager", "call_hangup")));
        assert!(router.handles(&event("flow-manager", "call_hangup")));
        assert!(router.handles(&event("x", "conference_joined")));
        assert!(!router.handles(&event("x", "call_created")));
    }

    #[test]
    fn bad_pattern_fails_build() {
        let result = EventRouter::builder()
            .on_pattern("(", |_| async { Ok(()) })
            .build();
        assert!(result.is_err());
    }

    async fn subscriber(
        broker: &MemoryBroker,
        service: &str,
        router: EventRouter,
        metrics: &Arc<MetricsRegistry>,
    ) -> (SubscribeHandler, Arc<ShutdownController>) {
        let config = NodeConfig {
            subscribe_targets: "relay.call-manager.event,relay.conference-manager.event".to_string(),
            ..NodeConfig::new("relay", service)
        };
        let handler = SubscribeHandler::new(Arc::new(broker.clone()), &config, router, Arc::clone(metrics));
        let shutdown = Arc::new(ShutdownController::new());
        handler.run(Arc::clone(&shutdown)).await.unwrap();
        (handler, shutdown)
    }

    async fn publish(broker: &MemoryBroker, exchange: &str, event: &Event) {
        broker
            .publish(
                &Destination::exchange(exchange, ""),
                Envelope::new(encode(event).unwrap()),
            )
            .await
            .unwrap();
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn dispatches_to_selected_handler() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handler, _shutdown) = subscriber(&broker, "webhook-manager", recording_router(&tx), &metrics).await;
        assert_eq!(handler.targets().len(), 2);

        publish(&broker, "relay.call-manager.event", &event("call-manager", "call_hangup")).await;
        assert_eq!(recv(&mut rx).await, "exact");

        publish(&broker, "relay.conference-manager.event", &event("conference-manager", "conference_joined")).await;
        assert_eq!(recv(&mut rx).await, "pattern:conference_joined");

        assert!(handler.stop(true).await);
        assert!(metrics.render().contains("subscribe_event_process_time"));
    }

    #[tokio::test]
    async fn unhandled_and_malformed_events_are_skipped() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handler, _shutdown) = subscriber(&broker, "webhook-manager", recording_router(&tx), &metrics).await;

        publish(&broker, "relay.call-manager.event", &event("call-manager", "call_created")).await;
        broker
            .publish(
                &Destination::exchange("relay.call-manager.event", ""),
                Envelope::new(&b"\xc1"[..]),
            )
            .await
            .unwrap();
        publish(&broker, "relay.call-manager.event", &event("call-manager", "call_hangup")).await;

        assert_eq!(recv(&mut rx).await, "exact");
        let text = metrics.render();
        assert!(text.contains("subscribe_event_unhandled_total"));
        assert!(text.contains("type=\"call_created\""));
        handler.stop(true).await;
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_consumption() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = EventRouter::builder()
            .on_type("call_hangup", move |e: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(e.publisher.clone());
                    Err(anyhow::anyhow!("downstream unavailable"))
                }
            })
            .build()
            .unwrap();
        let (handler, _shutdown) = subscriber(&broker, "billing-manager", router, &metrics).await;

        for _ in 0..2 {
            publish(&broker, "relay.call-manager.event", &event("call-manager", "call_hangup")).await;
            assert_eq!(recv(&mut rx).await, "call-manager");
        }
        handler.stop(true).await;
    }

    #[tokio::test]
    async fn runs_again_after_stop() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handler, shutdown) = subscriber(&broker, "webhook-manager", recording_router(&tx), &metrics).await;

        publish(&broker, "relay.call-manager.event", &event("call-manager", "call_hangup")).await;
        assert_eq!(recv(&mut rx).await, "exact");
        assert!(handler.stop(true).await);

        handler.run(Arc::clone(&shutdown)).await.unwrap();
        publish(&broker, "relay.call-manager.event", &event("call-manager", "call_hangup")).await;
        assert_eq!(recv(&mut rx).await, "exact");
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        assert!(handler.stop(true).await);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_consumption() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = EventRouter::builder()
            .on_type("call_hangup", move |e: Event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(e.publisher.clone());
                    if e.publisher == "broken-manager" {
                        panic!("handler bug");
                    }
                    Ok(())
                }
            })
            .build()
            .unwrap();
        let config = NodeConfig {
            subscribe_targets: "relay.call-manager.event".to_string(),
            event_workers: 1,
            ..NodeConfig::new("relay", "billing-manager")
        };
        let handler = SubscribeHandler::new(Arc::new(broker.clone()), &config, router, Arc::clone(&metrics));
        handler.run(Arc::new(ShutdownController::new())).await.unwrap();

        for publisher in ["broken-manager", "broken-manager", "call-manager"] {
            publish(&broker, "relay.call-manager.event", &event(publisher, "call_hangup")).await;
        }
        let mut got = vec![recv(&mut rx).await, recv(&mut rx).await, recv(&mut rx).await];
        got.sort();
        assert_eq!(got, vec!["broken-manager", "broken-manager", "call-manager"]);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        assert!(handler.stop(true).await);
    }

    #[tokio::test]
    async fn two_subscribers_each_receive_one_copy() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(MetricsRegistry::new(&Namespace::new("relay")));
        let notify = NotifyHandler::new(
            Arc::new(broker.clone()),
            &NodeConfig::new("relay", "call-manager"),
            Arc::clone(&metrics),
        );
        notify.declare().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handlers = Vec::new();
        for service in ["webhook-manager", "billing-manager"] {
            let tx = tx.clone();
            let router = EventRouter::builder()
                .on_type("call_hangup", move |_| {
                    let tx = tx.clone();
                    let service = service.to_string();
                    async move {
                        let _ = tx.send(service);
                        Ok(())
                    }
                })
                .build()
                .unwrap();
            handlers.push(subscriber(&broker, service, router, &metrics).await);
        }

        notify.publish_event("call_hangup", "", Vec::new()).await.unwrap();

        let mut got = vec![recv(&mut rx).await, recv(&mut rx).await];
        got.sort();
        assert_eq!(got, vec!["billing-manager", "webhook-manager"]);
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());

        for (handler, _) in &handlers {
            handler.stop(true).await;
        }
    }
}
