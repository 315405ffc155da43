//! In-process [`Transport`] implementation backed by [`DashMap`] and tokio channels.
//!
//! Models the broker features the framework relies on: competing consumers on
//! a queue, fanout/direct/delayed exchanges, manual acknowledgement with
//! prefetch limits, requeue on reject, and auto-deleted private queues.
//! Suitable for tests and single-process deployments.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use super::{
    ConsumeOptions, Delivery, Destination, Envelope, ExchangeKind, QueueOptions, Settle,
    Settlement, TransportError,
};
use crate::traits::{DeliveryHandler, Transport};

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Stored {
    envelope: Envelope,
    redelivered: bool,
}

struct QueueState {
    name: String,
    options: QueueOptions,
    tx: mpsc::UnboundedSender<Stored>,
    rx: Mutex<mpsc::UnboundedReceiver<Stored>>,
    consumers: AtomicUsize,
}

impl QueueState {
    fn new(name: &str, options: QueueOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            options,
            tx,
            rx: Mutex::new(rx),
            consumers: AtomicUsize::new(0),
        }
    }

    fn push(&self, envelope: Envelope, redelivered: bool) {
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.tx.send(Stored {
            envelope,
            redelivered,
        });
    }
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Inner {
    queues: DashMap<String, Arc<QueueState>>,
    exchanges: DashMap<String, ExchangeState>,
    /// Connection generation; bumped to simulate a dropped connection.
    connection: watch::Sender<u64>,
}

impl Inner {
    fn queue(&self, name: &str) -> Result<Arc<QueueState>, TransportError> {
        self.queues
            .get(name)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| TransportError::QueueNotFound(name.to_string()))
    }

    /// Names of the queues an exchange routes `routing_key` to.
    fn targets(
        &self,
        exchange: &str,
        routing_key: &str,
        direct: bool,
    ) -> Result<Vec<String>, TransportError> {
        let entry = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;
        let direct = direct || entry.kind != ExchangeKind::Fanout;
        Ok(entry
            .bindings
            .iter()
            .filter(|b| !direct || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect())
    }

    fn deliver(&self, queues: &[String], envelope: &Envelope) {
        for name in queues {
            match self.queues.get(name) {
                Some(queue) => queue.push(envelope.clone(), false),
                None => warn!(queue = %name, "binding points at a missing queue"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// In-memory message broker.
///
/// Cloning is cheap; clones share the same queues and exchanges, so one
/// broker can stand in for the connection shared by every component of a
/// process (or by several simulated services in tests).
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates a new, empty broker.
    #[must_use]
    pub fn new() -> Self {
        let (connection, _rx) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                queues: DashMap::new(),
                exchanges: DashMap::new(),
                connection,
            }),
        }
    }

    /// Simulates a lost connection: every running `consume` call returns
    /// `TransportError::ConnectionClosed`. Declarations and queued messages
    /// survive, as they would on a broker that stays up.
    pub fn reset_connection(&self) {
        self.inner.connection.send_modify(|generation| *generation += 1);
        info!("memory broker connection reset");
    }

    /// Returns `true` if a queue with this name is declared.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.queues.contains_key(name)
    }

    /// Number of consumers currently attached to a queue.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.inner
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.load(Ordering::SeqCst))
    }

    /// Number of queues bound to an exchange.
    #[must_use]
    pub fn binding_count(&self, exchange: &str) -> usize {
        self.inner
            .exchanges
            .get(exchange)
            .map_or(0, |e| e.bindings.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), TransportError> {
        let entry = self
            .inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(name, options)));
        if entry.options != options {
            return Err(TransportError::Mismatch {
                name: name.to_string(),
                reason: format!("declared as {:?}, requested {options:?}", entry.options),
            });
        }
        debug!(queue = %name, "queue declared");
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        let entry = self
            .inner
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        if entry.kind != kind {
            return Err(TransportError::Mismatch {
                name: name.to_string(),
                reason: format!("declared as {:?}, requested {kind:?}", entry.kind),
            });
        }
        debug!(exchange = %name, ?kind, "exchange declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        if !self.inner.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }
        let mut entry = self
            .inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;
        let exists = entry
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            entry.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        debug!(queue, exchange, routing_key, "queue bound");
        Ok(())
    }

    async fn publish(
        &self,
        destination: &Destination,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        match destination {
            Destination::Queue(name) => {
                self.inner.queue(name)?.push(envelope, false);
            }
            Destination::Exchange { name, routing_key } => {
                let kind = self
                    .inner
                    .exchanges
                    .get(name)
                    .map(|e| e.kind)
                    .ok_or_else(|| TransportError::ExchangeNotFound(name.clone()))?;

                if kind == ExchangeKind::Delayed {
                    let delay = Duration::from_millis(envelope.properties.delay_ms.unwrap_or(0));
                    let inner = Arc::clone(&self.inner);
                    let exchange = name.clone();
                    let routing_key = routing_key.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        match inner.targets(&exchange, &routing_key, true) {
                            Ok(targets) => inner.deliver(&targets, &envelope),
                            Err(e) => warn!(error = %e, "delayed message dropped"),
                        }
                    });
                } else {
                    let targets = self.inner.targets(name, routing_key, false)?;
                    if targets.is_empty() {
                        trace!(exchange = %name, routing_key = %routing_key, "message unroutable");
                    }
                    self.inner.deliver(&targets, &envelope);
                }
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError> {
        let state = self.inner.queue(queue)?;
        let _guard = ConsumerGuard::attach(Arc::clone(&self.inner), Arc::clone(&state))?;

        let mut connection = self.inner.connection.subscribe();
        connection.borrow_and_update();
        let permits = Arc::new(Semaphore::new(usize::from(options.prefetch.max(1))));

        debug!(
            queue,
            consumer_tag = %options.consumer_tag,
            prefetch = options.prefetch,
            "consumer attached"
        );

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => {
                    permit.map_err(|_| TransportError::ConnectionClosed)?
                }
                _ = connection.changed() => return Err(TransportError::ConnectionClosed),
            };

            let stored = tokio::select! {
                stored = async { state.rx.lock().await.recv().await } => stored,
                _ = connection.changed() => return Err(TransportError::ConnectionClosed),
            };
            let Some(Stored {
                envelope,
                redelivered,
            }) = stored
            else {
                return Err(TransportError::QueueDeleted(queue.to_string()));
            };

            let delivery = if options.auto_ack {
                drop(permit);
                Delivery::settled(envelope, redelivered)
            } else {
                let settle = MemorySettle {
                    queue: Arc::clone(&state),
                    envelope: envelope.clone(),
                    _permit: permit,
                };
                Delivery::new(envelope, redelivered, Box::new(settle))
            };

            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.handle(delivery).await });
        }
    }
}

// ---------------------------------------------------------------------------
// Settlement and consumer bookkeeping
// ---------------------------------------------------------------------------

/// Applies ack/reject for one delivery and releases its prefetch slot.
struct MemorySettle {
    queue: Arc<QueueState>,
    envelope: Envelope,
    _permit: OwnedSemaphorePermit,
}

impl Settle for MemorySettle {
    fn settle(self: Box<Self>, settlement: Settlement) {
        match settlement {
            Settlement::Ack => {}
            Settlement::Reject { requeue: true } => {
                trace!(queue = %self.queue.name, "message requeued");
                self.queue.push(self.envelope, true);
            }
            Settlement::Reject { requeue: false } => {
                debug!(queue = %self.queue.name, "message rejected and discarded");
            }
        }
    }
}

/// Tracks an attached consumer; removes auto-delete queues when the last one leaves.
struct ConsumerGuard {
    inner: Arc<Inner>,
    queue: Arc<QueueState>,
}

impl ConsumerGuard {
    fn attach(inner: Arc<Inner>, queue: Arc<QueueState>) -> Result<Self, TransportError> {
        if queue.options.exclusive {
            queue
                .consumers
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .map_err(|_| TransportError::Exclusive(queue.name.clone()))?;
        } else {
            queue.consumers.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Self { inner, queue })
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let remaining = self.queue.consumers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.queue.options.auto_delete {
            let name = &self.queue.name;
            self.inner.queues.remove(name);
            for mut exchange in self.inner.exchanges.iter_mut() {
                exchange.bindings.retain(|b| &b.queue != name);
            }
            debug!(queue = %name, "auto-delete queue removed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;

    /// Forwards every delivery into a channel so tests can inspect and settle it.
    struct Forward(mpsc::UnboundedSender<Delivery>);

    #[async_trait]
    impl DeliveryHandler for Forward {
        async fn handle(&self, delivery: Delivery) {
            let _ = self.0.send(delivery);
        }
    }

    fn spawn_consumer(
        broker: &MemoryBroker,
        queue: &str,
        prefetch: u16,
    ) -> (
        mpsc::UnboundedReceiver<Delivery>,
        tokio::task::JoinHandle<Result<(), TransportError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = broker.clone();
        let queue = queue.to_string();
        let handle = tokio::spawn(async move {
            broker
                .consume(
                    &queue,
                    ConsumeOptions::new("test").with_prefetch(prefetch),
                    Arc::new(Forward(tx)),
                )
                .await
        });
        (rx, handle)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delivery within timeout")
            .expect("channel open")
    }

    async fn nothing(rx: &mut mpsc::UnboundedReceiver<Delivery>) {
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q", QueueOptions::normal()).await.unwrap();
        broker.declare_queue("q", QueueOptions::normal()).await.unwrap();
        broker.declare_exchange("x", ExchangeKind::Fanout).await.unwrap();
        broker.declare_exchange("x", ExchangeKind::Fanout).await.unwrap();
        broker.bind_queue("q", "x", "").await.unwrap();
        broker.bind_queue("q", "x", "").await.unwrap();
        assert_eq!(broker.binding_count("x"), 1);
    }

    #[tokio::test]
    async fn conflicting_declarations_fail() {
        let broker = MemoryBroker::new();
        broker.declare_exchange("x", ExchangeKind::Fanout).await.unwrap();
        let err = broker
            .declare_exchange("x", ExchangeKind::Direct)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Mismatch { .. }));

        broker.declare_queue("q", QueueOptions::normal()).await.unwrap();
        let err = broker
            .declare_queue("q", QueueOptions::volatile())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Mismatch { .. }));
    }

    #[tokio::test]
    async fn publish_to_missing_targets_fails() {
        let broker = MemoryBroker::new();
        let err = broker
            .publish(&Destination::queue("nope"), Envelope::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::QueueNotFound("nope".into()));

        let err = broker
            .publish(&Destination::exchange("nope", ""), Envelope::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::ExchangeNotFound("nope".into()));
    }

    #[tokio::test]
    async fn competing_consumers_each_message_once() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q", QueueOptions::normal()).await.unwrap();
        let (mut rx_a, _a) = spawn_consumer(&broker, "q", 10);
        let (mut rx_b, _b) = spawn_consumer(&broker, "q", 10);
        tokio::time::sleep(Duration::from_millis(10)).await;

        for i in 0..4 {
            broker
                .publish(&Destination::queue("q"), Envelope::new(format!("m{i}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut total = 0;
        while let Ok(d) = rx_a.try_recv() {
            d.ack();
            total += 1;
        }
        while let Ok(d) = rx_b.try_recv() {
            d.ack();
            total += 1;
        }
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn fanout_delivers_one_copy_per_bound_queue() {
        let broker = MemoryBroker::new();
        broker.declare_exchange("svc.event", ExchangeKind::Fanout).await.unwrap();
        for q in ["a.subscribe", "b.subscribe"] {
            broker.declare_queue(q, QueueOptions::normal()).await.unwrap();
            broker.bind_queue(q, "svc.event", "").await.unwrap();
        }
        let (mut rx_a, _a) = spawn_consumer(&broker, "a.subscribe", 10);
        let (mut rx_b, _b) = spawn_consumer(&broker, "b.subscribe", 10);

        broker
            .publish(&Destination::exchange("svc.event", ""), Envelope::new("evt"))
            .await
            .unwrap();

        next(&mut rx_a).await.ack();
        next(&mut rx_b).await.ack();
        nothing(&mut rx_a).await;
        nothing(&mut rx_b).await;
    }

    #[tokio::test]
    async fn direct_exchange_routes_by_key() {
        let broker = MemoryBroker::new();
        broker.declare_exchange("d", ExchangeKind::Direct).await.unwrap();
        broker.declare_queue("q1", QueueOptions::normal()).await.unwrap();
        broker.declare_queue("q2", QueueOptions::normal()).await.unwrap();
        broker.bind_queue("q1", "d", "q1").await.unwrap();
        broker.bind_queue("q2", "d", "q2").await.unwrap();
        let (mut rx1, _c1) = spawn_consumer(&broker, "q1", 10);
        let (mut rx2, _c2) = spawn_consumer(&broker, "q2", 10);

        broker
            .publish(&Destination::exchange("d", "q2"), Envelope::new("only q2"))
            .await
            .unwrap();

        let d = next(&mut rx2).await;
        assert_eq!(&d.envelope.body[..], b"only q2");
        d.ack();
        nothing(&mut rx1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_exchange_holds_message() {
        let broker = MemoryBroker::new();
        broker.declare_exchange("ns.delay", ExchangeKind::Delayed).await.unwrap();
        broker.declare_queue("q", QueueOptions::normal()).await.unwrap();
        broker.bind_queue("q", "ns.delay", "q").await.unwrap();
        let (mut rx, _c) = spawn_consumer(&broker, "q", 10);

        broker
            .publish(
                &Destination::exchange("ns.delay", "q"),
                Envelope::new("later").with_delay_ms(5_000),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let d = rx.recv().await.expect("delivered after delay");
        assert_eq!(&d.envelope.body[..], b"later");
        d.ack();
    }

    #[tokio::test]
    async fn prefetch_limits_unsettled_deliveries() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q", QueueOptions::normal()).await.unwrap();
        let (mut rx, _c) = spawn_consumer(&broker, "q", 1);

        for body in ["first", "second"] {
            broker
                .publish(&Destination::queue("q"), Envelope::new(body))
                .await
                .unwrap();
        }

        let first = next(&mut rx).await;
        nothing(&mut rx).await;
        first.ack();
        let second = next(&mut rx).await;
        assert_eq!(&second.envelope.body[..], b"second");
        second.ack();
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q", QueueOptions::normal()).await.unwrap();
        let (mut rx, _c) = spawn_consumer(&broker, "q", 10);

        broker
            .publish(&Destination::queue("q"), Envelope::new("again"))
            .await
            .unwrap();
        let first = next(&mut rx).await;
        assert!(!first.redelivered);
        drop(first);

        let second = next(&mut rx).await;
        assert!(second.redelivered);
        second.reject(false);
        nothing(&mut rx).await;
    }

    #[tokio::test]
    async fn reset_connection_ends_consumers() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q", QueueOptions::normal()).await.unwrap();
        let (_rx, handle) = spawn_consumer(&broker, "q", 10);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.consumer_count("q"), 1);

        broker.reset_connection();
        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("consumer returns")
            .expect("task joins");
        assert_eq!(result, Err(TransportError::ConnectionClosed));
        assert_eq!(broker.consumer_count("q"), 0);
        assert!(broker.has_queue("q"));
    }

    #[tokio::test]
    async fn exclusive_auto_delete_queue_lifecycle() {
        let broker = MemoryBroker::new();
        broker.declare_exchange("x", ExchangeKind::Fanout).await.unwrap();
        broker.declare_queue("reply", QueueOptions::volatile()).await.unwrap();
        broker.bind_queue("reply", "x", "").await.unwrap();
        let (_rx, handle) = spawn_consumer(&broker, "reply", 10);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (tx, _unused) = mpsc::unbounded_channel();
        let err = broker
            .consume("reply", ConsumeOptions::new("second"), Arc::new(Forward(tx)))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Exclusive("reply".into()));

        handle.abort();
        let _ = handle.await;
        assert!(!broker.has_queue("reply"));
        assert_eq!(broker.binding_count("x"), 0);
    }
}
