//! Node lifecycle state and graceful shutdown.
//!
//! Consumption loops hold a [`ShutdownSignal`] and stop restarting once it
//! fires; message handlers hold an [`InFlightGuard`] while they work so
//! shutdown can wait for them to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Node lifecycle state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Declaring queues and attaching consumers.
    Starting,
    /// Consuming requests and events.
    Ready,
    /// Consumers are stopping; in-flight messages are being finished.
    Draining,
    /// Every in-flight message has completed.
    Stopped,
}

impl NodeState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Starting => "starting",
            NodeState::Ready => "ready",
            NodeState::Draining => "draining",
            NodeState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Coordinates shutdown across the consumption loops of one node.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    state: Arc<ArcSwap<NodeState>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self {
            signal,
            in_flight: Arc::new(InFlight::default()),
            state: Arc::new(ArcSwap::from_pointee(NodeState::Starting)),
        }
    }

    pub fn mark_ready(&self) {
        self.state.store(Arc::new(NodeState::Ready));
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        **self.state.load()
    }

    /// A signal handle for a background loop.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.signal.subscribe(),
        }
    }

    /// Moves to `Draining` and wakes every [`ShutdownSignal`].
    pub fn trigger(&self) {
        self.state.store(Arc::new(NodeState::Draining));
        self.signal.send_replace(true);
    }

    /// Marks one message as in flight until the guard is dropped.
    #[must_use]
    pub fn track(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Waits until no message is in flight, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` on success; returns `false` and
    /// stays `Draining` when the timeout expires.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let notified = self.in_flight.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        let drained = tokio::time::timeout(timeout, idle).await.is_ok();
        if drained {
            self.state.store(Arc::new(NodeState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the shutdown broadcast.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered or the controller is gone.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Decrements the in-flight count on drop, waking `drain` at zero.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), NodeState::Starting);
        controller.mark_ready();
        assert_eq!(controller.state(), NodeState::Ready);
        controller.trigger();
        assert_eq!(controller.state(), NodeState::Draining);
        assert_eq!(controller.state().as_str(), "draining");
    }

    #[test]
    fn guards_track_in_flight_messages() {
        let controller = ShutdownController::new();
        let a = controller.track();
        let b = controller.track();
        assert_eq!(controller.in_flight(), 2);
        drop(a);
        drop(b);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn signal_fires_for_late_subscribers() {
        let controller = ShutdownController::new();
        let mut early = controller.signal();
        assert!(!early.is_triggered());

        controller.trigger();
        early.triggered().await;

        let mut late = controller.signal();
        assert!(late.is_triggered());
        late.triggered().await;
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let controller = ShutdownController::new();
        let guard = controller.track();
        controller.trigger();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        assert!(controller.drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), NodeState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_guard() {
        let controller = ShutdownController::new();
        let _guard = controller.track();
        controller.trigger();

        assert!(!controller.drain(Duration::from_millis(30)).await);
        assert_eq!(controller.state(), NodeState::Draining);
    }
}
