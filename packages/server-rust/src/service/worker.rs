//! Bounded worker pool for event handlers.
//!
//! A fixed set of workers pulls boxed tasks from one bounded mpsc channel.
//! When the channel is full, [`Backpressure`] decides whether submitters
//! wait or fail. Shutdown closes the channel, lets the workers finish what is
//! queued, and aborts whatever is still running at the drain deadline.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Behaviour of [`WorkerPool::submit`] when the task queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Wait until a slot frees up.
    #[default]
    Block,
    /// Fail immediately with `PoolError::Saturated`.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool saturated")]
    Saturated,
    #[error("worker pool closed")]
    Closed,
}

/// Fixed-size pool of tokio tasks consuming a bounded queue.
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    backpressure: Backpressure,
}

impl WorkerPool {
    /// Spawns `workers` workers sharing a queue of `capacity` tasks.
    ///
    /// Both values are raised to at least one.
    #[must_use]
    pub fn start(workers: usize, capacity: usize, backpressure: Backpressure) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let task = rx.lock().await.recv().await;
                        match task {
                            Some(task) => {
                                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                                    warn!(worker = id, panic = panic_message(&*panic), "task panicked");
                                }
                            }
                            None => break,
                        }
                    }
                    debug!(worker = id, "worker stopped");
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            backpressure,
        }
    }

    /// Queues a task.
    ///
    /// # Errors
    ///
    /// - `PoolError::Saturated` if the queue is full and backpressure is `Reject`
    /// - `PoolError::Closed` after `shutdown`
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock().clone().ok_or(PoolError::Closed)?;
        let task: Task = Box::pin(task);
        match self.backpressure {
            Backpressure::Block => tx.send(task).await.map_err(|_| PoolError::Closed),
            Backpressure::Reject => tx.try_send(task).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PoolError::Saturated,
                mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
            }),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Stops accepting tasks and waits up to `drain_timeout` for queued and
    /// running tasks. Returns `false` if workers had to be aborted.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        self.tx.lock().take();
        let mut workers = std::mem::take(&mut *self.workers.lock());

        let drained = tokio::time::timeout(drain_timeout, join_all(workers.iter_mut()))
            .await
            .is_ok();
        if !drained {
            warn!(workers = workers.len(), "drain timed out; aborting workers");
            for worker in &workers {
                worker.abort();
            }
        }
        drained
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().iter() {
            worker.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
