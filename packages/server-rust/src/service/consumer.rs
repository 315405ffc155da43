//! Supervised consumption loop shared by the listen, subscribe and reply consumers.
//!
//! A transport error ends one `consume` call; the loop logs it, waits for the
//! restart delay and consumes again until shutdown is signalled. Individual
//! messages are never retried here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::shutdown::ShutdownSignal;
use crate::traits::{DeliveryHandler, Transport};
use crate::transport::{ConsumeOptions, QueueOptions};

pub struct ConsumeLoop {
    pub transport: Arc<dyn Transport>,
    pub queue: String,
    pub options: ConsumeOptions,
    pub handler: Arc<dyn DeliveryHandler>,
    pub restart_delay: Duration,
    /// Redeclare the queue before each attempt (needed for auto-delete queues,
    /// which vanish when their consumer drops).
    pub redeclare: Option<QueueOptions>,
}

impl ConsumeLoop {
    /// Consumes until `shutdown` fires. Returns the number of restarts.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> u64 {
        let mut restarts = 0_u64;
        loop {
            if shutdown.is_triggered() {
                break;
            }

            let attempt = async {
                if let Some(options) = self.redeclare {
                    self.transport.declare_queue(&self.queue, options).await?;
                }
                self.transport
                    .consume(&self.queue, self.options.clone(), Arc::clone(&self.handler))
                    .await
            };

            tokio::select! {
                result = attempt => {
                    if let Err(e) = result {
                        warn!(queue = %self.queue, error = %e, "consume failed; restarting");
                    } else {
                        warn!(queue = %self.queue, "consume ended; restarting");
                    }
                }
                () = shutdown.triggered() => break,
            }

            restarts += 1;
            tokio::select! {
                () = tokio::time::sleep(self.restart_delay) => {}
                () = shutdown.triggered() => break,
            }
        }
        info!(queue = %self.queue, restarts, "consume loop stopped");
        restarts
    }
}
