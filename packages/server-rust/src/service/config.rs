use std::time::Duration;

use relaybus_core::{split_targets, Namespace};

use crate::service::worker::Backpressure;
use crate::transport::DEFAULT_PREFETCH;
use crate::webhook::WebhookConfig;

/// Per-node configuration for the request, event and webhook paths.
///
/// Controls naming, consumer prefetch, RPC timeouts, the event worker pool,
/// and how long consumption loops wait before restarting after a transport error.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Namespace shared by every cooperating service (e.g. `"bin-manager"`).
    pub namespace: String,
    /// Name of this service; determines its request/event/subscribe names.
    pub service_name: String,
    /// Maximum unacknowledged deliveries per consumer.
    pub prefetch: u16,
    /// Default timeout for outbound RPC calls in milliseconds.
    pub request_timeout_ms: u64,
    /// Comma-separated event exchanges the subscribe queue binds to.
    pub subscribe_targets: String,
    /// Number of concurrent event handler workers.
    pub event_workers: usize,
    /// Capacity of the event task queue in front of the workers.
    pub event_queue_capacity: usize,
    /// What the subscriber does when the task queue is full.
    pub backpressure: Backpressure,
    /// Pause before a consumption loop restarts after a transport error, in milliseconds.
    pub consume_restart_delay_ms: u64,
    /// How long shutdown waits for in-flight event handlers, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Service that receives `POST /v1/webhooks` from the notify publisher.
    pub webhook_service: String,
    pub webhook: WebhookConfig,
}

impl NodeConfig {
    /// Convenience constructor with defaults for everything but the names.
    #[must_use]
    pub fn new(namespace: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.namespace.clone())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn consume_restart_delay(&self) -> Duration {
        Duration::from_millis(self.consume_restart_delay_ms)
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Parsed subscribe targets, blank entries removed.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        split_targets(&self.subscribe_targets)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            namespace: "bin-manager".to_string(),
            service_name: String::new(),
            prefetch: DEFAULT_PREFETCH,
            request_timeout_ms: 3_000,
            subscribe_targets: String::new(),
            event_workers: 16,
            event_queue_capacity: 256,
            backpressure: Backpressure::Block,
            consume_restart_delay_ms: 1_000,
            drain_timeout_ms: 5_000,
            webhook_service: "webhook-manager".to_string(),
            webhook: WebhookConfig::default(),
        }
    }
}
