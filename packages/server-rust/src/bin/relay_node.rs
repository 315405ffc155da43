//! Runs a transfer service and a webhook forwarder on an in-process broker.
//!
//! Transfers created over RPC are announced on the transfer service's event
//! exchange and forwarded to the `webhook_uri` in the payload, if any.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use relaybus_core::Namespace;
use relaybus_server::service::domain::webhook::DEFAULT_DEDUP_CAPACITY;
use relaybus_server::service::domain::{TransferService, WebhookForwarder};
use relaybus_server::service::{Backpressure, NodeConfig, RouteTable};
use relaybus_server::webhook::RetryScope;
use relaybus_server::{
    EventRouter, MemoryBroker, MetricsRegistry, RelayNode, Transport, WebhookClient,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "relay-node", about = "relaybus demo node")]
struct Args {
    /// Namespace prefix for every queue and exchange.
    #[arg(long, env = "RELAY_NAMESPACE", default_value = "bin-manager")]
    namespace: String,

    #[arg(long, env = "RELAY_SERVICE", default_value = "transfer-manager")]
    service: String,

    #[arg(long, env = "RELAY_WEBHOOK_SERVICE", default_value = "webhook-manager")]
    webhook_service: String,

    /// Maximum unacknowledged deliveries per consumer.
    #[arg(long, env = "RELAY_PREFETCH", default_value_t = 10)]
    prefetch: u16,

    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_MS", default_value_t = 3000)]
    request_timeout_ms: u64,

    #[arg(long, env = "RELAY_EVENT_WORKERS", default_value_t = 16)]
    event_workers: usize,

    /// Drop events instead of waiting when the worker pool is full.
    #[arg(long, env = "RELAY_REJECT_WHEN_SATURATED")]
    reject_when_saturated: bool,

    /// Retry only idempotent webhook methods.
    #[arg(long, env = "RELAY_WEBHOOK_IDEMPOTENT_ONLY")]
    webhook_idempotent_only: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "RELAY_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log as JSON lines.
    #[arg(long, env = "RELAY_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn config(&self, service: &str) -> NodeConfig {
        let mut config = NodeConfig::new(self.namespace.clone(), service);
        config.prefetch = self.prefetch;
        config.request_timeout_ms = self.request_timeout_ms;
        config.event_workers = self.event_workers;
        config.webhook_service.clone_from(&self.webhook_service);
        if self.reject_when_saturated {
            config.backpressure = Backpressure::Reject;
        }
        if self.webhook_idempotent_only {
            config.webhook.retry_scope = RetryScope::IdempotentOnly;
        }
        config
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn metrics(args: &Args, namespace: &Namespace) -> anyhow::Result<Arc<MetricsRegistry>> {
    let Some(addr) = args.metrics_addr else {
        return Ok(Arc::new(MetricsRegistry::new(namespace)));
    };
    let (recorder, exporter) = MetricsRegistry::builder()
        .with_http_listener(addr)
        .build()
        .context("building metrics exporter")?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "metrics exporter stopped");
        }
    });
    info!(%addr, "serving metrics");
    Ok(Arc::new(MetricsRegistry::from_recorder(namespace, recorder)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let broker: Arc<dyn Transport> = Arc::new(MemoryBroker::new());
    let metrics = metrics(&args, &Namespace::new(args.namespace.clone()))?;

    // Transfer service: serves /v1/transfers and publishes transfer_created.
    let node = RelayNode::new(args.config(&args.service), Arc::clone(&broker), Arc::clone(&metrics));
    let transfers = TransferService::new(Some(node.notify()));
    let node = node.with_routes(transfers.route_table(&args.service)?);

    // Webhook service: receives POST /v1/webhooks from every publisher and
    // also subscribes to the transfer service's events directly.
    let mut webhook_config = args.config(&args.webhook_service);
    webhook_config.subscribe_targets = Namespace::new(args.namespace.clone()).event_exchange(&args.service);
    let forwarder = WebhookForwarder::new(
        WebhookClient::new(webhook_config.webhook.clone())?,
        DEFAULT_DEDUP_CAPACITY,
    );
    let webhook_routes = forwarder
        .register(RouteTable::builder(args.webhook_service.clone()))
        .build()?;
    let webhook_events = forwarder
        .subscribe(EventRouter::builder(), "transfer_created")
        .build()?;
    let webhook_node = RelayNode::new(webhook_config, Arc::clone(&broker), Arc::clone(&metrics))
        .with_routes(webhook_routes)
        .with_events(webhook_events);

    webhook_node.start().await?;
    node.start().await?;
    info!(service = %args.service, namespace = %args.namespace, "relay node running; ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    let stop = async {
        node.shutdown().await?;
        webhook_node.shutdown().await
    };
    tokio::time::timeout(Duration::from_secs(30), stop)
        .await
        .context("shutdown timed out")??;
    Ok(())
}
