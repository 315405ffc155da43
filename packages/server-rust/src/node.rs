//! `RelayNode`: wires one service's handlers onto a transport.
//!
//! Construction only assembles components. [`RelayNode::start`] declares the
//! event exchange, connects the RPC client and starts the registered
//! services; [`RelayNode::shutdown`] stops consumers in reverse order and
//! waits for in-flight work.

use std::sync::Arc;

use anyhow::Context as _;
use arc_swap::ArcSwapOption;
use tracing::{info, warn};

use crate::listen::ListenHandler;
use crate::metrics::MetricsRegistry;
use crate::notify::NotifyHandler;
use crate::rpc::RpcClient;
use crate::service::config::NodeConfig;
use crate::service::registry::{ServiceContext, ServiceRegistry};
use crate::service::router::RouteTable;
use crate::service::shutdown::{NodeState, ShutdownController};
use crate::subscribe::{EventRouter, SubscribeHandler};
use crate::traits::Transport;

pub struct RelayNode {
    config: Arc<NodeConfig>,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsRegistry>,
    shutdown: Arc<ShutdownController>,
    registry: ServiceRegistry,
    notify: Arc<NotifyHandler>,
    rpc: ArcSwapOption<RpcClient>,
}

impl RelayNode {
    #[must_use]
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let notify = Arc::new(NotifyHandler::new(
            Arc::clone(&transport),
            &config,
            Arc::clone(&metrics),
        ));
        Self {
            config: Arc::new(config),
            transport,
            metrics,
            shutdown: Arc::new(ShutdownController::new()),
            registry: ServiceRegistry::new(),
            notify,
            rpc: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Publisher for this service's events. Usable once the node has started.
    #[must_use]
    pub fn notify(&self) -> Arc<NotifyHandler> {
        Arc::clone(&self.notify)
    }

    /// Serves `table` on this service's request queue.
    #[must_use]
    pub fn with_routes(self, table: RouteTable) -> Self {
        self.registry.register(ListenHandler::new(
            Arc::clone(&self.transport),
            &self.config,
            table,
            Arc::clone(&self.metrics),
        ));
        self
    }

    /// Consumes events from the configured subscribe targets.
    #[must_use]
    pub fn with_events(self, router: EventRouter) -> Self {
        self.registry.register(SubscribeHandler::new(
            Arc::clone(&self.transport),
            &self.config,
            router,
            Arc::clone(&self.metrics),
        ));
        self
    }

    /// # Errors
    ///
    /// Returns an error if a broker resource cannot be declared or a service
    /// fails to start.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.notify
            .declare()
            .await
            .context("declaring event exchange")?;
        let rpc = RpcClient::connect(
            Arc::clone(&self.transport),
            &self.config,
            Arc::clone(&self.metrics),
        )
        .await
        .context("connecting rpc client")?;
        self.rpc.store(Some(rpc));

        let ctx = ServiceContext {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            metrics: Arc::clone(&self.metrics),
            shutdown: Arc::clone(&self.shutdown),
        };
        self.registry.start_all(&ctx).await?;
        self.shutdown.mark_ready();
        info!(
            service = %self.config.service_name,
            services = ?self.registry.names(),
            "relay node ready"
        );
        Ok(())
    }

    /// RPC client bound to this node's reply queue; `None` before `start`.
    #[must_use]
    pub fn rpc(&self) -> Option<Arc<RpcClient>> {
        self.rpc.load_full()
    }

    #[must_use]
    pub fn state(&self) -> NodeState {
        self.shutdown.state()
    }

    /// Stops consuming, waits up to the drain timeout for in-flight work and
    /// closes the RPC client.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a service while stopping.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!(service = %self.config.service_name, "relay node draining");
        self.shutdown.trigger();
        let stopped = self.registry.shutdown_all(false).await;

        if !self.shutdown.drain(self.config.drain_timeout()).await {
            warn!(in_flight = self.shutdown.in_flight(), "drain timed out");
        }
        if let Some(rpc) = self.rpc.swap(None) {
            rpc.close().await;
        }
        info!(service = %self.config.service_name, state = self.state().as_str(), "relay node stopped");
        stopped
    }
}
