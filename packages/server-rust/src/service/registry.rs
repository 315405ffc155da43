use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::config::NodeConfig;
use super::shutdown::ShutdownController;
use crate::metrics::MetricsRegistry;
use crate::traits::Transport;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Shared node resources handed to services when they start.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<NodeConfig>,
    pub transport: Arc<dyn Transport>,
    pub metrics: Arc<MetricsRegistry>,
    pub shutdown: Arc<ShutdownController>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed component of a node (listen handler, subscriber, ...).
///
/// Services are started in registration order and shut down in reverse
/// registration order. The `Any` bound enables type-based lookup via
/// `ServiceRegistry::get::<T>()`.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Returns the unique name of this service (e.g., `"listen"`).
    fn name(&self) -> &'static str;

    /// Declare broker resources and start background loops.
    async fn start(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Stop background loops. If `terminate` is true, skip draining.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry for lifecycle-managed services.
///
/// Services can be looked up by `name()` or by concrete type.
pub struct ServiceRegistry {
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Registration order for deterministic start/shutdown sequencing.
    order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            by_type: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Register a service; registration order determines start/shutdown sequencing.
    pub fn register<T: ManagedService>(&self, service: T) -> Arc<T> {
        let arc = Arc::new(service);
        self.register_arc(Arc::clone(&arc));
        arc
    }

    /// Register a service that is already shared.
    pub fn register_arc<T: ManagedService>(&self, service: Arc<T>) {
        let name = service.name();
        if self.by_name.insert(name, service.clone()).is_some() {
            warn!(service = name, "service registered twice; replacing");
        } else {
            self.order.write().push(name);
        }
        self.by_type.insert(TypeId::of::<T>(), service);
    }

    /// Retrieve a service by its concrete type.
    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Retrieve a service by its name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.order.read().clone()
    }

    /// Start all registered services in registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if any service's `start()` call fails; later services
    /// are not started.
    pub async fn start_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        for name in self.names() {
            if let Some(service) = self.get_by_name(name) {
                service.start(ctx).await?;
                info!(service = name, "service started");
            }
        }
        Ok(())
    }

    /// Shut down all registered services in reverse registration order.
    ///
    /// Every service is asked to stop even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a service's `shutdown()`.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let mut first_error = None;
        for name in self.names().into_iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                if let Err(e) = service.shutdown(terminate).await {
                    warn!(service = name, error = %e, "service shutdown failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
