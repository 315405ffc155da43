//! Pipeline composition: wraps the route table in the middleware stack.

use std::convert::Infallible;
use std::sync::Arc;

use tower::util::BoxCloneSyncService;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use crate::metrics::MetricsRegistry;
use crate::service::router::{Dispatched, Inbound, RouteTable};

/// Type-erased, cloneable dispatch service.
pub type DispatchService = BoxCloneSyncService<Inbound, Dispatched, Infallible>;

/// Build the dispatch pipeline by wrapping the `RouteTable` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- record latency per (route, method)
///
/// The route table never fails, so neither does the pipeline.
#[must_use]
pub fn build_dispatch_pipeline(table: RouteTable, metrics: Arc<MetricsRegistry>) -> DispatchService {
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(MetricsLayer::new(metrics))
            .service(table),
    )
}
