//! Metrics middleware for the request dispatcher.
//!
//! Records the wall-clock duration of every dispatch in the
//! `<ns>_receive_request_process_time` histogram, labeled by route name and
//! method. Unmatched requests are labeled `type="notfound"`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{debug_span, Instrument};

use crate::metrics::{MetricsRegistry, RECEIVE_REQUEST_PROCESS_TIME};
use crate::service::router::{Dispatched, Inbound};

/// Route label used when no route matched.
pub const NOT_FOUND_ROUTE: &str = "notfound";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that times each dispatch into the metrics registry.
#[derive(Debug, Clone)]
pub struct MetricsLayer {
    metrics: Arc<MetricsRegistry>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records dispatch latency per (route, method).
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: Arc<MetricsRegistry>,
}

impl<S> Service<Inbound> for MetricsService<S>
where
    S: Service<Inbound, Response = Dispatched, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Dispatched;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inbound: Inbound) -> Self::Future {
        let span = debug_span!(
            "dispatch",
            method = %inbound.request.method,
            uri = %inbound.request.uri,
        );
        let metrics = Arc::clone(&self.metrics);
        let fut = self.inner.call(inbound);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

                if let Ok(dispatched) = &result {
                    let route = dispatched.route.as_deref().unwrap_or(NOT_FOUND_ROUTE);
                    metrics
                        .histogram(
                            RECEIVE_REQUEST_PROCESS_TIME,
                            &[("type", route), ("method", dispatched.method.as_str())],
                        )
                        .record(elapsed_ms);
                    tracing::debug!(
                        route,
                        status = dispatched.response.status_code,
                        elapsed_ms,
                        "request dispatched"
                    );
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
