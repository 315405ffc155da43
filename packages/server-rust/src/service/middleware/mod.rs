//! Tower middleware layers for the request dispatcher.
//!
//! - [`metrics`]: Per-route dispatch latency histogram
//! - [`pipeline`]: Composes the layers around the route table

pub mod metrics;
pub mod pipeline;

pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchService};
