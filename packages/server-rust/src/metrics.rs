//! Explicit metrics registry handed to every component at construction.
//!
//! Wraps a Prometheus recorder without installing it globally, so each node
//! (and each test) owns an isolated set of series. Metric names are prefixed
//! with the namespace, e.g. `bin_manager_request_process_time`.

use metrics::{Counter, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use relaybus_core::Namespace;
use tracing::warn;

/// Latency of inbound requests handled by the dispatcher, labeled `type`, `method`.
pub const RECEIVE_REQUEST_PROCESS_TIME: &str = "receive_request_process_time";
/// Latency of outbound RPC calls, labeled `target`, `method`.
pub const REQUEST_PROCESS_TIME: &str = "request_process_time";
/// Events published, labeled `event_type`.
pub const EVENT_PUBLISH_TOTAL: &str = "event_publish_total";
/// Latency of subscriber event handlers, labeled `publisher`, `type`.
pub const SUBSCRIBE_EVENT_PROCESS_TIME: &str = "subscribe_event_process_time";
/// Events without a matching subscriber handler, labeled `publisher`, `type`.
pub const SUBSCRIBE_EVENT_UNHANDLED_TOTAL: &str = "subscribe_event_unhandled_total";

/// Histogram buckets in milliseconds.
pub const LATENCY_BUCKETS_MS: &[f64] = &[50.0, 100.0, 500.0, 1000.0, 3000.0];

pub struct MetricsRegistry {
    prefix: String,
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Creates a registry with its own, uninstalled recorder.
    #[must_use]
    pub fn new(namespace: &Namespace) -> Self {
        Self::from_recorder(namespace, Self::builder().build_recorder())
    }

    /// Prometheus builder preconfigured with the latency buckets.
    ///
    /// The binary uses this to attach an HTTP listener before building.
    #[must_use]
    pub fn builder() -> PrometheusBuilder {
        match PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("process_time".into()), LATENCY_BUCKETS_MS)
        {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "latency buckets rejected; falling back to summaries");
                PrometheusBuilder::new()
            }
        }
    }

    /// Wraps an already built recorder.
    #[must_use]
    pub fn from_recorder(namespace: &Namespace, recorder: PrometheusRecorder) -> Self {
        let handle = recorder.handle();
        let registry = Self {
            prefix: namespace.metric_prefix(),
            recorder,
            handle,
        };
        registry.describe();
        registry
    }

    fn describe(&self) {
        let histograms = [
            (RECEIVE_REQUEST_PROCESS_TIME, "Time spent dispatching inbound requests."),
            (REQUEST_PROCESS_TIME, "Round-trip time of outbound RPC calls."),
            (SUBSCRIBE_EVENT_PROCESS_TIME, "Time spent handling subscribed events."),
        ];
        for (name, help) in histograms {
            self.recorder.describe_histogram(
                KeyName::from(self.full_name(name)),
                Some(Unit::Milliseconds),
                help.into(),
            );
        }
        let counters = [
            (EVENT_PUBLISH_TOTAL, "Events published to the service exchange."),
            (SUBSCRIBE_EVENT_UNHANDLED_TOTAL, "Subscribed events with no handler."),
        ];
        for (name, help) in counters {
            self.recorder
                .describe_counter(KeyName::from(self.full_name(name)), None, help.into());
        }
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}_{name}", self.prefix)
    }

    fn key(&self, name: &str, labels: &[(&'static str, &str)]) -> Key {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(*k, (*v).to_string()))
            .collect();
        Key::from_parts(self.full_name(name), labels)
    }

    /// Returns the histogram for `name` with the given labels.
    #[must_use]
    pub fn histogram(&self, name: &str, labels: &[(&'static str, &str)]) -> Histogram {
        let metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));
        self.recorder
            .register_histogram(&self.key(name, labels), &metadata)
    }

    /// Returns the counter for `name` with the given labels.
    #[must_use]
    pub fn counter(&self, name: &str, labels: &[(&'static str, &str)]) -> Counter {
        let metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));
        self.recorder.register_counter(&self.key(name, labels), &metadata)
    }

    /// Prometheus text exposition of every series recorded so far.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
