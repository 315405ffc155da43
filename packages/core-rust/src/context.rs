use std::time::SystemTime;

use uuid::Uuid;

/// Per-request context created fresh for every dispatched request.
/// Threaded through route handlers for logging and tracing.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique identifier of this dispatch, used as a tracing field.
    pub request_id: Uuid,
    /// Name of the service handling the request.
    pub service: String,
    /// Name of the service that sent the request, if it identified itself.
    pub publisher: Option<String>,
    /// Correlation token of the originating RPC, when one was supplied.
    pub correlation_id: Option<String>,
    /// Wall-clock time at which the request entered the dispatcher.
    pub received_at: SystemTime,
}

impl RequestContext {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            service: service.into(),
            publisher: None,
            correlation_id: None,
            received_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: &str) -> Self {
        self.publisher = (!publisher.is_empty()).then(|| publisher.to_string());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}
