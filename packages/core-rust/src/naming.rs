//! Deterministic queue and exchange names.
//!
//! Names follow `<namespace>.<service>.<role>`; there is no discovery layer,
//! so a service is reachable only through these names. Every namespace also
//! owns a single `<namespace>.delay` exchange used for delayed redelivery.

use std::fmt;

use uuid::Uuid;

/// Role suffix of a service-owned queue or exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Queue on which a service receives RPC requests.
    Request,
    /// Exchange to which a service publishes events.
    Event,
    /// Queue on which a service receives events from other services.
    Subscribe,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Request => "request",
            Role::Event => "event",
            Role::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name builder for one namespace (e.g. `"bin-manager"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self(namespace.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<namespace>.<service>.<role>`
    #[must_use]
    pub fn name(&self, service: &str, role: Role) -> String {
        format!("{}.{service}.{role}", self.0)
    }

    #[must_use]
    pub fn request_queue(&self, service: &str) -> String {
        self.name(service, Role::Request)
    }

    #[must_use]
    pub fn event_exchange(&self, service: &str) -> String {
        self.name(service, Role::Event)
    }

    #[must_use]
    pub fn subscribe_queue(&self, service: &str) -> String {
        self.name(service, Role::Subscribe)
    }

    /// The namespace-wide delay exchange.
    #[must_use]
    pub fn delay_exchange(&self) -> String {
        format!("{}.delay", self.0)
    }

    /// A private reply queue name for one RPC client instance.
    #[must_use]
    pub fn reply_queue(&self, service: &str) -> String {
        format!("{}.{service}.reply.{}", self.0, Uuid::new_v4())
    }

    /// Prefix used for metric names (`bin-manager` -> `bin_manager`).
    #[must_use]
    pub fn metric_prefix(&self) -> String {
        self.0.replace(['-', '.'], "_")
    }
}

/// Splits a comma-separated list of exchange names, ignoring blank entries.
#[must_use]
pub fn split_targets(targets: &str) -> Vec<String> {
    targets
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
