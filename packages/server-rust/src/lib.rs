//! relaybus server: RPC over a message broker, event fan-out and webhook
//! delivery for a family of cooperating services.
//!
//! Every service owns a request queue (`<ns>.<svc>.request`), an event
//! exchange (`<ns>.<svc>.event`) and a subscribe queue
//! (`<ns>.<svc>.subscribe`). [`RelayNode`] wires the handlers for one
//! service onto a [`Transport`].

pub mod listen;
pub mod metrics;
pub mod node;
pub mod notify;
pub mod rpc;
pub mod service;
pub mod subscribe;
pub mod traits;
pub mod transport;
pub mod webhook;

pub use listen::ListenHandler;
pub use metrics::MetricsRegistry;
pub use node::RelayNode;
pub use notify::{NotifyError, NotifyHandler};
pub use rpc::{RpcClient, RpcError};
pub use subscribe::{EventRouter, SubscribeHandler};
pub use traits::{DeliveryHandler, Transport};
pub use transport::{MemoryBroker, TransportError};
pub use webhook::{WebhookClient, WebhookConfig, WebhookError, WebhookJob};
