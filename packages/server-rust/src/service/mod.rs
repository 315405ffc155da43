//! Request dispatch and node lifecycle.
//!
//! 1. **Routing** (`router`): ordered `(method, URI pattern, handler)` table
//! 2. **Middleware** (`middleware`): Tower layers around the route table
//! 3. **Consumption** (`consumer`): restartable consume loops
//! 4. **Workers** (`worker`): bounded pool for event handlers
//! 5. **Lifecycle** (`registry`, `shutdown`): managed services and draining
//! 6. **Domain services** (`domain`): transfers and webhook forwarding

pub mod config;
pub mod consumer;
pub mod domain;
pub mod middleware;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod worker;

// Re-export key types for convenient access.
pub use config::NodeConfig;
pub use consumer::ConsumeLoop;
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use router::{HandlerError, Inbound, PathParams, Route, RouteError, RouteTable};
pub use shutdown::{NodeState, ShutdownController, ShutdownSignal};
pub use worker::{Backpressure, PoolError, WorkerPool};
