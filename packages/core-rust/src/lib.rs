//! relaybus core: request/response/event wire types, `MsgPack` codec, and
//! queue/exchange naming shared by every service on the bus.

pub mod context;
pub mod messages;
pub mod naming;
pub mod types;

pub use context::RequestContext;
pub use messages::{
    decode, encode, Event, Request, RequestMethod, Response, WireError, CONTENT_TYPE_JSON,
    CONTENT_TYPE_TEXT,
};
pub use naming::{split_targets, Namespace, Role};
pub use types::Owned;
