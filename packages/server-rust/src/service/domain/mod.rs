//! Domain services built on the framework.
//!
//! `transfer` serves a small REST-like resource over the request queue and
//! publishes events; `webhook` turns notifications into outbound HTTP calls.

pub mod transfer;
pub mod webhook;

pub use transfer::{Address, Transfer, TransferCreate, TransferService, TransferType};
pub use webhook::{Forwarded, WebhookDestination, WebhookForwarder};
