//! Wire-compatible message bodies carried over the broker.
//!
//! Three shapes travel between services: [`Request`] (sent to a service's
//! request queue), [`Response`] (sent back to the caller's reply queue) and
//! [`Event`] (published to a service's event exchange). All of them use named
//! `MsgPack` serialization (`rmp_serde::to_vec_named()`) with `snake_case`
//! field names, and the `data` payload is encoded as a `MsgPack` binary so the
//! bytes a caller sends are exactly the bytes the receiver sees.

pub mod method;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use method::RequestMethod;

/// Content type used by the JSON helpers.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type for plain-text payloads.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Errors from encoding or decoding broker message bodies.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode message body: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message body: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes a message body as a named `MsgPack` map.
///
/// # Errors
///
/// Returns `WireError::Encode` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

/// Deserializes a message body produced by [`encode`].
///
/// # Errors
///
/// Returns `WireError::Decode` if the bytes are not a valid body of type `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// An RPC request addressed to another service's request queue.
///
/// The correlation token and reply destination are transport properties and
/// are not part of the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: RequestMethod,
    pub uri: String,
    /// Name of the service that sent the request. Empty when unknown.
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(with = "serde_bytes", default)]
    pub data: Vec<u8>,
}

impl Request {
    /// Creates a request without a payload.
    #[must_use]
    pub fn new(method: RequestMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            publisher: String::new(),
            data_type: String::new(),
            data: Vec::new(),
        }
    }

    /// Creates a request carrying raw payload bytes.
    #[must_use]
    pub fn with_data(
        method: RequestMethod,
        uri: impl Into<String>,
        data_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            data,
            ..Self::new(method, uri)
        }
    }

    /// Creates a request whose payload is `body` encoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Json` if `body` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(
        method: RequestMethod,
        uri: impl Into<String>,
        body: &T,
    ) -> Result<Self, WireError> {
        Ok(Self::with_data(
            method,
            uri,
            CONTENT_TYPE_JSON,
            serde_json::to_vec(body)?,
        ))
    }

    /// Sets the publisher name.
    #[must_use]
    pub fn from_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }

    /// Decodes the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Json` if the payload is not valid JSON for `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Reply to a [`Request`]. Failures are carried in `status_code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status_code: u16,
    #[serde(default)]
    pub data_type: String,
    #[serde(with = "serde_bytes", default)]
    pub data: Vec<u8>,
}

impl Response {
    /// A response with a status code and no payload.
    #[must_use]
    pub fn status(status_code: u16) -> Self {
        Self {
            status_code,
            data_type: String::new(),
            data: Vec::new(),
        }
    }

    /// A response carrying `body` encoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Json` if `body` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(status_code: u16, body: &T) -> Result<Self, WireError> {
        Ok(Self {
            status_code,
            data_type: CONTENT_TYPE_JSON.to_string(),
            data: serde_json::to_vec(body)?,
        })
    }

    /// Returns `true` for 2xx status codes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Decodes the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Json` if the payload is not valid JSON for `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A one-way domain event published to a service's event exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub publisher: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(with = "serde_bytes", default)]
    pub data: Vec<u8>,
}

impl Event {
    /// Creates an event carrying raw payload bytes.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        publisher: impl Into<String>,
        data_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            publisher: publisher.into(),
            data_type: data_type.into(),
            data,
        }
    }

    /// Creates an event whose payload is `body` encoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Json` if `body` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(
        event_type: impl Into<String>,
        publisher: impl Into<String>,
        body: &T,
    ) -> Result<Self, WireError> {
        Ok(Self::new(
            event_type,
            publisher,
            CONTENT_TYPE_JSON,
            serde_json::to_vec(body)?,
        ))
    }

    /// Decodes the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Json` if the payload is not valid JSON for `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}
