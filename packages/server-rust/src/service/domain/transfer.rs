//! Call transfer resource.
//!
//! `POST /v1/transfers` creates a transfer and publishes `transfer_created`;
//! `GET /v1/transfers/<id>` reads it back. Records live in memory.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use relaybus_core::{Owned, RequestMethod, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::notify::NotifyHandler;
use crate::service::router::{status, HandlerError, RouteError, RouteTable, RouteTableBuilder};

pub const EVENT_TRANSFER_CREATED: &str = "transfer_created";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Blind,
    Attended,
}

/// A dialable destination such as `{"type":"tel","target":"+821100000001"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Body of `POST /v1/transfers`.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferCreate {
    #[serde(rename = "type")]
    pub transfer_type: TransferType,
    pub transferer_call_id: Uuid,
    pub transferee_addresses: Vec<Address>,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
}

impl TransferCreate {
    fn validate(&self) -> Result<(), HandlerError> {
        if self.transferee_addresses.is_empty() {
            return Err(HandlerError::bad_request("transferee_addresses is empty"));
        }
        if let Some(address) = self
            .transferee_addresses
            .iter()
            .find(|a| a.target.trim().is_empty())
        {
            return Err(HandlerError::bad_request(format!(
                "transferee address of type {:?} has no target",
                address.kind
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub customer_id: Uuid,
    #[serde(rename = "type")]
    pub transfer_type: TransferType,
    pub transferer_call_id: Uuid,
    pub transferee_addresses: Vec<Address>,
    /// Creation time in milliseconds since the Unix epoch.
    pub tm_create: u64,
}

impl Owned for Transfer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn tenant_id(&self) -> Uuid {
        self.customer_id
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// TransferService
// ---------------------------------------------------------------------------

/// In-memory transfer store exposed through a route table.
pub struct TransferService {
    transfers: DashMap<Uuid, Transfer>,
    notify: Option<Arc<NotifyHandler>>,
}

impl TransferService {
    #[must_use]
    pub fn new(notify: Option<Arc<NotifyHandler>>) -> Arc<Self> {
        Arc::new(Self {
            transfers: DashMap::new(),
            notify,
        })
    }

    /// Validates and stores a transfer, then announces it.
    ///
    /// Event publishing is best effort; the transfer exists even if the
    /// announcement fails.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::BadRequest` if the request is invalid.
    pub async fn create(&self, req: TransferCreate) -> Result<Transfer, HandlerError> {
        req.validate()?;
        let transfer = Transfer {
            id: Uuid::new_v4(),
            customer_id: req.customer_id.unwrap_or_default(),
            transfer_type: req.transfer_type,
            transferer_call_id: req.transferer_call_id,
            transferee_addresses: req.transferee_addresses,
            tm_create: now_ms(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        info!(id = %transfer.id, transfer_type = ?transfer.transfer_type, "transfer created");

        if let Some(notify) = &self.notify {
            let published = if transfer.customer_id.is_nil() {
                notify.publish_json(EVENT_TRANSFER_CREATED, &transfer).await
            } else {
                notify
                    .publish_webhook_event(transfer.customer_id, EVENT_TRANSFER_CREATED, &transfer)
                    .await
            };
            if let Err(e) = published {
                warn!(id = %transfer.id, error = %e, "failed to publish transfer_created");
            }
        }
        Ok(transfer)
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Transfer> {
        self.transfers.get(&id).map(|t| t.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Adds the transfer routes to `builder`.
    #[must_use]
    pub fn register(self: &Arc<Self>, builder: RouteTableBuilder) -> RouteTableBuilder {
        let create = Arc::clone(self);
        let get = Arc::clone(self);
        builder
            .json(
                "transfers",
                RequestMethod::Post,
                "^/v1/transfers$",
                move |_, _, req: TransferCreate| {
                    let service = Arc::clone(&create);
                    async move { service.create(req).await }
                },
            )
            .route(
                "transfers/id",
                RequestMethod::Get,
                r"^/v1/transfers/(?P<id>[0-9a-fA-F-]{36})$",
                move |_, params, _| {
                    let service = Arc::clone(&get);
                    async move {
                        let id = params.uuid("id")?;
                        let transfer = service
                            .get(id)
                            .ok_or_else(|| HandlerError::not_found(format!("transfer {id}")))?;
                        Ok::<_, HandlerError>(Response::json(status::OK, &transfer)?)
                    }
                },
            )
    }

    /// A route table serving only transfers.
    ///
    /// # Errors
    ///
    /// Returns `RouteError` if a pattern fails to compile.
    pub fn route_table(self: &Arc<Self>, service: &str) -> Result<RouteTable, RouteError> {
        self.register(RouteTable::builder(service)).build()
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::Request;

    use super::*;
    use crate::service::router::Inbound;

    const CREATE_BODY: &str = r#"{"type":"blind","transferer_call_id":"550e8400-e29b-41d4-a716-446655440002","transferee_addresses":[{"type":"tel","target":"+821100000001"}]}"#;

    async fn send(table: &RouteTable, request: Request) -> Response {
        table.dispatch(Inbound::from(request)).await.response
    }

    fn post(body: &str) -> Request {
        Request::with_data(
            RequestMethod::Post,
            "/v1/transfers",
            relaybus_core::CONTENT_TYPE_JSON,
            body.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn create_returns_resource_with_id() {
        let service = TransferService::new(None);
        let table = service.route_table("transfer-manager").unwrap();

        let response = send(&table, post(CREATE_BODY)).await;
        assert_eq!(response.status_code, 200);
        let body: serde_json::Value = response.decode_json().unwrap();
        let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();
        assert_eq!(body["type"], "blind");

        let stored = service.get(id).unwrap();
        assert_eq!(stored.transferee_addresses[0].target, "+821100000001");
        assert!(stored.tenant_id().is_nil());
    }

    #[tokio::test]
    async fn malformed_json_is_400_and_nothing_is_created() {
        let service = TransferService::new(None);
        let table = service.route_table("transfer-manager").unwrap();

        let response = send(&table, post("{invalid json")).await;
        assert_eq!(response.status_code, 400);
        assert!(service.is_empty());
    }

    #[tokio::test]
    async fn empty_address_list_is_400() {
        let service = TransferService::new(None);
        let table = service.route_table("transfer-manager").unwrap();

        let body = r#"{"type":"attended","transferer_call_id":"550e8400-e29b-41d4-a716-446655440002","transferee_addresses":[]}"#;
        assert_eq!(send(&table, post(body)).await.status_code, 400);
        assert!(service.is_empty());
    }

    #[tokio::test]
    async fn unknown_endpoint_is_404() {
        let table = TransferService::new(None).route_table("transfer-manager").unwrap();
        let response = send(&table, Request::new(RequestMethod::Get, "/unknown/endpoint")).await;
        assert_eq!(response.status_code, 404);
    }

    #[tokio::test]
    async fn get_by_id() {
        let service = TransferService::new(None);
        let table = service.route_table("transfer-manager").unwrap();
        let created: Transfer = send(&table, post(CREATE_BODY)).await.decode_json().unwrap();

        let found = send(&table, Request::new(RequestMethod::Get, format!("/v1/transfers/{}", created.id))).await;
        assert_eq!(found.status_code, 200);
        assert_eq!(found.decode_json::<Transfer>().unwrap(), created);

        let missing = send(&table, Request::new(RequestMethod::Get, format!("/v1/transfers/{}", Uuid::new_v4()))).await;
        assert_eq!(missing.status_code, 404);
    }
}
