//! Request routing: an ordered table of `(method, URI pattern, handler)` entries.
//!
//! Entries are evaluated in insertion order and the first match wins. A
//! request that matches nothing produces a 404; the table never returns an
//! error, so every inbound request yields a [`Response`].

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use regex::Regex;
use relaybus_core::{Request, RequestContext, RequestMethod, Response, WireError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::Service;
use tracing::{debug, warn};
use uuid::Uuid;

/// Status codes produced by the dispatcher itself.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
}

// ---------------------------------------------------------------------------
// Handler errors
// ---------------------------------------------------------------------------

/// Failure reported by a route handler, converted to a status code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Payload could not be decoded or failed validation (400).
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Addressed resource does not exist (404).
    #[error("not found: {0}")]
    NotFound(String),
    /// Processing failed (500).
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn bad_request(msg: impl fmt::Display) -> Self {
        Self::BadRequest(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => status::BAD_REQUEST,
            Self::NotFound(_) => status::NOT_FOUND,
            Self::Internal(_) => status::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<WireError> for HandlerError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Encode(_) => Self::internal(e),
            WireError::Decode(_) | WireError::Json(_) => Self::bad_request(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Path parameters
// ---------------------------------------------------------------------------

/// Named captures of the matched URI pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    fn capture(pattern: &Regex, uri: &str) -> Self {
        let Some(caps) = pattern.captures(uri) else {
            return Self::default();
        };
        Self(
            pattern
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
                .collect(),
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parses a captured UUID.
    ///
    /// # Errors
    ///
    /// Returns `HandlerError::BadRequest` if the capture is missing or not a UUID.
    pub fn uuid(&self, name: &str) -> Result<Uuid, HandlerError> {
        let raw = self
            .get(name)
            .ok_or_else(|| HandlerError::bad_request(format!("missing path parameter {name}")))?;
        Uuid::parse_str(raw).map_err(|e| HandlerError::bad_request(format!("{name}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response, HandlerError>> + Send>>;

type BoxedHandler = Arc<dyn Fn(RequestContext, PathParams, Request) -> HandlerFuture + Send + Sync>;

/// One entry of the route table.
#[derive(Clone)]
pub struct Route {
    name: String,
    method: RequestMethod,
    pattern: Regex,
    handler: BoxedHandler,
}

impl Route {
    /// A route whose handler receives the raw request.
    ///
    /// `pattern` is a regular expression matched against the URI, e.g.
    /// `^/v1/transfers/(?P<id>[0-9a-f-]{36})$`. It is not implicitly anchored.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::InvalidPattern` if `pattern` does not compile.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        method: RequestMethod,
        pattern: &str,
        handler: F,
    ) -> Result<Self, RouteError>
    where
        F: Fn(RequestContext, PathParams, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let pattern = Regex::new(pattern).map_err(|source| RouteError::InvalidPattern {
            name: name.clone(),
            source,
        })?;
        let handler: BoxedHandler = Arc::new(
            move |ctx: RequestContext, params: PathParams, req: Request| -> HandlerFuture {
                Box::pin(handler(ctx, params, req))
            },
        );
        Ok(Self {
            name,
            method,
            pattern,
            handler,
        })
    }

    /// A route with a JSON body of type `T` and a JSON result of type `R`.
    ///
    /// The body is decoded before the handler runs; a decode failure yields
    /// 400 without invoking the handler. Success yields 200.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::InvalidPattern` if `pattern` does not compile.
    pub fn json<T, R, F, Fut>(
        name: impl Into<String>,
        method: RequestMethod,
        pattern: &str,
        handler: F,
    ) -> Result<Self, RouteError>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, PathParams, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(name, method, pattern, move |ctx, params, request: Request| {
            let handler = Arc::clone(&handler);
            async move {
                let body: T = request.decode_json()?;
                let value = handler(ctx, params, body).await?;
                Ok::<_, HandlerError>(Response::json(status::OK, &value)?)
            }
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn method(&self) -> &RequestMethod {
        &self.method
    }

    fn matches(&self, request: &Request) -> bool {
        self.method == request.method && self.pattern.is_match(&request.uri)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("pattern", &self.pattern.as_str())
            .finish_non_exhaustive()
    }
}

/// Errors raised while building a route table.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route {name}: invalid pattern: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

// ---------------------------------------------------------------------------
// Inbound / Dispatched
// ---------------------------------------------------------------------------

/// A request as it enters the dispatcher, with its transport metadata.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub request: Request,
    pub correlation_id: Option<String>,
}

impl From<Request> for Inbound {
    fn from(request: Request) -> Self {
        Self {
            request,
            correlation_id: None,
        }
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Name of the matched route; `None` when nothing matched.
    pub route: Option<String>,
    pub method: RequestMethod,
    pub response: Response,
}

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

/// Immutable, ordered route table. Cloning shares the routes.
#[derive(Clone, Debug)]
pub struct RouteTable {
    service: Arc<str>,
    routes: Arc<[Route]>,
}

impl RouteTable {
    #[must_use]
    pub fn builder(service: impl Into<String>) -> RouteTableBuilder {
        RouteTableBuilder {
            service: service.into(),
            routes: Vec::new(),
            error: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes `inbound` to the first matching handler.
    pub async fn dispatch(&self, inbound: Inbound) -> Dispatched {
        let Inbound {
            request,
            correlation_id,
        } = inbound;
        let method = request.method.clone();

        let Some(route) = self.routes.iter().find(|r| r.matches(&request)) else {
            debug!(service = %self.service, %method, uri = %request.uri, "no route matched");
            return Dispatched {
                route: None,
                method,
                response: Response::status(status::NOT_FOUND),
            };
        };

        let params = PathParams::capture(&route.pattern, &request.uri);
        let ctx = RequestContext::new(self.service.as_ref())
            .with_publisher(&request.publisher)
            .with_correlation_id(correlation_id);
        let request_id = ctx.request_id;

        let response = match (route.handler)(ctx, params, request).await {
            Ok(response) => response,
            Err(e) => {
                let code = e.status_code();
                if code >= status::INTERNAL_SERVER_ERROR {
                    warn!(route = %route.name, %request_id, error = %e, "handler failed");
                } else {
                    debug!(route = %route.name, %request_id, error = %e, "handler rejected request");
                }
                Response::status(code)
            }
        };

        Dispatched {
            route: Some(route.name.clone()),
            method,
            response,
        }
    }
}

impl Service<Inbound> for RouteTable {
    type Response = Dispatched;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Dispatched, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, inbound: Inbound) -> Self::Future {
        let table = self.clone();
        Box::pin(async move { Ok(table.dispatch(inbound).await) })
    }
}

// ---------------------------------------------------------------------------
// RouteTableBuilder
// ---------------------------------------------------------------------------

/// Collects routes in evaluation order.
///
/// Pattern errors are deferred to [`RouteTableBuilder::build`] so route
/// registration reads as one chain.
pub struct RouteTableBuilder {
    service: String,
    routes: Vec<Route>,
    error: Option<RouteError>,
}

impl RouteTableBuilder {
    #[must_use]
    pub fn add(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    #[must_use]
    pub fn route<F, Fut>(
        self,
        name: impl Into<String>,
        method: RequestMethod,
        pattern: &str,
        handler: F,
    ) -> Self
    where
        F: Fn(RequestContext, PathParams, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
    {
        let route = Route::new(name, method, pattern, handler);
        self.push(route)
    }

    #[must_use]
    pub fn json<T, R, F, Fut>(
        self,
        name: impl Into<String>,
        method: RequestMethod,
        pattern: &str,
        handler: F,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RequestContext, PathParams, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let route = Route::json(name, method, pattern, handler);
        self.push(route)
    }

    fn push(mut self, route: Result<Route, RouteError>) -> Self {
        match route {
            Ok(route) => self.routes.push(route),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
            }
        }
        self
    }

    /// Finishes the table.
    ///
    /// # Errors
    ///
    /// Returns the first `RouteError` raised while adding routes.
    pub fn build(self) -> Result<RouteTable, RouteError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok(RouteTable {
            service: self.service.into(),
            routes: self.routes.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
