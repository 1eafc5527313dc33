//! Interception hook protocol.
//!
//! For every admitted request and every upstream response the proxy hands a
//! read-only view to the configured [`InterceptionHook`]. Returning
//! `Some(InterceptionResult)` replaces the message with a synthesized
//! response; `None` lets it continue unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{CONTENT_LENGTH, HeaderName};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Bytes;
use tracing::error;

/// Read view of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestView {
    /// Address of the client that sent the request.
    pub client_addr: SocketAddr,
    pub method: Method,
    pub uri: Uri,
    /// Literal `Host` value the request targets (may include a port).
    pub host: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RequestView {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }
}

/// Read view of a real upstream response, with the request that caused it.
#[derive(Debug, Clone)]
pub struct ResponseView {
    pub request: Arc<RequestView>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Synthetic response produced by a hook.
#[derive(Debug, Clone)]
pub struct InterceptionResult {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl InterceptionResult {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Sets a header, replacing any previous value for the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Size of the synthesized payload in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// Builds the HTTP response sent back to the client.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let size = self.body.len();
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(size));
        response
    }
}

/// Pluggable interception logic.
///
/// Calls are synchronous: the proxy suspends the triggering request/response
/// cycle until the hook returns, and runs it off the async workers so a slow
/// hook only stalls its own connection.
pub trait InterceptionHook: Send + Sync {
    /// Inspects a request before it is forwarded.
    fn on_request(&self, request: &RequestView) -> Option<InterceptionResult>;

    /// Inspects the real upstream response before it reaches the client.
    fn on_response(&self, response: &ResponseView) -> Option<InterceptionResult>;
}

pub(crate) async fn run_request_hook(
    hook: &Arc<dyn InterceptionHook>,
    request: &Arc<RequestView>,
) -> Option<InterceptionResult> {
    let hook = Arc::clone(hook);
    let request = Arc::clone(request);
    tokio::task::spawn_blocking(move || hook.on_request(&request))
        .await
        .unwrap_or_else(|e| {
            error!("request hook failed: {}", e);
            None
        })
}

pub(crate) async fn run_response_hook(
    hook: &Arc<dyn InterceptionHook>,
    response: &Arc<ResponseView>,
) -> Option<InterceptionResult> {
    let hook = Arc::clone(hook);
    let response = Arc::clone(response);
    tokio::task::spawn_blocking(move || hook.on_response(&response))
        .await
        .unwrap_or_else(|e| {
            error!("response hook failed: {}", e);
            None
        })
}
