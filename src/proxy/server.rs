//! Interception proxy server.
//!
//! Every accepted connection runs in its own task and is served by hyper's
//! auto builder. Plain requests go through the interception pipeline:
//! admission, request hook, upstream forwarding, response hook. `CONNECT`
//! requests are answered with `200`, upgraded, TLS-terminated with a minted
//! certificate and served by the same pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{self, HOST, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::admission::{Rejection, check_host, effective_host};
use super::hook::{
    InterceptionHook, InterceptionResult, RequestView, ResponseView, run_request_hook,
    run_response_hook,
};
use super::tls::{TlsAcceptor, TlsMaterial};
use super::upstream::{Scheme, Upstream};
use crate::ca::CertCache;
use crate::events::{EventData, EventSink, InterceptionEvent, SPOOFED_RESPONSE};

/// Longest a client may take to complete a TLS handshake or a CONNECT
/// upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that only describe a single hop and are never relayed.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Observable state of the listener task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Listening(SocketAddr),
    Failed(String),
    Closed,
}

/// Shutdown phase broadcast to connection tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Finish the in-flight exchange, then close.
    Draining,
    /// Grace period is over; drop the connection now.
    Closed,
}

/// Collaborators shared by all connections of one listener.
pub(crate) struct ProxyCore {
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) hook: Option<Arc<dyn InterceptionHook>>,
    pub(crate) upstream: Upstream,
    pub(crate) cert_cache: Arc<CertCache>,
}

/// Listener parameters.
pub(crate) struct ListenerSpec {
    pub(crate) addr: SocketAddr,
    pub(crate) tls: Option<TlsMaterial>,
    pub(crate) grace: Duration,
}

/// Per-connection data handed to the request service.
#[derive(Clone)]
struct ConnectionContext {
    peer_addr: SocketAddr,
    scheme: Scheme,
    default_port: u16,
    phase: watch::Receiver<Phase>,
    /// Keeps the listener's drain wait pending while the connection lives.
    _guard: mpsc::Sender<()>,
}

/// Runs the listener until `stop` fires (or its sender is dropped), then
/// drains connections for at most `settings.grace`.
///
/// Failures to load TLS material or to bind are logged and published on
/// `status`; they never escape the task.
pub(crate) async fn serve(
    core: Arc<ProxyCore>,
    settings: ListenerSpec,
    status: watch::Sender<ListenerState>,
    mut stop: oneshot::Receiver<()>,
) {
    let acceptor = match &settings.tls {
        Some(material) => match material.acceptor() {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                warn!("failed to load TLS material: {}", e);
                status.send_replace(ListenerState::Failed(e.to_string()));
                return;
            }
        },
        None => None,
    };

    let listener = match TcpListener::bind(settings.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("failed to bind proxy on {}: {}", settings.addr, e);
            status.send_replace(ListenerState::Failed(e.to_string()));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("failed to read proxy address: {}", e);
            status.send_replace(ListenerState::Failed(e.to_string()));
            return;
        }
    };

    let scheme = if acceptor.is_some() {
        Scheme::Https
    } else {
        Scheme::Http
    };
    info!("proxy listening on {} ({:?})", local_addr, scheme);
    status.send_replace(ListenerState::Listening(local_addr));

    let (phase_tx, phase_rx) = watch::channel(Phase::Running);
    let (guard_tx, mut guard_rx) = mpsc::channel::<()>(1);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept connection: {}", e);
                        continue;
                    }
                };
                debug!("accepted connection from {}", peer_addr);

                let ctx = ConnectionContext {
                    peer_addr,
                    scheme,
                    default_port: scheme.default_port(),
                    phase: phase_rx.clone(),
                    _guard: guard_tx.clone(),
                };
                let core = Arc::clone(&core);
                let acceptor = acceptor.clone();

                tokio::spawn(async move {
                    let Some(acceptor) = acceptor else {
                        return serve_connection(core, ctx, stream).await;
                    };
                    match handshake(&ctx.phase, acceptor.accept(stream)).await {
                        Some(Ok((tls_stream, _))) => serve_connection(core, ctx, tls_stream).await,
                        Some(Err(e)) => debug!("TLS handshake with {} failed: {}", peer_addr, e),
                        None => debug!("TLS handshake with {} abandoned", peer_addr),
                    }
                });
            }
        }
    }

    drop(listener);
    info!("proxy on {} shutting down", local_addr);

    let _ = phase_tx.send(Phase::Draining);
    drop(guard_tx);
    if tokio::time::timeout(settings.grace, guard_rx.recv()).await.is_err() {
        warn!("connections still open after {:?}, closing them", settings.grace);
        let _ = phase_tx.send(Phase::Closed);
    }

    status.send_replace(ListenerState::Closed);
}

/// Drives a connection setup step until it completes, [`HANDSHAKE_TIMEOUT`]
/// elapses or shutdown reaches [`Phase::Closed`]; `None` in the latter two
/// cases.
async fn handshake<F, T>(phase: &watch::Receiver<Phase>, step: F) -> Option<T>
where
    F: Future<Output = T>,
{
    let mut phase = phase.clone();
    tokio::select! {
        result = tokio::time::timeout(HANDSHAKE_TIMEOUT, step) => result.ok(),
        _ = phase.wait_for(|phase| *phase == Phase::Closed) => None,
    }
}

/// Serves HTTP on one (possibly decrypted) stream until the peer goes away
/// or shutdown reaches it.
async fn serve_connection<IO>(core: Arc<ProxyCore>, ctx: ConnectionContext, io: IO)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer_addr = ctx.peer_addr;
    let mut phase = ctx.phase.clone();

    let service = service_fn(move |req: Request<Incoming>| {
        let core = Arc::clone(&core);
        let ctx = ctx.clone();
        async move { handle(core, ctx, req).await }
    });

    let builder = ServerBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    match *phase.borrow_and_update() {
        Phase::Running => {}
        Phase::Draining => conn.as_mut().graceful_shutdown(),
        Phase::Closed => return,
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("connection from {} ended with error: {}", peer_addr, e);
                }
                return;
            }
            changed = phase.changed() => {
                let current = match changed {
                    Ok(()) => *phase.borrow_and_update(),
                    Err(_) => Phase::Closed,
                };
                match current {
                    Phase::Running => {}
                    Phase::Draining => conn.as_mut().graceful_shutdown(),
                    Phase::Closed => {
                        debug!("dropping connection from {}", peer_addr);
                        return;
                    }
                }
            }
        }
    }
}

async fn handle(
    core: Arc<ProxyCore>,
    ctx: ConnectionContext,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Rejection> {
    if req.method() == Method::CONNECT {
        return Ok(open_tunnel(core, ctx, req));
    }
    intercept(&core, &ctx, req).await
}

/// Accepts a `CONNECT` and intercepts the tunnel once the client upgrades.
fn open_tunnel(
    core: Arc<ProxyCore>,
    ctx: ConnectionContext,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let Some(authority) = req.uri().authority().cloned() else {
        warn!("CONNECT without authority from {}", ctx.peer_addr);
        return error_response(StatusCode::BAD_REQUEST, "CONNECT target missing");
    };

    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let ctx = ConnectionContext {
        scheme: Scheme::Https,
        default_port: authority.port_u16().unwrap_or(Scheme::Https.default_port()),
        ..ctx
    };
    debug!("CONNECT {} from {}", authority, ctx.peer_addr);

    tokio::spawn(async move {
        let upgraded = match handshake(&ctx.phase, hyper::upgrade::on(req)).await {
            Some(Ok(upgraded)) => upgraded,
            Some(Err(e)) => {
                debug!("CONNECT upgrade failed: {}", e);
                return;
            }
            None => {
                debug!("CONNECT upgrade from {} abandoned", ctx.peer_addr);
                return;
            }
        };

        let acceptor = TlsAcceptor::for_tunnel(Arc::clone(&core.cert_cache), host);
        match handshake(&ctx.phase, acceptor.accept(TokioIo::new(upgraded))).await {
            Some(Ok((tls_stream, sni))) => {
                debug!("tunnel from {} decrypted (SNI {:?})", ctx.peer_addr, sni);
                serve_connection(core, ctx, tls_stream).await;
            }
            Some(Err(e)) => debug!("tunnel TLS handshake failed: {}", e),
            None => debug!("tunnel TLS handshake from {} abandoned", ctx.peer_addr),
        }
    });

    Response::new(Full::new(Bytes::new()))
}

/// One request/response cycle through the hooks and the upstream.
async fn intercept(
    core: &ProxyCore,
    ctx: &ConnectionContext,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Rejection> {
    let host = effective_host(&req);
    if let Err(rejection) = check_host(&host) {
        error!("{} (from {})", rejection, ctx.peer_addr);
        return Err(rejection);
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read request body from {}: {}", ctx.peer_addr, e);
            return Ok(error_response(StatusCode::BAD_REQUEST, "unreadable body"));
        }
    };

    let request = Arc::new(RequestView {
        client_addr: ctx.peer_addr,
        method: parts.method,
        uri: parts.uri,
        host,
        headers: parts.headers,
        body,
    });
    debug!("{} {}{}", request.method, request.host, request.path());

    if let Some(hook) = &core.hook
        && let Some(result) = run_request_hook(hook, &request).await
    {
        return Ok(spoof(core, &request, result));
    }

    let upstream_req = match upstream_request(&request) {
        Ok(upstream_req) => upstream_req,
        Err(e) => {
            warn!("cannot forward request for {}: {}", request.host, e);
            return Ok(error_response(StatusCode::BAD_REQUEST, "invalid request"));
        }
    };

    let response = match core
        .upstream
        .send(ctx.scheme, &request.host, ctx.default_port, upstream_req)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            error!("upstream {} failed: {}", request.host, e);
            return Ok(error_response(
                StatusCode::BAD_GATEWAY,
                format!("upstream error: {}", e),
            ));
        }
    };

    let (mut parts, body) = response.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!("failed to read response from {}: {}", request.host, e);
            return Ok(error_response(
                StatusCode::BAD_GATEWAY,
                "upstream response incomplete",
            ));
        }
    };

    if let Some(hook) = &core.hook {
        let view = Arc::new(ResponseView {
            request: Arc::clone(&request),
            status: parts.status,
            headers: parts.headers.clone(),
            body: body.clone(),
        });
        if let Some(result) = run_response_hook(hook, &view).await {
            return Ok(spoof(core, &request, result));
        }
    }

    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Full::new(body)))
}

/// Rewrites the client request for the upstream: origin-form target,
/// literal `Host`, per-hop headers removed.
fn upstream_request(request: &RequestView) -> Result<Request<Full<Bytes>>, http::Error> {
    let target = request
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    headers.insert(HOST, HeaderValue::from_str(&request.host)?);

    let mut upstream_req = Request::builder()
        .method(request.method.clone())
        .uri(target)
        .body(Full::new(request.body.clone()))?;
    *upstream_req.headers_mut() = headers;
    Ok(upstream_req)
}

/// Records the interception and turns the hook result into the response.
fn spoof(
    core: &ProxyCore,
    request: &RequestView,
    result: InterceptionResult,
) -> Response<Full<Bytes>> {
    let event = InterceptionEvent {
        to: request.client_addr.ip().to_string(),
        method: request.method.to_string(),
        host: request.host.clone(),
        path: request.path().to_string(),
        size: result.size(),
    };
    core.events.add(SPOOFED_RESPONSE, EventData::Interception(event));
    result.into_response()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers nominated by `Connection` are per-hop too.
    let nominated: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in nominated.iter().chain(HOP_BY_HOP) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

fn error_response(status: StatusCode, message: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(message.into()));
    *response.status_mut() = status;
    response
}
