//! Upstream connections for forwarded requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use http::uri::Authority;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Scheme the original client used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream host: {0}")]
    InvalidHost(String),
    #[error("failed to resolve {0}")]
    Resolve(String),
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] std::io::Error),
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),
}

/// Connector sending requests to the host they were originally meant for.
pub struct Upstream {
    client_config: Arc<ClientConfig>,
    /// Static `host -> address` overrides consulted before DNS.
    overrides: HashMap<String, SocketAddr>,
}

impl Upstream {
    /// Creates an upstream connector trusting the webpki root set.
    pub fn new(overrides: HashMap<String, SocketAddr>) -> Self {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self::with_client_config(Arc::new(config), overrides)
    }

    /// Creates an upstream connector with a custom TLS client configuration.
    pub fn with_client_config(
        client_config: Arc<ClientConfig>,
        overrides: HashMap<String, SocketAddr>,
    ) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(host, addr)| (host.to_ascii_lowercase(), addr))
            .collect();
        Self {
            client_config,
            overrides,
        }
    }

    /// Sends `request` (origin-form URI, `Host` header set) to the server
    /// named by `host` and returns its response head and streaming body.
    pub async fn send(
        &self,
        scheme: Scheme,
        host: &str,
        default_port: u16,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let authority: Authority = host
            .parse()
            .map_err(|_| UpstreamError::InvalidHost(host.to_string()))?;
        let name = authority.host().trim_start_matches('[').trim_end_matches(']');
        let port = authority.port_u16().unwrap_or(default_port);

        let addr = self.resolve(name, port).await?;
        debug!("connecting to upstream {} ({})", host, addr);

        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(UpstreamError::Connect)?;

        match scheme {
            Scheme::Http => exchange(tcp_stream, request).await,
            Scheme::Https => {
                let server_name = ServerName::try_from(name.to_string())
                    .map_err(|_| UpstreamError::InvalidServerName(name.to_string()))?;
                let connector = TlsConnector::from(Arc::clone(&self.client_config));
                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(UpstreamError::TlsHandshake)?;
                debug!("upstream TLS connection established to {}", name);
                exchange(tls_stream, request).await
            }
        }
    }

    async fn resolve(&self, name: &str, port: u16) -> Result<SocketAddr, UpstreamError> {
        if let Some(addr) = self.overrides.get(&name.to_ascii_lowercase()) {
            return Ok(*addr);
        }

        lookup_host((name, port))
            .await
            .map_err(|_| UpstreamError::Resolve(name.to_string()))?
            .next()
            .ok_or_else(|| UpstreamError::Resolve(name.to_string()))
    }
}

/// Runs one HTTP/1.1 request/response exchange over `stream`.
async fn exchange<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("upstream connection closed with error: {}", e);
        }
    });

    Ok(sender.send_request(request).await?)
}
