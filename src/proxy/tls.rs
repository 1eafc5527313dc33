//! TLS termination and certificate resolution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tracing::debug;

use crate::ca::CertCache;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read certificate {}: {message}", path.display())]
    Certificate { path: PathBuf, message: String },
    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),
    #[error("failed to read private key {}: {message}", path.display())]
    PrivateKey { path: PathBuf, message: String },
    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Certificate and key files a TLS-terminating listener serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl TlsMaterial {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        TlsAcceptor::from_files(&self.cert_file, &self.key_file)
    }
}

/// TLS acceptor used either with a fixed certificate (transparent HTTPS
/// listener) or with certificates minted per host (CONNECT tunnels).
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Creates an acceptor serving the PEM certificate chain and key in the
    /// given files.
    pub fn from_files(cert_file: &Path, key_file: &Path) -> Result<Self, TlsError> {
        let certs = CertificateDer::pem_file_iter(cert_file)
            .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
            .map_err(|e| TlsError::Certificate {
                path: cert_file.to_path_buf(),
                message: e.to_string(),
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate(cert_file.to_path_buf()));
        }

        let key = PrivateKeyDer::from_pem_file(key_file).map_err(|e| TlsError::PrivateKey {
            path: key_file.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Creates an acceptor for one CONNECT tunnel.
    ///
    /// Certificates are minted for the client's SNI, or for `host` (the
    /// CONNECT target) when the client sends none.
    pub fn for_tunnel(cert_cache: Arc<CertCache>, host: String) -> Self {
        let resolver = Arc::new(CertResolver {
            cache: cert_cache,
            fallback_host: host,
        });
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        // HTTP/2 inside tunnels is not intercepted
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Accepts a TLS connection, performing the handshake.
    /// Returns the TLS stream and the SNI (if provided by client).
    pub async fn accept<IO>(
        &self,
        stream: IO,
    ) -> Result<(TlsStream<IO>, Option<String>), std::io::Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls_stream = self.inner.accept(stream).await?;
        let sni = tls_stream.get_ref().1.server_name().map(|s| s.to_string());

        debug!("TLS handshake completed, SNI: {:?}", sni);

        Ok((tls_stream, sni))
    }
}

/// Certificate resolver that mints certificates on demand.
struct CertResolver {
    cache: Arc<CertCache>,
    fallback_host: String,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("fallback_host", &self.fallback_host)
            .finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for CertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let host = client_hello.server_name().unwrap_or(&self.fallback_host);
        debug!("resolving certificate for {}", host);
        match self.cache.get_or_create(host) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::error!("failed to generate certificate for {}: {}", host, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["proxy.local".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn loads_pem_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path());
        assert!(TlsMaterial::new(cert, key).acceptor().is_ok());
    }

    #[test]
    fn missing_certificate_file() {
        let dir = tempfile::tempdir().unwrap();
        let (_, key) = write_self_signed(dir.path());
        let err = TlsAcceptor::from_files(&dir.path().join("missing.pem"), &key)
            .err()
            .unwrap();
        assert!(matches!(err, TlsError::Certificate { .. }));
    }

    #[test]
    fn file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let (_, key) = write_self_signed(dir.path());
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "not a certificate").unwrap();
        let err = TlsAcceptor::from_files(&empty, &key).err().unwrap();
        assert!(matches!(err, TlsError::NoCertificate(_)));
    }
}
