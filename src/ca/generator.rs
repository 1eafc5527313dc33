//! CA and host certificate generation using rcgen.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Lifetime of a minted host certificate.
const HOST_CERT_VALIDITY: Duration = Duration::hours(1);

/// Cached host certificates this close to expiry are minted again.
const RENEW_BEFORE_EXPIRY: Duration = Duration::minutes(5);

/// Upper bound on the number of hosts kept in a [`CertCache`].
pub const MAX_CACHED_CERTS: usize = 1024;

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to generate certificate: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("failed to read CA material: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid CA certificate PEM: {0}")]
    Pem(String),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
}

/// CA used to mint certificates for intercepted CONNECT tunnels.
///
/// Either generated on startup (valid for 24 hours) or loaded from a
/// PEM certificate/key pair so clients can trust it permanently.
pub struct CaState {
    /// The CA certificate in DER format.
    ca_cert_der: CertificateDer<'static>,
    /// The CA certificate in PEM format (for installation on victims/clients).
    ca_cert_pem: String,
    /// Issuer signing host certificates with the CA key.
    issuer: Issuer<'static, KeyPair>,
}

impl CaState {
    /// Generates a new ephemeral CA with 24-hour validity.
    pub fn generate() -> CaResult<Self> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "mitm-proxy CA");
        dn.push(DnType::OrganizationName, "mitm-proxy");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5); // clock skew
        params.not_after = now + Duration::hours(24);

        let key_pair = KeyPair::generate()?;
        let ca_cert = params.self_signed(&key_pair)?;

        let ca_cert_pem = ca_cert.pem();
        let ca_cert_der = CertificateDer::from(ca_cert.der().to_vec());

        debug!("generated ephemeral CA certificate");

        Ok(Self {
            ca_cert_der,
            ca_cert_pem,
            issuer: Issuer::new(params, key_pair),
        })
    }

    /// Builds a CA from an existing PEM certificate and private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> CaResult<Self> {
        let key_pair = KeyPair::from_pem(key_pem)?;
        let ca_cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| CaError::Pem(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_der(&ca_cert_der, key_pair)?;

        Ok(Self {
            ca_cert_der,
            ca_cert_pem: cert_pem.to_string(),
            issuer,
        })
    }

    /// Loads a CA certificate and key from PEM files.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> CaResult<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Returns the CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns the CA certificate in DER format.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Generates a host certificate for the given host name or IP literal.
    /// The certificate is signed by this CA.
    pub fn generate_host_cert(&self, host: &str) -> CaResult<CertifiedKey> {
        self.mint(host).map(|(key, _)| key)
    }

    /// Mints a host certificate and reports when it expires.
    fn mint(&self, host: &str) -> CaResult<(CertifiedKey, OffsetDateTime)> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(
                host.try_into()
                    .map_err(|_| CaError::InvalidDnsName(host.to_string()))?,
            )],
        };
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        // Short-lived; the cache mints a new one before it expires
        let now = OffsetDateTime::now_utc();
        let not_after = now + HOST_CERT_VALIDITY;
        params.not_before = now - Duration::minutes(5);
        params.not_after = not_after;

        let host_key_pair = KeyPair::generate()?;
        let host_cert = params.signed_by(&host_key_pair, &self.issuer)?;

        let cert_der = CertificateDer::from(host_cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(host_key_pair.serialize_der()));

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(CaError::SigningKey)?;

        debug!("generated host certificate for {}", host);

        let certified_key =
            CertifiedKey::new(vec![cert_der, self.ca_cert_der.clone()], signing_key);
        Ok((certified_key, not_after))
    }
}

struct CachedCert {
    key: Arc<CertifiedKey>,
    not_after: OffsetDateTime,
}

impl CachedCert {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        now + RENEW_BEFORE_EXPIRY < self.not_after
    }
}

/// Cache for host certificates.
///
/// Stores minted host certificates keyed by host name to avoid regenerating
/// certificates for repeated tunnels to the same host. Entries close to
/// expiry are minted again, and the cache holds at most
/// [`MAX_CACHED_CERTS`] hosts.
pub struct CertCache {
    ca: Arc<CaState>,
    cache: RwLock<HashMap<String, CachedCert>>,
}

impl CertCache {
    /// Creates a new certificate cache backed by the given CA.
    pub fn new(ca: Arc<CaState>) -> Self {
        Self {
            ca,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Gets or generates a certified key for the given host.
    pub fn get_or_create(&self, host: &str) -> CaResult<Arc<CertifiedKey>> {
        let host = host.to_ascii_lowercase();
        let now = OffsetDateTime::now_utc();

        if let Ok(cache) = self.cache.read()
            && let Some(entry) = cache.get(&host)
            && entry.is_fresh(now)
        {
            return Ok(Arc::clone(&entry.key));
        }

        let (certified_key, not_after) = self.ca.mint(&host)?;
        let certified_key = Arc::new(certified_key);

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= MAX_CACHED_CERTS && !cache.contains_key(&host) {
                cache.retain(|_, entry| entry.is_fresh(now));
                if cache.len() >= MAX_CACHED_CERTS {
                    debug!("certificate cache full, clearing {} entries", cache.len());
                    cache.clear();
                }
            }
            cache.insert(
                host,
                CachedCert {
                    key: Arc::clone(&certified_key),
                    not_after,
                },
            );
        }

        Ok(certified_key)
    }

    /// Returns a reference to the underlying CA state.
    pub fn ca(&self) -> &CaState {
        &self.ca
    }
}
