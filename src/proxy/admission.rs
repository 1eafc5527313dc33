//! Host admissibility for redirected requests.

use http::Request;
use http::header::HOST;

/// Host prefixes that are never proxied, to avoid loops back into the
/// proxy and exposure of local services.
pub const BLACKLIST: &[&str] = &["localhost", "127.0.0.1"];

/// Why a request was refused service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("request with empty host")]
    EmptyHost,
    #[error("request with blacklisted host: {0}")]
    Blacklisted(String),
}

/// Host a request targets: the `Host` header, or the absolute-form URI
/// authority when no header was sent.
pub fn effective_host<B>(req: &Request<B>) -> String {
    match req.headers().get(HOST) {
        Some(value) => value.to_str().unwrap_or_default().trim().to_string(),
        None => req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default(),
    }
}

/// Checks whether a request for `host` may be serviced.
///
/// Matching is by prefix, so `127.0.0.100.example` is refused as well.
pub fn check_host(host: &str) -> Result<(), Rejection> {
    if host.is_empty() {
        return Err(Rejection::EmptyHost);
    }

    if BLACKLIST.iter().any(|prefix| host.starts_with(prefix)) {
        return Err(Rejection::Blacklisted(host.to_string()));
    }

    Ok(())
}
