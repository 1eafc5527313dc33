use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode};
use hyper::body::Bytes;

use super::config::{ResponseSpec, ScriptError};
use crate::proxy::InterceptionResult;

/// Compiled host pattern.
#[derive(Debug)]
pub(super) struct HostPattern {
    /// The pattern components, reversed for suffix matching.
    /// e.g., "*.example.com" -> ["com", "example"]
    parts: Vec<String>,
    is_wildcard: bool,
}

impl HostPattern {
    pub(super) fn parse(pattern: &str) -> Result<Self, ScriptError> {
        let invalid = || ScriptError::InvalidPattern(pattern.to_string());
        if pattern.is_empty() || pattern.chars().any(|c| c.is_whitespace()) {
            return Err(invalid());
        }

        let lower = pattern.to_lowercase();
        let (is_wildcard, rest) = match lower.strip_prefix("*.") {
            Some(rest) => (true, rest),
            None => (false, lower.as_str()),
        };
        if rest.contains('*') || rest.split('.').any(str::is_empty) {
            return Err(invalid());
        }

        Ok(Self {
            parts: rest.split('.').rev().map(String::from).collect(),
            is_wildcard,
        })
    }

    /// Matches a `Host` value, ignoring case and any port.
    pub(super) fn matches(&self, host: &str) -> bool {
        let host = strip_port(host).to_lowercase();
        let host_parts: Vec<&str> = host.split('.').rev().collect();

        if self.is_wildcard {
            // subdomain required
            if host_parts.len() <= self.parts.len() {
                return false;
            }
        } else if host_parts.len() != self.parts.len() {
            return false;
        }

        self.parts
            .iter()
            .zip(&host_parts)
            .all(|(part, host_part)| part == host_part)
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[derive(Debug)]
pub(super) enum PathPattern {
    Exact(String),
    Prefix(String),
}

impl PathPattern {
    pub(super) fn parse(pattern: &str) -> Result<Self, ScriptError> {
        if !pattern.starts_with('/') {
            return Err(ScriptError::InvalidPath(pattern.to_string()));
        }
        match pattern.strip_suffix('*') {
            Some(prefix) if !prefix.contains('*') => Ok(Self::Prefix(prefix.to_string())),
            Some(_) => Err(ScriptError::InvalidPath(pattern.to_string())),
            None if pattern.contains('*') => Err(ScriptError::InvalidPath(pattern.to_string())),
            None => Ok(Self::Exact(pattern.to_string())),
        }
    }

    pub(super) fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => path == exact,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

/// Conditions shared by request and response rules. Absent conditions
/// match everything.
#[derive(Debug)]
pub(super) struct Matcher {
    host: Option<HostPattern>,
    path: Option<PathPattern>,
    method: Option<Method>,
}

impl Matcher {
    pub(super) fn compile(
        host: Option<&str>,
        path: Option<&str>,
        method: Option<&str>,
    ) -> Result<Self, ScriptError> {
        let method = method
            .map(|m| {
                Method::from_bytes(m.to_uppercase().as_bytes())
                    .map_err(|_| ScriptError::InvalidMethod(m.to_string()))
            })
            .transpose()?;

        Ok(Self {
            host: host.map(HostPattern::parse).transpose()?,
            path: path.map(PathPattern::parse).transpose()?,
            method,
        })
    }

    pub(super) fn matches(&self, method: &Method, host: &str, path: &str) -> bool {
        self.method.as_ref().is_none_or(|m| m == method)
            && self.host.as_ref().is_none_or(|h| h.matches(host))
            && self.path.as_ref().is_none_or(|p| p.matches(path))
    }
}

/// Validated synthetic response.
#[derive(Debug)]
pub(super) struct CompiledResponse {
    status: StatusCode,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: Bytes,
}

impl CompiledResponse {
    pub(super) fn compile(spec: &ResponseSpec) -> Result<Self, ScriptError> {
        let status =
            StatusCode::from_u16(spec.status).map_err(|_| ScriptError::InvalidStatus(spec.status))?;

        let headers = spec
            .headers
            .iter()
            .map(|(name, value)| {
                let invalid = || ScriptError::InvalidHeader {
                    name: name.clone(),
                    value: value.clone(),
                };
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
                let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
                Ok((name, value))
            })
            .collect::<Result<_, ScriptError>>()?;

        Ok(Self {
            status,
            headers,
            body: Bytes::from(spec.body.clone()),
        })
    }

    pub(super) fn to_result(&self) -> InterceptionResult {
        self.headers
            .iter()
            .fold(InterceptionResult::new(self.status), |result, (name, value)| {
                result.with_header(name.clone(), value.clone())
            })
            .with_body(self.body.clone())
    }

    #[cfg(test)]
    pub(super) fn headers(&self) -> http::HeaderMap {
        self.headers.iter().cloned().collect()
    }
}
