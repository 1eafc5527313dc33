//! Rule scripts driving the interception hook.
//!
//! A script is a YAML file listing request and response rules. Each rule
//! matches on host, path, method (and, for responses, the upstream status)
//! and names the synthetic response to answer with. The first matching rule
//! wins; when none matches the message passes through.

mod config;
mod matcher;

use std::path::Path;

use http::StatusCode;
use tracing::debug;

pub use config::{RequestRule, ResponseRule, ResponseSpec, ScriptConfig, ScriptError};
use matcher::{CompiledResponse, Matcher};

use crate::proxy::{InterceptionHook, InterceptionResult, RequestView, ResponseView};

#[derive(Debug)]
struct RequestAction {
    matcher: Matcher,
    respond: CompiledResponse,
}

#[derive(Debug)]
struct ResponseAction {
    matcher: Matcher,
    status: Option<StatusCode>,
    respond: CompiledResponse,
}

/// Compiled script, usable as an [`InterceptionHook`].
#[derive(Debug)]
pub struct ProxyScript {
    on_request: Vec<RequestAction>,
    on_response: Vec<ResponseAction>,
}

impl ProxyScript {
    /// Loads and compiles a script file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        Self::compile(&ScriptConfig::load(path)?)
    }

    /// Parses and compiles a script from YAML.
    pub fn parse(yaml: &str) -> Result<Self, ScriptError> {
        Self::compile(&ScriptConfig::parse(yaml)?)
    }

    pub fn compile(config: &ScriptConfig) -> Result<Self, ScriptError> {
        let on_request = config
            .on_request
            .iter()
            .map(|rule| {
                Ok(RequestAction {
                    matcher: Matcher::compile(
                        rule.host.as_deref(),
                        rule.path.as_deref(),
                        rule.method.as_deref(),
                    )?,
                    respond: CompiledResponse::compile(&rule.respond)?,
                })
            })
            .collect::<Result<Vec<_>, ScriptError>>()?;

        let on_response = config
            .on_response
            .iter()
            .map(|rule| {
                let status = rule
                    .status
                    .map(|code| {
                        StatusCode::from_u16(code).map_err(|_| ScriptError::InvalidStatus(code))
                    })
                    .transpose()?;
                Ok(ResponseAction {
                    matcher: Matcher::compile(
                        rule.host.as_deref(),
                        rule.path.as_deref(),
                        rule.method.as_deref(),
                    )?,
                    status,
                    respond: CompiledResponse::compile(&rule.respond)?,
                })
            })
            .collect::<Result<Vec<_>, ScriptError>>()?;

        Ok(Self {
            on_request,
            on_response,
        })
    }

    /// Number of request and response rules.
    pub fn rule_count(&self) -> (usize, usize) {
        (self.on_request.len(), self.on_response.len())
    }
}

impl InterceptionHook for ProxyScript {
    fn on_request(&self, request: &RequestView) -> Option<InterceptionResult> {
        let (index, action) = self.on_request.iter().enumerate().find(|(_, action)| {
            action
                .matcher
                .matches(&request.method, &request.host, request.path())
        })?;
        debug!("request rule #{} matched {}{}", index, request.host, request.path());
        Some(action.respond.to_result())
    }

    fn on_response(&self, response: &ResponseView) -> Option<InterceptionResult> {
        let request = &response.request;
        let (index, action) = self.on_response.iter().enumerate().find(|(_, action)| {
            action.status.is_none_or(|status| status == response.status)
                && action
                    .matcher
                    .matches(&request.method, &request.host, request.path())
        })?;
        debug!("response rule #{} matched {}{}", index, request.host, request.path());
        Some(action.respond.to_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Uri};
    use hyper::body::Bytes;
    use std::sync::Arc;

    const SCRIPT: &str = r#"
on_request:
  - host: "ads.example.com"
    respond:
      status: 403
      body: blocked
  - host: "*.example.com"
    path: "/ads*"
    respond:
      status: 404
on_response:
  - status: 500
    respond:
      status: 200
      headers:
        Content-Type: text/html
      body: "<p>all good</p>"
  - host: "example.com"
    respond:
      body: replaced
"#;

    fn request(method: Method, host: &str, uri: &str) -> RequestView {
        RequestView {
            client_addr: "10.0.0.7:51000".parse().unwrap(),
            method,
            uri: uri.parse::<Uri>().unwrap(),
            host: host.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn response(request: RequestView, status: StatusCode) -> ResponseView {
        ResponseView {
            request: Arc::new(request),
            status,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"upstream"),
        }
    }

    #[test]
    fn compiles_rules() {
        let script = ProxyScript::parse(SCRIPT).unwrap();
        assert_eq!(script.rule_count(), (2, 2));
    }

    /// First matching request rule wins.
    #[test]
    fn request_rules_in_order() {
        let script = ProxyScript::parse(SCRIPT).unwrap();

        let result = script
            .on_request(&request(Method::GET, "ads.example.com", "/ads/1"))
            .unwrap();
        assert_eq!(result.status(), StatusCode::FORBIDDEN);
        assert_eq!(&result.body()[..], b"blocked");

        let result = script
            .on_request(&request(Method::GET, "cdn.example.com:80", "/ads/1?x=1"))
            .unwrap();
        assert_eq!(result.status(), StatusCode::NOT_FOUND);

        assert!(
            script
                .on_request(&request(Method::GET, "cdn.example.com", "/index"))
                .is_none()
        );
        assert!(
            script
                .on_request(&request(Method::GET, "example.org", "/ads"))
                .is_none()
        );
    }

    #[test]
    fn response_rules_match_status() {
        let script = ProxyScript::parse(SCRIPT).unwrap();

        let failed = response(
            request(Method::GET, "api.other.net", "/"),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        let result = script.on_response(&failed).unwrap();
        assert_eq!(result.status(), StatusCode::OK);
        assert_eq!(result.headers()["content-type"], "text/html");

        let ok = response(request(Method::GET, "api.other.net", "/"), StatusCode::OK);
        assert!(script.on_response(&ok).is_none());

        let ok = response(request(Method::POST, "example.com", "/form"), StatusCode::OK);
        assert_eq!(&script.on_response(&ok).unwrap().body()[..], b"replaced");
    }

    #[test]
    fn invalid_rules_rejected() {
        let bad_status = r#"
on_response:
  - status: 42
    respond: {}
"#;
        assert!(matches!(
            ProxyScript::parse(bad_status),
            Err(ScriptError::InvalidStatus(42))
        ));

        let bad_host = r#"
on_request:
  - host: "ads.*.com"
    respond: {}
"#;
        assert!(matches!(
            ProxyScript::parse(bad_host),
            Err(ScriptError::InvalidPattern(_))
        ));

        let bad_method = r#"
on_request:
  - method: "GE T"
    respond: {}
"#;
        assert!(matches!(
            ProxyScript::parse(bad_method),
            Err(ScriptError::InvalidMethod(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, SCRIPT).unwrap();
        assert!(ProxyScript::load(&path).is_ok());

        assert!(matches!(
            ProxyScript::load(dir.path().join("missing.yaml")),
            Err(ScriptError::Io(_))
        ));
    }
}
