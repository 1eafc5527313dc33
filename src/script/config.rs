use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse script: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported script version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid host pattern: {0}")]
    InvalidPattern(String),
    #[error("invalid path pattern: {0}")]
    InvalidPath(String),
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    #[error("invalid status code: {0}")]
    InvalidStatus(u16),
    #[error("invalid header {name}: {value:?}")]
    InvalidHeader { name: String, value: String },
}

/// Synthetic response a rule answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSpec {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Rule evaluated before a request is forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRule {
    /// Host pattern: "ads.example.com" or "*.example.com". Absent matches
    /// every host.
    #[serde(default)]
    pub host: Option<String>,
    /// Exact path, or a prefix when it ends with `*`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    pub respond: ResponseSpec,
}

/// Rule evaluated on the real upstream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Upstream status the rule applies to.
    #[serde(default)]
    pub status: Option<u16>,
    pub respond: ResponseSpec,
}

/// Proxy script file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Script version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub on_request: Vec<RequestRule>,

    #[serde(default)]
    pub on_response: Vec<ResponseRule>,
}

fn default_version() -> u32 {
    1
}

fn default_status() -> u16 {
    200
}

impl ScriptConfig {
    /// Loads a script from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses a script from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ScriptError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        if config.version != 1 {
            return Err(ScriptError::UnsupportedVersion(config.version));
        }
        Ok(config)
    }
}
