//! Error types for the exporter

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExporterError>;

/// Malformed or inconsistent configuration. Fatal to the generation being built.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid configuration at `{path}`: {message}")]
pub struct ConfigError {
    /// Dotted path of the offending field, e.g. `metricInfo.latency.buckets`
    pub path: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("service account key file not found: {0}")]
    FileNotFound(String),

    #[error("malformed credentials: {0}")]
    Malformed(String),

    #[error("failed to obtain access token: {0}")]
    Token(String),
}

/// Transient failure talking to the monitoring backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("credentials unavailable: {0}")]
    Credential(#[from] CredentialError),
}

impl BackendError {
    pub fn is_timeout(&self) -> bool {
        match self {
            BackendError::Timeout(_) => true,
            BackendError::Http(err) => err.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("sink `{sink_id}`: {source}")]
pub struct SinkError {
    pub sink_id: String,
    #[source]
    pub source: BackendError,
}

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("unknown log: {0}")]
    UnknownLog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("exporter is shut down")]
    ShutDown,
}
