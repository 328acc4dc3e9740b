//! Raw adapter configuration document
//!
//! This is the shape supplied by the configuration-loading layer. Nothing here is
//! validated; see [`crate::compiler`] for that.

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    /// Override for the backend API base URL
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default, rename = "projectID", alias = "projectId")]
    pub project_id: String,

    /// Period between batched deliveries. Unset or zero means 60s.
    #[serde(default, with = "humantime_serde")]
    pub push_interval: Option<Duration>,

    #[serde(default)]
    pub use_ambient_credentials: bool,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub service_account_path: Option<String>,

    /// Namespace used when deriving `custom.<namespace>/<name>` metric types
    #[serde(default)]
    pub metric_namespace: Option<String>,

    /// Per backend call timeout
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,

    /// Bound for buffered log entries and buffered spans
    #[serde(default)]
    pub max_buffered_entries: Option<usize>,

    #[serde(default)]
    pub metric_info: BTreeMap<String, MetricInfo>,

    #[serde(default)]
    pub log_info: BTreeMap<String, LogInfo>,

    #[serde(default)]
    pub trace: TraceInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    #[default]
    Gauge,
    Delta,
    Cumulative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Bool,
    #[default]
    Int64,
    Double,
    String,
    Distribution,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "GAUGE",
            MetricKind::Delta => "DELTA",
            MetricKind::Cumulative => "CUMULATIVE",
        }
    }
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "BOOL",
            ValueType::Int64 => "INT64",
            ValueType::Double => "DOUBLE",
            ValueType::String => "STRING",
            ValueType::Distribution => "DISTRIBUTION",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricInfo {
    #[serde(default)]
    pub kind: MetricKind,

    #[serde(default, alias = "value")]
    pub value_type: ValueType,

    /// Explicit backend metric type; derived from the metric name when absent
    #[serde(default)]
    pub metric_type: Option<String>,

    #[serde(default)]
    pub buckets: Option<BucketsDefinition>,

    #[serde(default)]
    pub label_names: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,
}

/// Histogram definition as written in configuration.
///
/// More than one variant may be present in the document; the compiler rejects
/// anything other than exactly one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketsDefinition {
    #[serde(default, alias = "linearBuckets")]
    pub linear: Option<LinearBuckets>,

    #[serde(default, alias = "exponentialBuckets")]
    pub exponential: Option<ExponentialBuckets>,

    #[serde(default, alias = "explicitBuckets")]
    pub explicit: Option<ExplicitBuckets>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearBuckets {
    #[serde(default)]
    pub num_finite_buckets: i32,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub offset: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExponentialBuckets {
    #[serde(default)]
    pub num_finite_buckets: i32,
    #[serde(default)]
    pub growth_factor: f64,
    #[serde(default)]
    pub scale: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplicitBuckets {
    #[serde(default)]
    pub bounds: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogInfo {
    #[serde(default)]
    pub label_names: Vec<String>,

    #[serde(default)]
    pub payload_template: String,

    #[serde(default)]
    pub http_mapping: Option<HttpMapping>,

    #[serde(default)]
    pub sink_info: Option<SinkInfo>,

    #[serde(default)]
    pub severity: Option<String>,
}

/// Maps structured HTTP request fields to variable names
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMapping {
    pub status: Option<String>,
    pub request_size: Option<String>,
    pub response_size: Option<String>,
    pub latency: Option<String>,
    #[serde(alias = "localIP")]
    pub local_ip: Option<String>,
    #[serde(alias = "remoteIP")]
    pub remote_ip: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkInfo {
    pub id: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub unique_writer_identity: bool,
    #[serde(default)]
    pub update_destination: bool,
    #[serde(default)]
    pub update_filter: bool,
    #[serde(default)]
    pub update_include_children: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceInfo {
    #[serde(default)]
    pub sample_probability: f64,
}

impl AdapterConfig {
    pub fn from_yaml_str(document: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(document)?)
    }

    pub fn from_json_str(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    /// Load a document from disk; `.json` files are parsed as JSON, everything
    /// else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_document() {
        let yaml = r#"
projectID: my-project
pushInterval: 10s
apiKey: secret
metricInfo:
  requests:
    kind: CUMULATIVE
    value: DISTRIBUTION
    buckets:
      linear:
        numFiniteBuckets: 2
        width: 10
        offset: 0
logInfo:
  access:
    labelNames: [method]
    payloadTemplate: "{{.method}} {{.url}}"
    httpMapping:
      status: responseCode
      localIP: sourceIp
trace:
  sampleProbability: 0.25
"#;

        let config = AdapterConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.project_id, "my-project");
        assert_eq!(config.push_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.api_key.as_deref(), Some("secret"));

        let metric = &config.metric_info["requests"];
        assert_eq!(metric.kind, MetricKind::Cumulative);
        assert_eq!(metric.value_type, ValueType::Distribution);
        assert_eq!(metric.buckets.as_ref().unwrap().linear.as_ref().unwrap().num_finite_buckets, 2);

        let log = &config.log_info["access"];
        let mapping = log.http_mapping.as_ref().unwrap();
        assert_eq!(mapping.status.as_deref(), Some("responseCode"));
        assert_eq!(mapping.local_ip.as_deref(), Some("sourceIp"));
        assert_eq!(config.trace.sample_probability, 0.25);
    }

    #[test]
    fn test_json_document_defaults() {
        let config = AdapterConfig::from_json_str(r#"{"projectID": "p"}"#).unwrap();
        assert_eq!(config.project_id, "p");
        assert!(config.push_interval.is_none());
        assert!(config.metric_info.is_empty());
        assert_eq!(config.trace.sample_probability, 0.0);
    }

    #[test]
    fn test_from_file_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"projectID": "from-file", "pushInterval": "1m"}}"#).unwrap();

        let config = AdapterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.project_id, "from-file");
        assert_eq!(config.push_interval, Some(Duration::from_secs(60)));
    }
}
