//! Telemetry data structures in the backend's data model

use crate::buckets::BucketOptions;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// A named variable value produced by the attribute-extraction layer
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Duration(Duration),
    Timestamp(DateTime<Utc>),
    Ip(IpAddr),
}

impl AttributeValue {
    /// Numeric view; durations are expressed in milliseconds
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int64(v) => Some(*v as f64),
            AttributeValue::Double(v) => Some(*v),
            AttributeValue::Duration(d) => Some(d.as_secs_f64() * 1000.0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int64(v) => Some(*v),
            AttributeValue::Double(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            AttributeValue::Duration(d) => i64::try_from(d.as_millis()).ok(),
            AttributeValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(v) => write!(f, "{}", v),
            AttributeValue::Int64(v) => write!(f, "{}", v),
            AttributeValue::Double(v) => write!(f, "{}", v),
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Duration(d) => write!(f, "{}s", d.as_secs_f64()),
            AttributeValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            AttributeValue::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int64(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Double(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<Duration> for AttributeValue {
    fn from(d: Duration) -> Self {
        AttributeValue::Duration(d)
    }
}

/// Ordered label set; ordering makes it usable as a series key
pub type LabelSet = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MonitoredResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub labels: BTreeMap<String, String>,
}

impl MonitoredResource {
    pub fn global(project_id: &str) -> Self {
        Self {
            resource_type: "global".to_string(),
            labels: BTreeMap::from([("project_id".to_string(), project_id.to_string())]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    pub metric: Metric,
    pub resource: MonitoredResource,
    pub metric_kind: &'static str,
    pub value_type: &'static str,
    pub points: Vec<Point>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Metric {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub labels: LabelSet,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Point {
    pub interval: TimeInterval,
    pub value: TypedValue,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_opt_timestamp")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub end_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TypedValue {
    BoolValue(bool),
    #[serde(serialize_with = "serialize_i64_string")]
    Int64Value(i64),
    DoubleValue(f64),
    StringValue(String),
    DistributionValue(Distribution),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    #[serde(serialize_with = "serialize_i64_string")]
    pub count: i64,
    pub mean: f64,
    pub sum_of_squared_deviation: f64,
    pub bucket_options: BucketOptions,
    #[serde(serialize_with = "serialize_counts")]
    pub bucket_counts: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptorResource {
    #[serde(rename = "type")]
    pub metric_type: String,
    pub metric_kind: &'static str,
    pub value_type: &'static str,
    pub labels: Vec<LabelDescriptor>,
    pub description: String,
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDescriptor {
    pub key: String,
    pub value_type: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub log_name: String,
    pub resource: MonitoredResource,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub severity: String,
    pub insert_id: String,
    pub labels: BTreeMap<String, String>,
    pub text_payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequest>,
}

/// Structured HTTP request attached to a log entry
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub request_method: String,
    pub request_url: String,
    #[serde(serialize_with = "serialize_i64_string")]
    pub request_size: i64,
    pub status: i32,
    #[serde(serialize_with = "serialize_i64_string")]
    pub response_size: i64,
    pub user_agent: String,
    pub remote_ip: String,
    pub server_ip: String,
    pub referer: String,
    #[serde(serialize_with = "serialize_latency")]
    pub latency: Duration,
}

/// Log export sink as stored by the backend
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSink {
    pub name: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub include_children: bool,
    #[serde(default, skip_serializing)]
    pub writer_identity: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TraceSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub attributes: HashMap<String, AttributeValue>,
}

impl TraceSpan {
    pub fn new(trace_id: String, span_id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
            name,
            start_time: now,
            end_time: now,
            attributes: HashMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_span_id: String) -> Self {
        self.parent_span_id = Some(parent_span_id);
        self
    }

    pub fn with_attribute(mut self, key: String, value: AttributeValue) -> Self {
        self.attributes.insert(key, value);
        self
    }

    pub fn with_times(mut self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }
}

/// Generate a new trace ID
pub fn generate_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Generate a new span ID
pub fn generate_span_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_timestamp(ts))
}

fn serialize_opt_timestamp<S: Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => serialize_timestamp(ts, s),
        None => s.serialize_none(),
    }
}

// int64 fields travel as JSON strings
fn serialize_i64_string<S: Serializer>(v: &i64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&v.to_string())
}

fn serialize_counts<S: Serializer>(counts: &[i64], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(counts.iter().map(|c| c.to_string()))
}

fn serialize_latency<S: Serializer>(latency: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{}.{:09}s", latency.as_secs(), latency.subsec_nanos()))
}
