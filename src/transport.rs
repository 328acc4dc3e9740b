//! Backend calls made by the exporter
//!
//! [`Backend`] describes the shape of every call; [`HttpBackend`] implements it
//! against the monitoring, logging and trace REST APIs.

use crate::compiler::Bundle;
use crate::credentials::ClientHandle;
use crate::errors::BackendError;
use crate::telemetry::{AttributeValue, LogEntry, LogSink, MetricDescriptorResource, TimeSeries, TraceSpan, format_timestamp};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

const MONITORING_URL: &str = "https://monitoring.googleapis.com";
const LOGGING_URL: &str = "https://logging.googleapis.com";
const TRACE_URL: &str = "https://cloudtrace.googleapis.com";

/// Result of a batch write the backend may accept partially
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub messages: Vec<String>,
}

impl WriteOutcome {
    pub fn complete(accepted: usize) -> Self {
        Self {
            accepted,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptorResource,
    ) -> Result<(), BackendError>;

    async fn create_time_series(&self, project_id: &str, series: &[TimeSeries]) -> Result<WriteOutcome, BackendError>;

    async fn write_log_entries(&self, entries: &[LogEntry]) -> Result<WriteOutcome, BackendError>;

    async fn get_sink(&self, project_id: &str, sink_id: &str) -> Result<Option<LogSink>, BackendError>;

    async fn create_sink(
        &self,
        project_id: &str,
        sink: &LogSink,
        unique_writer_identity: bool,
    ) -> Result<LogSink, BackendError>;

    /// Update only the fields named in `update_mask`
    async fn update_sink(
        &self,
        project_id: &str,
        sink: &LogSink,
        update_mask: &[&'static str],
        unique_writer_identity: bool,
    ) -> Result<LogSink, BackendError>;

    async fn batch_write_spans(&self, project_id: &str, spans: &[TraceSpan]) -> Result<(), BackendError>;
}

/// Builds the backend for a freshly resolved generation
pub trait BackendConnector: Send + Sync {
    fn connect(&self, bundle: &Bundle, client: ClientHandle) -> Result<Arc<dyn Backend>, BackendError>;
}

/// Connects to the REST APIs
#[derive(Debug, Default)]
pub struct HttpConnector;

impl BackendConnector for HttpConnector {
    fn connect(&self, bundle: &Bundle, client: ClientHandle) -> Result<Arc<dyn Backend>, BackendError> {
        Ok(Arc::new(HttpBackend::new(
            bundle.endpoint.clone(),
            client,
            bundle.request_timeout,
        )?))
    }
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    handle: ClientHandle,
    monitoring_url: String,
    logging_url: String,
    trace_url: String,
    timeout: Duration,
}

impl HttpBackend {
    /// `endpoint` overrides the base URL of every API when set
    pub fn new(endpoint: Option<String>, handle: ClientHandle, http_timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("stackdriver_exporter/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        let base = |default: &str| {
            endpoint
                .as_deref()
                .unwrap_or(default)
                .trim_end_matches('/')
                .to_string()
        };

        Ok(Self {
            client,
            handle,
            monitoring_url: base(MONITORING_URL),
            logging_url: base(LOGGING_URL),
            trace_url: base(TRACE_URL),
            timeout: http_timeout,
        })
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let request = self.handle.authorize(request).await?;
        timeout(self.timeout, request.send())
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))?
            .map_err(BackendError::Http)
    }

    async fn error_body(response: Response) -> (u16, String) {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        (status, body)
    }

    async fn sink_response(response: Response) -> Result<LogSink, BackendError> {
        if !response.status().is_success() {
            let (status, body) = Self::error_body(response).await;
            return Err(BackendError::Status { status, body });
        }
        response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptorResource,
    ) -> Result<(), BackendError> {
        let url = format!("{}/v3/projects/{}/metricDescriptors", self.monitoring_url, project_id);
        let response = self.send(self.client.post(&url).json(descriptor)).await?;

        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        let (status, body) = Self::error_body(response).await;
        Err(BackendError::Status { status, body })
    }

    async fn create_time_series(&self, project_id: &str, series: &[TimeSeries]) -> Result<WriteOutcome, BackendError> {
        let url = format!("{}/v3/projects/{}/timeSeries", self.monitoring_url, project_id);
        debug!("Writing {} time series to {}", series.len(), url);

        let response = self
            .send(self.client.post(&url).json(&json!({ "timeSeries": series })))
            .await?;

        if response.status().is_success() {
            return Ok(WriteOutcome::complete(series.len()));
        }

        let (status, body) = Self::error_body(response).await;
        time_series_summary(&body).ok_or(BackendError::Status { status, body })
    }

    async fn write_log_entries(&self, entries: &[LogEntry]) -> Result<WriteOutcome, BackendError> {
        let url = format!("{}/v2/entries:write", self.logging_url);
        debug!("Writing {} log entries", entries.len());

        let response = self
            .send(
                self.client
                    .post(&url)
                    .json(&json!({ "entries": entries, "partialSuccess": true })),
            )
            .await?;

        if response.status().is_success() {
            return Ok(WriteOutcome::complete(entries.len()));
        }

        let (status, body) = Self::error_body(response).await;
        log_entry_errors(&body, entries.len()).ok_or(BackendError::Status { status, body })
    }

    async fn get_sink(&self, project_id: &str, sink_id: &str) -> Result<Option<LogSink>, BackendError> {
        let url = format!("{}/v2/projects/{}/sinks/{}", self.logging_url, project_id, sink_id);
        let response = self.send(self.client.get(&url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::sink_response(response).await.map(Some)
    }

    async fn create_sink(
        &self,
        project_id: &str,
        sink: &LogSink,
        unique_writer_identity: bool,
    ) -> Result<LogSink, BackendError> {
        let url = format!("{}/v2/projects/{}/sinks", self.logging_url, project_id);
        let request = self
            .client
            .post(&url)
            .query(&[("uniqueWriterIdentity", unique_writer_identity)])
            .json(sink);
        Self::sink_response(self.send(request).await?).await
    }

    async fn update_sink(
        &self,
        project_id: &str,
        sink: &LogSink,
        update_mask: &[&'static str],
        unique_writer_identity: bool,
    ) -> Result<LogSink, BackendError> {
        let url = format!("{}/v2/projects/{}/sinks/{}", self.logging_url, project_id, sink.name);
        let request = self
            .client
            .patch(&url)
            .query(&[
                ("uniqueWriterIdentity", unique_writer_identity.to_string()),
                ("updateMask", update_mask.join(",")),
            ])
            .json(sink);
        Self::sink_response(self.send(request).await?).await
    }

    async fn batch_write_spans(&self, project_id: &str, spans: &[TraceSpan]) -> Result<(), BackendError> {
        let url = format!("{}/v2/projects/{}/traces:batchWrite", self.trace_url, project_id);
        let spans: Vec<Value> = spans.iter().map(|span| span_json(project_id, span)).collect();

        let response = self.send(self.client.post(&url).json(&json!({ "spans": spans }))).await?;
        if response.status().is_success() {
            return Ok(());
        }
        let (status, body) = Self::error_body(response).await;
        Err(BackendError::Status { status, body })
    }
}

fn error_details(body: &str) -> Vec<Value> {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["details"].as_array().cloned())
        .unwrap_or_default()
}

fn type_matches(detail: &Value, suffix: &str) -> bool {
    detail["@type"].as_str().is_some_and(|t| t.ends_with(suffix))
}

/// Decode a `CreateTimeSeriesSummary` from an error body
fn time_series_summary(body: &str) -> Option<WriteOutcome> {
    let summary = error_details(body)
        .into_iter()
        .find(|d| type_matches(d, "CreateTimeSeriesSummary"))?;

    let total = summary["totalPointCount"].as_u64().unwrap_or(0) as usize;
    let success = summary["successPointCount"].as_u64().unwrap_or(0) as usize;
    let messages = summary["errors"]
        .as_array()
        .map(|errors| {
            errors
                .iter()
                .map(|e| {
                    format!(
                        "{} point(s): {}",
                        e["pointCount"].as_u64().unwrap_or(0),
                        e["status"]["message"].as_str().unwrap_or("unknown error")
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    Some(WriteOutcome {
        accepted: success,
        rejected: total.saturating_sub(success),
        messages,
    })
}

/// Decode `WriteLogEntriesPartialErrors` from an error body
fn log_entry_errors(body: &str, total: usize) -> Option<WriteOutcome> {
    let partial = error_details(body)
        .into_iter()
        .find(|d| type_matches(d, "WriteLogEntriesPartialErrors"))?;

    let errors = partial["logEntryErrors"].as_object()?;
    let messages = errors
        .iter()
        .map(|(index, status)| {
            format!(
                "entry {}: {}",
                index,
                status["message"].as_str().unwrap_or("unknown error")
            )
        })
        .collect();

    Some(WriteOutcome {
        accepted: total.saturating_sub(errors.len()),
        rejected: errors.len(),
        messages,
    })
}

fn span_json(project_id: &str, span: &TraceSpan) -> Value {
    let attributes: serde_json::Map<String, Value> = span
        .attributes
        .iter()
        .map(|(key, value)| {
            let value = match value {
                AttributeValue::Int64(v) => json!({ "intValue": v.to_string() }),
                AttributeValue::Bool(v) => json!({ "boolValue": v }),
                other => json!({ "stringValue": { "value": other.to_string(), "truncatedByteCount": 0 } }),
            };
            (key.clone(), value)
        })
        .collect();

    let mut value = json!({
        "name": format!("projects/{}/traces/{}/spans/{}", project_id, span.trace_id, span.span_id),
        "spanId": span.span_id,
        "displayName": { "value": span.name, "truncatedByteCount": 0 },
        "startTime": format_timestamp(&span.start_time),
        "endTime": format_timestamp(&span.end_time),
        "attributes": { "attributeMap": attributes },
    });
    if let Some(parent) = &span.parent_span_id {
        value["parentSpanId"] = json!(parent);
    }
    value
}

/// Backend wrapper that records call counts and durations
pub struct InstrumentedBackend {
    inner: Arc<dyn Backend>,
    metrics: Mutex<TransportMetrics>,
}

#[derive(Debug, Default)]
struct TransportMetrics {
    attempts: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
    min_duration: Option<Duration>,
    max_duration: Option<Duration>,
}

/// Snapshot of transport metrics
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}

impl InstrumentedBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            metrics: Mutex::new(TransportMetrics::default()),
        }
    }

    async fn track<T>(&self, call: &str, result: Result<T, BackendError>, started: Instant) -> Result<T, BackendError> {
        let duration = started.elapsed();
        let mut metrics = self.metrics.lock().await;
        metrics.attempts += 1;
        match &result {
            Ok(_) => metrics.successes += 1,
            Err(err) => {
                metrics.failures += 1;
                warn!("Backend call {} failed after {}ms: {}", call, duration.as_millis(), err);
            }
        }
        metrics.total_duration += duration;
        metrics.min_duration = Some(metrics.min_duration.map_or(duration, |m| m.min(duration)));
        metrics.max_duration = Some(metrics.max_duration.map_or(duration, |m| m.max(duration)));
        result
    }

    pub async fn metrics(&self) -> TransportMetricsSnapshot {
        let metrics = self.metrics.lock().await;

        let success_rate = if metrics.attempts > 0 {
            (metrics.successes as f64 / metrics.attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration = if metrics.attempts > 0 {
            metrics.total_duration / metrics.attempts as u32
        } else {
            Duration::ZERO
        };

        TransportMetricsSnapshot {
            attempts: metrics.attempts,
            successes: metrics.successes,
            failures: metrics.failures,
            success_rate,
            avg_duration_ms: avg_duration.as_millis() as u64,
            min_duration_ms: metrics.min_duration.map(|d| d.as_millis() as u64),
            max_duration_ms: metrics.max_duration.map(|d| d.as_millis() as u64),
        }
    }
}

#[async_trait]
impl Backend for InstrumentedBackend {
    async fn create_metric_descriptor(
        &self,
        project_id: &str,
        descriptor: &MetricDescriptorResource,
    ) -> Result<(), BackendError> {
        let started = Instant::now();
        let result = self.inner.create_metric_descriptor(project_id, descriptor).await;
        self.track("create_metric_descriptor", result, started).await
    }

    async fn create_time_series(&self, project_id: &str, series: &[TimeSeries]) -> Result<WriteOutcome, BackendError> {
        let started = Instant::now();
        let result = self.inner.create_time_series(project_id, series).await;
        self.track("create_time_series", result, started).await
    }

    async fn write_log_entries(&self, entries: &[LogEntry]) -> Result<WriteOutcome, BackendError> {
        let started = Instant::now();
        let result = self.inner.write_log_entries(entries).await;
        self.track("write_log_entries", result, started).await
    }

    async fn get_sink(&self, project_id: &str, sink_id: &str) -> Result<Option<LogSink>, BackendError> {
        let started = Instant::now();
        let result = self.inner.get_sink(project_id, sink_id).await;
        self.track("get_sink", result, started).await
    }

    async fn create_sink(
        &self,
        project_id: &str,
        sink: &LogSink,
        unique_writer_identity: bool,
    ) -> Result<LogSink, BackendError> {
        let started = Instant::now();
        let result = self.inner.create_sink(project_id, sink, unique_writer_identity).await;
        self.track("create_sink", result, started).await
    }

    async fn update_sink(
        &self,
        project_id: &str,
        sink: &LogSink,
        update_mask: &[&'static str],
        unique_writer_identity: bool,
    ) -> Result<LogSink, BackendError> {
        let started = Instant::now();
        let result = self
            .inner
            .update_sink(project_id, sink, update_mask, unique_writer_identity)
            .await;
        self.track("update_sink", result, started).await
    }

    async fn batch_write_spans(&self, project_id: &str, spans: &[TraceSpan]) -> Result<(), BackendError> {
        let started = Instant::now();
        let result = self.inner.batch_write_spans(project_id, spans).await;
        self.track("batch_write_spans", result, started).await
    }
}
