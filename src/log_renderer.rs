//! Renders log entries from named variables and buffers them for delivery

use crate::buffer::{BoundedBuffer, chunked};
use crate::compiler::LogMapping;
use crate::config::HttpMapping;
use crate::errors::{ExporterError, Result};
use crate::stats::ExporterStats;
use crate::telemetry::{AttributeValue, HttpRequest, LogEntry, MonitoredResource};
use crate::transport::Backend;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Backend limit on entries per write request
pub const MAX_ENTRIES_PER_REQUEST: usize = 1000;

/// A rendered entry and the sink it is destined for, if any
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEntry {
    pub entry: LogEntry,
    pub sink_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFlushReport {
    pub requests: usize,
    pub entries_sent: usize,
    pub entries_rejected: usize,
    pub sink_entries: BTreeMap<String, usize>,
    pub failed_requests: usize,
}

pub struct LogRenderer {
    project_id: String,
    resource: MonitoredResource,
    mappings: BTreeMap<String, LogMapping>,
    buffer: BoundedBuffer<RenderedEntry>,
    stats: Arc<ExporterStats>,
}

impl LogRenderer {
    pub fn new(
        project_id: &str,
        mappings: &BTreeMap<String, LogMapping>,
        max_buffered: usize,
        stats: Arc<ExporterStats>,
    ) -> Self {
        let issues: usize = mappings.values().map(|m| m.template.issues().len()).sum();
        if issues > 0 {
            stats.add_template_issues(issues as u64);
        }

        Self {
            project_id: project_id.to_string(),
            resource: MonitoredResource::global(project_id),
            mappings: mappings.clone(),
            buffer: BoundedBuffer::new("log", max_buffered),
            stats,
        }
    }

    /// Render an entry. Missing variables never fail the entry; only an unknown
    /// log name does.
    pub fn render(&self, log_name: &str, variables: &HashMap<String, AttributeValue>) -> Result<RenderedEntry> {
        let mapping = self
            .mappings
            .get(log_name)
            .ok_or_else(|| ExporterError::UnknownLog(log_name.to_string()))?;

        let labels = mapping
            .label_names
            .iter()
            .map(|name| {
                let value = variables.get(name).map(|v| v.to_string()).unwrap_or_default();
                (name.clone(), value)
            })
            .collect();

        let timestamp = match variables.get("timestamp") {
            Some(AttributeValue::Timestamp(ts)) => *ts,
            _ => Utc::now(),
        };

        let entry = LogEntry {
            log_name: format!("projects/{}/logs/{}", self.project_id, log_name),
            resource: self.resource.clone(),
            timestamp,
            severity: mapping.severity.clone(),
            insert_id: Uuid::new_v4().to_string(),
            labels,
            text_payload: mapping.template.render(variables),
            http_request: mapping
                .http_mapping
                .as_ref()
                .map(|http| http_request(http, variables)),
        };

        Ok(RenderedEntry {
            entry,
            sink_id: mapping.sink.as_ref().map(|s| s.id.clone()),
        })
    }

    /// Render and buffer an entry for the next flush. Unknown logs are counted
    /// and dropped.
    pub async fn submit(&self, log_name: &str, variables: &HashMap<String, AttributeValue>) -> bool {
        match self.render(log_name, variables) {
            Ok(rendered) => {
                if self.buffer.push(rendered).await {
                    self.stats.add_buffer_overflows(1);
                }
                true
            }
            Err(err) => {
                self.stats.add_unknown_logs(1);
                debug!("Dropping log entry: {}", err);
                false
            }
        }
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.len().await
    }

    /// Write every buffered entry. Sink-destined entries are written to their
    /// log like any other; the sink's filter exports them from there.
    pub async fn flush(&self, backend: &dyn Backend) -> LogFlushReport {
        let rendered = self.buffer.drain().await;
        let mut report = LogFlushReport::default();
        if rendered.is_empty() {
            return report;
        }

        let mut entries = Vec::with_capacity(rendered.len());
        for item in rendered {
            if let Some(sink_id) = item.sink_id {
                *report.sink_entries.entry(sink_id).or_insert(0) += 1;
            }
            entries.push(item.entry);
        }

        for chunk in chunked(entries, MAX_ENTRIES_PER_REQUEST) {
            report.requests += 1;
            match backend.write_log_entries(&chunk).await {
                Ok(outcome) => {
                    report.entries_sent += outcome.accepted;
                    if outcome.rejected > 0 {
                        report.entries_rejected += outcome.rejected;
                        self.stats.add_rejected_log_entries(outcome.rejected as u64);
                        warn!(
                            "Backend rejected {} of {} log entries: {}",
                            outcome.rejected,
                            chunk.len(),
                            outcome.messages.join("; ")
                        );
                    }
                }
                Err(err) => {
                    report.failed_requests += 1;
                    self.stats.record_backend_error(&err);
                    error!("Dropping {} log entries: {}", chunk.len(), err);
                }
            }
        }

        for (sink_id, count) in &report.sink_entries {
            debug!("Flushed {} entries destined for sink {}", count, sink_id);
        }
        report
    }
}

fn lookup<'a>(variables: &'a HashMap<String, AttributeValue>, name: &Option<String>) -> Option<&'a AttributeValue> {
    name.as_ref().and_then(|n| variables.get(n))
}

fn text(variables: &HashMap<String, AttributeValue>, name: &Option<String>) -> String {
    lookup(variables, name).map(|v| v.to_string()).unwrap_or_default()
}

fn number(variables: &HashMap<String, AttributeValue>, name: &Option<String>) -> i64 {
    lookup(variables, name).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn latency(variables: &HashMap<String, AttributeValue>, name: &Option<String>) -> Duration {
    match lookup(variables, name) {
        Some(AttributeValue::Duration(d)) => *d,
        Some(other) => other
            .as_f64()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
            .unwrap_or_default(),
        None => Duration::ZERO,
    }
}

/// Build the structured request field by field; absent fields stay empty/zero
fn http_request(mapping: &HttpMapping, variables: &HashMap<String, AttributeValue>) -> HttpRequest {
    HttpRequest {
        request_method: text(variables, &mapping.method),
        request_url: text(variables, &mapping.url),
        request_size: number(variables, &mapping.request_size),
        status: i32::try_from(number(variables, &mapping.status)).unwrap_or(0),
        response_size: number(variables, &mapping.response_size),
        user_agent: text(variables, &mapping.user_agent),
        remote_ip: text(variables, &mapping.remote_ip),
        server_ip: text(variables, &mapping.local_ip),
        referer: text(variables, &mapping.referer),
        latency: latency(variables, &mapping.latency),
    }
}
