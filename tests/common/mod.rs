//! Shared fixtures for scheduler integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use stackdriver_exporter::compiler::Bundle;
use stackdriver_exporter::credentials::{AccessToken, ClientHandle, CredentialResolver, TokenIdentity, TokenProvider};
use stackdriver_exporter::errors::{BackendError, CredentialError};
use stackdriver_exporter::telemetry::{LogEntry, LogSink, MetricDescriptorResource, TimeSeries, TraceSpan};
use stackdriver_exporter::transport::{Backend, BackendConnector, WriteOutcome};
use stackdriver_exporter::{AdapterConfig, ExportScheduler, ExporterStats};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// In-memory backend that records every call
#[derive(Default)]
pub struct RecordingBackend {
    pub descriptors: Mutex<Vec<MetricDescriptorResource>>,
    pub series: Mutex<Vec<Vec<TimeSeries>>>,
    pub entries: Mutex<Vec<Vec<LogEntry>>>,
    pub spans: Mutex<Vec<Vec<TraceSpan>>>,
    pub sinks: Mutex<HashMap<String, LogSink>>,
    pub sink_creates: Mutex<Vec<String>>,
    pub sink_updates: Mutex<Vec<(String, Vec<&'static str>)>>,
    pub fail_writes: AtomicBool,
}

impl RecordingBackend {
    pub fn series_writes(&self) -> Vec<Vec<TimeSeries>> {
        self.series.lock().unwrap().clone()
    }

    pub fn entry_writes(&self) -> Vec<Vec<LogEntry>> {
        self.entries.lock().unwrap().clone()
    }

    pub fn span_writes(&self) -> Vec<Vec<TraceSpan>> {
        self.spans.lock().unwrap().clone()
    }

    /// Every written series, flattened across requests
    pub fn all_series(&self) -> Vec<TimeSeries> {
        self.series_writes().into_iter().flatten().collect()
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn create_metric_descriptor(&self, _: &str, descriptor: &MetricDescriptorResource) -> Result<(), BackendError> {
        self.descriptors.lock().unwrap().push(descriptor.clone());
        Ok(())
    }

    async fn create_time_series(&self, _: &str, series: &[TimeSeries]) -> Result<WriteOutcome, BackendError> {
        self.series.lock().unwrap().push(series.to_vec());
        self.check()?;
        Ok(WriteOutcome::complete(series.len()))
    }

    async fn write_log_entries(&self, entries: &[LogEntry]) -> Result<WriteOutcome, BackendError> {
        self.entries.lock().unwrap().push(entries.to_vec());
        self.check()?;
        Ok(WriteOutcome::complete(entries.len()))
    }

    async fn get_sink(&self, _: &str, sink_id: &str) -> Result<Option<LogSink>, BackendError> {
        Ok(self.sinks.lock().unwrap().get(sink_id).cloned())
    }

    async fn create_sink(&self, _: &str, sink: &LogSink, _: bool) -> Result<LogSink, BackendError> {
        self.sink_creates.lock().unwrap().push(sink.name.clone());
        self.sinks.lock().unwrap().insert(sink.name.clone(), sink.clone());
        Ok(sink.clone())
    }

    async fn update_sink(
        &self,
        _: &str,
        sink: &LogSink,
        update_mask: &[&'static str],
        _: bool,
    ) -> Result<LogSink, BackendError> {
        self.sink_updates
            .lock()
            .unwrap()
            .push((sink.name.clone(), update_mask.to_vec()));
        self.sinks.lock().unwrap().insert(sink.name.clone(), sink.clone());
        Ok(sink.clone())
    }

    async fn batch_write_spans(&self, _: &str, spans: &[TraceSpan]) -> Result<(), BackendError> {
        self.spans.lock().unwrap().push(spans.to_vec());
        self.check()
    }
}

/// Hands the same recording backend to every generation
pub struct RecordingConnector {
    pub backend: Arc<RecordingBackend>,
    pub connects: Mutex<Vec<String>>,
}

impl BackendConnector for RecordingConnector {
    fn connect(&self, bundle: &Bundle, _: ClientHandle) -> Result<Arc<dyn Backend>, BackendError> {
        self.connects.lock().unwrap().push(bundle.project_id.clone());
        Ok(self.backend.clone())
    }
}

pub struct StaticTokenProvider;

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _: &TokenIdentity) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken {
            token: "test-token".to_string(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        })
    }
}

pub fn config(yaml: &str) -> AdapterConfig {
    AdapterConfig::from_yaml_str(yaml).unwrap()
}

pub struct Harness {
    pub scheduler: ExportScheduler,
    pub backend: Arc<RecordingBackend>,
    pub connector: Arc<RecordingConnector>,
}

pub async fn start(yaml: &str) -> Harness {
    start_with(yaml, RecordingBackend::default()).await
}

pub async fn start_with(yaml: &str, backend: RecordingBackend) -> Harness {
    let backend = Arc::new(backend);
    let connector = Arc::new(RecordingConnector {
        backend: backend.clone(),
        connects: Mutex::new(Vec::new()),
    });
    let scheduler = ExportScheduler::start(
        &config(yaml),
        CredentialResolver::new(Arc::new(StaticTokenProvider)),
        connector.clone(),
        Arc::new(ExporterStats::new()),
    )
    .await
    .unwrap();

    Harness {
        scheduler,
        backend,
        connector,
    }
}
