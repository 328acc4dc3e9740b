//! Idempotent upsert of log export sinks

use crate::compiler::SinkSpec;
use crate::errors::SinkError;
use crate::stats::ExporterStats;
use crate::telemetry::LogSink;
use crate::transport::Backend;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Per-sink outcome of one [`SinkManager::ensure_all`] pass
#[derive(Debug, Default)]
pub struct SinkReport {
    pub ready: Vec<String>,
    pub failed: BTreeMap<String, SinkError>,
}

impl SinkReport {
    pub fn is_ready(&self, sink_id: &str) -> bool {
        self.ready.iter().any(|id| id == sink_id)
    }
}

pub struct SinkManager {
    project_id: String,
    stats: Arc<ExporterStats>,
}

impl SinkManager {
    pub fn new(project_id: &str, stats: Arc<ExporterStats>) -> Self {
        Self {
            project_id: project_id.to_string(),
            stats,
        }
    }

    /// Create the sink if it does not exist; otherwise update only the fields
    /// whose update flag is set. With no flags set an existing sink is left alone.
    pub async fn ensure_sink(&self, backend: &dyn Backend, spec: &SinkSpec) -> Result<LogSink, SinkError> {
        let wrap = |source| SinkError {
            sink_id: spec.id.clone(),
            source,
        };

        let Some(existing) = backend.get_sink(&self.project_id, &spec.id).await.map_err(wrap)? else {
            let sink = LogSink {
                name: spec.id.clone(),
                destination: spec.destination.clone(),
                filter: spec.filter.clone(),
                ..Default::default()
            };
            let created = backend
                .create_sink(&self.project_id, &sink, spec.unique_writer_identity)
                .await
                .map_err(wrap)?;
            info!("Created sink {} -> {}", spec.id, created.destination);
            return Ok(created);
        };

        let (sink, mask) = update_for(&existing, spec);
        if mask.is_empty() {
            return Ok(existing);
        }

        let updated = backend
            .update_sink(&self.project_id, &sink, &mask, spec.unique_writer_identity)
            .await
            .map_err(wrap)?;
        info!("Updated sink {} ({})", spec.id, mask.join(","));
        Ok(updated)
    }

    /// Upsert every sink. A failing sink is counted and logged and never stops
    /// the others.
    pub async fn ensure_all(&self, backend: &dyn Backend, specs: &[SinkSpec]) -> SinkReport {
        let mut report = SinkReport::default();
        for spec in specs {
            match self.ensure_sink(backend, spec).await {
                Ok(_) => report.ready.push(spec.id.clone()),
                Err(err) => {
                    self.stats.add_sink_errors(1);
                    error!("{}; entries for it still go to the project log", err);
                    report.failed.insert(spec.id.clone(), err);
                }
            }
        }
        report
    }
}

/// Overlay the flagged fields of `spec` onto `existing`
fn update_for(existing: &LogSink, spec: &SinkSpec) -> (LogSink, Vec<&'static str>) {
    let mut sink = existing.clone();
    let mut mask = Vec::new();

    if spec.update_destination {
        sink.destination = spec.destination.clone();
        mask.push("destination");
    }
    if spec.update_filter {
        sink.filter = spec.filter.clone();
        mask.push("filter");
    }
    if spec.update_include_children {
        sink.include_children = false;
        mask.push("includeChildren");
    }
    (sink, mask)
}
