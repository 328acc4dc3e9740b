//! Probabilistic trace sampling and span delivery

use crate::buffer::{BoundedBuffer, chunked};
use crate::compiler::TraceConfig;
use crate::stats::ExporterStats;
use crate::telemetry::TraceSpan;
use crate::transport::Backend;
use std::sync::Arc;
use tracing::{debug, warn};

/// Spans per batch-write request
pub const MAX_SPANS_PER_REQUEST: usize = 1000;

pub struct TraceSampler {
    probability: f64,
    buffer: BoundedBuffer<TraceSpan>,
    stats: Arc<ExporterStats>,
}

impl TraceSampler {
    pub fn new(config: TraceConfig, max_buffered: usize, stats: Arc<ExporterStats>) -> Self {
        Self {
            probability: config.sample_probability,
            buffer: BoundedBuffer::new("span", max_buffered),
            stats,
        }
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// 0 never samples, 1 always samples
    pub fn should_sample(&self) -> bool {
        if self.probability <= 0.0 {
            false
        } else if self.probability >= 1.0 {
            true
        } else {
            rand::random::<f64>() < self.probability
        }
    }

    /// Sample `span` and queue it for the next flush; returns whether it was kept
    pub async fn submit(&self, span: TraceSpan) -> bool {
        if !self.should_sample() {
            self.stats.add_spans_unsampled(1);
            return false;
        }

        self.stats.add_spans_sampled(1);
        if self.buffer.push(span).await {
            self.stats.add_buffer_overflows(1);
        }
        true
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.len().await
    }

    /// Send every queued span. Failures are logged and counted, never returned.
    pub async fn flush(&self, backend: &dyn Backend, project_id: &str) -> usize {
        let spans = self.buffer.drain().await;
        if spans.is_empty() {
            return 0;
        }

        let mut sent = 0;
        for chunk in chunked(spans, MAX_SPANS_PER_REQUEST) {
            match backend.batch_write_spans(project_id, &chunk).await {
                Ok(()) => sent += chunk.len(),
                Err(err) => {
                    self.stats.record_backend_error(&err);
                    warn!("Dropping {} spans: {}", chunk.len(), err);
                }
            }
        }
        debug!("Sent {} spans", sent);
        sent
    }
}
