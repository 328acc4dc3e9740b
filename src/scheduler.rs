//! Periodic export scheduler
//!
//! Each compiled configuration becomes a generation holding its own batcher,
//! log renderer, sampler and backend. The current generation sits behind an
//! atomic swap; a reload builds the next generation completely before swapping
//! it in, then drains the old one. Observations hold a read guard on their
//! generation's gate while they mutate it, and a drain closes the gate with the
//! write guard, so no observation lands in a generation after its final flush.

use crate::batcher::{MetricBatcher, MetricFlushReport};
use crate::compiler::{Bundle, compile};
use crate::config::AdapterConfig;
use crate::credentials::CredentialResolver;
use crate::errors::{ExporterError, Result};
use crate::log_renderer::{LogFlushReport, LogRenderer, RenderedEntry};
use crate::sampler::TraceSampler;
use crate::sinks::SinkManager;
use crate::stats::{ExporterStats, StatsSnapshot};
use crate::telemetry::{AttributeValue, LabelSet, TraceSpan};
use crate::transport::{Backend, BackendConnector, InstrumentedBackend, TransportMetricsSnapshot};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, instrument};

/// What one flush of a generation delivered
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub generation: u64,
    pub metrics: MetricFlushReport,
    pub logs: LogFlushReport,
    pub spans_sent: usize,
}

struct Generation {
    id: u64,
    bundle: Bundle,
    backend: Arc<InstrumentedBackend>,
    batcher: MetricBatcher,
    logs: LogRenderer,
    sampler: TraceSampler,
    /// `true` once the generation has been drained
    gate: Arc<RwLock<bool>>,
}

impl Generation {
    async fn flush(&self, stats: &ExporterStats) -> FlushReport {
        let backend: &dyn Backend = self.backend.as_ref();
        let (metrics, spans_sent, logs) = tokio::join!(
            self.batcher.flush(backend),
            self.sampler.flush(backend, &self.bundle.project_id),
            self.logs.flush(backend),
        );
        stats.add_flushes(1);

        FlushReport {
            generation: self.id,
            metrics,
            logs,
            spans_sent,
        }
    }
}

struct Shared {
    current: ArcSwap<Generation>,
    resolver: CredentialResolver,
    connector: Arc<dyn BackendConnector>,
    stats: Arc<ExporterStats>,
    flush_lock: Mutex<()>,
    reload_lock: Mutex<()>,
    next_id: AtomicU64,
    stopped: AtomicBool,
}

/// Compile, resolve credentials and connect. Nothing is swapped in here, so any
/// failure leaves the serving generation untouched.
async fn build_generation(
    id: u64,
    config: &AdapterConfig,
    resolver: &CredentialResolver,
    connector: &dyn BackendConnector,
    stats: &Arc<ExporterStats>,
) -> Result<Generation> {
    let bundle = compile(config)?;
    let client = resolver.resolve(&bundle.credentials).await?;
    let backend = Arc::new(InstrumentedBackend::new(connector.connect(&bundle, client)?));

    let batcher = MetricBatcher::new(&bundle.project_id, &bundle.metrics, Arc::clone(stats));
    let logs = LogRenderer::new(
        &bundle.project_id,
        &bundle.logs,
        bundle.max_buffered_entries,
        Arc::clone(stats),
    );
    let sampler = TraceSampler::new(bundle.trace, bundle.max_buffered_entries, Arc::clone(stats));

    batcher.register_descriptors(backend.as_ref()).await;
    if !bundle.sinks.is_empty() {
        let sinks = SinkManager::new(&bundle.project_id, Arc::clone(stats));
        let report = sinks.ensure_all(backend.as_ref(), &bundle.sinks).await;
        info!("Sinks ready: {}, failed: {}", report.ready.len(), report.failed.len());
    }

    info!(
        "Built generation {} for project {}: {} metrics, {} logs, push interval {:?}",
        id,
        bundle.project_id,
        bundle.metrics.len(),
        bundle.logs.len(),
        bundle.push_interval
    );

    Ok(Generation {
        id,
        bundle,
        backend,
        batcher,
        logs,
        sampler,
        gate: Arc::new(RwLock::new(false)),
    })
}

impl Shared {
    async fn build(&self, config: &AdapterConfig) -> Result<Generation> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        build_generation(id, config, &self.resolver, self.connector.as_ref(), &self.stats).await
    }

    /// Enter the current generation for one observation
    async fn enter(&self) -> Option<(Arc<Generation>, OwnedRwLockReadGuard<bool>)> {
        loop {
            let generation = self.current.load_full();
            let guard = Arc::clone(&generation.gate).read_owned().await;
            if !*guard {
                return Some((generation, guard));
            }
            // Drained: either a newer generation is already current or we are stopping
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn flush_current(&self) -> Option<FlushReport> {
        let _serial = self.flush_lock.lock().await;
        let generation = self.current.load_full();
        if *generation.gate.read().await {
            return None;
        }
        Some(generation.flush(&self.stats).await)
    }

    /// Close the generation's gate and flush what it holds. Runs at most once
    /// per generation.
    async fn drain(&self, generation: &Generation) -> Option<FlushReport> {
        let _serial = self.flush_lock.lock().await;
        {
            let mut closed = generation.gate.write().await;
            if *closed {
                return None;
            }
            *closed = true;
        }
        Some(generation.flush(&self.stats).await)
    }

    async fn log_flush(&self, report: &FlushReport) {
        let generation = self.current.load_full();
        let transport = generation.backend.metrics().await;
        debug!(
            "Flushed generation {}: {} series, {} log entries, {} spans; transport {:.1}% success over {} calls",
            report.generation,
            report.metrics.series_sent,
            report.logs.entries_sent,
            report.spans_sent,
            transport.success_rate,
            transport.attempts
        );
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_timer(shared: Arc<Shared>, mut period_rx: watch::Receiver<Duration>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut flush_interval = ticker(*period_rx.borrow_and_update());

    loop {
        tokio::select! {
            _ = flush_interval.tick() => {
                if let Some(report) = shared.flush_current().await {
                    shared.log_flush(&report).await;
                }
            }
            changed = period_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *period_rx.borrow_and_update();
                flush_interval = ticker(period);
                debug!("Flush timer reset to {:?}", period);
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("Flush timer stopped");
}

/// Owns the current generation and the timer task that flushes it
pub struct ExportScheduler {
    shared: Arc<Shared>,
    period_tx: watch::Sender<Duration>,
    shutdown_tx: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ExportScheduler {
    /// Build the first generation and start the flush timer. Fails when the
    /// configuration or its credentials are unusable.
    #[instrument(skip_all)]
    pub async fn start(
        config: &AdapterConfig,
        resolver: CredentialResolver,
        connector: Arc<dyn BackendConnector>,
        stats: Arc<ExporterStats>,
    ) -> Result<Self> {
        let first = build_generation(1, config, &resolver, connector.as_ref(), &stats).await?;
        let period = first.bundle.push_interval;
        let shared = Arc::new(Shared {
            current: ArcSwap::from_pointee(first),
            resolver,
            connector,
            stats,
            flush_lock: Mutex::new(()),
            reload_lock: Mutex::new(()),
            next_id: AtomicU64::new(2),
            stopped: AtomicBool::new(false),
        });

        let (period_tx, period_rx) = watch::channel(period);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer = tokio::spawn(run_timer(Arc::clone(&shared), period_rx, shutdown_rx));

        info!("Export scheduler started, flushing every {:?}", period);
        Ok(Self {
            shared,
            period_tx,
            shutdown_tx,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Record one metric observation. Never fails; dropped observations are
    /// counted. Returns whether it was kept.
    pub async fn record(&self, name: &str, value: &AttributeValue, labels: LabelSet, timestamp: DateTime<Utc>) -> bool {
        let Some((generation, _guard)) = self.shared.enter().await else {
            return false;
        };
        generation.batcher.record(name, value, labels, timestamp).await
    }

    /// Render an entry against the current generation without queueing it
    pub fn render(&self, log_name: &str, variables: &HashMap<String, AttributeValue>) -> Result<RenderedEntry> {
        self.shared.current.load().logs.render(log_name, variables)
    }

    /// Render and queue a log entry for the next flush
    pub async fn log(&self, log_name: &str, variables: &HashMap<String, AttributeValue>) -> bool {
        let Some((generation, _guard)) = self.shared.enter().await else {
            return false;
        };
        generation.logs.submit(log_name, variables).await
    }

    pub fn should_sample(&self) -> bool {
        self.shared.current.load().sampler.should_sample()
    }

    /// Sample a finished span and queue it if kept
    pub async fn submit_span(&self, span: TraceSpan) -> bool {
        let Some((generation, _guard)) = self.shared.enter().await else {
            return false;
        };
        generation.sampler.submit(span).await
    }

    /// Flush the current generation now, outside the timer
    pub async fn flush_now(&self) -> Option<FlushReport> {
        self.shared.flush_current().await
    }

    /// Replace the configuration. The new generation is fully built before it is
    /// swapped in; on error the current generation keeps serving.
    #[instrument(skip_all)]
    pub async fn reload(&self, config: &AdapterConfig) -> Result<FlushReport> {
        let _reloading = self.shared.reload_lock.lock().await;
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(ExporterError::ShutDown);
        }

        let next = match self.shared.build(config).await {
            Ok(next) => next,
            Err(err) => {
                error!("Reload rejected, keeping current configuration: {}", err);
                return Err(err);
            }
        };
        let period = next.bundle.push_interval;
        let next_id = next.id;

        let old = self.shared.current.swap(Arc::new(next));
        let report = self.shared.drain(&old).await.unwrap_or_default();
        self.period_tx.send_replace(period);

        info!("Reloaded configuration: generation {} replaced {}", next_id, old.id);
        Ok(report)
    }

    /// Stop the timer, wait for any in-flight flush, then drain the current
    /// generation once. Later calls return [`ExporterError::ShutDown`].
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<FlushReport> {
        let _reloading = self.shared.reload_lock.lock().await;
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return Err(ExporterError::ShutDown);
        }
        info!("Performing graceful shutdown");

        self.shutdown_tx.send_replace(true);
        if let Some(timer) = self.timer.lock().await.take() {
            if let Err(err) = timer.await {
                error!("Flush timer task failed: {}", err);
            }
        }

        let generation = self.shared.current.load_full();
        let report = self.shared.drain(&generation).await.unwrap_or_default();

        let transport = generation.backend.metrics().await;
        info!(
            "Final transport metrics - Success rate: {:.1}%, Total attempts: {}, Avg duration: {}ms",
            transport.success_rate, transport.attempts, transport.avg_duration_ms
        );
        info!("Export scheduler shutdown complete");
        Ok(report)
    }

    pub fn generation(&self) -> u64 {
        self.shared.current.load().id
    }

    pub fn project_id(&self) -> String {
        self.shared.current.load().bundle.project_id.clone()
    }

    pub fn push_interval(&self) -> Duration {
        self.shared.current.load().bundle.push_interval
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Transport metrics of the current generation's backend
    pub async fn transport_metrics(&self) -> TransportMetricsSnapshot {
        let generation = self.shared.current.load_full();
        generation.backend.metrics().await
    }
}

impl Drop for ExportScheduler {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
