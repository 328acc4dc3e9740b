//! Per-window metric aggregation
//!
//! Every configured metric owns its own lock, so concurrent `record` calls only
//! contend when they hit the same metric. Network I/O happens in
//! [`MetricBatcher::flush`] only.

use crate::buffer::chunked;
use crate::compiler::MetricDescriptor;
use crate::config::{MetricKind, ValueType};
use crate::stats::ExporterStats;
use crate::telemetry::{
    AttributeValue, Distribution, LabelDescriptor, LabelSet, Metric, MetricDescriptorResource, MonitoredResource,
    Point, TimeInterval, TimeSeries, TypedValue,
};
use crate::transport::Backend;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Backend limit on time series per write request
pub const MAX_SERIES_PER_REQUEST: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherState {
    Idle,
    Accumulating,
    Flushing,
}

#[derive(Debug, Clone, PartialEq)]
enum Accumulated {
    Bool(bool),
    Int64(i64),
    Double(f64),
    String(String),
    Distribution(Histogram),
}

#[derive(Debug, Clone, PartialEq)]
struct Histogram {
    count: i64,
    mean: f64,
    sum_of_squared_deviation: f64,
    bucket_counts: Vec<i64>,
}

impl Histogram {
    fn new(buckets: usize) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            sum_of_squared_deviation: 0.0,
            bucket_counts: vec![0; buckets],
        }
    }

    fn add(&mut self, value: f64, bucket: usize) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.sum_of_squared_deviation += delta * (value - self.mean);
        self.bucket_counts[bucket] += 1;
    }
}

#[derive(Debug)]
struct SeriesState {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    value: Accumulated,
    dirty: bool,
    /// Set once a point for this series has been written; a CUMULATIVE start is fixed from then on
    emitted: bool,
}

struct MetricState {
    descriptor: MetricDescriptor,
    series: Mutex<HashMap<LabelSet, SeriesState>>,
}

/// Series collected from one window, grouped by metric
#[derive(Debug, Clone)]
pub struct MetricBatch {
    pub metric: String,
    pub series: Vec<TimeSeries>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFlushReport {
    pub requests: usize,
    pub series_sent: usize,
    pub points_rejected: usize,
    pub failed_requests: usize,
}

pub struct MetricBatcher {
    project_id: String,
    resource: MonitoredResource,
    metrics: HashMap<String, MetricState>,
    stats: Arc<ExporterStats>,
    pending: AtomicUsize,
    flushing: AtomicBool,
}

impl MetricBatcher {
    pub fn new(
        project_id: &str,
        descriptors: &BTreeMap<String, MetricDescriptor>,
        stats: Arc<ExporterStats>,
    ) -> Self {
        let metrics = descriptors
            .iter()
            .map(|(name, descriptor)| {
                (
                    name.clone(),
                    MetricState {
                        descriptor: descriptor.clone(),
                        series: Mutex::new(HashMap::new()),
                    },
                )
            })
            .collect();

        Self {
            project_id: project_id.to_string(),
            resource: MonitoredResource::global(project_id),
            metrics,
            stats,
            pending: AtomicUsize::new(0),
            flushing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> BatcherState {
        if self.flushing.load(Ordering::Acquire) {
            BatcherState::Flushing
        } else if self.pending.load(Ordering::Acquire) > 0 {
            BatcherState::Accumulating
        } else {
            BatcherState::Idle
        }
    }

    /// Record one observation. Unknown metrics and unconvertible values are
    /// counted and dropped; returns whether the observation was kept.
    pub async fn record(
        &self,
        name: &str,
        value: &AttributeValue,
        labels: LabelSet,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(state) = self.metrics.get(name) else {
            self.stats.add_unknown_metrics(1);
            debug!("Dropping observation for unknown metric {}", name);
            return false;
        };
        let descriptor = &state.descriptor;

        let Some(observed) = convert(descriptor, value) else {
            self.stats.add_invalid_values(1);
            debug!(
                "Dropping value {:?} not convertible to {} for metric {}",
                value,
                descriptor.value_type.as_str(),
                name
            );
            return false;
        };

        let mut series = state.series.lock().await;
        match series.get_mut(&labels) {
            Some(existing) => merge(descriptor.kind, existing, observed, timestamp),
            None => {
                let value = match observed {
                    Observed::Scalar(value) => value,
                    Observed::Sample(sample, bucket) => {
                        let mut histogram = Histogram::new(bucket_count(descriptor));
                        histogram.add(sample, bucket);
                        Accumulated::Distribution(histogram)
                    }
                };
                series.insert(
                    labels,
                    SeriesState {
                        start_time: timestamp,
                        end_time: timestamp,
                        value,
                        dirty: true,
                        emitted: false,
                    },
                );
            }
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Take the current window. GAUGE and DELTA state resets; CUMULATIVE totals
    /// carry over to the next window.
    ///
    /// CUMULATIVE series are never evicted here, so their map grows with the
    /// number of distinct label sets seen during this batcher's lifetime. A
    /// reload builds a fresh batcher and releases them.
    pub async fn take_window(&self) -> Vec<MetricBatch> {
        self.pending.store(0, Ordering::Release);
        let mut batches = Vec::new();

        for (name, state) in &self.metrics {
            let descriptor = &state.descriptor;
            let mut series = state.series.lock().await;

            let collected: Vec<TimeSeries> = series
                .iter_mut()
                .filter(|(_, s)| s.dirty)
                .map(|(labels, s)| {
                    s.dirty = false;
                    s.emitted = true;
                    self.to_time_series(descriptor, labels, s)
                })
                .collect();

            if descriptor.kind != MetricKind::Cumulative {
                series.clear();
            }

            if !collected.is_empty() {
                batches.push(MetricBatch {
                    metric: name.clone(),
                    series: collected,
                });
            }
        }

        batches
    }

    /// Flush the current window: one write request per metric, each split at the
    /// backend's per-request limit. Failures are logged and counted; the window
    /// is not retried.
    pub async fn flush(&self, backend: &dyn Backend) -> MetricFlushReport {
        self.flushing.store(true, Ordering::Release);
        let batches = self.take_window().await;
        let mut report = MetricFlushReport::default();

        if batches.is_empty() {
            self.flushing.store(false, Ordering::Release);
            return report;
        }

        let requests: Vec<(String, Vec<TimeSeries>)> = batches
            .into_iter()
            .flat_map(|batch| {
                let metric = batch.metric;
                chunked(batch.series, MAX_SERIES_PER_REQUEST)
                    .into_iter()
                    .map(move |chunk| (metric.clone(), chunk))
            })
            .collect();

        let sends = requests.iter().map(|(metric, series)| async move {
            (metric, series.len(), backend.create_time_series(&self.project_id, series).await)
        });

        for (metric, sent, result) in join_all(sends).await {
            report.requests += 1;
            match result {
                Ok(outcome) if outcome.rejected > 0 => {
                    report.series_sent += outcome.accepted;
                    report.points_rejected += outcome.rejected;
                    self.stats.add_rejected_points(outcome.rejected as u64);
                    warn!(
                        "Backend rejected {} of {} points for metric {}: {}",
                        outcome.rejected,
                        outcome.accepted + outcome.rejected,
                        metric,
                        outcome.messages.join("; ")
                    );
                }
                Ok(outcome) => {
                    report.series_sent += outcome.accepted;
                    debug!("Wrote {} series for metric {}", sent, metric);
                }
                Err(err) => {
                    report.failed_requests += 1;
                    self.stats.record_backend_error(&err);
                    error!("Dropping {} series for metric {}: {}", sent, metric, err);
                }
            }
        }

        self.flushing.store(false, Ordering::Release);
        report
    }

    /// Register every metric descriptor with the backend; failures are logged
    pub async fn register_descriptors(&self, backend: &dyn Backend) {
        for state in self.metrics.values() {
            let descriptor = &state.descriptor;
            if let Some(buckets) = &descriptor.buckets {
                debug!(
                    "Metric {} uses bucket boundaries {:?}",
                    descriptor.name,
                    buckets.boundaries()
                );
            }

            let resource = MetricDescriptorResource {
                metric_type: descriptor.backend_metric_type.clone(),
                metric_kind: descriptor.kind.as_str(),
                value_type: descriptor.value_type.as_str(),
                labels: descriptor
                    .label_names
                    .iter()
                    .map(|key| LabelDescriptor {
                        key: key.clone(),
                        value_type: "STRING",
                    })
                    .collect(),
                description: descriptor.description.clone(),
                display_name: descriptor.name.clone(),
            };

            match backend.create_metric_descriptor(&self.project_id, &resource).await {
                Ok(()) => info!("Registered metric descriptor {}", resource.metric_type),
                Err(err) => {
                    self.stats.add_descriptor_errors(1);
                    self.stats.record_backend_error(&err);
                    warn!("Failed to register metric descriptor {}: {}", resource.metric_type, err);
                }
            }
        }
    }

    fn to_time_series(&self, descriptor: &MetricDescriptor, labels: &LabelSet, state: &SeriesState) -> TimeSeries {
        let interval = match descriptor.kind {
            MetricKind::Gauge => TimeInterval {
                start_time: None,
                end_time: state.end_time,
            },
            // start must precede end for non-gauge points
            MetricKind::Delta | MetricKind::Cumulative => {
                let end_time = if state.end_time > state.start_time {
                    state.end_time
                } else {
                    state.start_time + chrono::Duration::milliseconds(1)
                };
                TimeInterval {
                    start_time: Some(state.start_time),
                    end_time,
                }
            }
        };

        let value = match &state.value {
            Accumulated::Bool(v) => TypedValue::BoolValue(*v),
            Accumulated::Int64(v) => TypedValue::Int64Value(*v),
            Accumulated::Double(v) => TypedValue::DoubleValue(*v),
            Accumulated::String(v) => TypedValue::StringValue(v.clone()),
            Accumulated::Distribution(h) => TypedValue::DistributionValue(Distribution {
                count: h.count,
                mean: h.mean,
                sum_of_squared_deviation: h.sum_of_squared_deviation,
                bucket_options: descriptor
                    .buckets
                    .as_ref()
                    .map(|b| b.options())
                    .unwrap_or(crate::buckets::BucketOptions::ExplicitBuckets { bounds: vec![] }),
                bucket_counts: h.bucket_counts.clone(),
            }),
        };

        TimeSeries {
            metric: Metric {
                metric_type: descriptor.backend_metric_type.clone(),
                labels: labels.clone(),
            },
            resource: self.resource.clone(),
            metric_kind: descriptor.kind.as_str(),
            value_type: descriptor.value_type.as_str(),
            points: vec![Point { interval, value }],
        }
    }
}

enum Observed {
    Scalar(Accumulated),
    Sample(f64, usize),
}

fn bucket_count(descriptor: &MetricDescriptor) -> usize {
    descriptor.buckets.as_ref().map_or(1, |b| b.bucket_count())
}

fn convert(descriptor: &MetricDescriptor, value: &AttributeValue) -> Option<Observed> {
    match descriptor.value_type {
        ValueType::Bool => match value {
            AttributeValue::Bool(v) => Some(Observed::Scalar(Accumulated::Bool(*v))),
            _ => None,
        },
        ValueType::Int64 => value.as_i64().map(|v| Observed::Scalar(Accumulated::Int64(v))),
        ValueType::Double => value
            .as_f64()
            .filter(|v| v.is_finite())
            .map(|v| Observed::Scalar(Accumulated::Double(v))),
        ValueType::String => Some(Observed::Scalar(Accumulated::String(value.to_string()))),
        ValueType::Distribution => {
            let sample = value.as_f64().filter(|v| v.is_finite())?;
            let bucket = descriptor.buckets.as_ref()?.index(sample);
            Some(Observed::Sample(sample, bucket))
        }
    }
}

fn merge(kind: MetricKind, state: &mut SeriesState, observed: Observed, timestamp: DateTime<Utc>) {
    if timestamp > state.end_time {
        state.end_time = timestamp;
    }
    // out-of-order arrivals widen the interval backwards
    if timestamp < state.start_time && (kind == MetricKind::Delta || !state.emitted) {
        state.start_time = timestamp;
    }
    state.dirty = true;

    if kind == MetricKind::Gauge {
        state.start_time = timestamp;
        state.end_time = timestamp;
    }

    match (kind, &mut state.value, observed) {
        (MetricKind::Gauge, value, Observed::Scalar(new)) => *value = new,
        (_, Accumulated::Int64(total), Observed::Scalar(Accumulated::Int64(v))) => {
            *total = total.saturating_add(v)
        }
        (_, Accumulated::Double(total), Observed::Scalar(Accumulated::Double(v))) => *total += v,
        (_, Accumulated::Distribution(h), Observed::Sample(sample, bucket)) => h.add(sample, bucket),
        (_, value, Observed::Scalar(new)) => *value = new,
        (_, _, Observed::Sample(..)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::config::AdapterConfig;
    use crate::errors::BackendError;
    use crate::telemetry::{LogEntry, LogSink, TraceSpan};
    use crate::transport::WriteOutcome;
    use async_trait::async_trait;
    use chrono::TimeZone;

    #[derive(Default)]
    struct SeriesSink {
        writes: std::sync::Mutex<Vec<Vec<TimeSeries>>>,
        reject: usize,
        fail: bool,
    }

    #[async_trait]
    impl Backend for SeriesSink {
        async fn create_metric_descriptor(&self, _: &str, _: &MetricDescriptorResource) -> Result<(), BackendError> {
            Ok(())
        }

        async fn create_time_series(&self, _: &str, series: &[TimeSeries]) -> Result<WriteOutcome, BackendError> {
            self.writes.lock().unwrap().push(series.to_vec());
            if self.fail {
                return Err(BackendError::Status { status: 503, body: "unavailable".to_string() });
            }
            Ok(WriteOutcome {
                accepted: series.len() - self.reject.min(series.len()),
                rejected: self.reject.min(series.len()),
                messages: vec!["rejected".to_string()],
            })
        }

        async fn write_log_entries(&self, entries: &[LogEntry]) -> Result<WriteOutcome, BackendError> {
            Ok(WriteOutcome::complete(entries.len()))
        }

        async fn get_sink(&self, _: &str, _: &str) -> Result<Option<LogSink>, BackendError> {
            Ok(None)
        }

        async fn create_sink(&self, _: &str, sink: &LogSink, _: bool) -> Result<LogSink, BackendError> {
            Ok(sink.clone())
        }

        async fn update_sink(&self, _: &str, sink: &LogSink, _: &[&'static str], _: bool) -> Result<LogSink, BackendError> {
            Ok(sink.clone())
        }

        async fn batch_write_spans(&self, _: &str, _: &[TraceSpan]) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn batcher(yaml: &str) -> (MetricBatcher, Arc<ExporterStats>) {
        let bundle = compile(&AdapterConfig::from_yaml_str(yaml).unwrap()).unwrap();
        let stats = Arc::new(ExporterStats::new());
        (MetricBatcher::new(&bundle.project_id, &bundle.metrics, stats.clone()), stats)
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    const DISTRIBUTION: &str = r#"
projectID: p
pushInterval: 10s
metricInfo:
  requests:
    value: DISTRIBUTION
    kind: DELTA
    buckets:
      linear: {numFiniteBuckets: 2, width: 10, offset: 0}
"#;

    #[tokio::test]
    async fn test_distribution_bucket_counts() {
        let (batcher, _) = batcher(DISTRIBUTION);
        for (i, v) in [5.0, 15.0, 25.0].into_iter().enumerate() {
            assert!(batcher.record("requests", &AttributeValue::Double(v), LabelSet::new(), at(i as u32)).await);
        }

        let window = batcher.take_window().await;
        assert_eq!(window.len(), 1);
        let series = &window[0].series;
        assert_eq!(series.len(), 1);

        let TypedValue::DistributionValue(dist) = &series[0].points[0].value else {
            panic!("expected distribution");
        };
        assert_eq!(dist.bucket_counts, vec![0, 1, 1, 1]);
        assert_eq!(dist.count, 3);
        assert!((dist.mean - 15.0).abs() < 1e-9);
        assert!((dist.sum_of_squared_deviation - 200.0).abs() < 1e-9);
        assert_eq!(series[0].points[0].interval.start_time, Some(at(0)));
        assert_eq!(series[0].points[0].interval.end_time, at(2));
    }

    #[tokio::test]
    async fn test_unknown_metric_counted() {
        let (batcher, stats) = batcher(DISTRIBUTION);
        assert!(!batcher.record("nope", &AttributeValue::Int64(1), LabelSet::new(), at(0)).await);
        assert_eq!(stats.snapshot().unknown_metrics, 1);
        assert_eq!(batcher.state(), BatcherState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_value_counted() {
        let (batcher, stats) = batcher(DISTRIBUTION);
        assert!(!batcher.record("requests", &AttributeValue::from("abc"), LabelSet::new(), at(0)).await);
        assert!(!batcher.record("requests", &AttributeValue::Double(f64::NAN), LabelSet::new(), at(0)).await);
        assert_eq!(stats.snapshot().invalid_values, 2);
    }

    #[tokio::test]
    async fn test_series_keyed_by_labels() {
        let (batcher, _) = batcher("projectID: p\nmetricInfo:\n  hits: {value: INT64, kind: DELTA}");
        batcher.record("hits", &AttributeValue::Int64(1), labels(&[("code", "200")]), at(0)).await;
        batcher.record("hits", &AttributeValue::Int64(2), labels(&[("code", "200")]), at(1)).await;
        batcher.record("hits", &AttributeValue::Int64(5), labels(&[("code", "500")]), at(1)).await;

        let window = batcher.take_window().await;
        let mut values: Vec<(String, TypedValue)> = window[0]
            .series
            .iter()
            .map(|s| (s.metric.labels["code"].clone(), s.points[0].value.clone()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(
            values,
            vec![
                ("200".to_string(), TypedValue::Int64Value(3)),
                ("500".to_string(), TypedValue::Int64Value(5)),
            ]
        );
        assert!(batcher.take_window().await.is_empty());
    }

    #[tokio::test]
    async fn test_gauge_last_value_wins() {
        let (batcher, _) = batcher("projectID: p\nmetricInfo:\n  temp: {value: DOUBLE}");
        batcher.record("temp", &AttributeValue::Double(1.0), LabelSet::new(), at(0)).await;
        batcher.record("temp", &AttributeValue::Double(7.5), LabelSet::new(), at(3)).await;

        let window = batcher.take_window().await;
        let point = &window[0].series[0].points[0];
        assert_eq!(point.value, TypedValue::DoubleValue(7.5));
        assert_eq!(point.interval.start_time, None);
        assert_eq!(point.interval.end_time, at(3));
    }

    #[tokio::test]
    async fn test_cumulative_carries_over() {
        let (batcher, _) = batcher("projectID: p\nmetricInfo:\n  total: {value: INT64, kind: CUMULATIVE}");
        batcher.record("total", &AttributeValue::Int64(2), LabelSet::new(), at(0)).await;
        batcher.take_window().await;

        assert!(batcher.take_window().await.is_empty());

        batcher.record("total", &AttributeValue::Int64(3), LabelSet::new(), at(5)).await;
        let window = batcher.take_window().await;
        let point = &window[0].series[0].points[0];
        assert_eq!(point.value, TypedValue::Int64Value(5));
        assert_eq!(point.interval.start_time, Some(at(0)));
        assert_eq!(point.interval.end_time, at(5));
    }

    #[tokio::test]
    async fn test_delta_interval_covers_late_arrivals() {
        let (batcher, _) = batcher("projectID: p\nmetricInfo:\n  hits: {value: INT64, kind: DELTA}");
        batcher.record("hits", &AttributeValue::Int64(1), LabelSet::new(), at(5)).await;
        batcher.record("hits", &AttributeValue::Int64(1), LabelSet::new(), at(2)).await;

        let window = batcher.take_window().await;
        let point = &window[0].series[0].points[0];
        assert_eq!(point.value, TypedValue::Int64Value(2));
        assert_eq!(point.interval.start_time, Some(at(2)));
        assert_eq!(point.interval.end_time, at(5));
    }

    #[tokio::test]
    async fn test_cumulative_start_fixed_once_written() {
        let (batcher, _) = batcher("projectID: p\nmetricInfo:\n  total: {value: INT64, kind: CUMULATIVE}");
        batcher.record("total", &AttributeValue::Int64(1), LabelSet::new(), at(5)).await;
        batcher.record("total", &AttributeValue::Int64(1), LabelSet::new(), at(3)).await;
        let window = batcher.take_window().await;
        assert_eq!(window[0].series[0].points[0].interval.start_time, Some(at(3)));

        batcher.record("total", &AttributeValue::Int64(1), LabelSet::new(), at(1)).await;
        let window = batcher.take_window().await;
        let point = &window[0].series[0].points[0];
        assert_eq!(point.value, TypedValue::Int64Value(3));
        assert_eq!(point.interval.start_time, Some(at(3)));
        assert_eq!(point.interval.end_time, at(5));
    }

    #[tokio::test]
    async fn test_empty_flush_makes_no_call() {
        let (batcher, _) = batcher(DISTRIBUTION);
        let backend = SeriesSink::default();
        let report = batcher.flush(&backend).await;
        assert_eq!(report, MetricFlushReport::default());
        assert!(backend.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_one_request_per_metric() {
        let (batcher, _) = batcher("projectID: p\nmetricInfo:\n  a: {value: INT64}\n  b: {value: INT64}");
        batcher.record("a", &AttributeValue::Int64(1), LabelSet::new(), at(0)).await;
        batcher.record("b", &AttributeValue::Int64(1), labels(&[("x", "1")]), at(0)).await;
        batcher.record("b", &AttributeValue::Int64(1), labels(&[("x", "2")]), at(0)).await;
        assert_eq!(batcher.state(), BatcherState::Accumulating);

        let backend = SeriesSink::default();
        let report = batcher.flush(&backend).await;
        assert_eq!(report.requests, 2);
        assert_eq!(report.series_sent, 3);
        assert_eq!(batcher.state(), BatcherState::Idle);

        let writes = backend.writes.lock().unwrap();
        assert!(writes.iter().all(|w| w.iter().all(|s| s.metric.metric_type == w[0].metric.metric_type)));
    }

    #[tokio::test]
    async fn test_flush_chunks_large_metrics() {
        let (batcher, _) = batcher("projectID: p\nmetricInfo:\n  a: {value: INT64}");
        for i in 0..(MAX_SERIES_PER_REQUEST + 1) {
            let key = i.to_string();
            batcher.record("a", &AttributeValue::Int64(1), labels(&[("i", key.as_str())]), at(0)).await;
        }

        let backend = SeriesSink::default();
        let report = batcher.flush(&backend).await;
        assert_eq!(report.requests, 2);
        assert_eq!(report.series_sent, MAX_SERIES_PER_REQUEST + 1);
    }

    #[tokio::test]
    async fn test_partial_failure_not_retried() {
        let (batcher, stats) = batcher("projectID: p\nmetricInfo:\n  a: {value: INT64}");
        batcher.record("a", &AttributeValue::Int64(1), labels(&[("x", "1")]), at(0)).await;
        batcher.record("a", &AttributeValue::Int64(1), labels(&[("x", "2")]), at(0)).await;

        let backend = SeriesSink {
            reject: 1,
            ..Default::default()
        };
        let report = batcher.flush(&backend).await;
        assert_eq!(report.points_rejected, 1);
        assert_eq!(report.series_sent, 1);
        assert_eq!(stats.snapshot().rejected_points, 1);

        batcher.flush(&backend).await;
        assert_eq!(backend.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_drops_window() {
        let (batcher, stats) = batcher("projectID: p\nmetricInfo:\n  a: {value: INT64}");
        batcher.record("a", &AttributeValue::Int64(1), LabelSet::new(), at(0)).await;

        let backend = SeriesSink {
            fail: true,
            ..Default::default()
        };
        let report = batcher.flush(&backend).await;
        assert_eq!(report.failed_requests, 1);
        assert_eq!(report.series_sent, 0);
        assert_eq!(stats.snapshot().backend_errors, 1);
        assert!(batcher.take_window().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_records() {
        let (batcher, _) = batcher("projectID: p\nmetricInfo:\n  a: {value: INT64, kind: DELTA}");
        let batcher = Arc::new(batcher);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let batcher = batcher.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        batcher.record("a", &AttributeValue::Int64(1), LabelSet::new(), Utc::now()).await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let window = batcher.take_window().await;
        assert_eq!(window[0].series[0].points[0].value, TypedValue::Int64Value(1000));
    }
}
