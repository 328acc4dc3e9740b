//! Compiles the raw configuration document into an immutable [`Bundle`]
//!
//! Compilation is all-or-nothing: the first invalid field aborts with a
//! [`ConfigError`] naming its path.

use crate::buckets::{BucketLayout, BucketResolver, MAX_BUCKET_COUNT};
use crate::config::{AdapterConfig, BucketsDefinition, HttpMapping, LogInfo, MetricInfo, MetricKind, SinkInfo, ValueType};
use crate::credentials::CredentialMode;
use crate::errors::ConfigError;
use crate::template::Template;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_METRIC_NAMESPACE: &str = "googleapis.com";
pub const DEFAULT_MAX_BUFFERED_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct MetricDescriptor {
    pub name: String,
    pub kind: MetricKind,
    pub value_type: ValueType,
    pub buckets: Option<BucketResolver>,
    pub backend_metric_type: String,
    pub label_names: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct LogMapping {
    pub name: String,
    pub label_names: Vec<String>,
    pub template: Template,
    pub http_mapping: Option<HttpMapping>,
    pub sink: Option<SinkSpec>,
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkSpec {
    pub id: String,
    pub destination: String,
    pub filter: String,
    pub unique_writer_identity: bool,
    pub update_destination: bool,
    pub update_filter: bool,
    pub update_include_children: bool,
}

impl SinkSpec {
    pub fn has_updates(&self) -> bool {
        self.update_destination || self.update_filter || self.update_include_children
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceConfig {
    pub sample_probability: f64,
}

/// One compiled configuration generation
#[derive(Debug, Clone)]
pub struct Bundle {
    pub project_id: String,
    pub endpoint: Option<String>,
    pub push_interval: Duration,
    pub request_timeout: Duration,
    pub max_buffered_entries: usize,
    pub credentials: CredentialMode,
    pub metrics: BTreeMap<String, MetricDescriptor>,
    pub logs: BTreeMap<String, LogMapping>,
    pub sinks: Vec<SinkSpec>,
    pub trace: TraceConfig,
}

pub fn compile(config: &AdapterConfig) -> Result<Bundle, ConfigError> {
    if config.project_id.trim().is_empty() {
        return Err(ConfigError::new("projectID", "must be set"));
    }

    let push_interval = match config.push_interval {
        Some(interval) if !interval.is_zero() => interval,
        _ => DEFAULT_PUSH_INTERVAL,
    };

    let request_timeout = match config.request_timeout {
        Some(timeout) if !timeout.is_zero() => timeout,
        _ => DEFAULT_REQUEST_TIMEOUT,
    };

    let max_buffered_entries = match config.max_buffered_entries {
        Some(0) => return Err(ConfigError::new("maxBufferedEntries", "must be greater than 0")),
        Some(n) => n,
        None => DEFAULT_MAX_BUFFERED_ENTRIES,
    };

    let credentials = compile_credentials(config)?;

    let namespace = config
        .metric_namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(DEFAULT_METRIC_NAMESPACE);

    let mut metrics = BTreeMap::new();
    for (name, info) in &config.metric_info {
        metrics.insert(name.clone(), compile_metric(name, info, namespace)?);
    }

    let mut logs = BTreeMap::new();
    let mut sinks: Vec<SinkSpec> = Vec::new();
    for (name, info) in &config.log_info {
        let mapping = compile_log(name, info)?;
        if let Some(sink) = &mapping.sink {
            match sinks.iter().find(|existing| existing.id == sink.id) {
                Some(existing) if existing != sink => {
                    return Err(ConfigError::new(
                        format!("logInfo.{}.sinkInfo.id", name),
                        format!("sink `{}` is declared with conflicting settings", sink.id),
                    ));
                }
                Some(_) => {}
                None => sinks.push(sink.clone()),
            }
        }
        logs.insert(name.clone(), mapping);
    }

    let probability = config.trace.sample_probability;
    if !(0.0..=1.0).contains(&probability) {
        return Err(ConfigError::new(
            "trace.sampleProbability",
            format!("must be within [0, 1], got {}", probability),
        ));
    }

    Ok(Bundle {
        project_id: config.project_id.clone(),
        endpoint: config.endpoint.clone().filter(|e| !e.is_empty()),
        push_interval,
        request_timeout,
        max_buffered_entries,
        credentials,
        metrics,
        logs,
        sinks,
        trace: TraceConfig {
            sample_probability: probability,
        },
    })
}

fn compile_credentials(config: &AdapterConfig) -> Result<CredentialMode, ConfigError> {
    let api_key = config.api_key.as_deref().filter(|k| !k.is_empty());
    let sa_path = config.service_account_path.as_deref().filter(|p| !p.is_empty());

    let set = [config.use_ambient_credentials, api_key.is_some(), sa_path.is_some()]
        .iter()
        .filter(|set| **set)
        .count();
    if set > 1 {
        return Err(ConfigError::new(
            "credentials",
            "only one of useAmbientCredentials, apiKey, serviceAccountPath may be set",
        ));
    }

    Ok(match (api_key, sa_path) {
        (Some(key), _) => CredentialMode::ApiKey(key.to_string()),
        (_, Some(path)) => CredentialMode::ServiceAccountFile(PathBuf::from(path)),
        _ => CredentialMode::AmbientDefault,
    })
}

fn compile_metric(name: &str, info: &MetricInfo, namespace: &str) -> Result<MetricDescriptor, ConfigError> {
    let path = format!("metricInfo.{}", name);

    let buckets = match (info.value_type, &info.buckets) {
        (ValueType::Distribution, Some(def)) => Some(compile_buckets(&format!("{}.buckets", path), def)?),
        (ValueType::Distribution, None) => {
            return Err(ConfigError::new(
                format!("{}.buckets", path),
                "DISTRIBUTION metrics require a bucket definition",
            ));
        }
        (_, Some(_)) => {
            return Err(ConfigError::new(
                format!("{}.buckets", path),
                "buckets are only valid for DISTRIBUTION metrics",
            ));
        }
        (_, None) => None,
    };

    if matches!(info.value_type, ValueType::Bool | ValueType::String) && info.kind != MetricKind::Gauge {
        return Err(ConfigError::new(
            format!("{}.kind", path),
            "BOOL and STRING metrics must be GAUGE",
        ));
    }

    let backend_metric_type = match info.metric_type.as_deref().filter(|t| !t.is_empty()) {
        Some(explicit) => explicit.to_string(),
        None => format!("custom.{}/{}", namespace, name),
    };

    Ok(MetricDescriptor {
        name: name.to_string(),
        kind: info.kind,
        value_type: info.value_type,
        buckets,
        backend_metric_type,
        label_names: info.label_names.clone(),
        description: info.description.clone().unwrap_or_default(),
    })
}

fn compile_buckets(path: &str, def: &BucketsDefinition) -> Result<BucketResolver, ConfigError> {
    let layout = match (&def.linear, &def.exponential, &def.explicit) {
        (Some(linear), None, None) => {
            let path = format!("{}.linear", path);
            let num_finite_buckets = positive_buckets(&path, linear.num_finite_buckets)?;
            if !(linear.width > 0.0) {
                return Err(ConfigError::new(format!("{}.width", path), "must be greater than 0"));
            }
            if !linear.offset.is_finite() {
                return Err(ConfigError::new(format!("{}.offset", path), "must be finite"));
            }
            if !(linear.offset + linear.width * f64::from(num_finite_buckets)).is_finite() {
                return Err(ConfigError::new(format!("{}.width", path), "largest boundary must be finite"));
            }
            BucketLayout::Linear {
                num_finite_buckets,
                width: linear.width,
                offset: linear.offset,
            }
        }
        (None, Some(exponential), None) => {
            let path = format!("{}.exponential", path);
            let num_finite_buckets = positive_buckets(&path, exponential.num_finite_buckets)?;
            if !(exponential.growth_factor > 1.0) {
                return Err(ConfigError::new(format!("{}.growthFactor", path), "must be greater than 1"));
            }
            if !(exponential.scale > 0.0) {
                return Err(ConfigError::new(format!("{}.scale", path), "must be greater than 0"));
            }
            let largest = exponential.scale * exponential.growth_factor.powi(num_finite_buckets as i32);
            if !largest.is_finite() {
                return Err(ConfigError::new(
                    format!("{}.growthFactor", path),
                    "largest boundary must be finite",
                ));
            }
            BucketLayout::Exponential {
                num_finite_buckets,
                growth_factor: exponential.growth_factor,
                scale: exponential.scale,
            }
        }
        (None, None, Some(explicit)) => {
            let path = format!("{}.explicit.bounds", path);
            if explicit.bounds.is_empty() {
                return Err(ConfigError::new(path, "must contain at least one bound"));
            }
            if explicit.bounds.len() + 1 > MAX_BUCKET_COUNT {
                return Err(ConfigError::new(
                    path,
                    format!("at most {} bounds are allowed", MAX_BUCKET_COUNT - 1),
                ));
            }
            if explicit.bounds.iter().any(|b| !b.is_finite()) {
                return Err(ConfigError::new(path, "bounds must be finite"));
            }
            if explicit.bounds.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ConfigError::new(path, "bounds must be strictly increasing"));
            }
            BucketLayout::Explicit {
                bounds: explicit.bounds.clone(),
            }
        }
        _ => {
            return Err(ConfigError::new(
                path,
                "exactly one of linear, exponential or explicit must be set",
            ));
        }
    };

    Ok(BucketResolver::new(layout))
}

fn positive_buckets(path: &str, n: i32) -> Result<u32, ConfigError> {
    let path = format!("{}.numFiniteBuckets", path);
    let n = u32::try_from(n)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::new(path.clone(), "must be greater than 0"))?;
    // underflow and overflow take two of the backend's buckets
    let max = (MAX_BUCKET_COUNT - 2) as u32;
    if n > max {
        return Err(ConfigError::new(path, format!("must be at most {}", max)));
    }
    Ok(n)
}

fn compile_log(name: &str, info: &LogInfo) -> Result<LogMapping, ConfigError> {
    let path = format!("logInfo.{}", name);

    let template = Template::compile(&info.payload_template);
    for issue in template.issues() {
        warn!("{}.payloadTemplate: {}; rendering it literally", path, issue);
    }

    let sink = match &info.sink_info {
        Some(sink) => Some(compile_sink(&format!("{}.sinkInfo", path), sink)?),
        None => None,
    };

    let mut label_names: Vec<String> = Vec::new();
    for label in &info.label_names {
        if !label_names.contains(label) {
            label_names.push(label.clone());
        }
    }

    Ok(LogMapping {
        name: name.to_string(),
        label_names,
        template,
        http_mapping: info.http_mapping.clone(),
        sink,
        severity: info
            .severity
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "DEFAULT".to_string()),
    })
}

fn compile_sink(path: &str, sink: &SinkInfo) -> Result<SinkSpec, ConfigError> {
    if sink.id.is_empty() {
        return Err(ConfigError::new(format!("{}.id", path), "must be set"));
    }
    if sink.destination.is_empty() {
        return Err(ConfigError::new(format!("{}.destination", path), "must be set"));
    }

    Ok(SinkSpec {
        id: sink.id.clone(),
        destination: sink.destination.clone(),
        filter: sink.filter.clone(),
        unique_writer_identity: sink.unique_writer_identity,
        update_destination: sink.update_destination,
        update_filter: sink.update_filter,
        update_include_children: sink.update_include_children,
    })
}
