//! Stackdriver Exporter Library
//!
//! Batches metrics, renders structured log entries, manages log export sinks
//! and samples trace spans, delivering all of them to the monitoring, logging
//! and trace APIs on a periodic schedule with hot configuration reload.

pub mod batcher;
pub mod buckets;
pub mod buffer;
pub mod compiler;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod log_renderer;
pub mod sampler;
pub mod scheduler;
pub mod sinks;
pub mod stats;
pub mod telemetry;
pub mod template;
pub mod transport;

pub use buckets::{BucketLayout, BucketResolver};
pub use compiler::{Bundle, compile};
pub use config::AdapterConfig;
pub use credentials::{CredentialMode, CredentialResolver, MetadataTokenProvider, TokenProvider};
pub use errors::{BackendError, ConfigError, CredentialError, ExporterError, Result, SinkError};
pub use scheduler::{ExportScheduler, FlushReport};
pub use stats::{ExporterStats, StatsSnapshot};
pub use telemetry::{AttributeValue, LabelSet, LogEntry, TraceSpan};
pub use transport::{Backend, BackendConnector, HttpConnector};
