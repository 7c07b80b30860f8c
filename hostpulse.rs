//! # hostpulse - Host Metrics Agent Core
//!
//! The scheduling and dispatch core of a host-metrics agent. Independent
//! collectors are polled on their own intervals and every measurement they
//! produce is merged onto one output stream, ready for a sender that
//! forwards it to a time-series database.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              HOSTPULSE                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  REGISTRY → SCHEDULER (one loop per collector) → TAGGER → STREAM     │
//! │                              ▲                                       │
//! │                         CLOCK CACHE                                  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Clock cache**: one background task refreshes the current unix second.
//! - **Tagger**: stamps host identity and timestamp onto every measurement.
//! - **Registry**: named collectors with their polling intervals.
//! - **Scheduler**: per-collector loops fanning into a single stream.
//! - **Query builder**: `SELECT` text from statically declared record schemas.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::runtime::Handle as RuntimeHandle;
use tokio::task::{JoinError, JoinHandle as TokioJoinHandle};
use tokio::time::{interval, interval_at, Instant as TokioInstant, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Channels & Locks
// ----------------------------------------------------------------------------
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender};
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Strings & Hashing
// ----------------------------------------------------------------------------
use ahash::RandomState as AHashRandomState;
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time, Configuration, CLI, System Information
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use sysinfo::System as SysInfoSystem;
use unicode_general_category::{get_general_category, GeneralCategory};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Agent version - follows semantic versioning
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_NAME: &str = "hostpulse";
pub const AGENT_FULL_NAME: &str = "hostpulse metrics agent";

/// Default polling frequency for collectors registered without an interval.
pub const DEFAULT_FREQ_SECS: u64 = 15;

/// [`DEFAULT_FREQ_SECS`] as a [`Duration`].
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(DEFAULT_FREQ_SECS);

/// How often the clock cache refreshes its value.
pub const CLOCK_RESOLUTION: Duration = Duration::from_secs(1);

/// Output stream capacity. Zero makes every send a rendezvous with a reader.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 0;

/// Tag key that carries host identity on every measurement.
pub const HOST_TAG: &str = "host";

/// Host identity used when the hostname cannot be resolved.
pub const UNKNOWN_HOST: &str = "unknown";

/// Registry name of the built-in self-monitoring collector.
pub const SELF_COLLECTOR_NAME: &str = "hostpulse.self";

/// Tag key naming the collector a self-monitoring measurement describes.
pub const COLLECTOR_TAG: &str = "collector";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "hostpulse.toml";

/// Prefix for environment overrides (`HOSTPULSE_AGENT__HOSTNAME=...`)
pub const ENV_PREFIX: &str = "HOSTPULSE_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Timestamps, values, tags and measurements. Everything the scheduler moves
// around is one of these.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Unix Seconds
// ----------------------------------------------------------------------------

/// A wall-clock instant in whole seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from seconds since the Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// Read the wall clock. This is a syscall; hot paths use [`ClockCache`].
    #[inline]
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Self(secs)
    }

    /// Get seconds value
    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0
    }

    /// Absolute distance between two timestamps in seconds
    #[inline]
    pub fn abs_diff(&self, other: Timestamp) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(secs: i64) -> Self {
        Self(secs)
    }
}

impl From<Timestamp> for i64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let secs = st
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Self(secs)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Metric Values
// ----------------------------------------------------------------------------

/// A scalar the time-series backend accepts. No validation happens here;
/// the sender decides what it can encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// Integer sample (counters, byte totals, state codes)
    Int(i64),
    /// Floating point sample (percentages, rates)
    Float(f64),
    /// Text sample
    Text(CompactString),
}

impl MetricValue {
    /// Get the value as a float (for numeric types)
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            MetricValue::Text(_) => None,
        }
    }

    /// Get the value as an integer (integers only, floats are not truncated)
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetricValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        !matches!(self, MetricValue::Text(_))
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            MetricValue::Int(_) => "int",
            MetricValue::Float(_) => "float",
            MetricValue::Text(_) => "text",
        }
    }
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Text(s) => write!(f, "{}", s),
        }
    }
}

macro_rules! metric_value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for MetricValue {
                fn from(v: $ty) -> Self {
                    MetricValue::Int(i64::from(v))
                }
            }
        )*
    };
}

metric_value_from_int!(i8, i16, i32, i64, u8, u16, u32);

// Wider unsigned values fall back to a float once they leave i64 range.
impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        i64::try_from(v)
            .map(MetricValue::Int)
            .unwrap_or(MetricValue::Float(v as f64))
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::from(v as u64)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Float(f64::from(v))
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Int(i64::from(v))
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(CompactString::from(v))
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(CompactString::from(v))
    }
}

impl From<CompactString> for MetricValue {
    fn from(v: CompactString) -> Self {
        MetricValue::Text(v)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Tags - Unique Key/Value Labels
// ----------------------------------------------------------------------------

type TagMap = HashMap<CompactString, CompactString, AHashRandomState>;

/// Tag key to tag value. Keys are unique; iteration order is unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(TagMap);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a tag, returning the previous value.
    pub fn insert<K, V>(&mut self, key: K, value: V) -> Option<CompactString>
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.0.insert(key.into(), value.into())
    }

    /// Builder form of [`TagSet::insert`].
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<CompactString> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Pairs sorted by key, for stable rendering.
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self.iter().collect();
        pairs.sort_unstable_by(|a, b| a.0.cmp(b.0));
        pairs
    }
}

impl<K, V> FromIterator<(K, V)> for TagSet
where
    K: Into<CompactString>,
    V: Into<CompactString>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tags = TagSet::new();
        for (key, value) in iter {
            tags.insert(key, value);
        }
        tags
    }
}

/// Create a TagSet from key-value pairs
#[macro_export]
macro_rules! tags {
    () => {
        $crate::TagSet::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut tags = $crate::TagSet::new();
        $( tags.insert($key, $value); )+
        tags
    }};
}

// ----------------------------------------------------------------------------
// 3.4 Measurement - The Unit Handed To The Sender
// ----------------------------------------------------------------------------

/// A single named, timestamped, tagged observation.
///
/// Serializes to the shape of an OpenTSDB HTTP `/api/put` data point:
/// `{"metric": .., "timestamp": .., "value": .., "tags": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Metric name (e.g. "cpu.idle", "net.bytes")
    pub metric: CompactString,
    /// Unix seconds
    pub timestamp: Timestamp,
    pub value: MetricValue,
    pub tags: TagSet,
}

impl Measurement {
    pub fn new<N, V>(metric: N, timestamp: Timestamp, value: V, tags: TagSet) -> Self
    where
        N: Into<CompactString>,
        V: Into<MetricValue>,
    {
        Self {
            metric: metric.into(),
            timestamp,
            value: value.into(),
            tags,
        }
    }

    /// The host tag, present on everything that went through a [`Tagger`].
    pub fn host(&self) -> Option<&str> {
        self.tags.get(HOST_TAG)
    }

    /// Render as an OpenTSDB telnet `put` line (tags sorted by key).
    pub fn to_put_line(&self) -> String {
        let mut line = format!("put {} {} {}", self.metric, self.timestamp.as_secs(), self.value);
        for (key, value) in self.tags.sorted() {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(value);
        }
        line
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.metric)?;
        for (i, (key, value)) in self.tags.sorted().into_iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", key, value)?;
        }
        write!(f, "}} {} @ {}", self.value, self.timestamp)
    }
}

// ----------------------------------------------------------------------------
// 3.5 Metric Batch - One Collector Invocation
// ----------------------------------------------------------------------------

/// Ordered measurements produced by one poll of one collector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricBatch {
    metrics: Vec<Measurement>,
}

impl MetricBatch {
    /// Create a new empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch with pre-allocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            metrics: Vec::with_capacity(capacity),
        }
    }

    /// Append a measurement
    #[inline]
    pub fn push(&mut self, measurement: Measurement) {
        self.metrics.push(measurement);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Measurement> {
        self.metrics.iter()
    }

    /// Drain all measurements in append order
    #[inline]
    pub fn drain(&mut self) -> impl Iterator<Item = Measurement> + '_ {
        self.metrics.drain(..)
    }
}

impl FromIterator<Measurement> for MetricBatch {
    fn from_iter<I: IntoIterator<Item = Measurement>>(iter: I) -> Self {
        Self {
            metrics: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for MetricBatch {
    type Item = Measurement;
    type IntoIter = std::vec::IntoIter<Measurement>;

    fn into_iter(self) -> Self::IntoIter {
        self.metrics.into_iter()
    }
}

impl<'a> IntoIterator for &'a MetricBatch {
    type Item = &'a Measurement;
    type IntoIter = std::slice::Iter<'a, Measurement>;

    fn into_iter(self) -> Self::IntoIter {
        self.metrics.iter()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top Level Error
// ----------------------------------------------------------------------------

/// The main error type for the agent.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum HostpulseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HostpulseError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            HostpulseError::Config(_) => false,
            HostpulseError::Collector(e) => e.is_recoverable(),
            HostpulseError::Query(_) => false,
            HostpulseError::Io(_) => true,
            HostpulseError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            HostpulseError::Config(_) => "config",
            HostpulseError::Collector(_) => "collector",
            HostpulseError::Query(_) => "query",
            HostpulseError::Io(_) => "io",
            HostpulseError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Collector Errors
// ----------------------------------------------------------------------------

/// Errors from registration, scheduling and collectors themselves
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Collector name must not be empty")]
    InvalidName,

    #[error("Collector '{name}' is already registered")]
    Duplicate { name: String },

    #[error("Collector '{name}' has a zero polling interval")]
    InvalidInterval { name: String },

    #[error("Collector '{name}' not found")]
    NotFound { name: String },

    #[error("Collection failed for '{collector}': {message}")]
    CollectionFailed { collector: String, message: String },

    #[error("Collector '{collector}' panicked: {message}")]
    Panicked { collector: String, message: String },

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler must be started from within a tokio runtime")]
    NoRuntime,
}

impl CollectorError {
    /// Failures of a single poll heal on the next tick; registration
    /// mistakes do not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CollectorError::CollectionFailed { .. } | CollectorError::Panicked { .. }
        )
    }

    pub fn collection_failed(collector: impl Into<String>, message: impl Into<String>) -> Self {
        CollectorError::CollectionFailed {
            collector: collector.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Query Builder Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueryError {
    #[error("Table '{table}' declares no columns")]
    EmptySchema { table: String },
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for agent operations
pub type HostpulseResult<T> = Result<T, HostpulseError>;

/// Result type for collector operations
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Result type for query building
pub type QueryResult<T> = Result<T, QueryError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file merged with HOSTPULSE_ prefixed environment variables. Durations
// are humantime strings ("15s", "1m 30s").
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// General agent settings
    #[serde(default)]
    pub agent: GeneralConfig,

    /// Per-collector scheduling overrides
    #[serde(default)]
    pub collectors: CollectorsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.default_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "agent.default_interval",
                "polling interval must be greater than zero",
            ));
        }

        if self.agent.self_monitoring_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "agent.self_monitoring_interval",
                "polling interval must be greater than zero",
            ));
        }

        for (name, interval) in &self.collectors.intervals {
            if interval.is_zero() {
                return Err(ConfigError::invalid_value(
                    format!("collectors.intervals.{}", name),
                    "polling interval must be greater than zero",
                ));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                format!("unknown format '{}' (expected pretty, compact or json)", self.logging.format),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Host identity: the configured override, or the resolved hostname.
    pub fn hostname(&self) -> String {
        self.agent
            .hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(resolve_hostname)
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Agent Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Hostname (auto-detected if empty)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Interval for collectors registered without one
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub default_interval: Duration,

    /// Output stream capacity (0 = unbuffered)
    #[serde(default)]
    pub channel_capacity: usize,

    /// Register the built-in self-monitoring collector
    #[serde(default = "default_true")]
    pub self_monitoring: bool,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub self_monitoring_interval: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            default_interval: default_interval(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            self_monitoring: true,
            self_monitoring_interval: default_interval(),
        }
    }
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Collector Scheduling Overrides
// ----------------------------------------------------------------------------

/// Overrides keyed by registered collector name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorsConfig {
    /// Polling interval overrides (e.g. `"cpu.stats" = "5s"`)
    #[serde(default)]
    pub intervals: BTreeMap<String, humantime_serde::Serde<Duration>>,

    /// Collectors that are registered but never scheduled
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl CollectorsConfig {
    pub fn interval_for(&self, name: &str) -> Option<Duration> {
        self.intervals.get(name).map(|d| **d)
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.iter().any(|d| d == name)
    }
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
///
/// Logs go to stderr so stdout stays free for measurement output.
pub fn init_logging(config: &LoggingConfig) -> HostpulseResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| HostpulseError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| HostpulseError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(io::stderr)
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| HostpulseError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "hostpulse::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: CLOCK CACHE
// ============================================================================
// Every measurement needs a timestamp, and a busy agent emits thousands per
// second. One task reads the wall clock once per second; everyone else does
// an atomic load.
// ============================================================================

/// Shared, cheaply cloneable "current second".
///
/// Clones observe the same value. The updater task holds only a weak
/// reference and exits once every clone is dropped.
#[derive(Debug, Clone)]
pub struct ClockCache {
    inner: Arc<ClockState>,
}

#[derive(Debug)]
struct ClockState {
    secs: AtomicI64,
    updater_started: AtomicBool,
}

impl ClockCache {
    /// Create a clock seeded from the wall clock. Call [`ClockCache::start`]
    /// to keep it fresh.
    pub fn new() -> Self {
        Self::manual(Timestamp::now())
    }

    /// A clock that only moves when told to. Used to pin timestamps in tests.
    pub fn manual(ts: Timestamp) -> Self {
        Self {
            inner: Arc::new(ClockState {
                secs: AtomicI64::new(ts.as_secs()),
                updater_started: AtomicBool::new(false),
            }),
        }
    }

    /// Most recently published second. Lock-free, no syscall.
    #[inline]
    pub fn now(&self) -> Timestamp {
        Timestamp::from_secs(self.inner.secs.load(AtomicOrdering::Acquire))
    }

    /// Overwrite the value unconditionally.
    pub fn set(&self, ts: Timestamp) {
        self.inner.secs.store(ts.as_secs(), AtomicOrdering::Release);
    }

    /// Publish `ts` unless a newer value is already visible, so readers
    /// never see time go backwards.
    pub fn advance_to(&self, ts: Timestamp) {
        let mut current = self.inner.secs.load(AtomicOrdering::Relaxed);
        while ts.as_secs() > current {
            match self.inner.secs.compare_exchange(
                current,
                ts.as_secs(),
                AtomicOrdering::Release,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Spawn the background updater on the current tokio runtime.
    ///
    /// Only the first call spawns; later calls return `None`. Panics outside
    /// a tokio runtime, like `tokio::spawn`.
    pub fn start(&self) -> Option<TokioJoinHandle<()>> {
        if self.inner.updater_started.swap(true, AtomicOrdering::AcqRel) {
            return None;
        }

        let state: Weak<ClockState> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut tick = interval(CLOCK_RESOLUTION);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tick.tick().await;
                let Some(inner) = state.upgrade() else {
                    trace!(target: "hostpulse::clock", "Clock dropped, updater exiting");
                    break;
                };
                ClockCache { inner }.advance_to(Timestamp::now());
            }
        });

        debug!(target: "hostpulse::clock", "Clock updater started");
        Some(handle)
    }

    pub fn is_updating(&self) -> bool {
        self.inner.updater_started.load(AtomicOrdering::Acquire)
    }
}

impl Default for ClockCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SECTION 8: HOST IDENTITY & TAGGING
// ============================================================================

/// Resolve the local hostname, falling back to [`UNKNOWN_HOST`].
pub fn resolve_hostname() -> String {
    match SysInfoSystem::host_name() {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => {
            warn!(
                target: "hostpulse::init",
                fallback = UNKNOWN_HOST,
                "Could not resolve hostname"
            );
            UNKNOWN_HOST.to_string()
        }
    }
}

/// Emission context handed to every collector poll.
///
/// Holds the immutable host identity and the shared clock; cloning is two
/// reference-count bumps.
#[derive(Debug, Clone)]
pub struct Tagger {
    host: Arc<str>,
    clock: ClockCache,
}

impl Tagger {
    pub fn new(host: impl Into<Arc<str>>, clock: ClockCache) -> Self {
        Self {
            host: host.into(),
            clock,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn clock(&self) -> &ClockCache {
        &self.clock
    }

    /// Append one measurement to `batch`.
    ///
    /// Missing tags count as empty. The `host` tag is always set to this
    /// agent's identity, replacing whatever the caller put there. The
    /// timestamp comes from the clock cache.
    pub fn add<N, V>(&self, batch: &mut MetricBatch, metric: N, value: V, tags: Option<TagSet>)
    where
        N: Into<CompactString>,
        V: Into<MetricValue>,
    {
        let mut tags = tags.unwrap_or_default();
        tags.insert(HOST_TAG, &*self.host);
        batch.push(Measurement::new(metric, self.clock.now(), value, tags));
    }
}

// ============================================================================
// SECTION 9: COLLECTOR TRAIT & REGISTRY
// ============================================================================
// A collector is anything that can turn a Tagger into a batch. Most are plain
// closures; stateful ones implement the trait on a struct. Every collector is
// registered under an explicit, unique name.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Collector Trait
// ----------------------------------------------------------------------------

/// A unit of work that produces zero or more measurements per poll.
///
/// `collect` runs on the blocking thread pool, so it may do synchronous I/O.
/// Returning `Err` (or panicking) costs that cycle's measurements and nothing
/// else; the collector is polled again on its next tick.
pub trait Collector: Send + Sync {
    fn collect(&self, tagger: &Tagger) -> CollectorResult<MetricBatch>;
}

/// Adapter that lets a closure act as a [`Collector`].
pub struct FnCollector<F>(F);

impl<F> Collector for FnCollector<F>
where
    F: Fn(&Tagger) -> CollectorResult<MetricBatch> + Send + Sync,
{
    fn collect(&self, tagger: &Tagger) -> CollectorResult<MetricBatch> {
        (self.0)(tagger)
    }
}

impl<F> Debug for FnCollector<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("FnCollector")
    }
}

// ----------------------------------------------------------------------------
// 9.2 Collector Statistics
// ----------------------------------------------------------------------------

/// Point-in-time statistics for one collector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorStats {
    /// Polls attempted (successful or not)
    pub cycles: u64,
    /// Polls that returned an error or panicked
    pub failures: u64,
    /// Measurements accepted by the output stream
    pub measurements: u64,
    /// Duration of the most recent poll in microseconds
    pub last_poll_us: u64,
    /// Longest poll seen in microseconds
    pub max_poll_us: u64,
    /// Error message from the most recent failed poll
    pub last_error: Option<String>,
}

/// Tracks collector statistics with atomic operations.
#[derive(Debug, Default)]
pub struct CollectorStatsTracker {
    cycles: AtomicU64,
    failures: AtomicU64,
    measurements: AtomicU64,
    last_poll_us: AtomicU64,
    max_poll_us: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl CollectorStatsTracker {
    fn record_cycle(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.last_poll_us.store(us, AtomicOrdering::Relaxed);
        self.max_poll_us.fetch_max(us, AtomicOrdering::Relaxed);
    }

    fn record_failure(&self, message: String) {
        self.failures.fetch_add(1, AtomicOrdering::Relaxed);
        *self.last_error.write() = Some(message);
    }

    fn record_measurement(&self) {
        self.measurements.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> CollectorStats {
        CollectorStats {
            cycles: self.cycles.load(AtomicOrdering::Relaxed),
            failures: self.failures.load(AtomicOrdering::Relaxed),
            measurements: self.measurements.load(AtomicOrdering::Relaxed),
            last_poll_us: self.last_poll_us.load(AtomicOrdering::Relaxed),
            max_poll_us: self.max_poll_us.load(AtomicOrdering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// 9.3 Collector Entry
// ----------------------------------------------------------------------------

/// A registered collector: identity, interval and the work itself.
#[derive(Clone)]
pub struct CollectorEntry {
    name: CompactString,
    interval: Duration,
    collector: Arc<dyn Collector>,
    stats: Arc<CollectorStatsTracker>,
}

impl CollectorEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Invoke the collector once, outside the scheduler.
    pub fn poll(&self, tagger: &Tagger) -> CollectorResult<MetricBatch> {
        self.collector.collect(tagger)
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats.snapshot()
    }
}

impl Debug for CollectorEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorEntry")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// 9.4 Collector Registry
// ----------------------------------------------------------------------------

/// Append-only set of collectors, filled during start-up.
///
/// The registry is moved into the [`Scheduler`], so nothing can be added
/// once polling has begun.
#[derive(Debug)]
pub struct CollectorRegistry {
    entries: Vec<CollectorEntry>,
    default_interval: Duration,
}

impl CollectorRegistry {
    /// Create an empty registry using [`DEFAULT_INTERVAL`].
    pub fn new() -> Self {
        Self::with_default_interval(DEFAULT_INTERVAL)
    }

    /// Create an empty registry with a custom default interval.
    pub fn with_default_interval(default_interval: Duration) -> Self {
        Self {
            entries: Vec::new(),
            default_interval,
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Register a closure polled every `interval`.
    pub fn register<F>(
        &mut self,
        name: impl Into<CompactString>,
        interval: Duration,
        poll: F,
    ) -> CollectorResult<()>
    where
        F: Fn(&Tagger) -> CollectorResult<MetricBatch> + Send + Sync + 'static,
    {
        self.register_collector(name, interval, FnCollector(poll))
    }

    /// Register a closure polled at the registry's default interval.
    pub fn register_default<F>(&mut self, name: impl Into<CompactString>, poll: F) -> CollectorResult<()>
    where
        F: Fn(&Tagger) -> CollectorResult<MetricBatch> + Send + Sync + 'static,
    {
        let interval = self.default_interval;
        self.register(name, interval, poll)
    }

    /// Register any [`Collector`] implementation.
    pub fn register_collector<C>(
        &mut self,
        name: impl Into<CompactString>,
        interval: Duration,
        collector: C,
    ) -> CollectorResult<()>
    where
        C: Collector + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CollectorError::InvalidName);
        }
        if self.get(&name).is_some() {
            return Err(CollectorError::Duplicate { name: name.to_string() });
        }
        if interval.is_zero() {
            return Err(CollectorError::InvalidInterval { name: name.to_string() });
        }

        debug!(
            target: "hostpulse::registry",
            collector = %name,
            interval_ms = interval.as_millis() as u64,
            "Collector registered"
        );

        self.entries.push(CollectorEntry {
            name,
            interval,
            collector: Arc::new(collector),
            stats: Arc::new(CollectorStatsTracker::default()),
        });
        Ok(())
    }

    /// All entries whose name contains `pattern` (case-sensitive).
    /// An empty result is not an error.
    pub fn search(&self, pattern: &str) -> Vec<&CollectorEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.name.contains(pattern))
            .collect()
    }

    /// Get a collector by exact name.
    pub fn get(&self, name: &str) -> Option<&CollectorEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CollectorEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shared handles to the statistics of everything registered so far.
    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            trackers: self
                .entries
                .iter()
                .map(|entry| (entry.name.clone(), Arc::clone(&entry.stats)))
                .collect(),
        }
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of collector statistics that outlives the registry move.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    trackers: Vec<(CompactString, Arc<CollectorStatsTracker>)>,
}

impl StatsHandle {
    pub fn snapshot(&self) -> Vec<(String, CollectorStats)> {
        self.trackers
            .iter()
            .map(|(name, tracker)| (name.to_string(), tracker.snapshot()))
            .collect()
    }
}

// ============================================================================
// SECTION 10: SCHEDULER & OUTPUT STREAM
// ============================================================================
// One task per collector. Each task ticks on its own interval, polls on the
// blocking pool and pushes the batch onto a single flume channel. With the
// default capacity of zero every send waits for the reader, so a slow sender
// throttles all collectors at their next emission.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Measurement Stream
// ----------------------------------------------------------------------------

/// Receiving end of the shared output stream.
///
/// Measurements from different collectors interleave in no particular order;
/// measurements from one poll arrive in the order they were added.
#[derive(Debug, Clone)]
pub struct MeasurementStream {
    receiver: FlumeReceiver<Measurement>,
}

impl MeasurementStream {
    /// Wait for the next measurement. `None` once every collector loop is gone.
    pub async fn recv_async(&self) -> Option<Measurement> {
        self.receiver.recv_async().await.ok()
    }

    /// Blocking receive, for consumers running on plain threads.
    pub fn recv(&self) -> Option<Measurement> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Measurement> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Measurement> {
        self.receiver.try_recv().ok()
    }

    /// Measurements buffered in the channel (always 0 when unbuffered).
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// True when no collector loop can send any more.
    pub fn is_disconnected(&self) -> bool {
        self.receiver.is_disconnected()
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> flume::r#async::RecvStream<'static, Measurement> {
        self.receiver.into_stream()
    }
}

// ----------------------------------------------------------------------------
// 10.2 Scheduler
// ----------------------------------------------------------------------------

/// Owns the registry and drives one polling loop per collector.
#[derive(Debug)]
pub struct Scheduler {
    registry: CollectorRegistry,
    tagger: Tagger,
    capacity: usize,
    overrides: CollectorsConfig,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(registry: CollectorRegistry, tagger: Tagger) -> Self {
        Self {
            registry,
            tagger,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            overrides: CollectorsConfig::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Buffer up to `capacity` measurements before senders block.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Apply interval overrides and the disabled list.
    pub fn with_overrides(mut self, overrides: CollectorsConfig) -> Self {
        self.overrides = overrides;
        self
    }

    /// Apply the scheduling parts of an [`AgentConfig`].
    pub fn with_config(self, config: &AgentConfig) -> Self {
        self.with_capacity(config.agent.channel_capacity)
            .with_overrides(config.collectors.clone())
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    pub fn tagger(&self) -> &Tagger {
        &self.tagger
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn search(&self, pattern: &str) -> Vec<&CollectorEntry> {
        self.registry.search(pattern)
    }

    pub fn stats(&self, name: &str) -> Option<CollectorStats> {
        self.registry.get(name).map(CollectorEntry::stats)
    }

    pub fn all_stats(&self) -> Vec<(String, CollectorStats)> {
        self.registry.stats_handle().snapshot()
    }

    /// Interval a collector actually runs at, after overrides.
    pub fn effective_interval(&self, entry: &CollectorEntry) -> Duration {
        match self.overrides.interval_for(entry.name()) {
            Some(interval) if !interval.is_zero() => interval,
            Some(_) => {
                warn!(
                    target: "hostpulse::scheduler",
                    collector = %entry.name(),
                    "Ignoring zero interval override"
                );
                entry.interval()
            }
            None => entry.interval(),
        }
    }

    /// Start every enabled collector loop and return the shared stream.
    ///
    /// Must be called from within a tokio runtime, and only once. Loops run
    /// until every [`MeasurementStream`] clone is dropped.
    pub fn run(&self) -> CollectorResult<MeasurementStream> {
        let runtime = RuntimeHandle::try_current().map_err(|_| CollectorError::NoRuntime)?;

        if self.running.swap(true, AtomicOrdering::AcqRel) {
            return Err(CollectorError::AlreadyRunning);
        }

        let (sender, receiver) = flume::bounded(self.capacity);
        let mut spawned = 0usize;

        for entry in self.registry.iter() {
            if self.overrides.is_disabled(entry.name()) {
                info!(target: "hostpulse::scheduler", collector = %entry.name(), "Collector disabled");
                continue;
            }

            let period = self.effective_interval(entry);
            runtime.spawn(run_collector(
                entry.clone(),
                period,
                self.tagger.clone(),
                sender.clone(),
            ));
            spawned += 1;
        }

        if spawned == 0 {
            warn!(target: "hostpulse::scheduler", "No collectors scheduled, output stream is closed");
        }

        info!(
            target: "hostpulse::scheduler",
            collectors = spawned,
            capacity = self.capacity,
            host = %self.tagger.host(),
            "Scheduler started"
        );

        Ok(MeasurementStream { receiver })
    }
}

// ----------------------------------------------------------------------------
// 10.3 Per-Collector Loop
// ----------------------------------------------------------------------------

/// Poll `entry` every `period` and forward each measurement.
///
/// The first poll happens one period after start. Missed ticks are skipped,
/// so a slow poll never triggers a burst of catch-up polls.
async fn run_collector(
    entry: CollectorEntry,
    period: Duration,
    tagger: Tagger,
    sender: FlumeSender<Measurement>,
) {
    let mut tick = interval_at(TokioInstant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(
        target: "hostpulse::scheduler",
        collector = %entry.name(),
        interval_ms = period.as_millis() as u64,
        "Collector loop started"
    );

    loop {
        tick.tick().await;

        if sender.is_disconnected() {
            info!(
                target: "hostpulse::scheduler",
                collector = %entry.name(),
                "Output stream closed, collector loop exiting"
            );
            return;
        }

        let batch = poll_isolated(&entry, &tagger).await;
        for measurement in batch {
            if sender.send_async(measurement).await.is_err() {
                info!(
                    target: "hostpulse::scheduler",
                    collector = %entry.name(),
                    "Output stream closed, collector loop exiting"
                );
                return;
            }
            entry.stats.record_measurement();
        }
    }
}

/// Run one poll on the blocking pool. Errors and panics become an empty batch.
async fn poll_isolated(entry: &CollectorEntry, tagger: &Tagger) -> MetricBatch {
    let collector = Arc::clone(&entry.collector);
    let poll_tagger = tagger.clone();
    let started = Instant::now();

    let outcome = tokio::task::spawn_blocking(move || collector.collect(&poll_tagger)).await;
    entry.stats.record_cycle(started.elapsed());

    let error = match outcome {
        Ok(Ok(batch)) => {
            trace!(
                target: "hostpulse::scheduler",
                collector = %entry.name(),
                measurements = batch.len(),
                duration_us = started.elapsed().as_micros() as u64,
                "Poll complete"
            );
            return batch;
        }
        Ok(Err(error)) => error,
        Err(join_error) => CollectorError::Panicked {
            collector: entry.name().to_string(),
            message: panic_message(join_error),
        },
    };

    warn!(
        target: "hostpulse::scheduler",
        collector = %entry.name(),
        error = %error,
        "Poll failed, skipping cycle"
    );
    entry.stats.record_failure(error.to_string());
    MetricBatch::new()
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload: Box<dyn Any + Send> = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// SECTION 11: QUERY BUILDER
// ============================================================================
// Collectors that read tabular sources (WMI-style classes, SQL views) build
// their SELECT from a statically declared record layout, so the column list
// and the struct that receives the rows cannot drift apart.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Table Schema
// ----------------------------------------------------------------------------

/// Table name plus ordered column names, known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

impl TableSchema {
    pub const fn new(name: &'static str, columns: &'static [&'static str]) -> Self {
        Self { name, columns }
    }

    /// `SELECT c1, c2, ..., cn FROM <name> <where_clause>`.
    ///
    /// Columns and clause are inserted verbatim, nothing is escaped. The
    /// separating space is always written, so an empty clause leaves a
    /// trailing space after the table name.
    pub fn select(&self, where_clause: &str) -> QueryResult<String> {
        let Some((last, rest)) = self.columns.split_last() else {
            return Err(QueryError::EmptySchema {
                table: self.name.to_string(),
            });
        };

        let width: usize = self.columns.iter().map(|c| c.len() + 2).sum();
        let mut query = String::with_capacity(16 + width + self.name.len() + where_clause.len());

        query.push_str("SELECT ");
        for column in rest {
            query.push_str(column);
            query.push_str(", ");
        }
        query.push_str(last);
        query.push_str(" FROM ");
        query.push_str(self.name);
        query.push(' ');
        query.push_str(where_clause);

        Ok(query)
    }
}

// ----------------------------------------------------------------------------
// 11.2 Table Trait & Helpers
// ----------------------------------------------------------------------------

/// A record type that maps onto one table. Usually implemented by [`table!`].
pub trait Table {
    /// Table (or class) name, usually the type name.
    const NAME: &'static str;
    /// Column names in declaration order.
    const COLUMNS: &'static [&'static str];

    fn schema() -> TableSchema {
        TableSchema::new(Self::NAME, Self::COLUMNS)
    }
}

/// Build the SELECT for record type `T`.
pub fn build_select<T: Table>(where_clause: &str) -> QueryResult<String> {
    T::schema().select(where_clause)
}

/// Build the SELECT for the element type of a destination buffer.
pub fn select_for<T: Table>(_destination: &[T], where_clause: &str) -> QueryResult<String> {
    build_select::<T>(where_clause)
}

/// Declare a record struct and derive its [`Table`] implementation from the
/// struct name and field names.
///
/// ```ignore
/// table! {
///     #[derive(Debug, Default)]
///     pub struct Win32_PerfRawData_PerfOS_Processor {
///         pub Name: String,
///         pub PercentIdleTime: u64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! table {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$field_meta:meta])* $field_vis:vis $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[allow(non_snake_case, non_camel_case_types)]
        $vis struct $name {
            $( $(#[$field_meta])* $field_vis $field: $ty, )*
        }

        impl $crate::Table for $name {
            const NAME: &'static str = stringify!($name);
            const COLUMNS: &'static [&'static str] = &[$( stringify!($field) ),*];
        }
    };
}

// ============================================================================
// SECTION 12: COLLECTOR HELPERS
// ============================================================================

/// Call `on_line` for every line of a text file, typically under `/proc`.
///
/// Open and read errors are logged and end the read; a collector simply
/// emits nothing for that source this cycle.
pub fn read_proc<P, F>(path: P, mut on_line: F)
where
    P: AsRef<Path>,
    F: FnMut(&str),
{
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!(target: "hostpulse::collector", path = %path.display(), error = %e, "Failed to open");
            return;
        }
    };

    for line in BufReader::new(file).lines() {
        match line {
            Ok(line) => on_line(&line),
            Err(e) => {
                warn!(target: "hostpulse::collector", path = %path.display(), error = %e, "Failed to read");
                return;
            }
        }
    }
}

/// True when every character before the first NUL is a decimal digit
/// (general category Nd, so `٣` passes but `²` and `Ⅻ` do not).
/// Fixed-width fields padded with NUL count as their prefix; `""` is true.
pub fn is_digit(s: &str) -> bool {
    s.chars().take_while(|&c| c != '\0').all(is_decimal_digit)
}

/// Like [`is_digit`], also accepting letters (general category L*).
pub fn is_alnum(s: &str) -> bool {
    s.chars()
        .take_while(|&c| c != '\0')
        .all(|c| is_decimal_digit(c) || is_letter(c))
}

fn is_decimal_digit(c: char) -> bool {
    c.is_ascii_digit() || get_general_category(c) == GeneralCategory::DecimalNumber
}

fn is_letter(c: char) -> bool {
    matches!(
        get_general_category(c),
        GeneralCategory::UppercaseLetter
            | GeneralCategory::LowercaseLetter
            | GeneralCategory::TitlecaseLetter
            | GeneralCategory::ModifierLetter
            | GeneralCategory::OtherLetter
    )
}

// ============================================================================
// SECTION 13: SELF MONITORING
// ============================================================================

/// Reports the agent's own uptime and per-collector statistics.
#[derive(Debug)]
pub struct SelfMonitor {
    stats: StatsHandle,
    started: Instant,
}

impl SelfMonitor {
    pub fn new(stats: StatsHandle) -> Self {
        Self {
            stats,
            started: Instant::now(),
        }
    }
}

impl Collector for SelfMonitor {
    fn collect(&self, tagger: &Tagger) -> CollectorResult<MetricBatch> {
        let snapshot = self.stats.snapshot();
        let mut batch = MetricBatch::with_capacity(1 + snapshot.len() * 3);

        tagger.add(&mut batch, "hostpulse.uptime", self.started.elapsed().as_secs(), None);

        for (name, stats) in snapshot {
            let tags = tags!(COLLECTOR_TAG => name.as_str());
            tagger.add(&mut batch, "hostpulse.collector.cycles", stats.cycles, Some(tags.clone()));
            tagger.add(&mut batch, "hostpulse.collector.failures", stats.failures, Some(tags.clone()));
            tagger.add(&mut batch, "hostpulse.collector.measurements", stats.measurements, Some(tags));
        }

        Ok(batch)
    }
}

impl CollectorRegistry {
    /// Register [`SelfMonitor`] under [`SELF_COLLECTOR_NAME`].
    ///
    /// It reports on collectors registered before this call, so register it
    /// last.
    pub fn register_self_monitoring(&mut self, interval: Duration) -> CollectorResult<()> {
        let monitor = SelfMonitor::new(self.stats_handle());
        self.register_collector(SELF_COLLECTOR_NAME, interval, monitor)
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// hostpulse CLI
#[derive(Parser, Debug)]
#[command(
    name = "hostpulse",
    version,
    about = "Host metrics agent: polls collectors and streams measurements",
    long_about = "hostpulse polls a set of named collectors, each on its own interval, \
                  stamps every measurement with host identity and time, and writes the \
                  merged stream to stdout for a sender to forward."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, env = "HOSTPULSE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "HOSTPULSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "HOSTPULSE_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent (default)
    Run {
        /// Output format for measurements
        #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Put)]
        format: OutputFormat,
    },

    /// List registered collectors
    List {
        /// Only show collectors whose name contains this text
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

/// How measurements are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// OpenTSDB telnet `put` lines
    Put,
    /// One JSON object per line
    Json,
}

impl OutputFormat {
    pub fn render(&self, measurement: &Measurement) -> serde_json::Result<String> {
        match self {
            OutputFormat::Put => Ok(measurement.to_put_line()),
            OutputFormat::Json => measurement.to_json(),
        }
    }
}

// ----------------------------------------------------------------------------
// 14.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> HostpulseResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match AgentConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!();
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!();
            println!("  host:             {}", config.hostname());
            println!("  default interval: {}", humantime::format_duration(config.agent.default_interval));
            println!("  channel capacity: {}", config.agent.channel_capacity);
            println!("  self monitoring:  {}", config.agent.self_monitoring);
            println!("  overrides:        {}", config.collectors.intervals.len());
            println!("  disabled:         {}", config.collectors.disabled.len());

            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            Err(HostpulseError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> HostpulseResult<()> {
    let config_str = AgentConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", AGENT_FULL_NAME, AGENT_VERSION);
    println!("  target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
    println!("  default interval: {}s", DEFAULT_FREQ_SECS);
}

/// Handle the list subcommand
fn handle_list(registry: &CollectorRegistry, config: &AgentConfig, filter: Option<&str>) {
    let matches = registry.search(filter.unwrap_or(""));
    if matches.is_empty() {
        println!("No collectors match");
        return;
    }

    for entry in matches {
        let interval = config
            .collectors
            .interval_for(entry.name())
            .filter(|d| !d.is_zero())
            .unwrap_or(entry.interval());
        let state = if config.collectors.is_disabled(entry.name()) {
            "disabled"
        } else {
            "enabled"
        };
        println!("{:<32} {:>8} {}", entry.name(), humantime::format_duration(interval).to_string(), state);
    }
}

/// Collectors shipped with the agent itself.
pub fn builtin_registry(config: &AgentConfig) -> CollectorResult<CollectorRegistry> {
    let mut registry = CollectorRegistry::with_default_interval(config.agent.default_interval);
    if config.agent.self_monitoring {
        registry.register_self_monitoring(config.agent.self_monitoring_interval)?;
    }
    Ok(registry)
}

/// Write every measurement to stdout until the stream closes.
async fn drain_to_stdout(stream: MeasurementStream, format: OutputFormat) -> u64 {
    let mut written = 0u64;
    while let Some(measurement) = stream.recv_async().await {
        match format.render(&measurement) {
            Ok(line) => {
                println!("{}", line);
                written += 1;
            }
            Err(e) => warn!(
                target: "hostpulse::output",
                metric = %measurement.metric,
                error = %e,
                "Failed to render measurement"
            ),
        }
    }
    written
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the hostpulse agent
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let mut config = if config_found {
        AgentConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        AgentConfig::default()
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }

    init_logging(&config.logging)?;

    if !config_found {
        warn!(
            target: "hostpulse::init",
            path = %cli.config.display(),
            "Config file not found, using defaults"
        );
    }

    let host = config.hostname();
    let clock = ClockCache::new();
    let tagger = Tagger::new(host.as_str(), clock.clone());
    let registry = builtin_registry(&config).context("Failed to register built-in collectors")?;

    match cli.command {
        Some(Commands::List { filter }) => {
            handle_list(&registry, &config, filter.as_deref());
        }
        Some(Commands::Run { format }) => run_agent(&config, registry, tagger, format).await?,
        None => run_agent(&config, registry, tagger, OutputFormat::Put).await?,
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}

async fn run_agent(
    config: &AgentConfig,
    registry: CollectorRegistry,
    tagger: Tagger,
    format: OutputFormat,
) -> AnyhowResult<()> {
    info!(
        target: "hostpulse::init",
        version = AGENT_VERSION,
        host = %tagger.host(),
        collectors = registry.len(),
        "Starting {}",
        AGENT_FULL_NAME
    );

    tagger.clock().start();

    let scheduler = Scheduler::new(registry, tagger).with_config(config);
    let stream = scheduler.run().context("Failed to start scheduler")?;
    let written = drain_to_stdout(stream, format).await;

    info!(target: "hostpulse::init", measurements = written, "Output stream closed, exiting");
    Ok(())
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    const T0: i64 = 1_700_000_000;

    fn fixed_tagger(host: &str) -> Tagger {
        Tagger::new(host, ClockCache::manual(Timestamp::from_secs(T0)))
    }

    async fn next(stream: &MeasurementStream) -> Measurement {
        tokio::time::timeout(Duration::from_secs(3), stream.recv_async())
            .await
            .expect("timed out waiting for a measurement")
            .expect("stream closed")
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    // ------------------------------------------------------------------------
    // Core types
    // ------------------------------------------------------------------------

    #[test]
    fn test_timestamp_conversions() {
        let ts = Timestamp::from_secs(T0);
        assert_eq!(ts.as_secs(), T0);
        assert_eq!(i64::from(ts), T0);
        assert_eq!(ts.abs_diff(Timestamp::from_secs(T0 + 5)), 5);
        assert_eq!(Timestamp::EPOCH.to_string(), "1970-01-01 00:00:00 UTC");
        assert!(Timestamp::now() > ts);
    }

    #[test]
    fn test_metric_value_accessors() {
        assert_eq!(MetricValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(MetricValue::Float(3.5).as_i64(), None);
        assert_eq!(MetricValue::from("ok").as_str(), Some("ok"));
        assert!(!MetricValue::from("ok").is_numeric());
        assert_eq!(MetricValue::Float(0.25).type_name(), "float");
    }

    #[test]
    fn test_tag_set_and_macro() {
        let mut tags = tags!("iface" => "eth0", "direction" => "in");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("iface"), Some("eth0"));

        let previous = tags.insert("iface", "eth1");
        assert_eq!(previous.as_deref(), Some("eth0"));
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.sorted(), vec![("direction", "in"), ("iface", "eth1")]);

        assert!(tags!().is_empty());
        let collected: TagSet = vec![("a", "1"), ("a", "2")].into_iter().collect();
        assert_eq!(collected.get("a"), Some("2"));
    }

    #[test]
    fn test_put_line_sorts_tags() {
        let m = Measurement::new(
            "cpu.idle",
            Timestamp::from_secs(100),
            42,
            tags!("host" => "web", "cpu" => "0"),
        );
        assert_eq!(m.to_put_line(), "put cpu.idle 100 42 cpu=0 host=web");
        assert_eq!(m.host(), Some("web"));
    }

    #[test]
    fn test_measurement_json_shape() {
        let m = Measurement::new("load.1", Timestamp::from_secs(100), 1.5, tags!("host" => "web"));
        let json = m.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"metric":"load.1","timestamp":100,"value":1.5,"tags":{"host":"web"}}"#
        );

        let back: Measurement = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    // ------------------------------------------------------------------------
    // Clock & tagging
    // ------------------------------------------------------------------------

    #[test]
    fn test_manual_clock_never_goes_backwards() {
        let clock = ClockCache::manual(Timestamp::from_secs(T0));
        let reader = clock.clone();

        clock.advance_to(Timestamp::from_secs(T0 + 10));
        assert_eq!(reader.now().as_secs(), T0 + 10);

        clock.advance_to(Timestamp::from_secs(T0 + 3));
        assert_eq!(reader.now().as_secs(), T0 + 10);

        clock.set(Timestamp::from_secs(T0));
        assert_eq!(reader.now().as_secs(), T0);
        assert!(!clock.is_updating());
    }

    #[tokio::test]
    async fn test_clock_updater_tracks_wall_clock() {
        let clock = ClockCache::manual(Timestamp::EPOCH);
        assert!(clock.start().is_some());
        assert!(clock.start().is_none());
        assert!(clock.is_updating());

        let reader = clock.clone();
        let caught_up = wait_until(
            || reader.now().abs_diff(Timestamp::now()) <= 2,
            Duration::from_secs(3),
        )
        .await;
        assert!(caught_up);

        let first = clock.now();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(clock.now() >= first);
        assert!(clock.now().abs_diff(Timestamp::now()) <= 2);
    }

    #[test]
    fn test_add_overwrites_host_tag() {
        let tagger = fixed_tagger("web-01");
        let mut batch = MetricBatch::new();

        tagger.add(
            &mut batch,
            "net.bytes",
            1024u64,
            Some(tags!("host" => "other", "iface" => "eth0")),
        );

        let m = batch.iter().next().unwrap();
        assert_eq!(m.host(), Some("web-01"));
        assert_eq!(m.tags.get("iface"), Some("eth0"));
        assert_eq!(m.timestamp.as_secs(), T0);
    }

    #[test]
    fn test_add_without_tags_and_order() {
        let tagger = fixed_tagger("web-01");
        let mut batch = MetricBatch::new();

        tagger.add(&mut batch, "a", 1, None);
        tagger.add(&mut batch, "b", 2, None);
        tagger.add(&mut batch, "c", 3, None);

        let names: Vec<&str> = batch.iter().map(|m| m.metric.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        for m in &batch {
            assert_eq!(m.tags.len(), 1);
            assert_eq!(m.host(), Some("web-01"));
        }
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    fn noop(_: &Tagger) -> CollectorResult<MetricBatch> {
        Ok(MetricBatch::new())
    }

    #[test]
    fn test_registry_register_and_search() {
        let mut registry = CollectorRegistry::new();
        registry.register("cpu.stats", Duration::from_secs(5), noop).unwrap();
        registry.register_default("mem.stats", noop).unwrap();
        registry.register_default("net.bytes", noop).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names(), vec!["cpu.stats", "mem.stats", "net.bytes"]);
        assert_eq!(registry.get("cpu.stats").unwrap().interval(), Duration::from_secs(5));
        assert_eq!(registry.get("mem.stats").unwrap().interval(), DEFAULT_INTERVAL);

        let hits: Vec<&str> = registry.search("stats").iter().map(|e| e.name()).collect();
        assert_eq!(hits, vec!["cpu.stats", "mem.stats"]);
        assert!(registry.search("zzz").is_empty());
        assert!(registry.search("Stats").is_empty());
        assert_eq!(registry.search("").len(), 3);
    }

    #[test]
    fn test_registry_rejects_bad_registrations() {
        let mut registry = CollectorRegistry::new();
        registry.register_default("cpu", noop).unwrap();

        assert!(matches!(
            registry.register_default("cpu", noop),
            Err(CollectorError::Duplicate { ref name }) if name == "cpu"
        ));
        assert!(matches!(registry.register_default("  ", noop), Err(CollectorError::InvalidName)));
        assert!(matches!(
            registry.register("mem", Duration::ZERO, noop),
            Err(CollectorError::InvalidInterval { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_custom_default_interval() {
        let mut registry = CollectorRegistry::with_default_interval(Duration::from_secs(60));
        registry.register_default("disk", noop).unwrap();
        assert_eq!(registry.get("disk").unwrap().interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_entry_poll_uses_tagger() {
        let mut registry = CollectorRegistry::new();
        registry
            .register_default("uptime", |t: &Tagger| {
                let mut batch = MetricBatch::new();
                t.add(&mut batch, "system.uptime", 99, None);
                Ok(batch)
            })
            .unwrap();

        let batch = registry.get("uptime").unwrap().poll(&fixed_tagger("h1")).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.iter().next().unwrap().to_put_line(), format!("put system.uptime {} 99 host=h1", T0));
    }

    #[test]
    fn test_self_monitor_reports_earlier_collectors() {
        let mut registry = CollectorRegistry::new();
        registry.register_default("cpu", noop).unwrap();
        registry.register_default("mem", noop).unwrap();
        registry.register_self_monitoring(Duration::from_secs(30)).unwrap();

        let entry = registry.get(SELF_COLLECTOR_NAME).unwrap();
        assert_eq!(entry.interval(), Duration::from_secs(30));

        let batch = entry.poll(&fixed_tagger("h1")).unwrap();
        assert_eq!(batch.len(), 1 + 2 * 3);

        let described: Vec<&str> = batch
            .iter()
            .filter(|m| m.metric == "hostpulse.collector.cycles")
            .filter_map(|m| m.tags.get(COLLECTOR_TAG))
            .collect();
        assert_eq!(described, vec!["cpu", "mem"]);
        assert!(batch.iter().all(|m| m.host() == Some("h1")));
    }

    // ------------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_polls_follow_interval() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);

        let mut registry = CollectorRegistry::new();
        registry
            .register("ticker", Duration::from_millis(50), move |_: &Tagger| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(MetricBatch::new())
            })
            .unwrap();

        let scheduler = Scheduler::new(registry, fixed_tagger("h1"));
        let _stream = scheduler.run().unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(polls.load(AtomicOrdering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let count = polls.load(AtomicOrdering::SeqCst);
        assert!((6..=11).contains(&count), "unexpected poll count {}", count);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_measurement_delivered_once_in_order() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);

        let mut registry = CollectorRegistry::new();
        registry
            .register("seq", Duration::from_millis(10), move |t: &Tagger| {
                let base = counter.fetch_add(1, AtomicOrdering::SeqCst) as i64 * 3;
                let mut batch = MetricBatch::with_capacity(3);
                for i in 0..3 {
                    t.add(&mut batch, "seq.value", base + i, None);
                }
                Ok(batch)
            })
            .unwrap();

        let scheduler = Scheduler::new(registry, fixed_tagger("h1"));
        let stream = scheduler.run().unwrap();

        let mut values = Vec::new();
        for _ in 0..15 {
            values.push(next(&stream).await.value.as_i64().unwrap());
        }
        assert_eq!(values, (0..15).collect::<Vec<i64>>());

        let counted = wait_until(
            || scheduler.stats("seq").map(|s| s.measurements).unwrap_or(0) >= 15,
            Duration::from_secs(3),
        )
        .await;
        assert!(counted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_and_panicking_collectors_are_isolated() {
        let mut registry = CollectorRegistry::new();
        registry
            .register("healthy", Duration::from_millis(20), |t: &Tagger| {
                let mut batch = MetricBatch::new();
                t.add(&mut batch, "healthy.tick", 1, None);
                Ok(batch)
            })
            .unwrap();
        registry
            .register("failing", Duration::from_millis(20), |_: &Tagger| {
                Err(CollectorError::collection_failed("failing", "no data"))
            })
            .unwrap();
        registry
            .register(
                "panicking",
                Duration::from_millis(20),
                |_: &Tagger| -> CollectorResult<MetricBatch> { panic!("collector blew up") },
            )
            .unwrap();

        let scheduler = Scheduler::new(registry, fixed_tagger("h1"));
        let stream = scheduler.run().unwrap();

        for _ in 0..5 {
            assert_eq!(next(&stream).await.metric, "healthy.tick");
        }

        let settled = wait_until(
            || {
                scheduler.stats("failing").map(|s| s.failures).unwrap_or(0) >= 2
                    && scheduler.stats("panicking").map(|s| s.failures).unwrap_or(0) >= 2
            },
            Duration::from_secs(3),
        )
        .await;
        assert!(settled);

        // Both broken collectors keep being polled, and the stream stays open.
        assert_eq!(next(&stream).await.metric, "healthy.tick");
        assert!(!stream.is_disconnected());

        let failing = scheduler.stats("failing").unwrap();
        assert!(failing.last_error.unwrap().contains("no data"));
        let panicking = scheduler.stats("panicking").unwrap();
        assert!(panicking.last_error.unwrap().contains("collector blew up"));
        assert_eq!(scheduler.stats("healthy").unwrap().failures, 0);
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let mut registry = CollectorRegistry::new();
        registry.register_default("cpu", noop).unwrap();

        let scheduler = Scheduler::new(registry, fixed_tagger("h1"));
        let _stream = scheduler.run().unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.run(), Err(CollectorError::AlreadyRunning)));
    }

    #[test]
    fn test_run_outside_runtime_fails() {
        let scheduler = Scheduler::new(CollectorRegistry::new(), fixed_tagger("h1"));
        assert!(matches!(scheduler.run(), Err(CollectorError::NoRuntime)));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_zero_collectors_close_stream() {
        let scheduler = Scheduler::new(CollectorRegistry::new(), fixed_tagger("h1"));
        let stream = scheduler.run().unwrap();
        assert!(stream.is_disconnected());
        assert!(stream.recv_async().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disabled_and_overridden_intervals() {
        let slow_polls = Arc::new(AtomicUsize::new(0));
        let skipped_polls = Arc::new(AtomicUsize::new(0));
        let slow_counter = Arc::clone(&slow_polls);
        let skipped_counter = Arc::clone(&skipped_polls);

        let mut registry = CollectorRegistry::new();
        registry
            .register("slow", Duration::from_secs(3600), move |_: &Tagger| {
                slow_counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(MetricBatch::new())
            })
            .unwrap();
        registry
            .register("skipped", Duration::from_millis(10), move |_: &Tagger| {
                skipped_counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(MetricBatch::new())
            })
            .unwrap();

        let config = AgentConfig::from_str(
            r#"
[collectors]
disabled = ["skipped"]

[collectors.intervals]
slow = "20ms"
"#,
        )
        .unwrap();

        let scheduler = Scheduler::new(registry, fixed_tagger("h1")).with_config(&config);
        let slow = scheduler.registry().get("slow").unwrap();
        assert_eq!(scheduler.effective_interval(slow), Duration::from_millis(20));

        let _stream = scheduler.run().unwrap();
        let polled = wait_until(|| slow_polls.load(AtomicOrdering::SeqCst) >= 3, Duration::from_secs(3)).await;
        assert!(polled);
        assert_eq!(skipped_polls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unbuffered_stream_applies_backpressure() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);

        let mut registry = CollectorRegistry::new();
        registry
            .register("chatty", Duration::from_millis(10), move |t: &Tagger| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                let mut batch = MetricBatch::new();
                t.add(&mut batch, "chatty.value", 1, None);
                Ok(batch)
            })
            .unwrap();

        let scheduler = Scheduler::new(registry, fixed_tagger("h1"));
        let stream = scheduler.run().unwrap();

        // Nobody reads: the first send never completes, so no second poll.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(polls.load(AtomicOrdering::SeqCst), 1);

        next(&stream).await;
        let resumed = wait_until(|| polls.load(AtomicOrdering::SeqCst) >= 2, Duration::from_secs(3)).await;
        assert!(resumed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_collector_stops_when_stream_dropped() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);

        let mut registry = CollectorRegistry::new();
        registry
            .register("silent", Duration::from_millis(10), move |_: &Tagger| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(MetricBatch::new())
            })
            .unwrap();

        let scheduler = Scheduler::new(registry, fixed_tagger("h1"));
        let stream = scheduler.run().unwrap();

        let polled = wait_until(|| polls.load(AtomicOrdering::SeqCst) >= 2, Duration::from_secs(3)).await;
        assert!(polled);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_drop = polls.load(AtomicOrdering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(polls.load(AtomicOrdering::SeqCst), after_drop);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_adapter_and_shutdown_on_drop() {
        use futures::StreamExt;

        let mut registry = CollectorRegistry::new();
        registry
            .register("pair", Duration::from_millis(10), |t: &Tagger| {
                let mut batch = MetricBatch::new();
                t.add(&mut batch, "pair.a", 1, None);
                t.add(&mut batch, "pair.b", 2, None);
                Ok(batch)
            })
            .unwrap();

        let scheduler = Scheduler::new(registry, fixed_tagger("h1")).with_capacity(8);
        let stream = scheduler.run().unwrap();

        let received: Vec<Measurement> = tokio::time::timeout(
            Duration::from_secs(3),
            stream.into_stream().take(4).collect::<Vec<_>>(),
        )
        .await
        .unwrap();

        let names: Vec<&str> = received.iter().map(|m| m.metric.as_str()).collect();
        assert_eq!(names, vec!["pair.a", "pair.b", "pair.a", "pair.b"]);

        // Receiver gone: the loop stops after its next failed send.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cycles = scheduler.stats("pair").unwrap().cycles;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.stats("pair").unwrap().cycles, cycles);
    }

    // ------------------------------------------------------------------------
    // Query builder
    // ------------------------------------------------------------------------

    table! {
        #[derive(Debug, Default)]
        struct Row {
            ID: i64,
            Name: String,
            Value: f64,
        }
    }

    table! {
        struct Win32_PerfRawData_PerfOS_Memory {
            pub AvailableBytes: u64,
        }
    }

    struct Empty;

    impl Table for Empty {
        const NAME: &'static str = "Empty";
        const COLUMNS: &'static [&'static str] = &[];
    }

    #[test]
    fn test_select_lists_columns_in_order() {
        assert_eq!(
            build_select::<Row>("WHERE ID > 5").unwrap(),
            "SELECT ID, Name, Value FROM Row WHERE ID > 5"
        );
    }

    #[test]
    fn test_select_single_column_and_empty_clause() {
        assert_eq!(
            build_select::<Win32_PerfRawData_PerfOS_Memory>("").unwrap(),
            "SELECT AvailableBytes FROM Win32_PerfRawData_PerfOS_Memory "
        );
    }

    #[test]
    fn test_select_for_destination() {
        let rows: Vec<Row> = vec![Row::default()];
        assert_eq!(
            select_for(rows.as_slice(), "WHERE Name = 'x'").unwrap(),
            "SELECT ID, Name, Value FROM Row WHERE Name = 'x'"
        );
        assert_eq!(Row::schema(), TableSchema::new("Row", &["ID", "Name", "Value"]));
    }

    #[test]
    fn test_empty_schema_is_an_error() {
        assert_eq!(
            build_select::<Empty>("WHERE 1 = 1"),
            Err(QueryError::EmptySchema {
                table: "Empty".to_string()
            })
        );
    }

    // ------------------------------------------------------------------------
    // Collector helpers
    // ------------------------------------------------------------------------

    proptest::proptest! {
        #[test]
        fn prop_digit_strings_are_digits(s in "[0-9]{0,24}") {
            proptest::prop_assert!(is_digit(&s));
            proptest::prop_assert!(is_alnum(&s));
        }

        #[test]
        fn prop_letter_breaks_is_digit(a in "[0-9]{0,8}", b in "[a-z]", c in "[0-9]{0,8}") {
            let s = format!("{}{}{}", a, b, c);
            proptest::prop_assert!(!is_digit(&s));
            proptest::prop_assert!(is_alnum(&s));
        }
    }

    #[test]
    fn test_read_proc_visits_every_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cpu  10 20 30").unwrap();
        writeln!(file, "cpu0 1 2 3").unwrap();
        writeln!(file, "intr 7").unwrap();

        let mut lines = Vec::new();
        read_proc(file.path(), |line| lines.push(line.to_string()));
        assert_eq!(lines, vec!["cpu  10 20 30", "cpu0 1 2 3", "intr 7"]);
    }

    #[test]
    fn test_read_proc_missing_file_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let mut calls = 0;
        read_proc(dir.path().join("does-not-exist"), |_| calls += 1);
        assert_eq!(calls, 0);
    }

    // ------------------------------------------------------------------------
    // Configuration & CLI
    // ------------------------------------------------------------------------

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.agent.default_interval, DEFAULT_INTERVAL);
        assert_eq!(config.agent.channel_capacity, 0);
        assert!(config.agent.self_monitoring);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = AgentConfig::from_str(
            r#"
[agent]
hostname = "db-01"
default_interval = "30s"
channel_capacity = 64
self_monitoring = false

[collectors]
disabled = ["hostpulse.self"]

[collectors.intervals]
"cpu.stats" = "5s"

[logging]
level = "debug"
format = "json"
"#,
        )
        .unwrap();

        assert_eq!(config.hostname(), "db-01");
        assert_eq!(config.agent.default_interval, Duration::from_secs(30));
        assert_eq!(config.agent.channel_capacity, 64);
        assert_eq!(config.collectors.interval_for("cpu.stats"), Some(Duration::from_secs(5)));
        assert_eq!(config.collectors.interval_for("mem.stats"), None);
        assert!(config.collectors.is_disabled("hostpulse.self"));
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_config_rejects_zero_interval() {
        let err = AgentConfig::from_str("[agent]\ndefault_interval = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "agent.default_interval"));

        let err = AgentConfig::from_str("[collectors.intervals]\ncpu = \"0s\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "collectors.intervals.cpu"));
    }

    #[test]
    fn test_config_rejects_unknown_log_format() {
        let err = AgentConfig::from_str("[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "logging.format"));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let generated = AgentConfig::generate_default_config();
        let config = AgentConfig::from_str(&generated).unwrap();
        assert_eq!(config.agent.default_interval, DEFAULT_INTERVAL);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[agent]\nhostname = \"edge-7\"\nself_monitoring_interval = \"1m\"").unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.agent.hostname.as_deref(), Some("edge-7"));
        assert_eq!(config.agent.self_monitoring_interval, Duration::from_secs(60));

        let missing = AgentConfig::load("/nonexistent/hostpulse.toml").unwrap_err();
        assert!(matches!(missing, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_builtin_registry_follows_config() {
        let registry = builtin_registry(&AgentConfig::default()).unwrap();
        assert_eq!(registry.names(), vec![SELF_COLLECTOR_NAME]);

        let mut config = AgentConfig::default();
        config.agent.self_monitoring = false;
        assert!(builtin_registry(&config).unwrap().is_empty());
    }

    #[test]
    fn test_cli_parsing() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["hostpulse", "run", "--format", "json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run { format: OutputFormat::Json })));

        let cli = Cli::try_parse_from(["hostpulse", "list", "-f", "cpu"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::List { filter: Some(ref f) }) if f == "cpu"));

        let cli = Cli::try_parse_from(["hostpulse"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_output_format_render() {
        let m = Measurement::new("up", Timestamp::from_secs(5), 1, tags!("host" => "h"));
        assert_eq!(OutputFormat::Put.render(&m).unwrap(), "put up 5 1 host=h");
        assert!(OutputFormat::Json.render(&m).unwrap().starts_with(r#"{"metric":"up""#));
    }

    #[test]
    fn test_error_classification() {
        let err = HostpulseError::from(CollectorError::collection_failed("cpu", "eof"));
        assert!(err.is_recoverable());
        assert_eq!(err.category(), "collector");
        assert!(!HostpulseError::from(CollectorError::AlreadyRunning).is_recoverable());
        assert_eq!(HostpulseError::from(QueryError::EmptySchema { table: "T".into() }).category(), "query");
    }
}

// ----------------------------------------------------------------------------
// Table-driven tests
// ----------------------------------------------------------------------------
