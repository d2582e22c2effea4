//! Configuration loading and typed config structures for the pitwall client.
//!
//! The configuration lives in `pitwall.yaml`. Every field has a default
//! matching the live timing service's reference behaviour, so an empty
//! (or absent) file yields a working client. A handful of environment
//! variables override the file for deployment convenience.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Every topic the live timing hub publishes.
pub const ALL_TOPICS: [&str; 20] = [
    "Heartbeat",
    "AudioStreams",
    "DriverList",
    "ExtrapolatedClock",
    "RaceControlMessages",
    "SessionInfo",
    "SessionStatus",
    "TeamRadio",
    "TimingAppData",
    "TimingStats",
    "TrackStatus",
    "WeatherData",
    "Position.z",
    "CarData.z",
    "ContentStreams",
    "SessionData",
    "TimingData",
    "TopThree",
    "RcmSeries",
    "LapCount",
];

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is unusable.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level client configuration.
///
/// Mirrors the structure of `pitwall.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FeedConfig {
    /// Endpoint, hub, and topic selection.
    #[serde(default)]
    pub feed: EndpointConfig,

    /// Timeouts and backoff.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Optional gap escape hatch for the sequencer.
    #[serde(default)]
    pub sequencer: SequencerConfig,

    /// Durable history files and flush cadence.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FeedConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override file values:
    /// - `PITWALL_BASE_URL` overrides `feed.base_url`
    /// - `PITWALL_DATA_DIR` overrides `persistence.data_dir`
    /// - `PITWALL_TOPICS` (comma separated) overrides `feed.topics`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is unusable.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, then apply env overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is unusable.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup.
    ///
    /// Takes the lookup as a function so tests never touch the process
    /// environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PITWALL_BASE_URL") {
            self.feed.base_url = val;
        }
        if let Some(val) = lookup("PITWALL_DATA_DIR") {
            self.persistence.data_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("PITWALL_TOPICS") {
            self.feed.topics = val
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }
    }

    /// Reject values the client cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.hub.is_empty() {
            return Err(invalid("feed.hub must not be empty"));
        }
        if self.timing.connect_timeout_ms == 0 {
            return Err(invalid("timing.connect_timeout_ms must be at least 1"));
        }
        if self.persistence.flush_interval_ms == 0 {
            return Err(invalid("persistence.flush_interval_ms must be at least 1"));
        }
        if self.sequencer.max_pending == Some(0) {
            return Err(invalid("sequencer.max_pending must be at least 1 when set"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.to_owned(),
    }
}

/// Endpoint and hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    /// Base URL of the hub; `/negotiate` and `/connect` are appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the streaming hub.
    #[serde(default = "default_hub")]
    pub hub: String,

    /// Protocol version sent as `clientProtocol`.
    #[serde(default = "default_client_protocol")]
    pub client_protocol: String,

    /// `User-Agent` header for the socket handshake.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// `Accept-Encoding` header for the socket handshake.
    #[serde(default = "default_accept_encoding")]
    pub accept_encoding: String,

    /// Topics to subscribe to on start.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            hub: default_hub(),
            client_protocol: default_client_protocol(),
            user_agent: default_user_agent(),
            accept_encoding: default_accept_encoding(),
            topics: default_topics(),
        }
    }
}

/// Timeouts and retry delay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimingConfig {
    /// Deadline for the negotiation request.
    #[serde(default = "default_negotiate_timeout_ms")]
    pub negotiate_timeout_ms: u64,

    /// Deadline for the socket to reach the open state.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Fixed delay before every automatic reconnect.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl TimingConfig {
    /// Negotiation deadline.
    pub const fn negotiate_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiate_timeout_ms)
    }

    /// Socket open deadline.
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect backoff delay.
    pub const fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            negotiate_timeout_ms: default_negotiate_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

/// Sequencer gap handling.
///
/// Both limits are unset by default, in which case a delivery id that never
/// arrives stalls every later envelope indefinitely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SequencerConfig {
    /// Skip the gap once this many envelopes are waiting.
    #[serde(default)]
    pub max_pending: Option<usize>,

    /// Skip the gap once the oldest waiting envelope is this old.
    #[serde(default)]
    pub gap_timeout_ms: Option<u64>,
}

/// Durable history configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding the history files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Append log of every recorded frame.
    #[serde(default = "default_raw_file")]
    pub raw_file: String,

    /// Most recent frame plus counters.
    #[serde(default = "default_live_file")]
    pub live_file: String,

    /// Latest reconstructed snapshot.
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,

    /// Interval between flushes.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl PersistenceConfig {
    /// Path of the append log.
    pub fn raw_path(&self) -> PathBuf {
        self.data_dir.join(&self.raw_file)
    }

    /// Path of the latest-frame record.
    pub fn live_path(&self) -> PathBuf {
        self.data_dir.join(&self.live_file)
    }

    /// Path of the snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }

    /// Flush interval.
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            raw_file: default_raw_file(),
            live_file: default_live_file(),
            snapshot_file: default_snapshot_file(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Log a progress line every N received frames (0 disables).
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            progress_every: default_progress_every(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_base_url() -> String {
    "https://livetiming.formula1.com/signalr".to_owned()
}

fn default_hub() -> String {
    "Streaming".to_owned()
}

fn default_client_protocol() -> String {
    "1.5".to_owned()
}

fn default_user_agent() -> String {
    "BestHTTP".to_owned()
}

fn default_accept_encoding() -> String {
    "gzip,identity".to_owned()
}

fn default_topics() -> Vec<String> {
    ALL_TOPICS.iter().map(|t| (*t).to_owned()).collect()
}

const fn default_negotiate_timeout_ms() -> u64 {
    10_000
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_reconnect_backoff_ms() -> u64 {
    5_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_raw_file() -> String {
    "f1_raw_data.json".to_owned()
}

fn default_live_file() -> String {
    "f1_live_data.json".to_owned()
}

fn default_snapshot_file() -> String {
    "f1_snapshot.json".to_owned()
}

const fn default_flush_interval_ms() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_progress_every() -> u64 {
    50
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behaviour() {
        let config = FeedConfig::default();
        assert_eq!(config.feed.hub, "Streaming");
        assert_eq!(config.feed.client_protocol, "1.5");
        assert_eq!(config.feed.topics.len(), 20);
        assert_eq!(config.timing.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.timing.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.persistence.flush_interval(), Duration::from_secs(2));
        assert_eq!(config.sequencer.max_pending, None);
        assert_eq!(config.sequencer.gap_timeout_ms, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_yaml_keeps_other_defaults() {
        let yaml = r#"
feed:
  topics:
    - WeatherData
    - LapCount
timing:
  reconnect_backoff_ms: 1000
sequencer:
  max_pending: 500
persistence:
  data_dir: "/tmp/pitwall"
logging:
  level: "debug"
  format: json
"#;
        let mut config: FeedConfig = serde_yml::from_str(yaml).unwrap();
        config.apply_overrides(|_| None);

        assert_eq!(config.feed.topics, vec!["WeatherData", "LapCount"]);
        assert_eq!(config.feed.hub, "Streaming");
        assert_eq!(config.timing.reconnect_backoff_ms, 1000);
        assert_eq!(config.timing.connect_timeout_ms, 10_000);
        assert_eq!(config.sequencer.max_pending, Some(500));
        assert_eq!(
            config.persistence.raw_path(),
            PathBuf::from("/tmp/pitwall/f1_raw_data.json")
        );
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = FeedConfig::default();
        config.apply_overrides(|name| match name {
            "PITWALL_BASE_URL" => Some("http://localhost:9000/signalr".to_owned()),
            "PITWALL_TOPICS" => Some("Heartbeat, LapCount,,".to_owned()),
            _ => None,
        });

        assert_eq!(config.feed.base_url, "http://localhost:9000/signalr");
        assert_eq!(config.feed.topics, vec!["Heartbeat", "LapCount"]);
        assert_eq!(config.persistence.data_dir, PathBuf::from("."));
    }

    #[test]
    fn zero_max_pending_is_rejected() {
        let mut config = FeedConfig::default();
        config.sequencer.max_pending = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let result = FeedConfig::parse("feed: [unclosed");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }
}
