use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("packet size buckets must start at 0, got {0}")]
    BucketsStart(u64),
    #[error("packet size buckets must be strictly increasing")]
    BucketsOrder,
    #[error("time series interval must be positive, got {0} ms")]
    Interval(i64),
}

/// Settings for the conversation tracker.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Eviction cap for tracked flows.
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
    /// Age bound consulted by the idle-eviction maintenance call.
    #[serde(default = "default_conversation_timeout")]
    pub conversation_timeout_secs: i64,
    /// Gate on per-flow TCP stream tracking.
    #[serde(default = "default_enable_stream_reassembly")]
    pub enable_stream_reassembly: bool,
    /// Per-direction cap on retained stream payload, in bytes.
    #[serde(default = "default_max_stream_size")]
    pub max_stream_size: usize,
}

/// Settings for the statistics engine.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Width of the rate-series buckets, in milliseconds.
    #[serde(default = "default_time_series_interval")]
    pub time_series_interval_ms: i64,
    /// Eviction cap for the endpoint table.
    #[serde(default = "default_max_endpoints")]
    pub max_endpoints: usize,
    /// Size histogram boundaries. Must start at 0 and be strictly
    /// increasing; the final bucket is open-ended.
    #[serde(default = "default_size_buckets")]
    pub packet_size_buckets: Vec<u64>,
    /// Cap on retained error-packet samples.
    #[serde(default = "default_max_error_packets")]
    pub max_error_packets: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub statistics: StatsConfig,
}

fn default_max_conversations() -> usize {
    100_000
}
fn default_conversation_timeout() -> i64 {
    3600
}
fn default_enable_stream_reassembly() -> bool {
    true
}
fn default_max_stream_size() -> usize {
    10 * 1024 * 1024
}
fn default_time_series_interval() -> i64 {
    1000
}
fn default_max_endpoints() -> usize {
    10_000
}
fn default_size_buckets() -> Vec<u64> {
    vec![0, 64, 128, 256, 512, 1024, 1518]
}
fn default_max_error_packets() -> usize {
    1000
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            max_conversations: default_max_conversations(),
            conversation_timeout_secs: default_conversation_timeout(),
            enable_stream_reassembly: default_enable_stream_reassembly(),
            max_stream_size: default_max_stream_size(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            time_series_interval_ms: default_time_series_interval(),
            max_endpoints: default_max_endpoints(),
            packet_size_buckets: default_size_buckets(),
            max_error_packets: default_max_error_packets(),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            tracker: TrackerConfig::default(),
            statistics: StatsConfig::default(),
        }
    }
}

/// Check that `boundaries` describe a valid size histogram.
pub fn validate_size_buckets(boundaries: &[u64]) -> Result<(), ConfigError> {
    match boundaries.first() {
        Some(0) => {}
        Some(&other) => return Err(ConfigError::BucketsStart(other)),
        None => return Err(ConfigError::BucketsOrder),
    }
    if boundaries.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConfigError::BucketsOrder);
    }
    Ok(())
}

impl AnalyzerConfig {
    /// Load a configuration from a JSON file and validate it. Missing keys
    /// fall back to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: AnalyzerConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.statistics.time_series_interval_ms <= 0 {
            return Err(ConfigError::Interval(self.statistics.time_series_interval_ms));
        }
        validate_size_buckets(&self.statistics.packet_size_buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalyzerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tracker.max_conversations, 100_000);
        assert_eq!(config.statistics.time_series_interval_ms, 1000);
    }

    #[test]
    fn test_buckets_must_start_at_zero() {
        assert!(matches!(
            validate_size_buckets(&[64, 128]),
            Err(ConfigError::BucketsStart(64))
        ));
    }

    #[test]
    fn test_buckets_must_increase() {
        assert!(matches!(
            validate_size_buckets(&[0, 128, 128]),
            Err(ConfigError::BucketsOrder)
        ));
        assert!(validate_size_buckets(&[0, 64, 128]).is_ok());
    }

    #[test]
    fn test_load_with_partial_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tracker": {{"max_conversations": 2}}, "statistics": {{}}}}"#
        )
        .unwrap();
        let config = AnalyzerConfig::load(file.path()).unwrap();
        assert_eq!(config.tracker.max_conversations, 2);
        // Untouched keys keep their defaults.
        assert!(config.tracker.enable_stream_reassembly);
        assert_eq!(config.statistics.max_endpoints, 10_000);
    }

    #[test]
    fn test_load_rejects_bad_buckets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"statistics": {{"packet_size_buckets": [10, 20]}}}}"#
        )
        .unwrap();
        assert!(AnalyzerConfig::load(file.path()).is_err());
    }
}
