//! Configuration structures for fsdispatch.
//!
//! This module provides configuration types for every part of a watch session:
//!
//! - [`WatchConfig`] - Raw event intake (debounce window, recursion, channel size)
//! - [`DispatchConfig`] - Handler execution (worker pool, drain timeout, feed sizes)
//! - [`IgnoreConfig`] - Paths dropped before pattern matching
//! - [`Config`] - Root configuration combining all settings
//!
//! All configuration types implement [`Default`] and deserialize with
//! `#[serde(default)]`, so a partial JSON document only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for raw event intake and normalization.
///
/// # Examples
///
/// ```
/// use fsd_core::WatchConfig;
///
/// let config = WatchConfig::default();
/// assert_eq!(config.debounce_ms, 1600);
/// assert!(config.recursive);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Debounce window in milliseconds.
    ///
    /// Identical events (same root, path and kind) closer together than this
    /// window are delivered once. A deletion followed by a creation of the
    /// same path within the window is delivered as a single modification.
    pub debounce_ms: u64,

    /// Whether to watch subdirectories recursively.
    pub recursive: bool,

    /// Capacity of the channel between the raw event source and the
    /// ingestion task.
    ///
    /// When full, the source blocks. This is the backpressure path for slow
    /// blocking handlers.
    pub channel_capacity: usize,
}

impl WatchConfig {
    /// Returns the debounce window as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1600,
            recursive: true,
            channel_capacity: 1024,
        }
    }
}

/// Configuration for handler execution and the observation feed.
///
/// # Examples
///
/// ```
/// use fsd_core::DispatchConfig;
///
/// let config = DispatchConfig::default();
/// assert_eq!(config.max_workers, 4);
/// assert_eq!(config.history_capacity, 100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of non-blocking handler invocations running at once.
    pub max_workers: usize,

    /// How long a graceful stop waits for in-flight work, in milliseconds.
    ///
    /// `None` waits without a bound.
    pub drain_timeout_ms: Option<u64>,

    /// Capacity of the observation feed broadcast channel.
    ///
    /// Readers that fall further behind than this lose the oldest records.
    pub feed_capacity: usize,

    /// Number of recent dispatches a session keeps for
    /// `WatchSession::history`.
    pub history_capacity: usize,
}

impl DispatchConfig {
    /// Returns the drain timeout as a [`Duration`], if bounded.
    #[inline]
    #[must_use]
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            drain_timeout_ms: Some(5000),
            feed_capacity: 256,
            history_capacity: 100,
        }
    }
}

/// Paths dropped before any handler pattern is consulted.
///
/// Rules are evaluated against the path relative to its watch root.
///
/// # Examples
///
/// ```
/// use fsd_core::IgnoreConfig;
///
/// let config = IgnoreConfig::default();
/// assert!(config.ignore_hidden);
/// assert!(config.suffixes.iter().any(|s| s == ".swp"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
    /// Drop paths with any component starting with a dot.
    pub ignore_hidden: bool,

    /// Drop files whose name ends with one of these suffixes
    /// (editor swap and backup files, partial downloads).
    pub suffixes: Vec<String>,

    /// Additional glob patterns to drop, matched like handler patterns.
    pub patterns: Vec<String>,
}

impl IgnoreConfig {
    /// An ignore configuration that drops nothing.
    #[must_use]
    pub fn none() -> Self {
        Self {
            ignore_hidden: false,
            suffixes: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            ignore_hidden: true,
            suffixes: vec![
                "~".to_owned(),
                ".swp".to_owned(),
                ".swx".to_owned(),
                ".swo".to_owned(),
                ".tmp".to_owned(),
                ".part".to_owned(),
                ".crdownload".to_owned(),
            ],
            patterns: Vec::new(),
        }
    }
}

/// Root configuration for fsdispatch.
///
/// # Examples
///
/// ```
/// use fsd_core::Config;
///
/// let config = Config::default();
/// assert_eq!(config.name, "fsd");
/// assert!(config.validate().is_ok());
///
/// let json = serde_json::to_string_pretty(&config).unwrap();
/// assert!(json.contains("debounce_ms"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name used in log output.
    pub name: String,

    /// Raw event intake configuration.
    pub watch: WatchConfig,

    /// Handler execution configuration.
    pub dispatch: DispatchConfig,

    /// Default ignore rules applied to every watch root.
    pub ignore: IgnoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "fsd".to_owned(),
            watch: WatchConfig::default(),
            dispatch: DispatchConfig::default(),
            ignore: IgnoreConfig::default(),
        }
    }
}

impl Config {
    /// Parses a configuration from JSON and validates it.
    ///
    /// Missing fields take their default values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks that every option holds a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch.channel_capacity == 0 {
            return Err(ConfigError::invalid_option(
                "watch.channel_capacity",
                "must be greater than zero",
            ));
        }
        if self.dispatch.max_workers == 0 {
            return Err(ConfigError::invalid_option(
                "dispatch.max_workers",
                "must be greater than zero",
            ));
        }
        if self.dispatch.feed_capacity == 0 {
            return Err(ConfigError::invalid_option(
                "dispatch.feed_capacity",
                "must be greater than zero",
            ));
        }
        if self.dispatch.history_capacity == 0 {
            return Err(ConfigError::invalid_option(
                "dispatch.history_capacity",
                "must be greater than zero",
            ));
        }
        if self.ignore.suffixes.iter().any(String::is_empty) {
            return Err(ConfigError::invalid_option(
                "ignore.suffixes",
                "suffixes must not be empty strings",
            ));
        }
        Ok(())
    }
}
