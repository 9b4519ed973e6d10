//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the
//! departure-config.toml file. It covers the station and per-screen platforms,
//! the data backend, retry and refresh timing, the clock and the display geometry.
//!
//! Every section has defaults, so a file only needs the values it changes.
//! The API key can also come from the `DEPARTURE_BOARD_API_KEY` environment
//! variable, which wins over the file.

use crate::extractor::{BoundedJsonExtractor, ExtractLimits};
use crate::fetch_client::{Backend, Query};
use crate::rail_data::RetryPolicy;
use crate::renderer::LayoutStyle;
use crate::scheduler::Cadence;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "departure-config.toml";

/// Environment variable overriding `api.api_key`.
pub const API_KEY_ENV: &str = "DEPARTURE_BOARD_API_KEY";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config IO: {0}")]
    Io(#[from] io::Error),

    #[error("config format: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config encoding: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Application configuration loaded from departure-config.toml
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is not set
    pub log_level: String,
    pub station: StationConfig,
    /// One entry per physical screen
    pub screens: Vec<ScreenConfig>,
    pub api: ApiConfig,
    pub refresh: RefreshConfig,
    pub clock: ClockConfig,
    pub display: DisplayConfig,
    pub alert: AlertConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StationConfig {
    /// Three-letter station code (e.g., "PMW" for Penmere)
    pub code: String,
    /// Name shown when the feed gives only the code
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScreenConfig {
    /// Platform shown on this screen; omit to show every platform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Direct,
    Filtered,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub backend: BackendKind,
    pub direct_url: String,
    pub filtered_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Rows requested from the direct backend
    pub num_rows: u8,
    /// Responses above this size are abandoned
    pub max_response_bytes: usize,
    /// Longest station, destination or operator text kept from a response
    pub max_text_chars: usize,
    pub max_alert_chars: usize,
    /// Calling points kept per service
    pub max_calling_points: usize,
    pub max_alerts: usize,
    /// Never use the network; show the offline dataset
    pub offline_mode: bool,
    /// Replacement for the embedded offline dataset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_data: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retry_window_secs: u64,
    pub request_timeout_secs: u64,
    /// First wait after a failed refresh cycle; doubles per consecutive failure
    pub failure_backoff_secs: u64,
    pub failure_backoff_max_secs: u64,
    /// Live data older than this is shown as stale
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClockConfig {
    /// `host:port` of an NTP server
    pub ntp_server: String,
    pub tick_secs: u64,
    /// Minutes between time resyncs; 0 disables resync
    pub resync_minutes: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    /// Glyph width in pixels (6 for the 6x10 font)
    pub char_width: u32,
    pub destination_chars: usize,
    pub alert_chars: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Static message shown instead of live alerts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            station: StationConfig::default(),
            screens: vec![
                ScreenConfig {
                    platform: Some("1".to_string()),
                },
                ScreenConfig {
                    platform: Some("2".to_string()),
                },
            ],
            api: ApiConfig::default(),
            refresh: RefreshConfig::default(),
            clock: ClockConfig::default(),
            display: DisplayConfig::default(),
            alert: AlertConfig::default(),
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            code: "PMW".to_string(),
            name: "Penmere".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Direct,
            direct_url: "https://api1.raildata.org.uk/1010-live-departure-board-dep1_2/LDBWS/api/20220120/GetDepBoardWithDetails".to_string(),
            filtered_url: "http://localhost:8080/departures".to_string(),
            api_key: None,
            num_rows: 10,
            max_response_bytes: 64 * 1024,
            max_text_chars: 48,
            max_alert_chars: 480,
            max_calling_points: 16,
            max_alerts: 3,
            offline_mode: false,
            offline_data: None,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 4_000,
            retry_window_secs: 8,
            request_timeout_secs: 10,
            failure_backoff_secs: 5,
            failure_backoff_max_secs: 180,
            stale_after_secs: 80,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ntp_server: "pool.ntp.org:123".to_string(),
            tick_secs: 60,
            resync_minutes: 0,
            timeout_ms: 3_000,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 128, // SSD1306 128x32
            height: 32,
            char_width: 6,
            destination_chars: 12,
            alert_chars: 19,
        }
    }
}

impl Config {
    /// Load configuration from departure-config.toml.
    /// Falls back to default configuration if the file doesn't exist or is invalid.
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_FILE)
    }

    /// Load configuration from the specified path.
    /// Falls back to default configuration if the file doesn't exist or is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::read(&path) {
            Ok(config) => {
                info!(station = %config.station.code, "Loaded configuration");
                config
            }
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.as_ref().display(), "No config file found, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.as_ref().display(), error = %e, "Unusable config file, using defaults");
                Self::default()
            }
        }
    }

    /// Reads and validates a config file without any fallback.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save current configuration to departure-config.toml
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to_path(CONFIG_FILE)
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(&path, contents)?;
        info!(path = %path.as_ref().display(), "Configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.screens.is_empty() || self.screens.len() > 2 {
            return invalid("between one and two [[screens]] are required");
        }
        if self.station.code.trim().is_empty() {
            return invalid("station.code must not be empty");
        }
        if self.refresh.max_attempts == 0 {
            return invalid("refresh.max_attempts must be at least 1");
        }
        if self.refresh.request_timeout_secs == 0 {
            return invalid("refresh.request_timeout_secs must be above zero");
        }
        let policy = self.retry_policy();
        if policy.max_attempts > 1 && policy.total_delay() >= policy.retry_window {
            return invalid("refresh.retry_window_secs leaves no time for retries after the backoff delays");
        }
        if !(30..=60).contains(&self.refresh.interval_secs) {
            return invalid("refresh.interval_secs must be between 30 and 60");
        }
        if self.clock.tick_secs < 60 {
            return invalid("clock.tick_secs must be at least 60");
        }
        if self.api.max_response_bytes == 0 {
            return invalid("api.max_response_bytes must be above zero");
        }
        if self.api.max_text_chars == 0 {
            return invalid("api.max_text_chars must be above zero");
        }
        if self.display.char_width == 0 {
            return invalid("display.char_width must be above zero");
        }
        Ok(())
    }

    /// API key from the environment, else from the file.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api.api_key.clone())
    }

    pub fn backend(&self) -> Backend {
        match self.api.backend {
            BackendKind::Direct => Backend::Direct {
                base_url: self.api.direct_url.clone(),
            },
            BackendKind::Filtered => Backend::Filtered {
                base_url: self.api.filtered_url.clone(),
            },
        }
    }

    /// Platform filter per screen, in screen order.
    pub fn screen_platforms(&self) -> Vec<Option<String>> {
        self.screens.iter().map(|s| s.platform.clone()).collect()
    }

    pub fn query(&self) -> Query {
        // A screen without a filter needs every platform
        let platforms = self
            .screens
            .iter()
            .map(|s| s.platform.clone())
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default();

        Query {
            station: self.station.code.clone(),
            platforms,
            num_rows: self.api.num_rows,
        }
    }

    pub fn extractor(&self) -> BoundedJsonExtractor {
        BoundedJsonExtractor::new(self.screen_platforms())
            .with_station_name(&self.station.code, &self.station.name)
            .with_limits(self.extract_limits())
    }

    pub fn extract_limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_text_chars: self.api.max_text_chars,
            max_alert_chars: self.api.max_alert_chars,
            max_calling_points: self.api.max_calling_points,
            max_alerts: self.api.max_alerts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.refresh.max_attempts,
            base_delay: Duration::from_millis(self.refresh.base_delay_ms),
            max_delay: Duration::from_millis(self.refresh.max_delay_ms),
            retry_window: Duration::from_secs(self.refresh.retry_window_secs),
            request_timeout: Duration::from_secs(self.refresh.request_timeout_secs),
        }
    }

    pub fn layout_style(&self) -> LayoutStyle {
        LayoutStyle {
            columns: (self.display.width / self.display.char_width.max(1)) as usize,
            destination_chars: self.display.destination_chars,
            alert_chars: self.display.alert_chars,
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.refresh.stale_after_secs)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.clock.resync_minutes > 0).then(|| Duration::from_secs(self.clock.resync_minutes * 60))
    }

    pub fn ntp_timeout(&self) -> Duration {
        Duration::from_millis(self.clock.timeout_ms)
    }

    pub fn cadence(&self) -> Cadence {
        Cadence {
            refresh_interval: Duration::from_secs(self.refresh.interval_secs),
            clock_tick: Duration::from_secs(self.clock.tick_secs),
            failure_backoff: Duration::from_secs(self.refresh.failure_backoff_secs),
            failure_backoff_max: Duration::from_secs(self.refresh.failure_backoff_max_secs),
        }
    }
}
