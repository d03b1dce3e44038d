//! Configuration management for the window roster.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::types::{KeepAlive, StreamQuality};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub filter: FilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether the daemon runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Interval between refresh passes of the daemon loop
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

impl GeneralConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Maximum concurrent still captures per batch
    #[serde(default = "default_capture_concurrency")]
    pub capture_concurrency: usize,

    /// Freshly launched applications get this long before a missing window
    /// list is believed
    #[serde(default = "default_launch_grace")]
    pub launch_grace_ms: u64,

    /// Add placeholders for windows only the window server can see
    #[serde(default = "default_true")]
    pub include_cross_space: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            capture_concurrency: default_capture_concurrency(),
            launch_grace_ms: default_launch_grace(),
            include_cross_space: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn launch_grace(&self) -> Duration {
        Duration::from_millis(self.launch_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Fraction of reference title words that must appear in the candidate
    #[serde(default = "default_title_overlap")]
    pub title_overlap_threshold: f64,

    /// Per-edge tolerance when comparing window geometry
    #[serde(default = "default_geometry_tolerance")]
    pub geometry_tolerance_px: u32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            title_overlap_threshold: default_title_overlap(),
            geometry_tolerance_px: default_geometry_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Resident live sessions before LRU eviction kicks in
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_frame_rate")]
    pub default_frame_rate: u32,

    #[serde(default = "default_quality")]
    pub default_quality: StreamQuality,

    /// Grace period after the panel closes; negative never stops, zero stops
    /// immediately
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: f64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            default_frame_rate: default_frame_rate(),
            default_quality: default_quality(),
            keep_alive_seconds: default_keep_alive(),
        }
    }
}

impl StreamingConfig {
    pub fn keep_alive(&self) -> KeepAlive {
        KeepAlive::from_secs(self.keep_alive_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Bundle IDs or application names to leave out (supports wildcards)
    #[serde(default = "default_blocked_owners")]
    pub blocked_owners: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_owners: default_blocked_owners(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_refresh_interval() -> u64 {
    2000
}

fn default_capture_concurrency() -> usize {
    4
}

fn default_launch_grace() -> u64 {
    2000
}

fn default_title_overlap() -> f64 {
    0.9
}

fn default_geometry_tolerance() -> u32 {
    10
}

fn default_max_sessions() -> usize {
    24
}

fn default_frame_rate() -> u32 {
    30
}

fn default_quality() -> StreamQuality {
    StreamQuality::Medium
}

fn default_keep_alive() -> f64 {
    2.0
}

fn default_blocked_owners() -> Vec<String> {
    vec![
        // Menu bar and system chrome
        "com.apple.controlcenter".to_string(),
        "com.apple.notificationcenterui".to_string(),
        "com.apple.WindowManager".to_string(),
        "com.apple.dock".to_string(),
        // Screen savers and lock screen
        "com.apple.ScreenSaver*".to_string(),
        "com.apple.loginwindow".to_string(),
    ]
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file: {}, using defaults", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("window-roster")
            .join("config.toml")
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;

        std::fs::write(&path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}
