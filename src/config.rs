//! Configuration System using Figment
//!
//! Strongly-typed configuration for an acquisition session. Configuration is loaded from:
//! 1. `config/imager.toml` (or an explicit path)
//! 2. Environment variables prefixed with `IMAGER_`, nested keys separated by `__`
//!    (e.g. `IMAGER_APPLICATION__LOG_LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use imager_agent::config::ImagerConfig;
//!
//! let config = ImagerConfig::load()?;
//! config.validate()?;
//! println!("Camera: {}", config.devices.camera);
//! # Ok::<(), imager_agent::error::ImagerError>(())
//! ```

use crate::error::{AppResult, ImagerError};
use crate::imager::group::validate_groups;
use crate::imager::naming::{validate_prefix, DEFAULT_PREFIX};
use crate::imager::{Group, DEFAULT_ABORT_TIMEOUT};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/imager.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Devices to drive
    pub devices: DeviceConfig,
    /// Where and how frames are stored
    #[serde(default)]
    pub storage: StorageConfig,
    /// Sequencer tuning
    #[serde(default)]
    pub sequencer: SequencerConfig,
    /// Simulated hardware settings used by `imager_agent run`
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Capture groups, in execution order
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Controlled device names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Camera device name
    pub camera: String,
    /// Filter wheel device name, if one is fitted
    #[serde(default)]
    pub filter_wheel: Option<String>,
}

/// Image storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for frames
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// File name prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

/// Sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Bounded wait for a device to acknowledge an abort
    #[serde(default = "default_abort_timeout", with = "humantime_serde")]
    pub abort_timeout: Duration,
}

/// Simulated hardware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Factor applied to exposure durations (1.0 = real time)
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
    /// Number of slots on the simulated filter wheel
    #[serde(default = "default_filter_slots")]
    pub filter_slots: u32,
    /// Time for the simulated wheel to advance one slot
    #[serde(default = "default_step_time", with = "humantime_serde")]
    pub step_time: Duration,
}

// Default value functions
fn default_name() -> String {
    "imager_agent".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("images")
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_abort_timeout() -> Duration {
    DEFAULT_ABORT_TIMEOUT
}

fn default_time_scale() -> f64 {
    1.0
}

fn default_filter_slots() -> u32 {
    5
}

fn default_step_time() -> Duration {
    Duration::from_millis(100)
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            prefix: default_prefix(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            abort_timeout: default_abort_timeout(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_scale: default_time_scale(),
            filter_slots: default_filter_slots(),
            step_time: default_step_time(),
        }
    }
}

impl ImagerConfig {
    /// Load configuration from `config/imager.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, with environment overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IMAGER_").split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        Ok(Figment::from(Toml::string(toml)).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ImagerError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.devices.camera.trim().is_empty() {
            return Err(ImagerError::Configuration(
                "devices.camera cannot be empty".into(),
            ));
        }

        validate_prefix(&self.storage.prefix)?;
        validate_groups(&self.groups)?;

        if self.groups.iter().any(Group::requires_filter) && self.devices.filter_wheel.is_none()
        {
            return Err(ImagerError::Configuration(
                "groups select filters but devices.filter_wheel is not set".into(),
            ));
        }

        if self.sequencer.abort_timeout.is_zero() {
            return Err(ImagerError::Configuration(
                "sequencer.abort_timeout must be positive".into(),
            ));
        }

        if !(self.simulation.time_scale.is_finite() && self.simulation.time_scale >= 0.0) {
            return Err(ImagerError::Configuration(format!(
                "simulation.time_scale must be a non-negative number, got {}",
                self.simulation.time_scale
            )));
        }
        if let Some(slot) = self
            .groups
            .iter()
            .filter_map(|g| g.filter_slot)
            .find(|&s| s == 0 || s > self.simulation.filter_slots)
        {
            return Err(ImagerError::Configuration(format!(
                "filter slot {} outside 1..={}",
                slot, self.simulation.filter_slots
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imager::Binning;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [application]
        name = "observatory"
        log_level = "debug"

        [devices]
        camera = "CCD Simulator"
        filter_wheel = "Filter Simulator"

        [storage]
        output_dir = "/tmp/lights"
        prefix = "M42"

        [sequencer]
        abort_timeout = "2s"

        [[groups]]
        image_count = 3
        filter_slot = 1
        exposure = "30s"

        [[groups]]
        image_count = 2
        filter_slot = 2
        exposure = "1m"
        binning = { x = 2, y = 2 }
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ImagerConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.application.name, "observatory");
        assert_eq!(config.devices.filter_wheel.as_deref(), Some("Filter Simulator"));
        assert_eq!(config.storage.prefix, "M42");
        assert_eq!(config.sequencer.abort_timeout, Duration::from_secs(2));
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups[1].exposure, Duration::from_secs(60));
        assert_eq!(config.groups[1].binning, Binning::new(2, 2));
    }

    #[test]
    fn test_defaults_applied() {
        let config = ImagerConfig::from_toml_str(
            r#"
            [devices]
            camera = "CCD Simulator"

            [[groups]]
            image_count = 1
            exposure = "1s"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.storage.prefix, "IMAGE");
        assert_eq!(config.sequencer.abort_timeout, DEFAULT_ABORT_TIMEOUT);
        assert_eq!(config.simulation.filter_slots, 5);
    }

    #[test]
    fn test_filter_without_wheel_rejected() {
        let config = ImagerConfig::from_toml_str(
            r#"
            [devices]
            camera = "CCD Simulator"

            [[groups]]
            image_count = 1
            filter_slot = 2
            exposure = "1s"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("filter_wheel"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ImagerConfig::from_toml_str(SAMPLE).unwrap();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = ImagerConfig::from_toml_str(SAMPLE).unwrap();
        config.groups[0].image_count = 0;
        assert!(config.validate().unwrap_err().to_string().contains("group 1"));

        let mut config = ImagerConfig::from_toml_str(SAMPLE).unwrap();
        config.groups[1].filter_slot = Some(9);
        assert!(config.validate().is_err());

        let mut config = ImagerConfig::from_toml_str(SAMPLE).unwrap();
        config.groups.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ImagerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.devices.camera, "CCD Simulator");
    }

    #[test]
    fn test_missing_devices_is_load_error() {
        let err = ImagerConfig::from_toml_str("[application]\nname = \"x\"").unwrap_err();
        assert!(matches!(err, ImagerError::ConfigLoad(_)));
    }
}
