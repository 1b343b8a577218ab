//! Configuration System using Figment
//!
//! Describes which endpoints to connect and how to configure their devices.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SDRREG_`, with `__` separating keys
//!
//! ```text
//! SDRREG_APPLICATION__LOG_LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "dual-band relay"
//! log_level = "info"
//!
//! [[endpoints]]
//! name = "rx"
//! serial = "1D3AC"
//! kind = "source"
//! chip_mode = "mimo"
//! sample_rate = 5e6
//!
//! [[endpoints.channels]]
//! channel = "A"
//! rf_freq = 433.92e6
//! gain = 40
//! ```

use crate::configure::{analog_filter_range, gain_range, OVERSAMPLING_RATIOS};
use crate::driver::Channel;
use crate::endpoint::Endpoint;
use crate::error::RegistryResult;
use crate::registry::{AttachReport, ChipMode, DeviceRegistry, EndpointKind};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or extracting the file and environment layers failed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is outside what the devices accept.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    /// Rendering the configuration back to TOML failed.
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Endpoints to connect
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
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

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// One source or sink endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint name, used in logs
    pub name: String,
    /// Device selector; empty picks the first discovered device
    #[serde(default)]
    pub serial: String,
    /// Source (RX) or sink (TX)
    pub kind: EndpointKind,
    /// Channel configuration
    #[serde(default = "default_chip_mode")]
    pub chip_mode: ChipMode,
    /// Replay/record file; when set, radio settings come from the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Sample rate in S/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    /// Oversampling ratio (0 = driver default)
    #[serde(default)]
    pub oversampling: u32,
    /// Turn off automatic DC correction after configuring
    #[serde(default)]
    pub disable_dc_corrections: bool,
    /// Per-channel settings
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Settings for one RF channel. Unset fields are left at the device default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel these settings apply to
    pub channel: Channel,
    /// LO frequency in Hz
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rf_freq: Option<f64>,
    /// Gain in dB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<u32>,
    /// Antenna port index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub antenna: Option<u32>,
    /// Analog filter bandwidth in Hz; 0 bypasses the filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analog_filter: Option<f64>,
    /// Digital filter bandwidth in Hz; 0 disables the filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digital_filter: Option<f64>,
    /// NCO frequency in Hz; 0 disables the NCO
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nco: Option<f64>,
    /// Calibration bandwidth in Hz; calibration runs after all other settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_bandwidth: Option<f64>,
}

fn default_name() -> String {
    "sdr-registry".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_chip_mode() -> ChipMode {
    ChipMode::ChannelA
}

impl AppConfig {
    /// Load configuration from a TOML file plus `SDRREG_` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be loaded or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("SDRREG_").split("__")),
        )
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Endpoint names are present and unique
    /// - No two endpoints of the same kind share a serial
    ///
    ///   This compares the selector strings as written. Selectors that differ
    ///   but resolve to the same device (`""` and the first serial, or a serial
    ///   and a longer one containing it) pass here and are caught at connect
    ///   time as `RegistryError::DoubleAttach`.
    /// - Each endpoint's values are within device limits
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let mut names = HashSet::new();
        let mut slots = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Endpoint name cannot be empty".to_string(),
                ));
            }
            if !names.insert(&endpoint.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate endpoint name: '{}'",
                    endpoint.name
                )));
            }
            if !slots.insert((&endpoint.serial, endpoint.kind)) {
                return Err(ConfigError::ValidationError(format!(
                    "Endpoint '{}': only one {} is allowed per device (serial '{}')",
                    endpoint.name, endpoint.kind, endpoint.serial
                )));
            }
            endpoint.validate()?;
        }

        Ok(())
    }

    /// Endpoints of one kind.
    pub fn endpoints_by_kind(&self, kind: EndpointKind) -> Vec<&EndpointConfig> {
        self.endpoints.iter().filter(|e| e.kind == kind).collect()
    }
}

impl EndpointConfig {
    fn invalid(&self, message: impl std::fmt::Display) -> ConfigError {
        ConfigError::ValidationError(format!("Endpoint '{}': {}", self.name, message))
    }

    /// Check values against device limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !OVERSAMPLING_RATIOS.contains(&self.oversampling) {
            return Err(self.invalid(format!(
                "oversampling {} must be one of {:?}",
                self.oversampling, OVERSAMPLING_RATIOS
            )));
        }
        if let Some(rate) = self.sample_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(self.invalid(format!("sample_rate {rate} must be positive")));
            }
        }

        let dir = self.kind.direction();
        let mut seen = HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.channel) {
                return Err(self.invalid(format!("channel {} configured twice", ch.channel)));
            }
            if !self.chip_mode.uses(ch.channel) {
                return Err(self.invalid(format!(
                    "channel {} is not active in {}",
                    ch.channel, self.chip_mode
                )));
            }
            if let Some(gain) = ch.gain {
                let range = gain_range(dir);
                if !range.contains(&gain) {
                    return Err(self.invalid(format!(
                        "{dir} gain {gain} dB must be within {}..={}",
                        range.start(),
                        range.end()
                    )));
                }
            }
            if let Some(bw) = ch.analog_filter.filter(|bw| *bw != 0.0) {
                let range = analog_filter_range(dir);
                if !range.contains(&bw) {
                    return Err(self.invalid(format!(
                        "{dir} analog filter {bw} Hz must be within {}..={}",
                        range.start(),
                        range.end()
                    )));
                }
            }
            if let Some(freq) = ch.rf_freq {
                if !(freq.is_finite() && freq > 0.0) {
                    return Err(self.invalid(format!("rf_freq {freq} must be positive")));
                }
            }
        }
        Ok(())
    }

    /// Open and attach this endpoint.
    pub fn connect(&self, registry: Arc<DeviceRegistry>) -> RegistryResult<(Endpoint, AttachReport)> {
        Endpoint::connect(
            registry,
            &self.serial,
            self.kind,
            self.chip_mode,
            self.file.clone(),
        )
    }

    /// Push these settings to the device through `endpoint`.
    ///
    /// File-backed endpoints only get their chip mode applied; their radio
    /// settings belong to the file.
    pub fn apply(&self, endpoint: &Endpoint) -> RegistryResult<()> {
        endpoint.apply_chip_mode()?;

        if endpoint.file().is_some() {
            debug!(endpoint = %self.name, "File-backed endpoint, skipping radio settings");
            return Ok(());
        }

        if let Some(rate) = self.sample_rate {
            let actual = endpoint.set_sample_rate(rate, self.oversampling)?;
            info!(endpoint = %self.name, requested = rate, actual, "Sample rate set");
        }

        for ch in &self.channels {
            if let Some(freq) = ch.rf_freq {
                let actual = endpoint.set_rf_freq(ch.channel, freq)?;
                info!(endpoint = %self.name, channel = %ch.channel, requested = freq, actual, "RF frequency set");
            }
            if let Some(gain) = ch.gain {
                let actual = endpoint.set_gain(ch.channel, gain)?;
                info!(endpoint = %self.name, channel = %ch.channel, requested = gain, actual, "Gain set");
            }
            if let Some(antenna) = ch.antenna {
                endpoint.set_antenna(ch.channel, antenna)?;
            }
            if let Some(bw) = ch.analog_filter {
                endpoint.set_analog_filter(ch.channel, bw != 0.0, bw)?;
            }
            if let Some(bw) = ch.digital_filter {
                endpoint.set_digital_filter(ch.channel, bw != 0.0, bw)?;
            }
            if let Some(freq) = ch.nco {
                endpoint.set_nco(ch.channel, freq)?;
            }
        }

        for ch in &self.channels {
            if let Some(bw) = ch.calibration_bandwidth {
                endpoint.calibrate(ch.channel, bw)?;
            }
        }

        if self.disable_dc_corrections {
            endpoint.disable_dc_corrections()?;
        }
        Ok(())
    }
}
