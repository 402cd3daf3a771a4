//! Configuration loading using Figment.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `MEMRISTOR_` (nested keys split on `__`)
//! 2. TOML configuration file (default: `config/memristor.toml`)
//! 3. Built-in defaults
//!
//! Every section is optional; `Settings::default()` is a valid configuration
//! that drives the simulated instrument.
//!
//! ```toml
//! [application]
//! log_level = "debug"
//!
//! [instrument]
//! resource = "GPIB0::24::INSTR"
//! simulate = false
//! backend = "visa"
//! timeout_ms = 10000
//!
//! [ramp]
//! step_volts = 0.1
//! inter_step_delay_ms = 20
//!
//! [sweep]
//! start_voltage = -1.0
//! stop_voltage = 1.0
//! step_voltage = 0.05
//! delay_seconds = 0.1
//! current_compliance_amps = 0.001
//! ```
//!
//! ```text
//! MEMRISTOR_INSTRUMENT__SIMULATE=false
//! MEMRISTOR_INSTRUMENT__RESOURCE="GPIB0::26::INSTR"
//! MEMRISTOR_APPLICATION__LOG_LEVEL=debug
//! ```

use crate::instrument::RampProfile;
use crate::sweep::SweepParameters;
use crate::transport::TransportBackend;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/memristor.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File or environment could not be read or parsed
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values were read but are unusable
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application identity and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Which instrument to talk to and how
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Bounded-step ramp used for every non-sweep level change
    #[serde(default)]
    pub ramp: RampConfig,
    /// Sweep used when the operator does not override a parameter
    #[serde(default)]
    pub sweep: SweepParameters,
    /// Sweep record output
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name used in logs
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Instrument connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Backend-specific address (VISA resource string or serial port path)
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Drive the simulated source-measure unit instead of hardware
    #[serde(default = "default_simulate")]
    pub simulate: bool,
    /// Hardware transport used when not simulating
    #[serde(default)]
    pub backend: TransportBackend,
    /// I/O timeout for hardware transports in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Serial backend only
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Artificial settling delay of the simulated instrument per reading
    #[serde(default = "default_settling_ms")]
    pub settling_ms: u64,
}

/// Bounded-step ramp settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    /// Largest level change per write (volts)
    #[serde(default = "default_ramp_step")]
    pub step_volts: f64,
    /// Pause between ramp writes in milliseconds
    #[serde(default = "default_ramp_delay_ms")]
    pub inter_step_delay_ms: u64,
}

/// Where sweep records are written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for CSV records
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "memristor_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_resource() -> String {
    "GPIB0::24::INSTR".to_string()
}

fn default_simulate() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_settling_ms() -> u64 {
    50
}

fn default_ramp_step() -> f64 {
    0.1
}

fn default_ramp_delay_ms() -> u64 {
    20
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            resource: default_resource(),
            simulate: default_simulate(),
            backend: TransportBackend::default(),
            timeout_ms: default_timeout_ms(),
            baud_rate: default_baud_rate(),
            settling_ms: default_settling_ms(),
        }
    }
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            step_volts: default_ramp_step(),
            inter_step_delay_ms: default_ramp_delay_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl InstrumentConfig {
    /// Hardware I/O timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Simulated settling delay per reading
    pub fn settling(&self) -> Duration {
        Duration::from_millis(self.settling_ms)
    }
}

impl RampConfig {
    /// Ramp profile handed to the instrument controller.
    pub fn profile(&self) -> RampProfile {
        RampProfile {
            step_size: self.step_volts,
            inter_step_delay: Duration::from_millis(self.inter_step_delay_ms),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/memristor.toml` and environment variables.
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MEMRISTOR_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string, without consulting the environment.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(source))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - A hardware resource is named when simulation is off
    /// - Timeouts and ramp step are positive
    /// - The default sweep itself passes sweep validation
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !self.instrument.simulate && self.instrument.resource.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "instrument 'resource' cannot be empty when simulate = false".to_string(),
            ));
        }

        if self.instrument.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "instrument 'timeout_ms' must be > 0".to_string(),
            ));
        }

        if !(self.ramp.step_volts.is_finite() && self.ramp.step_volts > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "ramp 'step_volts' must be a positive number, got {}",
                self.ramp.step_volts
            )));
        }

        self.sweep
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("[sweep] {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.instrument.simulate);
        assert_eq!(settings.instrument.timeout(), Duration::from_secs(10));
        assert_eq!(settings.ramp.profile(), RampProfile::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [instrument]
            simulate = false
            resource = "GPIB0::26::INSTR"
            backend = "serial"
            "#,
        )
        .unwrap();

        assert!(!settings.instrument.simulate);
        assert_eq!(settings.instrument.resource, "GPIB0::26::INSTR");
        assert_eq!(settings.instrument.backend, TransportBackend::Serial);
        assert_eq!(settings.instrument.baud_rate, 9600);
        assert_eq!(settings.application.log_level, "info");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let err = Settings::from_toml_str("[application]\nlog_level = \"loud\"").unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_ramp_step_rejected() {
        let err = Settings::from_toml_str("[ramp]\nstep_volts = 0.0").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_invalid_default_sweep_rejected() {
        let err = Settings::from_toml_str(
            r#"
            [sweep]
            start_voltage = 0.0
            stop_voltage = 1.0
            step_voltage = 0.1
            delay_seconds = 0.0
            current_compliance_amps = 0.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("[sweep]"));
    }

    #[test]
    fn test_empty_resource_rejected_for_hardware() {
        let err = Settings::from_toml_str("[instrument]\nsimulate = false\nresource = \"\"").unwrap_err();
        assert!(err.to_string().contains("resource"));
    }
}
