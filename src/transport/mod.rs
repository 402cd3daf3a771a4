//! Device transports.
//!
//! A transport opens a connection to a named resource and exchanges textual
//! SCPI command/query pairs with it. The instrument controller is written
//! against [`DeviceTransport`] only and never branches on which variant it
//! holds:
//!
//! - [`SimulatedTransport`]: fabricates plausible source-measure responses.
//! - [`VisaTransport`]: GPIB/USB/LAN instruments through the system VISA
//!   library (feature `instrument_visa`).
//! - [`SerialTransport`]: RS-232 instruments (feature `instrument_serial`).
//! - [`MockTransport`]: scripted test double with a call log and failure
//!   injection.

pub mod mock;
pub mod serial;
pub mod simulated;
pub mod visa;

pub use mock::{MockCall, MockTransport};
pub use serial::SerialTransport;
pub use simulated::SimulatedTransport;
pub use visa::VisaTransport;

use crate::config::InstrumentConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection timeout applied by the hardware transports.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Line terminator appended to every command sent to hardware.
pub const WRITE_TERMINATOR: &str = "\n";

/// Character ending every response read from hardware.
pub const READ_TERMINATOR: char = '\n';

/// Whether a transport talks to a physical instrument or a model of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Talks to a physical instrument
    Hardware,
    /// In-process stand-in
    Simulated,
}

/// Hardware transport backends selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransportBackend {
    /// VISA resource manager (GPIB, USB-TMC, LXI)
    #[default]
    Visa,
    /// Direct RS-232 port
    Serial,
}

impl fmt::Display for TransportBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportBackend::Visa => write!(f, "visa"),
            TransportBackend::Serial => write!(f, "serial"),
        }
    }
}

/// Textual command/response channel to a single instrument.
///
/// ## Contract
/// - `connect` returns the instrument identity (`*IDN?` response) and fails
///   when the resource cannot be opened or does not respond.
/// - `write` sends a command without reading a response.
/// - `query` sends a command and returns the trimmed response; a timeout is an
///   error.
/// - `close` is idempotent.
///
/// Implementations are driven by a single caller at a time; the instrument
/// controller serializes access behind a mutex.
#[async_trait]
pub trait DeviceTransport: Send {
    /// Open `resource` and return its identity string.
    async fn connect(&mut self, resource: &str) -> Result<String>;

    /// Send a command that produces no response.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read its response.
    async fn query(&mut self, command: &str) -> Result<String>;

    /// Release the resource.
    async fn close(&mut self) -> Result<()>;

    /// Hardware or simulated.
    fn kind(&self) -> TransportKind;

    /// Human-readable description for logs.
    fn info(&self) -> String;
}

/// Build the transport selected by the instrument configuration.
///
/// The returned transport is not yet connected.
///
/// # Errors
/// Fails when the configured backend was not compiled in.
pub fn from_config(config: &InstrumentConfig) -> Result<Box<dyn DeviceTransport>> {
    if config.simulate {
        return Ok(Box::new(
            SimulatedTransport::new().with_settling(config.settling()),
        ));
    }

    match config.backend {
        TransportBackend::Visa => Ok(Box::new(VisaTransport::new(config.timeout())?)),
        TransportBackend::Serial => Ok(Box::new(SerialTransport::new(
            config.baud_rate,
            config.timeout(),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_config_builds_simulated_transport() {
        let config = InstrumentConfig::default();
        let transport = from_config(&config).unwrap();
        assert_eq!(transport.kind(), TransportKind::Simulated);
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(TransportBackend::Visa.to_string(), "visa");
        assert_eq!(TransportBackend::Serial.to_string(), "serial");
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[test]
    fn test_visa_backend_requires_feature() {
        let config = InstrumentConfig {
            simulate: false,
            ..InstrumentConfig::default()
        };
        let err = from_config(&config).err().unwrap();
        assert!(err.to_string().contains("instrument_visa"));
    }
}
