//! Custom error types for the measurement engine.
//!
//! `SweepError` is the single error type surfaced by the instrument controller
//! and the sweep engine. Every variant carries a plain `String` detail so that
//! a failure can be cloned into the terminal record of a run and reported to
//! the operator after the worker has finished.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: bad operator input. Raised before any instrument I/O.
//! - **`Connection`**: the transport could not be opened or did not answer the
//!   identity query. The controller is left in `ConnectionError`.
//! - **`Configuration`**: source/sense mode or compliance setup failed, so the
//!   sweep never started.
//! - **`Communication`**: a write or query failed or timed out.
//! - **`Measurement`**: a current reading failed or could not be parsed.
//! - **`Instrument`**: a ramp or other controller-level operation failed.
//! - **`Busy`**: a sweep was requested while another one is still running.
//! - **`NotConnected`**: an operation needs an open connection.
//!
//! Transports report failures with `anyhow` internally; the controller maps
//! them into the variant matching the operation that failed.

use serde::Serialize;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Failure categories surfaced by the controller and the sweep engine.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail")]
pub enum SweepError {
    /// Sweep parameters were rejected before any instrument I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// The transport could not open the resource
    #[error("Connection error: {0}")]
    Connection(String),

    /// Putting the instrument into sweep mode failed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A write or level query failed mid-run
    #[error("Communication error: {0}")]
    Communication(String),

    /// A current reading failed or could not be parsed
    #[error("Measurement error: {0}")]
    Measurement(String),

    /// Ramp, self-test or worker failure
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Another sweep holds the instrument
    #[error("A sweep is already running on this instrument")]
    Busy,

    /// No transport is attached
    #[error("Instrument not connected")]
    NotConnected,
}

impl SweepError {
    /// Short machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            SweepError::Validation(_) => "validation",
            SweepError::Connection(_) => "connection",
            SweepError::Configuration(_) => "configuration",
            SweepError::Communication(_) => "communication",
            SweepError::Measurement(_) => "measurement",
            SweepError::Instrument(_) => "instrument",
            SweepError::Busy => "busy",
            SweepError::NotConnected => "not_connected",
        }
    }

    /// True for errors raised before the instrument was touched.
    pub fn is_validation(&self) -> bool {
        matches!(self, SweepError::Validation(_))
    }
}

/// Flattens an `anyhow` chain into a single line, keeping every cause.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}
