//! Core library for the memristor_daq application.
//!
//! Drives a source-measure unit through linear voltage sweeps to record the
//! I-V characteristic of a two-terminal device, without ever stepping the
//! output abruptly and always returning it to 0 V.
//!
//! - [`transport`]: command/response channels (VISA, serial, simulated, mock)
//! - [`instrument`]: SCPI semantics, bounded-step ramping, safe shutdown
//! - [`sweep`]: parameter validation, the run state machine, run records
//! - [`session`], [`discovery`], [`storage`]: collaborators used by the binary
//!
//! ```rust,ignore
//! use memristor_daq::{Session, Settings, SweepParameters};
//!
//! let result = Session::scoped(Settings::load()?, |session| async move {
//!     Ok(session.run_sweep(SweepParameters::default()).await?)
//! })
//! .await?;
//! println!("{}", result.summary());
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod instrument;
pub mod session;
pub mod storage;
pub mod sweep;
pub mod transport;

pub use config::Settings;
pub use error::{AppResult, SweepError};
pub use instrument::{ConnectionState, InstrumentController, RampProfile};
pub use session::Session;
pub use sweep::{
    AbortHandle, SweepEngine, SweepEvent, SweepParameters, SweepResult, SweepStatus,
};
pub use transport::{DeviceTransport, TransportBackend};
