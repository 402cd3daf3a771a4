//! Voltage sweeps: parameters, the run state machine, and the run record.

pub mod engine;
pub mod params;
pub mod result;

pub use engine::{
    AbortHandle, ProgressEvent, SweepEngine, SweepEvent, SweepHandle, SweepPhase, SweepSnapshot,
};
pub use params::{RawSweepInput, SweepParameters, MAX_SWEEP_POINTS};
pub use result::{RunMetadata, Sample, SweepResult, SweepStatus};
