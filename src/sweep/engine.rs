//! Sweep state machine.
//!
//! ```text
//! Idle -> Validating -> RampingToStart -> Stepping -> RampingToZero -> Completed
//!             |               |              |                     \-> Aborted
//!             v               v              v                     \-> Failed
//!           Failed     RampingToZero   RampingToZero
//! ```
//!
//! A run executes on its own Tokio task, which is the only code touching the
//! in-flight samples and the only caller into the instrument controller while
//! stepping. The foreground observes it through:
//!
//! - a `watch` channel of immutable [`SweepSnapshot`]s,
//! - the engine's `broadcast` stream of [`SweepEvent`]s,
//! - the terminal [`SweepResult`] returned by [`SweepHandle::wait`].
//!
//! Abort is cooperative. The flag is checked before each point, so at most
//! one more measurement than requested can complete after
//! [`AbortHandle::abort`].

use super::params::SweepParameters;
use super::result::{RunMetadata, Sample, SweepResult, SweepStatus};
use crate::error::{AppResult, SweepError};
use crate::instrument::{InstrumentController, SweepClaim};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Capacity of the engine's event stream.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    /// Not started
    #[default]
    Idle,
    /// Checking parameters, no I/O yet
    Validating,
    /// Configuring and walking to the first level
    RampingToStart,
    /// Applying levels and reading current
    Stepping,
    /// Walking back to 0 V
    RampingToZero,
    /// Every point measured
    Completed,
    /// Stopped on request
    Aborted,
    /// Stopped by an error
    Failed,
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SweepPhase::Idle => "idle",
            SweepPhase::Validating => "validating",
            SweepPhase::RampingToStart => "ramping_to_start",
            SweepPhase::Stepping => "stepping",
            SweepPhase::RampingToZero => "ramping_to_zero",
            SweepPhase::Completed => "completed",
            SweepPhase::Aborted => "aborted",
            SweepPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

impl From<SweepStatus> for SweepPhase {
    fn from(status: SweepStatus) -> Self {
        match status {
            SweepStatus::Idle => SweepPhase::Idle,
            SweepStatus::Running => SweepPhase::Validating,
            SweepStatus::Aborted => SweepPhase::Aborted,
            SweepStatus::Completed => SweepPhase::Completed,
            SweepStatus::Failed => SweepPhase::Failed,
        }
    }
}

/// One completed point, as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Zero-based point index
    pub index: usize,
    /// Points in the whole sweep
    pub total: usize,
    /// Applied level (volts)
    pub voltage: f64,
    /// Measured current (amps)
    pub current: f64,
}

/// Notifications broadcast while a sweep runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SweepEvent {
    /// The state machine entered a new phase
    Phase(SweepPhase),
    /// A point was measured
    Sample(ProgressEvent),
    /// The run reached a terminal status
    Finished {
        /// Terminal status
        status: SweepStatus,
        /// Cause of a failed run
        error: Option<SweepError>,
    },
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SweepSnapshot {
    /// Current phase
    pub phase: SweepPhase,
    /// Current status
    pub status: SweepStatus,
    /// Samples taken so far
    pub completed_points: usize,
    /// 0 until the parameters have been validated
    pub total_points: usize,
    /// Most recent sample
    pub last_sample: Option<Sample>,
    /// Error that ended the run, if any
    pub error: Option<SweepError>,
}

/// Cooperative abort flag shared between the foreground and a run.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Handle with no abort requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop before its next point.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether an abort has been requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Drives sweeps on one instrument controller.
///
/// Cloning is cheap; clones share the controller and the event stream.
#[derive(Clone)]
pub struct SweepEngine {
    controller: Arc<InstrumentController>,
    events: broadcast::Sender<SweepEvent>,
}

impl SweepEngine {
    /// Engine driving `controller`.
    pub fn new(controller: Arc<InstrumentController>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { controller, events }
    }

    /// Controller this engine drives.
    pub fn controller(&self) -> &Arc<InstrumentController> {
        &self.controller
    }

    /// Subscribe to the events of every subsequent run.
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.events.subscribe()
    }

    /// True while a run owns the instrument.
    pub fn is_running(&self) -> bool {
        self.controller.sweep_active()
    }

    /// Launch a run on a background task.
    ///
    /// Parameter problems do not fail this call: they end the run in
    /// `Failed` with a validation error, before any instrument I/O.
    ///
    /// # Errors
    /// `SweepError::Busy` while another run is active on the same controller.
    pub fn start(&self, parameters: SweepParameters) -> AppResult<SweepHandle> {
        let claim = self.controller.try_claim_sweep()?;
        let abort = AbortHandle::new();
        let (snapshots, snapshot_rx) = watch::channel(SweepSnapshot {
            status: SweepStatus::Running,
            ..SweepSnapshot::default()
        });

        let worker = SweepWorker {
            claim,
            parameters,
            abort: abort.clone(),
            events: self.events.clone(),
            snapshots,
            samples: Vec::new(),
            phase: SweepPhase::Idle,
            total: 0,
        };
        let task = tokio::spawn(worker.run());

        Ok(SweepHandle {
            abort,
            snapshots: snapshot_rx,
            task,
        })
    }

    /// Run a sweep to completion.
    pub async fn run(&self, parameters: SweepParameters) -> AppResult<SweepResult> {
        self.start(parameters)?.wait().await
    }
}

/// Foreground handle to one run.
pub struct SweepHandle {
    abort: AbortHandle,
    snapshots: watch::Receiver<SweepSnapshot>,
    task: JoinHandle<SweepResult>,
}

impl SweepHandle {
    /// Shareable handle for requesting an abort from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Ask the run to stop before its next point.
    pub fn request_abort(&self) {
        info!("Sweep abort requested");
        self.abort.abort();
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SweepSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that observes every snapshot change.
    pub fn snapshots(&self) -> watch::Receiver<SweepSnapshot> {
        self.snapshots.clone()
    }

    /// Whether the worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal result.
    ///
    /// # Errors
    /// `SweepError::Instrument` if the worker task itself died.
    pub async fn wait(self) -> AppResult<SweepResult> {
        self.task.await.map_err(|e| {
            error!("Sweep worker terminated abnormally: {}", e);
            SweepError::Instrument(format!("sweep worker terminated abnormally: {}", e))
        })
    }
}

struct SweepWorker {
    claim: SweepClaim,
    parameters: SweepParameters,
    abort: AbortHandle,
    events: broadcast::Sender<SweepEvent>,
    snapshots: watch::Sender<SweepSnapshot>,
    samples: Vec<Sample>,
    phase: SweepPhase,
    total: usize,
}

impl SweepWorker {
    async fn run(mut self) -> SweepResult {
        let controller = Arc::clone(self.claim.controller());
        let metadata = RunMetadata::new(
            controller.identity(),
            controller.state(),
            controller.resource(),
        );

        self.enter(SweepPhase::Validating);
        if let Err(e) = self.parameters.validate() {
            warn!("Sweep rejected: {}", e);
            return self.finish(SweepStatus::Failed, Some(e), metadata);
        }
        self.total = self.parameters.point_count();
        info!(
            "Sweep {} V -> {} V, step {} V, {} points, compliance {:e} A",
            self.parameters.start_voltage,
            self.parameters.stop_voltage,
            self.parameters.step_voltage,
            self.total,
            self.parameters.current_compliance_amps
        );

        if let Err(e) = controller
            .configure_for_sweep(self.parameters.current_compliance_amps)
            .await
        {
            error!("Sweep setup failed: {}", e);
            self.enter(SweepPhase::RampingToZero);
            controller.safe_shutdown().await;
            return self.finish(SweepStatus::Failed, Some(e), metadata);
        }

        self.enter(SweepPhase::RampingToStart);
        if let Err(e) = controller.ramp_voltage(self.parameters.start_voltage).await {
            error!("Ramp to start failed: {}", e);
            self.enter(SweepPhase::RampingToZero);
            controller.safe_shutdown().await;
            return self.finish(SweepStatus::Failed, Some(e), metadata);
        }

        self.enter(SweepPhase::Stepping);
        let (status, error) = self.step(&controller).await;

        self.enter(SweepPhase::RampingToZero);
        if status == SweepStatus::Failed {
            controller.safe_shutdown().await;
        } else if let Err(e) = controller.ramp_voltage(0.0).await {
            error!("Ramp to 0 V after sweep failed: {}", e);
        }

        self.finish(status, error, metadata)
    }

    async fn step(&mut self, controller: &InstrumentController) -> (SweepStatus, Option<SweepError>) {
        let delay = self.parameters.delay();

        for (index, voltage) in self.parameters.voltages().into_iter().enumerate() {
            if self.abort.is_requested() {
                info!("Sweep aborted before point {} of {}", index + 1, self.total);
                return (SweepStatus::Aborted, None);
            }

            if let Err(e) = controller.set_voltage(voltage).await {
                error!("Setting {} V failed: {}", voltage, e);
                return (SweepStatus::Failed, Some(e));
            }
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let current = match controller.measure_current().await {
                Ok(current) => current,
                Err(e) => {
                    error!("Reading at {} V failed: {}", voltage, e);
                    return (SweepStatus::Failed, Some(e));
                }
            };

            let sample = Sample { voltage, current };
            self.samples.push(sample);
            debug!("Point {}/{}: {} V, {:e} A", index + 1, self.total, voltage, current);

            let _ = self.events.send(SweepEvent::Sample(ProgressEvent {
                index,
                total: self.total,
                voltage,
                current,
            }));
            self.publish(None);
        }

        (SweepStatus::Completed, None)
    }

    fn enter(&mut self, phase: SweepPhase) {
        debug!("Sweep phase {} -> {}", self.phase, phase);
        self.phase = phase;
        let _ = self.events.send(SweepEvent::Phase(phase));
        self.publish(None);
    }

    fn publish(&self, error: Option<SweepError>) {
        let status = match self.phase {
            SweepPhase::Completed => SweepStatus::Completed,
            SweepPhase::Aborted => SweepStatus::Aborted,
            SweepPhase::Failed => SweepStatus::Failed,
            SweepPhase::Idle => SweepStatus::Idle,
            _ => SweepStatus::Running,
        };
        self.snapshots.send_replace(SweepSnapshot {
            phase: self.phase,
            status,
            completed_points: self.samples.len(),
            total_points: self.total,
            last_sample: self.samples.last().copied(),
            error,
        });
    }

    fn finish(
        mut self,
        status: SweepStatus,
        error: Option<SweepError>,
        metadata: RunMetadata,
    ) -> SweepResult {
        self.phase = status.into();
        self.publish(error.clone());
        let _ = self.events.send(SweepEvent::Phase(self.phase));
        let _ = self.events.send(SweepEvent::Finished {
            status,
            error: error.clone(),
        });

        let result = SweepResult::new(
            self.parameters,
            std::mem::take(&mut self.samples),
            status,
            error,
            metadata,
        );
        info!("{}", result.summary());
        result
    }
}
