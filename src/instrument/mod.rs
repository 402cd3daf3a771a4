//! Source-measure instrument controller.
//!
//! [`InstrumentController`] translates abstract operations (configure, set a
//! level, read current, ramp, shut down) into SCPI exchanges over a
//! [`DeviceTransport`] and enforces the hardware-safety policy:
//!
//! - Arbitrary level changes go through [`InstrumentController::ramp_voltage`],
//!   which never moves the output by more than the ramp step in one write.
//! - [`InstrumentController::set_voltage`] is unramped and reserved for the
//!   pre-validated points of a sweep.
//! - [`InstrumentController::safe_shutdown`] ramps to 0 V and disables the
//!   output, and never fails.
//!
//! The transport lives behind an async mutex; compound operations such as a
//! ramp hold it for their whole duration, so no other caller can interleave a
//! write with a ramp in progress.

pub mod scpi;

use crate::error::{describe, AppResult, SweepError};
use crate::transport::{DeviceTransport, TransportKind};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Connection state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport attached
    #[default]
    Disconnected,
    /// Attached to the simulated instrument
    Simulated,
    /// Attached to hardware
    Connected,
    /// The last connection attempt failed
    ConnectionError,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Simulated => "simulated",
            ConnectionState::Connected => "connected",
            ConnectionState::ConnectionError => "connection_error",
        };
        f.write_str(label)
    }
}

/// Bounded-step ramp settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampProfile {
    /// Largest level change allowed in a single write (volts)
    pub step_size: f64,
    /// Pause between consecutive ramp writes
    pub inter_step_delay: Duration,
}

impl Default for RampProfile {
    fn default() -> Self {
        Self {
            step_size: 0.1,
            inter_step_delay: Duration::from_millis(20),
        }
    }
}

/// Largest output level a 2400-class source can program, in volts.
pub const MAX_SOURCE_VOLTS: f64 = 210.0;

/// Whether `volts` is a level the source can actually program.
///
/// Also screens level readbacks: overflow markers such as `+9.91E37` fall
/// outside this range.
pub fn within_source_range(volts: f64) -> bool {
    volts.is_finite() && volts.abs() <= MAX_SOURCE_VOLTS
}

/// Levels to write when walking from `from` to `to` in steps no larger than
/// `step`. The last level is always exactly `to`.
///
/// Levels are produced lazily, so the walk never allocates.
pub fn ramp_points(from: f64, to: f64, step: f64) -> impl Iterator<Item = f64> {
    let distance = to - from;
    let moves = (distance.abs() / step).ceil() as usize;
    let direction = distance.signum();
    (1..moves)
        .map(move |i| from + direction * step * i as f64)
        .chain(std::iter::once(to))
}

/// Identity and state readable without touching the transport.
#[derive(Debug, Clone, Default)]
struct ControllerStatus {
    state: ConnectionState,
    identity: Option<String>,
    resource: Option<String>,
}

/// Everything guarded by the transport lock.
#[derive(Default)]
struct Link {
    transport: Option<Box<dyn DeviceTransport>>,
    /// Last level written, if any
    last_voltage: Option<f64>,
    output_enabled: bool,
}

/// Owns the transport of one source-measure unit and applies the ramp
/// and shutdown policy to everything written to it.
pub struct InstrumentController {
    link: Mutex<Link>,
    status: RwLock<ControllerStatus>,
    ramp: RampProfile,
    sweep_active: AtomicBool,
}

impl Default for InstrumentController {
    fn default() -> Self {
        Self::new(RampProfile::default())
    }
}

impl InstrumentController {
    /// Disconnected controller that ramps with `ramp`.
    pub fn new(ramp: RampProfile) -> Self {
        Self {
            link: Mutex::new(Link::default()),
            status: RwLock::new(ControllerStatus::default()),
            ramp,
            sweep_active: AtomicBool::new(false),
        }
    }

    /// Ramp settings used by [`Self::ramp_voltage`].
    pub fn ramp_profile(&self) -> RampProfile {
        self.ramp
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.read_status().state
    }

    /// `*IDN?` response captured at connect time
    pub fn identity(&self) -> Option<String> {
        self.read_status().identity
    }

    /// Resource address of the current or last connection.
    pub fn resource(&self) -> Option<String> {
        self.read_status().resource
    }

    /// Whether a transport is attached, simulated or not.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Simulated
        )
    }

    fn read_status(&self) -> ControllerStatus {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_status(&self, status: ControllerStatus) {
        *self
            .status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    /// Open `transport` on `resource` and take ownership of it.
    ///
    /// An existing connection is shut down safely and closed first.
    ///
    /// # Errors
    /// `SweepError::Connection` when the transport cannot open the resource;
    /// the controller is then left in `ConnectionState::ConnectionError`.
    pub async fn connect(
        &self,
        mut transport: Box<dyn DeviceTransport>,
        resource: &str,
    ) -> AppResult<String> {
        let mut link = self.link.lock().await;
        if link.transport.is_some() {
            info!("Replacing existing instrument connection");
            Self::release(&mut link, &self.ramp).await;
        }

        info!("Connecting to {} via {}", resource, transport.info());
        match transport.connect(resource).await {
            Ok(identity) => {
                let state = match transport.kind() {
                    TransportKind::Simulated => ConnectionState::Simulated,
                    TransportKind::Hardware => ConnectionState::Connected,
                };
                *link = Link {
                    transport: Some(transport),
                    last_voltage: None,
                    output_enabled: false,
                };
                self.set_status(ControllerStatus {
                    state,
                    identity: Some(identity.clone()),
                    resource: Some(resource.to_string()),
                });
                info!("Instrument {} ({}): {}", resource, state, identity);
                Ok(identity)
            }
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!("Close after failed connect also failed: {}", close_err);
                }
                self.set_status(ControllerStatus {
                    state: ConnectionState::ConnectionError,
                    identity: None,
                    resource: Some(resource.to_string()),
                });
                error!("Failed to connect to {}: {:#}", resource, e);
                Err(SweepError::Connection(format!(
                    "Failed to connect to instrument '{}': {}",
                    resource,
                    describe(&e)
                )))
            }
        }
    }

    /// Ramp to 0 V, disable the output and release the transport.
    ///
    /// Never fails; cleanup problems are logged.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        Self::release(&mut link, &self.ramp).await;
        let resource = self.resource();
        self.set_status(ControllerStatus {
            state: ConnectionState::Disconnected,
            identity: None,
            resource,
        });
    }

    async fn release(link: &mut Link, ramp: &RampProfile) {
        if link.transport.is_none() {
            return;
        }
        Self::shutdown_locked(link, ramp).await;
        if let Some(mut transport) = link.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Error while closing transport: {:#}", e);
            }
            info!("Instrument connection released");
        }
        link.last_voltage = None;
    }

    /// Voltage source, current sense, compliance limit, output on.
    ///
    /// Compliance is programmed before the output is enabled.
    ///
    /// # Errors
    /// `SweepError::Configuration` when not connected or any setup write fails.
    pub async fn configure_for_sweep(&self, compliance_amps: f64) -> AppResult<()> {
        if !(compliance_amps.is_finite() && compliance_amps > 0.0) {
            return Err(SweepError::Configuration(format!(
                "compliance must be a positive current, got {}",
                compliance_amps
            )));
        }

        let mut link = self.link.lock().await;
        let transport = link.transport.as_mut().ok_or_else(|| {
            SweepError::Configuration("instrument not connected".to_string())
        })?;

        let compliance = scpi::set_compliance(compliance_amps);
        let sequence = [
            scpi::SOURCE_VOLTAGE_MODE,
            scpi::SENSE_CURRENT_MODE,
            scpi::FORMAT_CURRENT_ONLY,
            compliance.as_str(),
            scpi::OUTPUT_ON,
        ];
        for command in sequence {
            transport.write(command).await.map_err(|e| {
                SweepError::Configuration(format!("'{}' failed: {}", command, describe(&e)))
            })?;
        }
        link.output_enabled = true;

        info!(
            "Configured for voltage sweep (compliance {:e} A, output on)",
            compliance_amps
        );
        Ok(())
    }

    /// Apply `volts` immediately, without ramping.
    ///
    /// Only for sweep points, whose spacing is bounded by validated operator
    /// input. Everything else must use [`Self::ramp_voltage`].
    pub async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        if !within_source_range(volts) {
            return Err(SweepError::Instrument(format!(
                "level {} V is outside the source range of +/-{} V",
                volts, MAX_SOURCE_VOLTS
            )));
        }
        let mut link = self.link.lock().await;
        let transport = link.transport.as_mut().ok_or(SweepError::NotConnected)?;
        transport
            .write(&scpi::set_voltage(volts))
            .await
            .map_err(|e| SweepError::Communication(describe(&e)))?;
        link.last_voltage = Some(volts);
        Ok(())
    }

    /// Take a single current reading in amps.
    pub async fn measure_current(&self) -> AppResult<f64> {
        let mut link = self.link.lock().await;
        let transport = link.transport.as_mut().ok_or(SweepError::NotConnected)?;
        let response = transport
            .query(scpi::MEASURE_CURRENT)
            .await
            .map_err(|e| SweepError::Measurement(describe(&e)))?;
        scpi::parse_reading(&response).ok_or_else(|| {
            SweepError::Measurement(format!("unparsable current reading '{}'", response))
        })
    }

    /// Query the programmed output level.
    pub async fn read_voltage(&self) -> AppResult<f64> {
        let mut link = self.link.lock().await;
        let transport = link.transport.as_mut().ok_or(SweepError::NotConnected)?;
        let response = transport
            .query(scpi::VOLTAGE_LEVEL_QUERY)
            .await
            .map_err(|e| SweepError::Communication(describe(&e)))?;
        scpi::parse_reading(&response).ok_or_else(|| {
            SweepError::Communication(format!("unparsable level reading '{}'", response))
        })
    }

    /// Last level this controller wrote to the instrument, if any.
    pub async fn last_commanded_voltage(&self) -> Option<f64> {
        self.link.lock().await.last_voltage
    }

    /// Whether this controller last left the output on.
    pub async fn output_enabled(&self) -> bool {
        self.link.lock().await.output_enabled
    }

    /// Walk the output to `target` using the controller's ramp profile.
    pub async fn ramp_voltage(&self, target: f64) -> AppResult<()> {
        self.ramp_voltage_with(target, self.ramp).await
    }

    /// Walk the output to `target` in steps no larger than `profile.step_size`,
    /// pausing `profile.inter_step_delay` between writes and finishing with an
    /// exact write of `target`.
    ///
    /// The starting level is read back from the instrument; when that fails
    /// the last commanded level is assumed, or 0 V if nothing was written yet.
    pub async fn ramp_voltage_with(&self, target: f64, profile: RampProfile) -> AppResult<()> {
        if !within_source_range(target) {
            return Err(SweepError::Instrument(format!(
                "ramp target must be a finite level within +/-{} V, got {}",
                MAX_SOURCE_VOLTS, target
            )));
        }
        if !(profile.step_size.is_finite() && profile.step_size > 0.0) {
            return Err(SweepError::Instrument(format!(
                "ramp step must be positive, got {}",
                profile.step_size
            )));
        }

        let mut link = self.link.lock().await;
        Self::ramp_locked(&mut link, target, &profile)
            .await
            .map_err(|e| SweepError::Instrument(format!("ramp to {} V failed: {}", target, describe(&e))))
    }

    async fn ramp_locked(link: &mut Link, target: f64, profile: &RampProfile) -> anyhow::Result<()> {
        let transport = link
            .transport
            .as_mut()
            .ok_or_else(|| anyhow!("instrument not connected"))?;

        let readback = match transport.query(scpi::VOLTAGE_LEVEL_QUERY).await {
            Ok(response) => scpi::parse_reading(&response).filter(|level| {
                let usable = within_source_range(*level);
                if !usable {
                    debug!("Level readback {} out of range", level);
                }
                usable
            }),
            Err(e) => {
                debug!("Level readback failed: {:#}", e);
                None
            }
        };
        let present = match readback {
            Some(level) => level,
            None => {
                let assumed = link.last_voltage.unwrap_or(0.0);
                warn!("Output level unreadable, assuming {} V", assumed);
                assumed
            }
        };

        debug!(
            "Ramping {} V -> {} V in steps of {} V",
            present, target, profile.step_size
        );

        for (i, level) in ramp_points(present, target, profile.step_size).enumerate() {
            if i > 0 && !profile.inter_step_delay.is_zero() {
                sleep(profile.inter_step_delay).await;
            }
            transport.write(&scpi::set_voltage(level)).await?;
            link.last_voltage = Some(level);
        }
        Ok(())
    }

    /// Run the built-in diagnostic (`*TST?`) and describe the outcome.
    pub async fn self_test(&self) -> AppResult<String> {
        let mut link = self.link.lock().await;
        let transport = link.transport.as_mut().ok_or(SweepError::NotConnected)?;
        let response = transport
            .query(scpi::SELF_TEST)
            .await
            .map_err(|e| SweepError::Instrument(format!("self-test failed: {}", describe(&e))))?;

        let report = match response.trim().parse::<i32>() {
            Ok(0) => "Self-test passed (code 0)".to_string(),
            Ok(code) => format!("Self-test reported failure code {}", code),
            Err(_) => format!("Self-test returned unexpected response '{}'", response.trim()),
        };
        info!("{}", report);
        Ok(report)
    }

    /// Ramp to 0 V, then disable the output.
    ///
    /// Last-resort cleanup used from error paths and teardown: it never fails
    /// and is a no-op when disconnected. Every internal failure is logged.
    pub async fn safe_shutdown(&self) {
        let mut link = self.link.lock().await;
        Self::shutdown_locked(&mut link, &self.ramp).await;
    }

    async fn shutdown_locked(link: &mut Link, ramp: &RampProfile) {
        if link.transport.is_none() {
            debug!("Safe shutdown skipped: not connected");
            return;
        }

        if let Err(e) = Self::ramp_locked(link, 0.0, ramp).await {
            error!("Safe shutdown: ramp to 0 V failed: {:#}", e);
        }

        if let Some(transport) = link.transport.as_mut() {
            match transport.write(scpi::OUTPUT_OFF).await {
                Ok(()) => link.output_enabled = false,
                Err(e) => error!("Safe shutdown: disabling output failed: {:#}", e),
            }
        }
        info!("Safe shutdown complete");
    }

    /// Reserve this instrument for one sweep.
    ///
    /// # Errors
    /// `SweepError::Busy` while another claim is alive.
    pub fn try_claim_sweep(self: &Arc<Self>) -> AppResult<SweepClaim> {
        self.sweep_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SweepError::Busy)?;
        Ok(SweepClaim {
            controller: Arc::clone(self),
        })
    }

    /// Whether a [`SweepClaim`] is alive.
    pub fn sweep_active(&self) -> bool {
        self.sweep_active.load(Ordering::Acquire)
    }
}

/// Exclusive right to run a sweep on a controller, released on drop.
pub struct SweepClaim {
    controller: Arc<InstrumentController>,
}

impl SweepClaim {
    /// Controller this claim reserves.
    pub fn controller(&self) -> &Arc<InstrumentController> {
        &self.controller
    }
}

impl Drop for SweepClaim {
    fn drop(&mut self) {
        self.controller.sweep_active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockCall, MockTransport, SimulatedTransport};
    use tracing_test::traced_test;

    const FAST: RampProfile = RampProfile {
        step_size: 0.1,
        inter_step_delay: Duration::ZERO,
    };

    async fn connected(mock: &MockTransport) -> Arc<InstrumentController> {
        let controller = Arc::new(InstrumentController::new(FAST));
        controller
            .connect(Box::new(mock.clone()), "GPIB0::24::INSTR")
            .await
            .unwrap();
        controller
    }

    #[test]
    fn test_ramp_points_end_exactly_on_target() {
        let points: Vec<f64> = ramp_points(0.0, 1.0, 0.1).collect();
        assert_eq!(points.len(), 10);
        assert_eq!(*points.last().unwrap(), 1.0);

        assert_eq!(ramp_points(0.5, 0.5, 0.1).collect::<Vec<_>>(), vec![0.5]);
        assert_eq!(ramp_points(0.0, 0.05, 0.1).collect::<Vec<_>>(), vec![0.05]);
    }

    #[test]
    fn test_ramp_points_descending() {
        let points: Vec<f64> = ramp_points(0.25, -0.25, 0.1).collect();
        assert_eq!(points.len(), 5);
        let mut previous = 0.25;
        for p in points {
            assert!(p < previous);
            assert!(previous - p <= 0.1 + 1e-9);
            previous = p;
        }
        assert_eq!(previous, -0.25);
    }

    #[tokio::test]
    async fn test_connect_records_identity_and_state() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(
            controller.identity().as_deref(),
            Some(crate::transport::mock::MOCK_IDENTITY)
        );
        assert_eq!(controller.resource().as_deref(), Some("GPIB0::24::INSTR"));
    }

    #[tokio::test]
    async fn test_connect_failure_sets_connection_error() {
        let mock = MockTransport::new();
        mock.fail_connect();
        let controller = InstrumentController::default();
        let err = controller
            .connect(Box::new(mock.clone()), "GPIB0::99::INSTR")
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Connection(_)));
        assert_eq!(controller.state(), ConnectionState::ConnectionError);
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_simulated_transport_sets_simulated_state() {
        let controller = InstrumentController::default();
        controller
            .connect(
                Box::new(SimulatedTransport::new().with_settling(Duration::ZERO)),
                "SIM::2400::INSTR",
            )
            .await
            .unwrap();
        assert_eq!(controller.state(), ConnectionState::Simulated);
    }

    #[tokio::test]
    async fn test_configure_requires_connection() {
        let controller = InstrumentController::default();
        let err = controller.configure_for_sweep(0.001).await.unwrap_err();
        assert!(matches!(err, SweepError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_configure_sets_compliance_before_output() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        controller.configure_for_sweep(0.001).await.unwrap();

        let writes: Vec<String> = mock
            .call_log()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Write(c) => Some(c),
                _ => None,
            })
            .collect();
        let compliance_at = writes.iter().position(|c| c.starts_with(":SENS:CURR:PROT")).unwrap();
        let output_at = writes.iter().position(|c| c == scpi::OUTPUT_ON).unwrap();
        assert!(compliance_at < output_at);
        assert_eq!(writes[0], scpi::SOURCE_VOLTAGE_MODE);
        assert!(mock.output_enabled());
        assert!(controller.output_enabled().await);
    }

    #[tokio::test]
    async fn test_configure_write_failure_is_configuration_error() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        mock.fail_writes_after(2);
        let err = controller.configure_for_sweep(0.001).await.unwrap_err();
        assert!(matches!(err, SweepError::Configuration(_)));
        assert!(!mock.output_enabled());
    }

    #[tokio::test]
    async fn test_measure_failure_is_measurement_error() {
        let mock = MockTransport::new();
        mock.fail_reading(1);
        let controller = connected(&mock).await;
        let err = controller.measure_current().await.unwrap_err();
        assert!(matches!(err, SweepError::Measurement(_)));
    }

    #[tokio::test]
    async fn test_ramp_walks_in_bounded_steps() {
        let mock = MockTransport::new().with_initial_level(2.3);
        let controller = connected(&mock).await;
        controller.ramp_voltage(-1.75).await.unwrap();

        let mut previous = 2.3;
        for level in mock.level_history() {
            assert!((level - previous).abs() <= 0.1 + 1e-9);
            previous = level;
        }
        assert_eq!(mock.level(), -1.75);
        assert_eq!(controller.last_commanded_voltage().await, Some(-1.75));
    }

    #[tokio::test]
    async fn test_ramp_assumes_zero_when_level_unreadable() {
        let mock = MockTransport::new();
        mock.fail_level_queries();
        let controller = connected(&mock).await;
        controller.ramp_voltage(0.3).await.unwrap();
        assert_eq!(mock.level_history().len(), 3);
        assert_eq!(mock.level(), 0.3);
    }

    #[tokio::test]
    async fn test_ramp_falls_back_to_last_commanded_level() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        controller.ramp_voltage(0.5).await.unwrap();
        mock.fail_level_queries();
        mock.clear_log();

        controller.ramp_voltage(0.0).await.unwrap();
        let history = mock.level_history();
        assert_eq!(history.len(), 5);
        assert!((history[0] - 0.4).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_sleeps_between_steps() {
        let mock = MockTransport::new();
        let controller = Arc::new(InstrumentController::new(RampProfile {
            step_size: 0.1,
            inter_step_delay: Duration::from_millis(20),
        }));
        controller
            .connect(Box::new(mock.clone()), "X")
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        controller.ramp_voltage(1.0).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(9 * 20));
    }

    #[tokio::test]
    async fn test_ramp_rejects_non_finite_target() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        assert!(controller.ramp_voltage(f64::NAN).await.is_err());
        assert!(mock.level_history().is_empty());
    }

    #[test]
    fn test_ramp_points_are_lazy_for_huge_spans() {
        let mut points = ramp_points(9.91e37, 0.0, 0.1);
        assert_eq!(points.next(), Some(9.91e37 - 0.1));
    }

    #[tokio::test]
    async fn test_ramp_rejects_out_of_range_target() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        let err = controller.ramp_voltage(1e30).await.unwrap_err();
        assert!(matches!(err, SweepError::Instrument(_)));
        assert!(controller.ramp_voltage(-MAX_SOURCE_VOLTS - 1.0).await.is_err());
        assert!(controller.set_voltage(250.0).await.is_err());
        assert!(mock.level_history().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_readback_is_treated_as_unreadable() {
        let mock = MockTransport::new().with_initial_level(9.91e37);
        let controller = connected(&mock).await;
        controller.configure_for_sweep(0.01).await.unwrap();

        controller.safe_shutdown().await;
        assert_eq!(mock.level_history(), vec![0.0]);
        assert!(!mock.output_enabled());
    }

    #[tokio::test]
    async fn test_overflow_readback_falls_back_to_last_commanded_level() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        controller.ramp_voltage(0.3).await.unwrap();
        mock.set_level_readback(9.91e37);
        mock.clear_log();

        controller.ramp_voltage(0.0).await.unwrap();
        let history = mock.level_history();
        assert_eq!(history.len(), 3);
        assert!((history[0] - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_self_test_report() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        let report = controller.self_test().await.unwrap();
        assert!(report.contains("passed"));
    }

    #[tokio::test]
    async fn test_safe_shutdown_is_idempotent() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        controller.configure_for_sweep(0.01).await.unwrap();
        controller.ramp_voltage(0.7).await.unwrap();

        controller.safe_shutdown().await;
        assert_eq!(mock.level(), 0.0);
        assert!(!mock.output_enabled());

        controller.safe_shutdown().await;
        assert_eq!(mock.level(), 0.0);
        assert_eq!(controller.last_commanded_voltage().await, Some(0.0));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_safe_shutdown_logs_swallowed_failures() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        controller.configure_for_sweep(0.01).await.unwrap();
        mock.fail_writes_after(0);

        controller.safe_shutdown().await;
        assert!(logs_contain("ramp to 0 V failed"));
        assert!(logs_contain("disabling output failed"));
        assert!(mock.output_enabled());
    }

    #[tokio::test]
    async fn test_safe_shutdown_when_disconnected_is_noop() {
        let controller = InstrumentController::default();
        controller.safe_shutdown().await;
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_ramps_down_and_closes() {
        let mock = MockTransport::new();
        let controller = connected(&mock).await;
        controller.configure_for_sweep(0.01).await.unwrap();
        controller.ramp_voltage(0.4).await.unwrap();

        controller.disconnect().await;
        assert_eq!(mock.level(), 0.0);
        assert!(!mock.output_enabled());
        assert!(!mock.is_connected());
        assert_eq!(mock.call_log().last(), Some(&MockCall::Close));
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_sweep_claim_is_exclusive() {
        let controller = Arc::new(InstrumentController::default());
        let claim = controller.try_claim_sweep().unwrap();
        assert!(controller.sweep_active());
        assert_eq!(controller.try_claim_sweep().err(), Some(SweepError::Busy));
        drop(claim);
        assert!(!controller.sweep_active());
        assert!(controller.try_claim_sweep().is_ok());
    }
}
