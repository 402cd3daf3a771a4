//! Simulated source-measure unit.
//!
//! Answers the same SCPI subset as the real instrument and models the device
//! under test as an Ohmic element with a little hysteresis:
//!
//! ```text
//! I = V * (BASE_CONDUCTANCE + HYSTERESIS_SPAN * w + jitter)
//! ```
//!
//! where `w` in `[0, 1]` is an internal state that drifts up under positive
//! bias and down under negative bias, and `jitter` is uniform noise in
//! `[0, JITTER_SPAN]`. The conductance therefore always lies in
//! `[0.001, 0.0012]` S. Readings are clamped to the programmed compliance and
//! are returned after an artificial settling delay.
//!
//! The simulation never fails `connect`, `write` or `query`.

use super::{DeviceTransport, TransportKind};
use crate::instrument::scpi;
use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Identity string reported by the simulated instrument.
pub const SIMULATED_IDENTITY: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 2400,SIMULATED,C32 (simulated)";

/// Resource address listed for the simulated instrument.
pub const SIMULATED_RESOURCE: &str = "SIM::2400::INSTR";

/// Conductance at zero hysteresis (siemens)
pub const BASE_CONDUCTANCE: f64 = 0.001;
/// Conductance added at full hysteresis (siemens)
pub const HYSTERESIS_SPAN: f64 = 0.0001;
/// Peak-to-peak multiplicative noise on each reading
pub const JITTER_SPAN: f64 = 0.0001;

/// How far the memory state moves per volt and reading.
const STATE_RATE: f64 = 0.05;

const DEFAULT_SETTLING: Duration = Duration::from_millis(50);
const SELF_TEST_DURATION: Duration = Duration::from_millis(500);

/// In-process memristor model answering the SCPI subset the controller uses.
pub struct SimulatedTransport {
    connected: bool,
    level: f64,
    output_enabled: bool,
    compliance: f64,
    state: f64,
    settling: Duration,
    rng: StdRng,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// Simulated instrument with the default settling delay.
    pub fn new() -> Self {
        Self {
            connected: false,
            level: 0.0,
            output_enabled: false,
            compliance: 0.105,
            state: 0.0,
            settling: DEFAULT_SETTLING,
            rng: StdRng::from_entropy(),
        }
    }

    /// Settling delay applied before every current reading
    pub fn with_settling(mut self, settling: Duration) -> Self {
        self.settling = settling;
        self
    }

    /// Use a fixed noise seed for reproducible readings
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Present output level
    pub fn level(&self) -> f64 {
        self.level
    }

    /// Whether the simulated output is on.
    pub fn output_enabled(&self) -> bool {
        self.output_enabled
    }

    fn read_current(&mut self) -> f64 {
        if !self.output_enabled {
            return 0.0;
        }

        let v = self.level;
        self.state = (self.state + STATE_RATE * v).clamp(0.0, 1.0);
        let jitter = self.rng.gen_range(0.0..=JITTER_SPAN);
        let conductance = BASE_CONDUCTANCE + HYSTERESIS_SPAN * self.state + jitter;
        let current = v * conductance;

        current.clamp(-self.compliance, self.compliance)
    }

    fn apply(&mut self, command: &str) {
        if let Some(v) = scpi::parse_set_voltage(command) {
            self.level = v;
        } else if let Some(c) = scpi::parse_set_compliance(command) {
            self.compliance = c.abs();
        } else {
            match command.trim() {
                scpi::OUTPUT_ON => self.output_enabled = true,
                scpi::OUTPUT_OFF => self.output_enabled = false,
                scpi::RESET => {
                    self.level = 0.0;
                    self.output_enabled = false;
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    async fn connect(&mut self, resource: &str) -> Result<String> {
        debug!("Simulated instrument opened as '{}'", resource);
        self.apply(scpi::RESET);
        self.connected = true;
        Ok(SIMULATED_IDENTITY.to_string())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        debug!("SIM write: {}", command);
        self.apply(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let response = match command.trim() {
            scpi::IDENTIFY => SIMULATED_IDENTITY.to_string(),
            scpi::MEASURE_CURRENT => {
                sleep(self.settling).await;
                scpi::format_reading(self.read_current())
            }
            scpi::VOLTAGE_LEVEL_QUERY => scpi::format_reading(self.level),
            scpi::SELF_TEST => {
                sleep(SELF_TEST_DURATION).await;
                "0".to_string()
            }
            _ => "0".to_string(),
        };
        debug!("SIM query '{}' -> '{}'", command, response);
        Ok(response)
    }

    async fn close(&mut self) -> Result<()> {
        if self.connected {
            debug!("Simulated instrument closed");
        }
        self.connected = false;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn info(&self) -> String {
        format!("SimulatedTransport(settling {}ms)", self.settling.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected() -> SimulatedTransport {
        let mut sim = SimulatedTransport::new()
            .with_settling(Duration::ZERO)
            .with_seed(7);
        sim.connect(SIMULATED_RESOURCE).await.unwrap();
        sim
    }

    #[tokio::test]
    async fn test_identity_is_fixed() {
        let mut sim = connected().await;
        assert_eq!(sim.query("*IDN?").await.unwrap(), SIMULATED_IDENTITY);
    }

    #[tokio::test]
    async fn test_current_tracks_commanded_voltage() {
        let mut sim = connected().await;
        sim.write(scpi::OUTPUT_ON).await.unwrap();

        for v in [0.1, 0.5, 1.0, -0.5, -1.0] {
            sim.write(&scpi::set_voltage(v)).await.unwrap();
            let reading = sim.query(scpi::MEASURE_CURRENT).await.unwrap();
            let current = scpi::parse_reading(&reading).unwrap();
            let ratio = current / v;
            assert!(
                (0.0..=0.0012 + 1e-9).contains(&ratio),
                "conductance {} out of range at {} V",
                ratio,
                v
            );
        }
    }

    #[tokio::test]
    async fn test_output_off_reads_zero() {
        let mut sim = connected().await;
        sim.write(&scpi::set_voltage(1.0)).await.unwrap();
        let reading = sim.query(scpi::MEASURE_CURRENT).await.unwrap();
        assert_eq!(scpi::parse_reading(&reading), Some(0.0));
    }

    #[tokio::test]
    async fn test_compliance_clamps_current() {
        let mut sim = connected().await;
        sim.write(&scpi::set_compliance(1e-4)).await.unwrap();
        sim.write(scpi::OUTPUT_ON).await.unwrap();
        sim.write(&scpi::set_voltage(5.0)).await.unwrap();

        let reading = sim.query(scpi::MEASURE_CURRENT).await.unwrap();
        let current = scpi::parse_reading(&reading).unwrap();
        assert!(current <= 1e-4 + 1e-12);
    }

    #[tokio::test]
    async fn test_level_query_reports_last_set() {
        let mut sim = connected().await;
        sim.write(&scpi::set_voltage(-0.25)).await.unwrap();
        let reading = sim.query(scpi::VOLTAGE_LEVEL_QUERY).await.unwrap();
        assert_eq!(scpi::parse_reading(&reading), Some(-0.25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_test_passes_after_delay() {
        let mut sim = connected().await;
        let start = tokio::time::Instant::now();
        assert_eq!(sim.query(scpi::SELF_TEST).await.unwrap(), "0");
        assert!(start.elapsed() >= SELF_TEST_DURATION);
    }
}
