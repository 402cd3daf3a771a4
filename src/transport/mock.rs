//! Mock transport for testing
//!
//! Scripted stand-in for a source-measure unit that provides:
//! - A call log for test verification
//! - Controllable failure injection (connect, nth reading, level queries, writes)
//! - Output level tracking, so safety properties can be checked on the exact
//!   sequence of levels the instrument was told to apply
//!
//! Clones share state: keep one clone in the test and hand another to the
//! controller.

use super::{DeviceTransport, TransportKind};
use crate::instrument::scpi;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Identity string reported by the mock.
pub const MOCK_IDENTITY: &str = "MOCK INSTRUMENTS,SMU-0,0000,1.0";

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// Open a resource
    Connect(String),
    /// Command without response
    Write(String),
    /// Command with response
    Query(String),
    /// Release the resource
    Close,
}

#[derive(Debug)]
struct MockState {
    connected: bool,
    level: f64,
    output_enabled: bool,
    conductance: f64,
    latency: Duration,
    call_log: Vec<MockCall>,
    levels: Vec<f64>,
    readings_taken: usize,
    fail_connect: bool,
    fail_reading: Option<usize>,
    fail_level_query: bool,
    level_readback: Option<f64>,
    fail_writes_from: Option<usize>,
    writes: usize,
}

/// Scripted in-memory transport. See the module docs.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a new mock transport with default settings
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: false,
                level: 0.0,
                output_enabled: false,
                conductance: 0.001,
                latency: Duration::ZERO,
                call_log: Vec::new(),
                levels: Vec::new(),
                readings_taken: 0,
                fail_connect: false,
                fail_reading: None,
                fail_level_query: false,
                level_readback: None,
                fail_writes_from: None,
                writes: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set simulated per-call latency
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Start at a non-zero output level, as if left there by a previous session
    pub fn with_initial_level(self, volts: f64) -> Self {
        self.lock().level = volts;
        self
    }

    /// Refuse to open the resource
    pub fn fail_connect(&self) {
        self.lock().fail_connect = true;
    }

    /// Fail the nth current reading (1-based)
    pub fn fail_reading(&self, nth: usize) {
        self.lock().fail_reading = Some(nth);
    }

    /// Answer level queries with an error, as an instrument without readback would
    pub fn fail_level_queries(&self) {
        self.lock().fail_level_query = true;
    }

    /// Answer level queries with `volts` regardless of the applied level,
    /// as an instrument reporting overflow would
    pub fn set_level_readback(&self, volts: f64) {
        self.lock().level_readback = Some(volts);
    }

    /// Fail every write after `count` successful ones
    pub fn fail_writes_after(&self, count: usize) {
        let mut state = self.lock();
        state.fail_writes_from = Some(state.writes + count);
    }

    /// Whether the resource is open
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Level currently applied
    pub fn level(&self) -> f64 {
        self.lock().level
    }

    /// Whether the output is on
    pub fn output_enabled(&self) -> bool {
        self.lock().output_enabled
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<MockCall> {
        self.lock().call_log.clone()
    }

    /// Clear the call log and level history
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.call_log.clear();
        state.levels.clear();
    }

    /// Every level applied through a set-voltage write, in order
    pub fn level_history(&self) -> Vec<f64> {
        self.lock().levels.clone()
    }

    /// Number of current readings answered (successful or not)
    pub fn readings_taken(&self) -> usize {
        self.lock().readings_taken
    }

    /// Number of calls matching the given query command
    pub fn query_count(&self, command: &str) -> usize {
        self.lock()
            .call_log
            .iter()
            .filter(|call| matches!(call, MockCall::Query(c) if c == command))
            .count()
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn connect(&mut self, resource: &str) -> Result<String> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.call_log.push(MockCall::Connect(resource.to_string()));

        if state.fail_connect {
            bail!("Injected failure: resource '{}' not found", resource);
        }

        state.connected = true;
        Ok(MOCK_IDENTITY.to_string())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.call_log.push(MockCall::Write(command.to_string()));

        if !state.connected {
            bail!("Not connected");
        }
        if state.fail_writes_from.is_some_and(|from| state.writes >= from) {
            bail!("Injected failure: write '{}' timed out", command);
        }
        state.writes += 1;

        if let Some(v) = scpi::parse_set_voltage(command) {
            state.level = v;
            state.levels.push(v);
        } else {
            match command {
                scpi::OUTPUT_ON => state.output_enabled = true,
                scpi::OUTPUT_OFF => state.output_enabled = false,
                _ => {}
            }
        }
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.call_log.push(MockCall::Query(command.to_string()));

        if !state.connected {
            bail!("Not connected");
        }

        match command {
            scpi::IDENTIFY => Ok(MOCK_IDENTITY.to_string()),
            scpi::SELF_TEST => Ok("0".to_string()),
            scpi::VOLTAGE_LEVEL_QUERY => {
                if state.fail_level_query {
                    bail!("Injected failure: level readback unsupported");
                }
                Ok(state.level_readback.unwrap_or(state.level).to_string())
            }
            scpi::MEASURE_CURRENT => {
                state.readings_taken += 1;
                if state.fail_reading == Some(state.readings_taken) {
                    return Err(anyhow!(
                        "Injected failure: reading #{} timed out",
                        state.readings_taken
                    ));
                }
                Ok((state.level * state.conductance).to_string())
            }
            other => Ok(format!("MOCK_RESPONSE: {}", other)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.call_log.push(MockCall::Close);
        state.connected = false;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Hardware
    }

    fn info(&self) -> String {
        "MockTransport".to_string()
    }
}
