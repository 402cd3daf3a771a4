//! The record of one sweep run.
//!
//! A [`SweepResult`] is assembled by the sweep worker and handed out only once
//! the run has reached a terminal status; it exposes read-only accessors and
//! no mutation. Persistence and plotting consume it through
//! [`SweepResult::samples`], [`SweepResult::voltages`] and
//! [`SweepResult::currents`].

use super::params::SweepParameters;
use crate::error::SweepError;
use crate::instrument::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    /// Not started
    #[default]
    Idle,
    /// In progress
    Running,
    /// Stopped on request; samples are partial
    Aborted,
    /// Every point measured
    Completed,
    /// Stopped by an error; samples are partial
    Failed,
}

impl SweepStatus {
    /// Whether the run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SweepStatus::Aborted | SweepStatus::Completed | SweepStatus::Failed
        )
    }
}

impl fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SweepStatus::Idle => "idle",
            SweepStatus::Running => "running",
            SweepStatus::Aborted => "aborted",
            SweepStatus::Completed => "completed",
            SweepStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One (voltage, current) reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Applied level (volts)
    pub voltage: f64,
    /// Measured current (amps)
    pub current: f64,
}

/// Where and when a run happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    /// `*IDN?` response of the instrument
    pub instrument_identity: Option<String>,
    /// Hardware or simulated
    pub connection_mode: ConnectionState,
    /// Resource address
    pub resource: Option<String>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunMetadata {
    pub(crate) fn new(
        instrument_identity: Option<String>,
        connection_mode: ConnectionState,
        resource: Option<String>,
    ) -> Self {
        Self {
            instrument_identity,
            connection_mode,
            resource,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Record of one sweep run, immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepResult {
    parameters: SweepParameters,
    samples: Vec<Sample>,
    status: SweepStatus,
    error: Option<SweepError>,
    metadata: RunMetadata,
}

impl SweepResult {
    pub(crate) fn new(
        parameters: SweepParameters,
        samples: Vec<Sample>,
        status: SweepStatus,
        error: Option<SweepError>,
        mut metadata: RunMetadata,
    ) -> Self {
        if metadata.finished_at.is_none() {
            metadata.finished_at = Some(Utc::now());
        }
        Self {
            parameters,
            samples,
            status,
            error,
            metadata,
        }
    }

    /// Parameters the run was started with.
    pub fn parameters(&self) -> &SweepParameters {
        &self.parameters
    }

    /// Samples in acquisition order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Iterate over the samples.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Applied levels, in order.
    pub fn voltages(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.voltage).collect()
    }

    /// Measured currents, in order.
    pub fn currents(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.current).collect()
    }

    /// Terminal status of the run.
    pub fn status(&self) -> SweepStatus {
        self.status
    }

    /// Failure detail, set only when the run failed
    pub fn error(&self) -> Option<&SweepError> {
        self.error.as_ref()
    }

    /// Instrument and timing details.
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was taken.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True when the run stopped before visiting every point.
    pub fn is_partial(&self) -> bool {
        self.samples.len() < self.parameters.point_count()
    }

    /// One-line description for logs and the console.
    pub fn summary(&self) -> String {
        let mut text = format!(
            "Sweep {}: {}/{} points ({} V -> {} V)",
            self.status,
            self.samples.len(),
            self.parameters.point_count(),
            self.parameters.start_voltage,
            self.parameters.stop_voltage
        );
        if let Some(err) = &self.error {
            text.push_str(&format!(": {}", err));
        }
        text
    }
}

impl<'a> IntoIterator for &'a SweepResult {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}
