//! Sweep parameters and their validation.

use crate::error::{AppResult, SweepError};
use crate::instrument::MAX_SOURCE_VOLTS;
use serde::{Deserialize, Serialize};

/// Upper bound on the number of points in one sweep.
///
/// Rejects step sizes so small that the run would never finish, or that would
/// exhaust memory holding its samples.
pub const MAX_SWEEP_POINTS: usize = 100_000;

/// Parameters of one linear voltage sweep.
///
/// Immutable for the duration of a run. Build from operator text with
/// [`SweepParameters::parse`], or construct directly and call
/// [`SweepParameters::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepParameters {
    /// First level applied (volts)
    pub start_voltage: f64,
    /// Last level applied (volts)
    pub stop_voltage: f64,
    /// Signed increment between points; must point from start towards stop
    pub step_voltage: f64,
    /// Settling time between applying a level and reading the current
    pub delay_seconds: f64,
    /// Current limit programmed before the output is enabled
    pub current_compliance_amps: f64,
}

impl Default for SweepParameters {
    fn default() -> Self {
        Self {
            start_voltage: 0.0,
            stop_voltage: 1.0,
            step_voltage: 0.1,
            delay_seconds: 0.1,
            current_compliance_amps: 0.001,
        }
    }
}

/// Sweep parameters as typed by an operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSweepInput {
    /// Text for [`SweepParameters::start_voltage`]
    pub start_voltage: String,
    /// Text for [`SweepParameters::stop_voltage`]
    pub stop_voltage: String,
    /// Text for [`SweepParameters::step_voltage`]
    pub step_voltage: String,
    /// Text for [`SweepParameters::delay_seconds`]
    pub delay_seconds: String,
    /// Text for [`SweepParameters::current_compliance_amps`]
    pub current_compliance_amps: String,
}

fn parse_field(name: &str, text: &str) -> AppResult<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SweepError::Validation(format!("{} is required", name)));
    }
    trimmed.parse::<f64>().map_err(|_| {
        SweepError::Validation(format!("{} must be a number, got '{}'", name, trimmed))
    })
}

impl SweepParameters {
    /// Parse and validate raw operator input.
    ///
    /// # Errors
    /// `SweepError::Validation` naming the first offending field.
    pub fn parse(raw: &RawSweepInput) -> AppResult<Self> {
        let params = Self {
            start_voltage: parse_field("start_voltage", &raw.start_voltage)?,
            stop_voltage: parse_field("stop_voltage", &raw.stop_voltage)?,
            step_voltage: parse_field("step_voltage", &raw.step_voltage)?,
            delay_seconds: parse_field("delay_seconds", &raw.delay_seconds)?,
            current_compliance_amps: parse_field(
                "current_compliance_amps",
                &raw.current_compliance_amps,
            )?,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check every invariant a run relies on.
    ///
    /// - all values finite
    /// - start and stop within +/-[`MAX_SOURCE_VOLTS`]
    /// - compliance > 0
    /// - delay >= 0
    /// - step non-zero and pointing from start to stop, unless start == stop
    /// - at most [`MAX_SWEEP_POINTS`] points
    pub fn validate(&self) -> AppResult<()> {
        let fields = [
            ("start_voltage", self.start_voltage),
            ("stop_voltage", self.stop_voltage),
            ("step_voltage", self.step_voltage),
            ("delay_seconds", self.delay_seconds),
            ("current_compliance_amps", self.current_compliance_amps),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(SweepError::Validation(format!(
                    "{} must be a finite number, got {}",
                    name, value
                )));
            }
        }

        for (name, value) in [
            ("start_voltage", self.start_voltage),
            ("stop_voltage", self.stop_voltage),
        ] {
            if value.abs() > MAX_SOURCE_VOLTS {
                return Err(SweepError::Validation(format!(
                    "{} {} V is outside the source range of +/-{} V",
                    name, value, MAX_SOURCE_VOLTS
                )));
            }
        }

        if self.current_compliance_amps <= 0.0 {
            return Err(SweepError::Validation(format!(
                "current_compliance_amps must be > 0, got {}",
                self.current_compliance_amps
            )));
        }

        if self.delay_seconds < 0.0 {
            return Err(SweepError::Validation(format!(
                "delay_seconds must be >= 0, got {}",
                self.delay_seconds
            )));
        }

        if self.start_voltage != self.stop_voltage {
            let direction = self.stop_voltage - self.start_voltage;
            if self.step_voltage == 0.0 {
                return Err(SweepError::Validation(
                    "step_voltage must be non-zero when start and stop differ".to_string(),
                ));
            }
            if direction.signum() != self.step_voltage.signum() {
                return Err(SweepError::Validation(format!(
                    "step_voltage {} points away from stop_voltage ({} -> {})",
                    self.step_voltage, self.start_voltage, self.stop_voltage
                )));
            }
        }

        let points = self.raw_point_count();
        if points > MAX_SWEEP_POINTS as f64 {
            return Err(SweepError::Validation(format!(
                "sweep would take {} points, the limit is {}",
                points, MAX_SWEEP_POINTS
            )));
        }

        Ok(())
    }

    fn raw_point_count(&self) -> f64 {
        if self.start_voltage == self.stop_voltage || self.step_voltage == 0.0 {
            return 1.0;
        }
        let intervals = ((self.stop_voltage - self.start_voltage).abs() / self.step_voltage.abs())
            .round()
            .max(1.0);
        intervals + 1.0
    }

    /// Number of points the sweep visits.
    ///
    /// 1 when start == stop, otherwise `round(|stop - start| / |step|) + 1`,
    /// never fewer than 2 so both endpoints are visited.
    pub fn point_count(&self) -> usize {
        self.raw_point_count() as usize
    }

    /// Evenly spaced levels from start to stop inclusive.
    ///
    /// The last level is exactly `stop_voltage`, even when the step does not
    /// divide the range.
    pub fn voltages(&self) -> Vec<f64> {
        let count = self.point_count();
        if count <= 1 {
            return vec![self.start_voltage];
        }

        let span = self.stop_voltage - self.start_voltage;
        let last = count - 1;
        (0..count)
            .map(|i| {
                if i == last {
                    self.stop_voltage
                } else {
                    self.start_voltage + i as f64 * span / last as f64
                }
            })
            .collect()
    }

    /// Settling delay as a `Duration`; zero for values that fail validation.
    pub fn delay(&self) -> std::time::Duration {
        if self.delay_seconds.is_finite() && self.delay_seconds > 0.0 {
            std::time::Duration::try_from_secs_f64(self.delay_seconds).unwrap_or_default()
        } else {
            std::time::Duration::ZERO
        }
    }
}
