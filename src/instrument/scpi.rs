//! SCPI command set of a Keithley 2400-class source-measure unit.
//!
//! Only the subset needed for a voltage-source / current-measure sweep is
//! covered. The simulated and mock transports parse the same strings, so any
//! command the controller emits must round-trip through the `parse_*`
//! helpers below.

/// Identity query
pub const IDENTIFY: &str = "*IDN?";
/// Reset to power-on defaults
pub const RESET: &str = "*RST";
/// Clear the status and error queues
pub const CLEAR_STATUS: &str = "*CLS";
/// Built-in self-test, `0` on success
pub const SELF_TEST: &str = "*TST?";

/// Source voltage
pub const SOURCE_VOLTAGE_MODE: &str = ":SOUR:FUNC VOLT";
/// Measure current
pub const SENSE_CURRENT_MODE: &str = ":SENS:FUNC \"CURR\"";
/// Restrict readings to the current element only
pub const FORMAT_CURRENT_ONLY: &str = ":FORM:ELEM CURR";
/// Enable the output
pub const OUTPUT_ON: &str = ":OUTP ON";
/// Disable the output
pub const OUTPUT_OFF: &str = ":OUTP OFF";
/// Trigger and read one current measurement
pub const MEASURE_CURRENT: &str = ":MEAS:CURR?";
/// Programmed voltage level
pub const VOLTAGE_LEVEL_QUERY: &str = ":SOUR:VOLT:LEV?";

const VOLTAGE_LEVEL_PREFIX: &str = ":SOUR:VOLT:LEV ";
const COMPLIANCE_PREFIX: &str = ":SENS:CURR:PROT ";

/// Program the source voltage level.
///
/// Uses shortest round-trip formatting so the instrument receives exactly the
/// requested value.
pub fn set_voltage(volts: f64) -> String {
    format!("{}{}", VOLTAGE_LEVEL_PREFIX, volts)
}

/// Program the current compliance limit.
pub fn set_compliance(amps: f64) -> String {
    format!("{}{}", COMPLIANCE_PREFIX, amps)
}

/// Level carried by a set-voltage command, if `command` is one.
pub fn parse_set_voltage(command: &str) -> Option<f64> {
    command
        .trim()
        .strip_prefix(VOLTAGE_LEVEL_PREFIX)
        .and_then(|v| v.trim().parse().ok())
}

/// Limit carried by a compliance command, if `command` is one.
pub fn parse_set_compliance(command: &str) -> Option<f64> {
    command
        .trim()
        .strip_prefix(COMPLIANCE_PREFIX)
        .and_then(|v| v.trim().parse().ok())
}

/// Parse a numeric reading. With `FORM:ELEM CURR` the instrument answers a
/// single value; otherwise the first element is used.
pub fn parse_reading(response: &str) -> Option<f64> {
    response
        .split(',')
        .next()
        .and_then(|field| field.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Format a numeric reading the way the instrument does.
pub fn format_reading(value: f64) -> String {
    format!("{:+.6E}", value)
}
