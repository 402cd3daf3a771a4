//! Sweep record persistence with clean feature flag handling.
//!
//! A record is a `#`-prefixed comment header (instrument identity, timestamps,
//! connection mode, status, every sweep parameter) followed by a
//! `voltage,current` table in scientific notation:
//!
//! ```text
//! # instrument: KEITHLEY INSTRUMENTS INC.,MODEL 2400,...
//! # started_at: 2024-05-01T10:00:00+00:00
//! # ...
//! voltage,current
//! 0.000000e0,1.234560e-7
//! ```

use crate::sweep::SweepResult;
use anyhow::Result;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name for a record written now: `sweep_YYYYMMDD_HHMMSS.csv`.
pub fn default_file_name() -> String {
    format!("sweep_{}.csv", chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use anyhow::Context;
    use std::fs::File;
    use std::io::BufWriter;
    use tracing::info;

    /// Writes sweep records as CSV files.
    pub struct CsvWriter {
        output_dir: PathBuf,
    }

    impl CsvWriter {
        /// Writer saving into `output_dir`.
        pub fn new(output_dir: impl Into<PathBuf>) -> Self {
            Self {
                output_dir: output_dir.into(),
            }
        }

        /// Directory used by [`Self::save`].
        pub fn output_dir(&self) -> &Path {
            &self.output_dir
        }

        /// Write `result` to a new timestamped file in the output directory.
        pub fn save(&self, result: &SweepResult) -> Result<PathBuf> {
            if !self.output_dir.exists() {
                std::fs::create_dir_all(&self.output_dir).with_context(|| {
                    format!("Failed to create storage directory at {:?}", self.output_dir)
                })?;
            }
            let path = self.output_dir.join(default_file_name());
            self.save_as(result, &path)?;
            Ok(path)
        }

        /// Write `result` to `path`, replacing any existing file.
        pub fn save_as(&self, result: &SweepResult, path: &Path) -> Result<()> {
            let file = File::create(path)
                .with_context(|| format!("Failed to create CSV file at {:?}", path))?;
            let mut out = BufWriter::new(file);
            self.write_to(result, &mut out)?;
            out.flush().context("Failed to flush CSV file")?;
            info!(
                "Saved {} points ({}) to '{}'",
                result.len(),
                result.status(),
                path.display()
            );
            Ok(())
        }

        /// Write the header and table to any writer.
        pub fn write_to<W: Write>(&self, result: &SweepResult, out: &mut W) -> Result<()> {
            for (key, value) in header_fields(result) {
                writeln!(out, "# {}: {}", key, value)
                    .context("Failed to write metadata to CSV file")?;
            }

            let mut writer = csv::Writer::from_writer(out);
            writer
                .write_record(["voltage", "current"])
                .context("Failed to write CSV header")?;
            for sample in result.samples() {
                writer
                    .write_record(&[
                        format!("{:.6e}", sample.voltage),
                        format!("{:.6e}", sample.current),
                    ])
                    .context("Failed to write sample to CSV file")?;
            }
            writer.flush().context("Failed to flush CSV writer")?;
            Ok(())
        }
    }

    fn header_fields(result: &SweepResult) -> Vec<(&'static str, String)> {
        let meta = result.metadata();
        let params = result.parameters();
        let mut fields = vec![
            (
                "instrument",
                meta.instrument_identity
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
            ("resource", meta.resource.clone().unwrap_or_default()),
            ("connection_mode", meta.connection_mode.to_string()),
            ("started_at", meta.started_at.to_rfc3339()),
            (
                "finished_at",
                meta.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            ("status", result.status().to_string()),
            ("start_voltage", params.start_voltage.to_string()),
            ("stop_voltage", params.stop_voltage.to_string()),
            ("step_voltage", params.step_voltage.to_string()),
            ("delay_seconds", params.delay_seconds.to_string()),
            (
                "current_compliance_amps",
                params.current_compliance_amps.to_string(),
            ),
        ];
        if let Some(err) = result.error() {
            fields.push(("error", err.to_string()));
        }
        fields
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use anyhow::anyhow;

    fn disabled() -> anyhow::Error {
        anyhow!("CSV storage not enabled. Rebuild with --features storage_csv")
    }

    /// Writes sweep records as CSV files.
    pub struct CsvWriter {
        output_dir: PathBuf,
    }

    impl CsvWriter {
        /// Writer saving into `output_dir`.
        pub fn new(output_dir: impl Into<PathBuf>) -> Self {
            Self {
                output_dir: output_dir.into(),
            }
        }

        /// Directory used by [`Self::save`].
        pub fn output_dir(&self) -> &Path {
            &self.output_dir
        }

        /// Always fails: CSV support is compiled out.
        pub fn save(&self, _result: &SweepResult) -> Result<PathBuf> {
            Err(disabled())
        }

        /// Always fails: CSV support is compiled out.
        pub fn save_as(&self, _result: &SweepResult, _path: &Path) -> Result<()> {
            Err(disabled())
        }

        /// Always fails: CSV support is compiled out.
        pub fn write_to<W: Write>(&self, _result: &SweepResult, _out: &mut W) -> Result<()> {
            Err(disabled())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvWriter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvWriter;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::instrument::ConnectionState;
    use crate::sweep::{RunMetadata, Sample, SweepParameters, SweepStatus};
    use crate::SweepError;

    fn sample_result(status: SweepStatus, error: Option<SweepError>) -> SweepResult {
        SweepResult::new(
            SweepParameters::default(),
            vec![
                Sample { voltage: 0.0, current: 0.0 },
                Sample { voltage: 0.5, current: 5.5e-4 },
            ],
            status,
            error,
            RunMetadata::new(
                Some("KEITHLEY INSTRUMENTS INC.,MODEL 2400".into()),
                ConnectionState::Simulated,
                Some("SIM::2400::INSTR".into()),
            ),
        )
    }

    #[test]
    fn test_default_file_name_shape() {
        let name = default_file_name();
        assert!(name.starts_with("sweep_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "sweep_YYYYMMDD_HHMMSS.csv".len());
    }

    #[test]
    fn test_header_then_table() {
        let writer = CsvWriter::new("unused");
        let mut out = Vec::new();
        writer
            .write_to(&sample_result(SweepStatus::Completed, None), &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "# instrument: KEITHLEY INSTRUMENTS INC.,MODEL 2400");
        assert!(lines.contains(&"# connection_mode: simulated"));
        assert!(lines.contains(&"# status: completed"));
        assert!(lines.contains(&"# current_compliance_amps: 0.001"));
        let table_at = lines.iter().position(|l| *l == "voltage,current").unwrap();
        assert_eq!(lines[table_at + 1], "0.000000e0,0.000000e0");
        assert_eq!(lines[table_at + 2], "5.000000e-1,5.500000e-4");
        assert_eq!(lines.len(), table_at + 3);
    }

    #[test]
    fn test_failed_record_carries_error() {
        let writer = CsvWriter::new("unused");
        let mut out = Vec::new();
        writer
            .write_to(
                &sample_result(
                    SweepStatus::Failed,
                    Some(SweepError::Measurement("timeout".into())),
                ),
                &mut out,
            )
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("# error: Measurement error: timeout"));
    }

    #[test]
    fn test_save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CsvWriter::new(dir.path().join("runs"));
        let path = writer
            .save(&sample_result(SweepStatus::Aborted, None))
            .unwrap();

        assert!(path.starts_with(dir.path().join("runs")));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# status: aborted"));
        assert!(text.contains("voltage,current"));
    }
}
