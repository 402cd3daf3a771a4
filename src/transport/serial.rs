//! Serial transport for RS-232 instruments
//!
//! Wraps the serialport crate and runs blocking port I/O on Tokio's blocking
//! pool. Responses are read byte-by-byte up to the line terminator, bounded by
//! the configured timeout.
//!
//! The resource may be a bare port path (`/dev/ttyUSB0`, `COM3`) or a VISA
//! style serial resource (`ASRL/dev/ttyUSB0::INSTR`, `ASRL3::INSTR`).

use super::{DeviceTransport, TransportKind};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use super::{CONNECT_TIMEOUT, READ_TERMINATOR, WRITE_TERMINATOR};
#[cfg(feature = "instrument_serial")]
use crate::instrument::scpi;
#[cfg(feature = "instrument_serial")]
use anyhow::Context;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// RS-232 transport speaking newline-terminated SCPI.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: Option<String>,
    baud_rate: u32,
    timeout: Duration,
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

/// Map a resource string to the OS port name.
pub fn port_name_from_resource(resource: &str) -> String {
    let trimmed = resource.trim();
    let Some(rest) = trimmed.strip_prefix("ASRL") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_suffix("::INSTR").unwrap_or(rest);
    if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
        if cfg!(windows) {
            format!("COM{}", rest)
        } else {
            format!("/dev/ttyS{}", rest)
        }
    } else {
        rest.to_string()
    }
}

impl SerialTransport {
    /// Create an unconnected serial transport
    ///
    /// # Errors
    /// Fails when the crate was built without `instrument_serial`.
    #[cfg(feature = "instrument_serial")]
    pub fn new(baud_rate: u32, timeout: Duration) -> Result<Self> {
        Ok(Self {
            port_name: None,
            baud_rate,
            timeout,
            port: None,
        })
    }

    #[cfg(not(feature = "instrument_serial"))]
    /// Always fails: serial support is compiled out.
    pub fn new(_baud_rate: u32, _timeout: Duration) -> Result<Self> {
        Err(anyhow!(
            "Serial support not enabled. Rebuild with --features instrument_serial"
        ))
    }

    /// Configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    #[cfg(feature = "instrument_serial")]
    async fn exchange(&self, command: &str, expect_reply: bool) -> Result<Option<String>> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| anyhow!("Serial port not connected"))?
            .clone();

        let line = format!("{}{}", command, WRITE_TERMINATOR);
        let command_for_log = command.to_string();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            use std::io::{Read, Write};

            let mut port_guard = port.blocking_lock();
            port_guard
                .write_all(line.as_bytes())
                .context("Failed to write to serial port")?;
            port_guard.flush().context("Failed to flush serial port")?;
            debug!("Sent serial command: {}", command_for_log);

            if !expect_reply {
                return Ok(None);
            }

            let mut response = Vec::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();

            loop {
                if start.elapsed() > timeout {
                    return Err(anyhow!(
                        "Serial read timeout after {:?} for: {}",
                        timeout,
                        command_for_log
                    ));
                }

                match port_guard.read(&mut buffer) {
                    Ok(0) => return Err(anyhow!("Unexpected EOF from serial port")),
                    Ok(_) => {
                        if buffer[0] as char == READ_TERMINATOR {
                            break;
                        }
                        response.push(buffer[0]);
                    }
                    // Port timeout is shorter than the overall timeout
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                }
            }

            let response = String::from_utf8_lossy(&response).trim().to_string();
            debug!("Received serial response: {}", response);
            Ok(Some(response))
        })
        .await
        .context("Serial I/O task panicked")?
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl DeviceTransport for SerialTransport {
    async fn connect(&mut self, resource: &str) -> Result<String> {
        let port_name = port_name_from_resource(resource);
        let baud_rate = self.baud_rate;

        let name_for_open = port_name.clone();
        let open = tokio::task::spawn_blocking(move || {
            serialport::new(&name_for_open, baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        name_for_open, baud_rate
                    )
                })
        });

        let port = tokio::time::timeout(CONNECT_TIMEOUT, open)
            .await
            .map_err(|_| anyhow!("Timed out opening '{}' after {:?}", port_name, CONNECT_TIMEOUT))?
            .context("Serial open task panicked")??;

        self.port = Some(Arc::new(Mutex::new(port)));
        self.port_name = Some(port_name.clone());

        self.exchange(scpi::RESET, false).await?;
        self.exchange(scpi::CLEAR_STATUS, false).await?;
        let identity = self
            .exchange(scpi::IDENTIFY, true)
            .await?
            .filter(|idn| !idn.is_empty())
            .ok_or_else(|| anyhow!("Instrument on '{}' returned an empty identity", port_name))?;

        debug!("Serial port '{}' opened at {} baud", port_name, baud_rate);
        Ok(identity)
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        self.exchange(command, false).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.exchange(command, true)
            .await?
            .ok_or_else(|| anyhow!("No response to: {}", command))
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(
                "Serial port '{}' closed",
                self.port_name.as_deref().unwrap_or("?")
            );
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Hardware
    }

    fn info(&self) -> String {
        format!(
            "SerialTransport({} @ {} baud, {}ms timeout)",
            self.port_name.as_deref().unwrap_or("unopened"),
            self.baud_rate,
            self.timeout.as_millis()
        )
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl DeviceTransport for SerialTransport {
    async fn connect(&mut self, _resource: &str) -> Result<String> {
        Err(anyhow!(
            "Serial support not enabled. Rebuild with --features instrument_serial"
        ))
    }

    async fn write(&mut self, _command: &str) -> Result<()> {
        Err(anyhow!("Serial port not connected"))
    }

    async fn query(&mut self, _command: &str) -> Result<String> {
        Err(anyhow!("Serial port not connected"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Hardware
    }

    fn info(&self) -> String {
        format!(
            "SerialTransport({} @ {} baud, {}ms timeout, disabled)",
            self.port_name.as_deref().unwrap_or("unopened"),
            self.baud_rate,
            self.timeout.as_millis()
        )
    }
}
