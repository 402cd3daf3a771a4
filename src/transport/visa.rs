//! VISA transport for GPIB/USB/Ethernet instruments
//!
//! Wraps the visa-rs crate. VISA calls are blocking, so every exchange runs on
//! Tokio's blocking pool behind an `Arc<Mutex<_>>`, bounded by the configured
//! timeout.
//!
//! Supports resource strings like:
//! - "GPIB0::24::INSTR" (GPIB interface)
//! - "USB0::0x05E6::0x2450::04412345::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
//!
//! Without the `instrument_visa` feature the type still exists but cannot be
//! constructed.

use super::{DeviceTransport, TransportKind};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use super::{CONNECT_TIMEOUT, READ_TERMINATOR, WRITE_TERMINATOR};
#[cfg(feature = "instrument_visa")]
use crate::instrument::scpi;
#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;

/// An open VISA session. The resource manager is kept alive alongside the
/// instrument because closing it closes every session it opened.
#[cfg(feature = "instrument_visa")]
struct VisaSession {
    _rm: visa_rs::DefaultRM,
    instrument: visa_rs::Instrument,
}

/// VISA transport for GPIB, USB-TMC and LXI resources.
pub struct VisaTransport {
    resource: Option<String>,
    timeout: Duration,
    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<VisaSession>>>,
}

impl VisaTransport {
    /// Create an unconnected VISA transport with the given I/O timeout
    ///
    /// # Errors
    /// Fails when the crate was built without `instrument_visa`.
    #[cfg(feature = "instrument_visa")]
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            resource: None,
            timeout,
            session: None,
        })
    }

    #[cfg(not(feature = "instrument_visa"))]
    /// Always fails: VISA support is compiled out.
    pub fn new(_timeout: Duration) -> Result<Self> {
        Err(anyhow!(
            "VISA support not enabled. Rebuild with --features instrument_visa"
        ))
    }

    /// I/O timeout applied to opened sessions.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a command, and read one response line when `expect_reply` is set.
    #[cfg(feature = "instrument_visa")]
    async fn exchange(&self, command: &str, expect_reply: bool) -> Result<Option<String>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| anyhow!("VISA instrument not connected"))?
            .clone();

        let line = format!("{}{}", command, WRITE_TERMINATOR);
        let command_for_log = command.to_string();

        let task = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            use std::io::{BufRead, BufReader, Write};

            let mut guard = session.blocking_lock();
            guard
                .instrument
                .write_all(line.as_bytes())
                .with_context(|| format!("VISA write failed for: {}", command_for_log))?;

            if !expect_reply {
                debug!("VISA write sent: {}", command_for_log);
                return Ok(None);
            }

            let mut response = String::new();
            BufReader::new(&guard.instrument)
                .read_line(&mut response)
                .with_context(|| format!("VISA read failed for: {}", command_for_log))?;
            let response = response.trim_end_matches(READ_TERMINATOR).trim().to_string();
            debug!("VISA query '{}' -> '{}'", command_for_log, response);
            Ok(Some(response))
        });

        tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| anyhow!("VISA exchange timed out after {:?}: {}", self.timeout, command))?
            .context("VISA I/O task panicked")?
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl DeviceTransport for VisaTransport {
    async fn connect(&mut self, resource: &str) -> Result<String> {
        let resource_owned = resource.to_string();
        let open = tokio::task::spawn_blocking(move || -> Result<VisaSession> {
            use std::ffi::CString;
            use visa_rs::prelude::*;

            let rm = DefaultRM::new().context("Failed to create VISA resource manager")?;
            let name = CString::new(resource_owned.clone())
                .context("Resource string contains a NUL byte")?;
            let instrument = rm
                .open(&name.into(), AccessMode::NO_LOCK, CONNECT_TIMEOUT)
                .with_context(|| format!("Failed to open VISA resource: {}", resource_owned))?;
            Ok(VisaSession { _rm: rm, instrument })
        });

        let session = tokio::time::timeout(CONNECT_TIMEOUT, open)
            .await
            .map_err(|_| anyhow!("Timed out opening '{}' after {:?}", resource, CONNECT_TIMEOUT))?
            .context("VISA open task panicked")??;

        self.session = Some(Arc::new(Mutex::new(session)));
        self.resource = Some(resource.to_string());

        self.exchange(scpi::RESET, false).await?;
        self.exchange(scpi::CLEAR_STATUS, false).await?;
        let identity = self
            .exchange(scpi::IDENTIFY, true)
            .await?
            .filter(|idn| !idn.is_empty())
            .ok_or_else(|| anyhow!("Instrument at '{}' returned an empty identity", resource))?;

        debug!(
            "VISA resource '{}' opened with {}ms timeout",
            resource,
            self.timeout.as_millis()
        );
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
        if self.session.take().is_some() {
            debug!(
                "VISA resource '{}' closed",
                self.resource.as_deref().unwrap_or("?")
            );
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Hardware
    }

    fn info(&self) -> String {
        format!(
            "VisaTransport({} @ {}ms timeout)",
            self.resource.as_deref().unwrap_or("unopened"),
            self.timeout.as_millis()
        )
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl DeviceTransport for VisaTransport {
    async fn connect(&mut self, _resource: &str) -> Result<String> {
        Err(anyhow!(
            "VISA support not enabled. Rebuild with --features instrument_visa"
        ))
    }

    async fn write(&mut self, _command: &str) -> Result<()> {
        Err(anyhow!("VISA instrument not connected"))
    }

    async fn query(&mut self, _command: &str) -> Result<String> {
        Err(anyhow!("VISA instrument not connected"))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Hardware
    }

    fn info(&self) -> String {
        format!(
            "VisaTransport({} @ {}ms timeout, disabled)",
            self.resource.as_deref().unwrap_or("unopened"),
            self.timeout.as_millis()
        )
    }
}
