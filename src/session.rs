//! Instrument session: settings, one connected controller and its sweep engine.
//!
//! A session is torn down with [`Session::close`], which ramps the output to
//! 0 V, disables it and releases the transport. [`Session::scoped`] runs a
//! body against a fresh session and performs that teardown even when the body
//! returns an error or panics.

use crate::config::Settings;
use crate::error::{describe, AppResult, SweepError};
use crate::instrument::InstrumentController;
use crate::sweep::{SweepEngine, SweepHandle, SweepParameters, SweepResult};
use crate::transport::{self, simulated::SIMULATED_RESOURCE, DeviceTransport};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

/// Configured controller and engine for one instrument.
///
/// Cheap to clone; clones share the same instrument.
#[derive(Clone)]
pub struct Session {
    settings: Arc<Settings>,
    controller: Arc<InstrumentController>,
    engine: SweepEngine,
}

impl Session {
    /// Build the transport named by `settings` and connect to the instrument.
    ///
    /// # Errors
    /// `SweepError::Connection` when the transport cannot be created (backend
    /// feature disabled) or the resource cannot be opened.
    pub async fn open(settings: Settings) -> AppResult<Self> {
        let transport = transport::from_config(&settings.instrument).map_err(|e| {
            SweepError::Connection(describe(&e))
        })?;
        Self::open_with(settings, transport).await
    }

    /// Connect using a caller-supplied transport.
    pub async fn open_with(
        settings: Settings,
        transport: Box<dyn DeviceTransport>,
    ) -> AppResult<Self> {
        let controller = Arc::new(InstrumentController::new(settings.ramp.profile()));
        let resource = if settings.instrument.simulate {
            SIMULATED_RESOURCE.to_string()
        } else {
            settings.instrument.resource.clone()
        };
        controller.connect(transport, &resource).await?;

        let engine = SweepEngine::new(Arc::clone(&controller));
        Ok(Self {
            settings: Arc::new(settings),
            controller,
            engine,
        })
    }

    /// Settings the session was opened with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Underlying instrument controller.
    pub fn controller(&self) -> &Arc<InstrumentController> {
        &self.controller
    }

    /// Sweep engine bound to the controller.
    pub fn engine(&self) -> &SweepEngine {
        &self.engine
    }

    /// Start a sweep in the background; see [`SweepEngine::start`].
    pub fn start_sweep(&self, parameters: SweepParameters) -> AppResult<SweepHandle> {
        self.engine.start(parameters)
    }

    /// Run a sweep to completion; see [`SweepEngine::run`].
    pub async fn run_sweep(&self, parameters: SweepParameters) -> AppResult<SweepResult> {
        self.engine.run(parameters).await
    }

    /// Run the instrument self-test.
    pub async fn self_test(&self) -> AppResult<String> {
        self.controller.self_test().await
    }

    /// Shut the output down safely and release the transport. Never fails.
    pub async fn close(&self) {
        info!("Closing instrument session");
        self.controller.disconnect().await;
    }

    /// Run `body` on this session, then close it whatever the outcome.
    ///
    /// A panic inside `body` is re-raised after teardown.
    pub async fn run_scoped<F, Fut, T>(self, body: F) -> anyhow::Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let session = self.clone();
        let outcome = AssertUnwindSafe(async move { body(session).await })
            .catch_unwind()
            .await;
        self.close().await;

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!("Session body panicked; instrument was shut down");
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Open a session from `settings`, run `body`, and always tear down.
    pub async fn scoped<F, Fut, T>(settings: Settings, body: F) -> anyhow::Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let session = Self::open(settings).await?;
        session.run_scoped(body).await
    }
}
