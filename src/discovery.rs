//! Resource discovery and connection probing.
//!
//! Nothing here returns an error: every failure is folded into the report's
//! diagnostics so an operator can see why a resource did not show up.

use crate::transport::simulated::SIMULATED_RESOURCE;
use crate::transport::{DeviceTransport, TransportBackend};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What a backend could see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryReport {
    /// `None` for the simulated listing
    pub backend: Option<TransportBackend>,
    /// Resource addresses found
    pub resources: Vec<String>,
    /// Problems met while listing or probing
    pub diagnostics: Vec<String>,
}

/// Outcome of opening one resource and asking for its identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    /// Address that was probed
    pub resource: String,
    /// `*IDN?` response, if the instrument answered
    pub identity: Option<String>,
    /// Problems met while listing or probing
    pub diagnostics: Vec<String>,
}

impl ProbeReport {
    /// Whether the instrument answered the identity query
    pub fn is_reachable(&self) -> bool {
        self.identity.is_some()
    }
}

/// Enumerate resources visible through `backend`.
pub async fn list_resources(backend: TransportBackend) -> DiscoveryReport {
    let listing = tokio::task::spawn_blocking(move || match backend {
        TransportBackend::Visa => list_visa(),
        TransportBackend::Serial => list_serial(),
    })
    .await;

    let (resources, diagnostics) = match listing {
        Ok(found) => found,
        Err(e) => (Vec::new(), vec![format!("Discovery task failed: {}", e)]),
    };
    info!(
        "{} backend: {} resource(s) found",
        backend,
        resources.len()
    );
    DiscoveryReport {
        backend: Some(backend),
        resources,
        diagnostics,
    }
}

/// The single resource offered by the simulated instrument.
pub fn list_simulated() -> DiscoveryReport {
    DiscoveryReport {
        backend: None,
        resources: vec![SIMULATED_RESOURCE.to_string()],
        diagnostics: vec!["Simulation mode: no hardware is contacted".to_string()],
    }
}

#[cfg(feature = "instrument_visa")]
fn list_visa() -> (Vec<String>, Vec<String>) {
    use std::ffi::CString;
    use visa_rs::prelude::*;

    let mut resources = Vec::new();
    let mut diagnostics = Vec::new();

    let rm = match DefaultRM::new() {
        Ok(rm) => rm,
        Err(e) => {
            diagnostics.push(format!("VISA resource manager unavailable: {}", e));
            diagnostics.push("Check that a VISA library (e.g. NI-VISA) is installed".to_string());
            return (resources, diagnostics);
        }
    };

    let expr = match CString::new("?*INSTR") {
        Ok(expr) => expr,
        Err(e) => {
            diagnostics.push(format!("Invalid search expression: {}", e));
            return (resources, diagnostics);
        }
    };

    match rm.find_res_list(&expr.into()) {
        Ok(mut list) => loop {
            match list.find_next() {
                Ok(Some(id)) => resources.push(format!("{}", id)),
                Ok(None) => break,
                Err(e) => {
                    diagnostics.push(format!("VISA enumeration stopped early: {}", e));
                    break;
                }
            }
        },
        Err(e) => diagnostics.push(format!("No VISA resources found: {}", e)),
    }

    if resources.iter().all(|r| !r.starts_with("GPIB")) {
        diagnostics.push("No GPIB instruments visible; check the adapter driver".to_string());
    }
    (resources, diagnostics)
}

#[cfg(not(feature = "instrument_visa"))]
fn list_visa() -> (Vec<String>, Vec<String>) {
    (
        Vec::new(),
        vec!["VISA support not enabled. Rebuild with --features instrument_visa".to_string()],
    )
}

#[cfg(feature = "instrument_serial")]
fn list_serial() -> (Vec<String>, Vec<String>) {
    match serialport::available_ports() {
        Ok(ports) => {
            let resources: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
            let diagnostics = if resources.is_empty() {
                vec!["No serial ports detected".to_string()]
            } else {
                Vec::new()
            };
            (resources, diagnostics)
        }
        Err(e) => (
            Vec::new(),
            vec![format!("Serial port enumeration failed: {}", e)],
        ),
    }
}

#[cfg(not(feature = "instrument_serial"))]
fn list_serial() -> (Vec<String>, Vec<String>) {
    (
        Vec::new(),
        vec!["Serial support not enabled. Rebuild with --features instrument_serial".to_string()],
    )
}

/// Open `resource`, capture its identity, then close it again.
pub async fn probe(mut transport: Box<dyn DeviceTransport>, resource: &str) -> ProbeReport {
    let mut diagnostics = vec![format!("Using {}", transport.info())];
    debug!("Probing {}", resource);

    let identity = match transport.connect(resource).await {
        Ok(identity) => {
            diagnostics.push("Connection successful".to_string());
            Some(identity)
        }
        Err(e) => {
            warn!("Probe of {} failed: {:#}", resource, e);
            diagnostics.push(format!("Failed to connect: {:#}", e));
            None
        }
    };

    if let Err(e) = transport.close().await {
        diagnostics.push(format!("Close failed: {:#}", e));
    }

    ProbeReport {
        resource: resource.to_string(),
        identity,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockCall, MockTransport, SimulatedTransport};

    #[test]
    fn test_simulated_listing() {
        let report = list_simulated();
        assert_eq!(report.resources, vec![SIMULATED_RESOURCE.to_string()]);
        assert!(report.backend.is_none());
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_disabled_visa_is_a_diagnostic() {
        let report = list_resources(TransportBackend::Visa).await;
        assert!(report.resources.is_empty());
        assert!(report.diagnostics[0].contains("instrument_visa"));
    }

    #[tokio::test]
    async fn test_probe_reports_identity_and_closes() {
        let mock = MockTransport::new();
        let report = probe(Box::new(mock.clone()), "GPIB0::24::INSTR").await;
        assert!(report.is_reachable());
        assert_eq!(mock.call_log().last(), Some(&MockCall::Close));
    }

    #[tokio::test]
    async fn test_probe_failure_is_a_diagnostic() {
        let mock = MockTransport::new();
        mock.fail_connect();
        let report = probe(Box::new(mock), "GPIB0::99::INSTR").await;
        assert!(!report.is_reachable());
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.contains("Failed to connect")));
    }

    #[tokio::test]
    async fn test_probe_simulated() {
        let report = probe(
            Box::new(SimulatedTransport::new()),
            SIMULATED_RESOURCE,
        )
        .await;
        assert_eq!(
            report.identity.as_deref(),
            Some(crate::transport::simulated::SIMULATED_IDENTITY)
        );
    }
}
