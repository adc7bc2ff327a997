//! Simulated Fabric
//!
//! A SAS domain held entirely in memory, used by the CLI's dry runs and by
//! tests in place of a host bus adapter.

pub mod fabric;
pub mod submitter;

pub use fabric::{FabricSpec, SimAtaCapabilities, SimDevice, SimDeviceKind, SimExpander, SimPhy};
pub use submitter::{ProgrammedRoute, RequestRecord, SimulatedFabric};

use crate::domain::ports::{MappingLayer, SessionReport};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Mapping layer that keeps every report it is handed
#[derive(Debug, Default)]
pub struct RecordingMappingLayer {
    reports: Mutex<Vec<SessionReport>>,
}

impl RecordingMappingLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<SessionReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl MappingLayer for RecordingMappingLayer {
    async fn on_session_complete(&self, report: &SessionReport) -> Result<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}
