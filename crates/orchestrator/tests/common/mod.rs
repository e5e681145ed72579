// Shared fixtures for orchestrator integration tests

#![allow(dead_code)]

use std::time::Duration;

use conductor_core::{ConductorConfig, Result};
use conductor_orchestrator::{ControlPlane, NodeDetails, SimulatedCluster, Universe};
use conductor_orchestrator::tasks::NodeSpec;

pub type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

/// Short waits so stalled checks time out quickly.
pub fn fast_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.wait.poll_interval = Duration::from_millis(5);
    config.wait.timeout = Duration::from_millis(250);
    config
}

/// A control plane over in-memory stores and a healthy simulated cluster.
pub fn plane() -> (ControlPlane, SimulatedCluster) {
    ControlPlane::simulated(&fast_config())
}

/// Store a three-master universe and return it.
pub async fn add_universe(plane: &ControlPlane, name: &str) -> Result<Universe> {
    let universe = Universe::new(
        name,
        vec![
            NodeDetails::new("n1", "az1").master(),
            NodeDetails::new("n2", "az2").master(),
            NodeDetails::new("n3", "az3").master(),
        ],
    );
    plane.services().universes.put(universe.clone()).await?;
    Ok(universe)
}

/// Current record of a universe.
pub async fn universe(plane: &ControlPlane, uuid: uuid::Uuid) -> Result<Universe> {
    plane
        .services()
        .universes
        .get(uuid)
        .await?
        .ok_or_else(|| conductor_core::Error::not_found("universe", uuid.to_string()))
}

pub fn node(name: &str, is_master: bool) -> NodeSpec {
    NodeSpec {
        name: name.into(),
        zone: "az1".into(),
        is_master,
    }
}
