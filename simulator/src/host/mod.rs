pub mod cluster_host;
pub mod process;

pub use cluster_host::ClusterHost;
pub use process::HostProcessInstance;

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::sim_config::HostRole;

/// Static description of one platform machine, surfaced to the scheduler in
/// `SIMULATION_BEGINS`.
#[derive(Clone, Debug, Serialize)]
pub struct MachineDescription {
    pub id: u32,
    pub name: String,
    pub state: String,
    pub core_count: u32,
    pub speed: f64,
    pub role: HostRole,
    pub properties: BTreeMap<String, String>,
    pub zone_properties: BTreeMap<String, String>,
}

impl MachineDescription {
    pub fn is_compute(&self) -> bool {
        self.role == HostRole::Compute
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "state": self.state,
            "core_count": self.core_count,
            "speed": self.speed,
            "properties": self.properties,
            "zone_properties": self.zone_properties,
        })
    }
}
