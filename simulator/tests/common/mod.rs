use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use serde_json::Value;

use batsim::config::sim_config::{
    HostGroupConfig, HostRole, PlatformConfig, SimulationConfig, WorkloadDescription,
};
use batsim::{FnSchedulerLink, SchedulerLink};

pub fn platform(nb_hosts: u32) -> PlatformConfig {
    PlatformConfig {
        hosts: vec![HostGroupConfig {
            name: "node".to_string(),
            count: Some(nb_hosts),
            cores: 4,
            speed: 1e9,
            memory: None,
            role: HostRole::Compute,
            properties: Default::default(),
        }],
        network: None,
    }
}

pub fn config_for(dir: &Path, workload: &Value) -> SimulationConfig {
    let workload_path = dir.join("workload.json");
    std::fs::write(&workload_path, serde_json::to_string_pretty(workload).unwrap()).unwrap();

    let mut config = SimulationConfig::new(platform(4));
    config.export_prefix = dir.join("out").to_string_lossy().to_string();
    config.workloads = vec![WorkloadDescription {
        path: workload_path.to_string_lossy().to_string(),
        name: "w0".to_string(),
    }];
    config
}

pub type MessageLog = Rc<RefCell<Vec<Value>>>;

pub fn new_log() -> MessageLog {
    Rc::new(RefCell::new(Vec::new()))
}

/// An in-process scheduler: the handler sees each decoded message and
/// returns the reply events, stamped at the message's `now`.
pub fn scripted_link(
    log: MessageLog,
    mut handler: impl FnMut(&Value) -> Vec<Value> + 'static,
) -> Box<dyn SchedulerLink> {
    Box::new(FnSchedulerLink::new(move |message: &str| {
        let doc: Value = serde_json::from_str(message).expect("valid protocol message");
        log.borrow_mut().push(doc.clone());
        let events = handler(&doc);
        serde_json::json!({ "now": doc["now"], "events": events }).to_string()
    }))
}

pub fn events_of_type(log: &MessageLog, kind: &str) -> Vec<Value> {
    log.borrow()
        .iter()
        .flat_map(|msg| msg["events"].as_array().cloned().unwrap_or_default())
        .filter(|e| e["type"] == kind)
        .collect()
}

pub fn submitted_job_ids(message: &Value) -> Vec<String> {
    message["events"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|e| e["type"] == "JOB_SUBMITTED")
        .filter_map(|e| e["data"]["job_id"].as_str().map(str::to_string))
        .collect()
}
