//! End-to-end scenarios driving the full simulation loop against scripted
//! in-process schedulers.

mod common;

use serde_json::{json, Value};

use batsim::BatsimSimulation;
use common::{config_for, events_of_type, new_log, scripted_link, submitted_job_ids};
use dslab_core::Simulation;

fn delay_workload(walltime: f64) -> Value {
    json!({
        "nb_res": 4,
        "profiles": {
            "d10": {"type": "delay", "delay": 10.0}
        },
        "jobs": [
            {"id": 1, "subtime": 0.0, "res": 1, "walltime": walltime, "profile": "d10"}
        ]
    })
}

fn execute_on_submit(message: &Value, alloc: &str) -> Vec<Value> {
    submitted_job_ids(message)
        .into_iter()
        .map(|job_id| {
            json!({
                "timestamp": message["now"],
                "type": "EXECUTE_JOB",
                "data": {"job_id": job_id, "alloc": alloc},
            })
        })
        .collect()
}

#[test]
fn delay_job_runs_to_completion() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(tmp.path(), &delay_workload(100.0));
    let log = new_log();
    let link = scripted_link(log.clone(), |msg| execute_on_submit(msg, "0"));

    let mut simulation = BatsimSimulation::new(Simulation::new(42), config, link).unwrap();
    simulation.run();

    assert_eq!(simulation.time(), 10.0);

    let completed = events_of_type(&log, "JOB_COMPLETED");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["timestamp"], json!(10.0));
    assert_eq!(completed[0]["data"]["job_id"], json!("w0!1"));
    assert_eq!(completed[0]["data"]["job_state"], json!("COMPLETED_SUCCESSFULLY"));
    assert_eq!(completed[0]["data"]["alloc"], json!("0"));
    assert_eq!(events_of_type(&log, "SIMULATION_ENDS").len(), 1);

    let csv = std::fs::read_to_string(tmp.path().join("out_jobs.csv")).unwrap();
    let row = csv.lines().nth(1).expect("one job row");
    assert!(row.contains("w0!1"));
    assert!(row.contains("10.000000"));
}

#[test]
fn walltime_kills_the_job_at_the_deadline() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(tmp.path(), &delay_workload(5.0));
    let log = new_log();
    let link = scripted_link(log.clone(), |msg| execute_on_submit(msg, "0"));

    let mut simulation = BatsimSimulation::new(Simulation::new(42), config, link).unwrap();
    simulation.run();

    assert_eq!(simulation.time(), 5.0);
    let completed = events_of_type(&log, "JOB_COMPLETED");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["timestamp"], json!(5.0));
    assert_eq!(
        completed[0]["data"]["job_state"],
        json!("COMPLETED_WALLTIME_REACHED")
    );
}

#[test]
fn call_me_later_fires_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(tmp.path(), &delay_workload(100.0));
    let log = new_log();
    let link = scripted_link(log.clone(), |msg| {
        let mut events = execute_on_submit(msg, "0");
        if !events.is_empty() {
            events.push(json!({
                "timestamp": msg["now"],
                "type": "CALL_ME_LATER",
                "data": {"timestamp": 42.0, "id": 7, "forWhat": 5},
            }));
        }
        events
    });

    let mut simulation = BatsimSimulation::new(Simulation::new(42), config, link).unwrap();
    simulation.run();

    assert_eq!(simulation.time(), 42.0);
    let calls = events_of_type(&log, "REQUESTED_CALL");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["timestamp"], json!(42.0));
    assert_eq!(calls[0]["data"]["id"], json!(7));
    assert_eq!(calls[0]["data"]["forWhat"], json!(5));
}

#[test]
fn kill_reports_progress_at_the_kill_instant() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_for(tmp.path(), &delay_workload(100.0));
    let log = new_log();
    let link = scripted_link(log.clone(), |msg| {
        let mut events = execute_on_submit(msg, "0");
        if !events.is_empty() {
            events.push(json!({
                "timestamp": msg["now"],
                "type": "CALL_ME_LATER",
                "data": {"timestamp": 4.0, "id": 1, "forWhat": 1},
            }));
        }
        let requested = msg["events"]
            .as_array()
            .into_iter()
            .flatten()
            .any(|e| e["type"] == "REQUESTED_CALL");
        if requested {
            events.push(json!({
                "timestamp": msg["now"],
                "type": "KILL_JOB",
                "data": {"job_msgs": [{"id": "w0!1", "forWhat": 1}]},
            }));
        }
        events
    });

    let mut simulation = BatsimSimulation::new(Simulation::new(42), config, link).unwrap();
    simulation.run();

    let killed = events_of_type(&log, "JOB_KILLED");
    assert_eq!(killed.len(), 1);
    assert_eq!(killed[0]["timestamp"], json!(4.0));
    assert_eq!(killed[0]["data"]["job_ids"], json!(["w0!1"]));
    let msg = &killed[0]["data"]["job_msgs"][0];
    assert_eq!(msg["forWhat"], json!(1));
    let progress = msg["job_progress"]["progress"].as_f64().unwrap();
    assert!((progress - 0.4).abs() < 1e-9, "progress was {}", progress);

    let completed = events_of_type(&log, "JOB_COMPLETED");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["data"]["job_state"], json!("COMPLETED_KILLED"));
}

#[test]
fn checkpoint_round_trip_resumes_and_matches_the_continuous_run() {
    let tmp = tempfile::tempdir().unwrap();

    // Continuous run, with a snapshot taken at t=4.
    let config = config_for(tmp.path(), &delay_workload(100.0));
    let log = new_log();
    let mut checkpointed = false;
    let link = scripted_link(log.clone(), move |msg| {
        let mut events = execute_on_submit(msg, "0");
        if !events.is_empty() {
            events.push(json!({
                "timestamp": msg["now"],
                "type": "CALL_ME_LATER",
                "data": {"timestamp": 4.0, "id": 1, "forWhat": 5},
            }));
        }
        let requested = msg["events"]
            .as_array()
            .into_iter()
            .flatten()
            .any(|e| e["type"] == "REQUESTED_CALL" && e["data"]["id"] == json!(1));
        if requested && !checkpointed {
            checkpointed = true;
            events.push(json!({
                "timestamp": msg["now"],
                "type": "NOTIFY",
                "data": {"type": "checkpoint"},
            }));
        }
        events
    });

    let mut simulation = BatsimSimulation::new(Simulation::new(42), config, link).unwrap();
    simulation.run();
    assert_eq!(simulation.time(), 10.0);

    let snapshot_dir = tmp.path().join("checkpoint_1");
    assert!(snapshot_dir.join("workload.json").exists());
    assert!(snapshot_dir.join("batsim_variables.chkpt").exists());

    // Resumed run from the snapshot.
    let mut resumed_config = config_for(tmp.path(), &delay_workload(100.0));
    resumed_config.export_prefix = tmp.path().join("out2").to_string_lossy().to_string();
    resumed_config.start_from_checkpoint = Some(1);
    let resumed_log = new_log();
    let resumed_link = scripted_link(resumed_log.clone(), |msg| execute_on_submit(msg, "0"));

    let mut resumed = BatsimSimulation::new(Simulation::new(42), resumed_config, resumed_link).unwrap();
    resumed.run();

    // the job resumes at the snapshot instant and still finishes at t=10
    assert_eq!(resumed.time(), 10.0);
    let submitted: Vec<String> = resumed_log
        .borrow()
        .iter()
        .flat_map(submitted_job_ids)
        .collect();
    assert_eq!(submitted, vec!["w0!1$1".to_string()]);

    let original_csv = std::fs::read_to_string(tmp.path().join("out_jobs.csv")).unwrap();
    let resumed_csv = std::fs::read_to_string(tmp.path().join("out2_jobs.csv")).unwrap();
    assert_eq!(
        original_csv.lines().nth(1).unwrap(),
        resumed_csv.lines().nth(1).unwrap(),
        "the resumed run's job row must match the continuous run's"
    );
}

#[test]
fn dynamic_registration_executes_a_scheduler_made_job() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config_for(tmp.path(), &delay_workload(100.0));
    config.dynamic_registration_enabled = true;
    config.ack_dynamic_registration = true;

    let log = new_log();
    let mut registered = false;
    let link = scripted_link(log.clone(), move |msg| {
        let mut events = Vec::new();
        for job_id in submitted_job_ids(msg) {
            let alloc = if job_id.starts_with("dyn!") { "1" } else { "0" };
            events.push(json!({
                "timestamp": msg["now"],
                "type": "EXECUTE_JOB",
                "data": {"job_id": job_id, "alloc": alloc},
            }));
        }
        let static_done = msg["events"]
            .as_array()
            .into_iter()
            .flatten()
            .any(|e| e["type"] == "JOB_COMPLETED" && e["data"]["job_id"] == json!("w0!1"));
        if static_done && !registered {
            registered = true;
            events.push(json!({
                "timestamp": msg["now"],
                "type": "REGISTER_PROFILE",
                "data": {
                    "workload_name": "dyn",
                    "profile_name": "d2",
                    "profile": {"type": "delay", "delay": 2.0},
                },
            }));
            events.push(json!({
                "timestamp": msg["now"],
                "type": "REGISTER_JOB",
                "data": {
                    "job_id": "dyn!9",
                    "job": {"id": "9", "subtime": 10.0, "res": 1, "profile": "d2"},
                },
            }));
            events.push(json!({
                "timestamp": msg["now"],
                "type": "NOTIFY",
                "data": {"type": "registration_finished"},
            }));
        }
        events
    });

    let mut simulation = BatsimSimulation::new(Simulation::new(42), config, link).unwrap();
    simulation.run();

    assert_eq!(simulation.time(), 12.0);
    let completed = events_of_type(&log, "JOB_COMPLETED");
    assert_eq!(completed.len(), 2);
    assert_eq!(completed[1]["data"]["job_id"], json!("dyn!9"));
    assert_eq!(completed[1]["timestamp"], json!(12.0));
}
