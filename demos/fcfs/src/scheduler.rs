//! A minimal first-come-first-served scheduler speaking the decision
//! protocol in-process.

use std::collections::{HashMap, VecDeque};

use serde_json::{json, Value};

use batsim::IntervalSet;

struct PendingJob {
    id: String,
    res: u32,
}

pub struct FcfsScheduler {
    free_hosts: Vec<u32>,
    queue: VecDeque<PendingJob>,
    running: HashMap<String, Vec<u32>>,
}

impl FcfsScheduler {
    pub fn new() -> FcfsScheduler {
        FcfsScheduler {
            free_hosts: Vec::new(),
            queue: VecDeque::new(),
            running: HashMap::new(),
        }
    }

    pub fn handle(&mut self, message: &str) -> String {
        let doc: Value = serde_json::from_str(message).expect("simulator messages are valid JSON");
        let now = doc["now"].as_f64().expect("'now' is a number");

        for event in doc["events"].as_array().into_iter().flatten() {
            match event["type"].as_str().unwrap_or_default() {
                "SIMULATION_BEGINS" => {
                    let nb = event["data"]["nb_compute_resources"].as_u64().unwrap_or(0) as u32;
                    self.free_hosts = (0..nb).rev().collect();
                }
                "JOB_SUBMITTED" => {
                    let id = event["data"]["job_id"].as_str().unwrap_or_default().to_string();
                    let res = event["data"]["job"]["res"].as_u64().unwrap_or(1) as u32;
                    self.queue.push_back(PendingJob { id, res });
                }
                "JOB_COMPLETED" => {
                    let id = event["data"]["job_id"].as_str().unwrap_or_default();
                    if let Some(hosts) = self.running.remove(id) {
                        self.free_hosts.extend(hosts);
                    }
                }
                _ => {}
            }
        }

        let mut events = Vec::new();
        while let Some(job) = self.queue.front() {
            if (self.free_hosts.len() as u32) < job.res {
                break;
            }
            let job = self.queue.pop_front().expect("non-empty queue");
            let mut hosts = Vec::with_capacity(job.res as usize);
            for _ in 0..job.res {
                hosts.push(self.free_hosts.pop().expect("checked above"));
            }
            let alloc = IntervalSet::from_elements(hosts.clone()).to_string();
            self.running.insert(job.id.clone(), hosts);
            events.push(json!({
                "timestamp": now,
                "type": "EXECUTE_JOB",
                "data": { "job_id": job.id, "alloc": alloc },
            }));
        }

        json!({ "now": now, "events": events }).to_string()
    }
}
