//! Encoder for simulator -> scheduler events. The writer owns a `last_date`
//! watchdog: outgoing timestamps must never regress within a batch.

use serde_json::{json, Map, Value};

use crate::host::MachineDescription;
use crate::interval_set::IntervalSet;
use crate::jobs::Job;
use crate::task_tree::ProgressSnapshot;
use crate::workload::Workloads;

/// One entry of a `JOB_KILLED` report.
#[derive(Clone, Debug)]
pub struct KilledJobReport {
    pub simple_id: String,
    pub for_what: i32,
    pub progress: Option<ProgressSnapshot>,
}

pub struct JsonProtocolWriter {
    events: Vec<Value>,
    last_date: f64,
    forward_profiles: bool,
}

impl JsonProtocolWriter {
    pub fn new(forward_profiles: bool) -> Self {
        JsonProtocolWriter {
            events: Vec::new(),
            last_date: 0.,
            forward_profiles,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn push(&mut self, date: f64, kind: &str, data: Value) {
        assert!(
            date >= self.last_date,
            "date inconsistency: {} is before the previous event date {}",
            date,
            self.last_date
        );
        self.last_date = date;
        self.events.push(json!({
            "timestamp": date,
            "type": kind,
            "data": data,
        }));
    }

    /// Serialises the pending batch and resets the writer for the next one.
    pub fn generate_message(&mut self, now: f64) -> String {
        assert!(now >= self.last_date, "date inconsistency on message generation");
        let message = json!({
            "now": now,
            "events": std::mem::take(&mut self.events),
        });
        serde_json::to_string(&message).expect("protocol message serialization")
    }

    pub fn append_simulation_begins(
        &mut self,
        machines: &[MachineDescription],
        workloads: &Workloads,
        config: &Value,
        allow_compute_sharing: bool,
        allow_storage_sharing: bool,
        redis_enabled: bool,
        date: f64,
    ) {
        let compute: Vec<Value> = machines
            .iter()
            .filter(|m| m.is_compute())
            .map(MachineDescription::to_json)
            .collect();
        let storage: Vec<Value> = machines
            .iter()
            .filter(|m| !m.is_compute())
            .map(MachineDescription::to_json)
            .collect();

        let mut workloads_dict = Map::new();
        let mut jobs_dict = Map::new();
        let mut profiles_dict = Map::new();
        for (name, workload) in workloads.iter() {
            workloads_dict.insert(name.clone(), json!(workload.file.clone()));
            if !redis_enabled {
                let jobs: Vec<Value> = workload
                    .jobs
                    .as_sorted_vec()
                    .iter()
                    .map(|j| j.borrow().json_description.clone())
                    .collect();
                jobs_dict.insert(name.clone(), Value::Array(jobs));
            }
            let mut profile_dict = Map::new();
            for (profile_name, profile) in workload.profiles.iter() {
                profile_dict.insert(profile_name.clone(), profile.json.borrow().clone());
            }
            profiles_dict.insert(name.clone(), Value::Object(profile_dict));
        }

        self.push(
            date,
            "SIMULATION_BEGINS",
            json!({
                "nb_resources": machines.len(),
                "nb_compute_resources": compute.len(),
                "nb_storage_resources": storage.len(),
                "allow_compute_sharing": allow_compute_sharing,
                "allow_storage_sharing": allow_storage_sharing,
                "config": config,
                "compute_resources": compute,
                "storage_resources": storage,
                "workloads": workloads_dict,
                "jobs": jobs_dict,
                "profiles": profiles_dict,
            }),
        );
    }

    pub fn append_simulation_ends(&mut self, date: f64) {
        self.push(date, "SIMULATION_ENDS", json!({}));
    }

    pub fn append_job_submitted(&mut self, job: &Job, redis_enabled: bool, date: f64) {
        let mut data = Map::new();
        data.insert("job_id".to_string(), json!(job.id.to_string()));

        if !redis_enabled {
            let mut job_json = job.json_description.clone();
            let restore = job.restore.clone().unwrap_or_default();
            if job_json.get("original_submit").is_none() {
                job_json["original_submit"] = json!(restore.original_submit);
            }
            if job_json.get("original_start").is_none() {
                job_json["original_start"] = json!(restore.original_start);
            }
            if job_json.get("original_walltime").is_none() {
                job_json["original_walltime"] =
                    json!(job.original_walltime.or(restore.original_walltime).unwrap_or(-1.));
            }
            job_json["checkpoint_job_data"] = json!({
                "allocation": restore.allocation,
                "consumed_energy": restore.consumed_energy,
                "jitter": restore.jitter.unwrap_or_default(),
                "progress": restore.progress,
                "state": restore.state.map(|s| s.wire_name().to_string()),
                "runtime": restore.runtime,
                "progressTimeCpu": restore.progress_time_cpu,
            });
            data.insert("job".to_string(), job_json);

            if self.forward_profiles {
                data.insert("profile".to_string(), job.profile.json.borrow().clone());
            }
        }

        self.push(date, "JOB_SUBMITTED", Value::Object(data));
    }

    pub fn append_job_completed(
        &mut self,
        job_id: &str,
        job_state: &str,
        job_alloc: &str,
        return_code: i32,
        date: f64,
    ) {
        self.push(
            date,
            "JOB_COMPLETED",
            json!({
                "job_id": job_id,
                "job_state": job_state,
                "return_code": return_code,
                "alloc": job_alloc,
            }),
        );
    }

    pub fn append_job_killed(&mut self, reports: &[KilledJobReport], date: f64) {
        let job_ids: Vec<&str> = reports.iter().map(|r| r.simple_id.as_str()).collect();
        let job_msgs: Vec<Value> = reports
            .iter()
            .map(|r| {
                let mut msg = json!({
                    "id": r.simple_id,
                    "forWhat": r.for_what,
                });
                if let Some(progress) = &r.progress {
                    msg["job_progress"] = progress.to_json();
                }
                msg
            })
            .collect();
        self.push(
            date,
            "JOB_KILLED",
            json!({
                "job_ids": job_ids,
                "job_msgs": job_msgs,
            }),
        );
    }

    pub fn append_requested_call(&mut self, id: i64, for_what: i32, date: f64) {
        self.push(date, "REQUESTED_CALL", json!({"id": id, "forWhat": for_what}));
    }

    pub fn append_resource_state_changed(
        &mut self,
        resources: &IntervalSet,
        new_state: &str,
        date: f64,
    ) {
        self.push(
            date,
            "RESOURCE_STATE_CHANGED",
            json!({
                "resources": resources.to_string(),
                "state": new_state,
            }),
        );
    }

    pub fn append_answer_energy(&mut self, consumed_energy: f64, date: f64) {
        self.push(date, "ANSWER", json!({"consumed_energy": consumed_energy}));
    }

    pub fn append_query_estimate_waiting_time(&mut self, job_id: &str, job_json: &Value, date: f64) {
        self.push(
            date,
            "QUERY",
            json!({
                "requests": {
                    "estimate_waiting_time": {
                        "job_id": job_id,
                        "job": job_json,
                    }
                }
            }),
        );
    }

    pub fn append_notify(&mut self, notify_type: &str, date: f64) {
        self.push(date, "NOTIFY", json!({"type": notify_type}));
    }

    pub fn append_notify_resource_event(
        &mut self,
        notify_type: &str,
        resources: &IntervalSet,
        date: f64,
    ) {
        self.push(
            date,
            "NOTIFY",
            json!({
                "type": notify_type,
                "resources": resources.to_string(),
            }),
        );
    }

    pub fn append_notify_job_fault(&mut self, notify_type: &str, job_id: &str, date: f64) {
        self.push(
            date,
            "NOTIFY",
            json!({
                "type": notify_type,
                "job": job_id,
            }),
        );
    }

    pub fn append_notify_generic(&mut self, data: Value, date: f64) {
        self.push(date, "NOTIFY", data);
    }

    pub fn append_from_job_message(&mut self, job_id: &str, message: &Value, date: f64) {
        self.push(
            date,
            "FROM_JOB_MSG",
            json!({
                "job_id": job_id,
                "msg": message,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batches_render_now_and_ordered_events() {
        let mut writer = JsonProtocolWriter::new(false);
        writer.append_requested_call(1, 0, 4.0);
        writer.append_notify("no_more_static_job_to_submit", 5.0);
        assert!(!writer.is_empty());

        let message = writer.generate_message(6.0);
        let doc: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(doc["now"], json!(6.0));
        let events = doc["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "REQUESTED_CALL");
        assert_eq!(events[0]["data"]["forWhat"], 0);
        assert_eq!(events[1]["data"]["type"], "no_more_static_job_to_submit");
        assert!(writer.is_empty());
    }

    #[test]
    #[should_panic(expected = "date inconsistency")]
    fn rejects_date_regression() {
        let mut writer = JsonProtocolWriter::new(false);
        writer.append_requested_call(1, 0, 4.0);
        writer.append_requested_call(2, 0, 3.0);
    }

    #[test]
    fn job_killed_embeds_progress_trees() {
        use crate::task_tree::{ProgressDetail, ProgressSnapshot};
        let mut writer = JsonProtocolWriter::new(false);
        writer.append_job_killed(
            &[
                KilledJobReport {
                    simple_id: "w0!1".to_string(),
                    for_what: 2,
                    progress: Some(ProgressSnapshot {
                        profile_name: "d10".to_string(),
                        detail: ProgressDetail::Leaf { progress: Some(0.52) },
                    }),
                },
                KilledJobReport {
                    simple_id: "w0!2".to_string(),
                    for_what: 0,
                    progress: None,
                },
            ],
            8.0,
        );
        let message = writer.generate_message(8.0);
        let doc: Value = serde_json::from_str(&message).unwrap();
        let data = &doc["events"][0]["data"];
        assert_eq!(data["job_ids"], json!(["w0!1", "w0!2"]));
        assert_eq!(data["job_msgs"][0]["job_progress"]["progress"], json!(0.52));
        assert!(data["job_msgs"][1].get("job_progress").is_none());
    }

    #[test]
    fn notify_and_query_variants_render() {
        let mut writer = JsonProtocolWriter::new(false);
        let resources: crate::interval_set::IntervalSet = "0 5-8".parse().unwrap();
        writer.append_notify_resource_event("event_resource_available", &resources, 1.0);
        writer.append_notify_job_fault("job_fault", "w0!3", 2.0);
        writer.append_notify_generic(json!({"type": "vendor_specific", "level": 3}), 3.0);
        writer.append_from_job_message("w0!1", &json!({"k": "v"}), 4.0);
        writer.append_query_estimate_waiting_time("wf!p17", &json!({"res": 1, "walltime": 12.0}), 5.0);
        writer.append_answer_energy(12500.0, 6.0);
        writer.append_resource_state_changed(&resources, "42", 7.0);

        let message = writer.generate_message(7.0);
        let doc: Value = serde_json::from_str(&message).unwrap();
        let events = doc["events"].as_array().unwrap();
        assert_eq!(events[0]["data"]["resources"], json!("0 5-8"));
        assert_eq!(events[1]["data"]["job"], json!("w0!3"));
        assert_eq!(events[2]["data"]["level"], json!(3));
        assert_eq!(events[3]["type"], "FROM_JOB_MSG");
        assert_eq!(
            events[4]["data"]["requests"]["estimate_waiting_time"]["job_id"],
            json!("wf!p17")
        );
        assert_eq!(events[5]["data"]["consumed_energy"], json!(12500.0));
        assert_eq!(events[6]["type"], "RESOURCE_STATE_CHANGED");
        assert_eq!(events[6]["data"]["state"], json!("42"));
    }

    #[test]
    fn timestamps_keep_full_precision() {
        let mut writer = JsonProtocolWriter::new(false);
        let date = 1234.567890123456;
        writer.append_requested_call(1, 0, date);
        let message = writer.generate_message(date);
        let doc: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(doc["events"][0]["timestamp"].as_f64().unwrap(), date);
    }
}
