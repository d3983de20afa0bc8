//! JSON workload ingest, for fresh workloads and for simulator-level
//! snapshots re-loaded through the same path.

use serde_json::{json, Value};

use crate::errors::ConfigError;
use crate::interval_set::IntervalSet;
use crate::jobs::{
    CheckpointKnobs, Job, JobIdentifier, JobPurpose, JobState, RestoreBundle,
};
use crate::workload::Workload;

/// Header carried by snapshot workloads on top of the regular schema.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckpointHeader {
    pub nb_checkpoint: u32,
    pub nb_original_jobs: u32,
    pub nb_actually_completed: u32,
}

pub fn read_document(path: &str) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Json {
        path: path.to_string(),
        detail: e.to_string(),
    })
}

impl Workload {
    pub fn load_from_json(&mut self, doc: &Value, source: &str) -> Result<(), ConfigError> {
        self.load_common(doc, source, None)
    }

    /// Loads a snapshot workload: job names receive a `$<nb_checkpoint>`
    /// suffix and the per-job restore bundle is populated.
    pub fn load_from_json_checkpoint(
        &mut self,
        doc: &Value,
        source: &str,
    ) -> Result<CheckpointHeader, ConfigError> {
        let header = CheckpointHeader {
            nb_checkpoint: read_u32(doc, "nb_checkpoint", source)?,
            nb_original_jobs: read_u32(doc, "nb_original_jobs", source)?,
            nb_actually_completed: read_u32(doc, "nb_actually_completed", source)?,
        };
        self.load_common(doc, source, Some(header.nb_checkpoint))?;
        Ok(header)
    }

    fn load_common(
        &mut self,
        doc: &Value,
        source: &str,
        checkpoint_gen: Option<u32>,
    ) -> Result<(), ConfigError> {
        let error_prefix = format!("Invalid JSON file '{}'", source);
        if !doc.is_object() {
            return Err(ConfigError::schema(format!("{}: not a JSON object", error_prefix)));
        }

        let nb_res = doc
            .get("nb_res")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                ConfigError::schema(format!("{}: the 'nb_res' field is missing", error_prefix))
            })?;
        if nb_res <= 0 {
            return Err(ConfigError::schema(format!(
                "{}: the value of the 'nb_res' field is invalid ({})",
                error_prefix, nb_res
            )));
        }
        self.nb_res = nb_res as u32;

        self.profiles.load_from_json(doc, source)?;

        let jobs = doc
            .get("jobs")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ConfigError::schema(format!("{}: the 'jobs' array is missing", error_prefix))
            })?
            .clone();
        for desc in &jobs {
            let job = self.job_from_json(desc, &error_prefix, checkpoint_gen)?;
            self.jobs.add(job)?;
        }
        Ok(())
    }

    pub fn job_from_json(
        &self,
        desc: &Value,
        error_prefix: &str,
        checkpoint_gen: Option<u32>,
    ) -> Result<Job, ConfigError> {
        let obj = desc
            .as_object()
            .ok_or_else(|| ConfigError::schema(format!("{}: one job is not an object", error_prefix)))?;

        let id_value = obj
            .get("id")
            .ok_or_else(|| ConfigError::schema(format!("{}: one job has no 'id' field", error_prefix)))?;
        let id_str = match id_value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => {
                return Err(ConfigError::schema(format!(
                    "{}: one job id field is invalid, it should be a string or an integer",
                    error_prefix
                )))
            }
        };
        let id = if id_str.contains('!') {
            let id: JobIdentifier = id_str.parse()?;
            if id.workload_name() != self.name {
                return Err(ConfigError::schema(format!(
                    "{}: job '{}' does not belong to workload '{}'",
                    error_prefix, id_str, self.name
                )));
            }
            id
        } else {
            JobIdentifier::new(&self.name, id_str.parse()?)?
        };
        let id = match checkpoint_gen {
            Some(gen) => JobIdentifier::new(&self.name, id.local().clone().with_checkpoint(gen))?,
            None => id,
        };

        let submission_time = obj
            .get("subtime")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                ConfigError::schema(format!("{}: job '{}' has no 'subtime' field", error_prefix, id))
            })?;

        let submission_times = match obj.get("submission_times") {
            Some(Value::Array(times)) => times
                .iter()
                .map(|t| {
                    t.as_f64().ok_or_else(|| {
                        ConfigError::schema(format!(
                            "{}: job '{}' has a non-number entry in 'submission_times'",
                            error_prefix, id
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(ConfigError::schema(format!(
                    "{}: the 'submission_times' member of job '{}' is not an array",
                    error_prefix, id
                )))
            }
            None => vec![submission_time],
        };

        let walltime = match obj.get("walltime") {
            None => None,
            Some(v) => {
                let w = v.as_f64().ok_or_else(|| {
                    ConfigError::schema(format!(
                        "{}: job '{}' has a non-number 'walltime' field",
                        error_prefix, id
                    ))
                })?;
                if w == -1. {
                    None
                } else if w > 0. {
                    Some(w)
                } else {
                    return Err(ConfigError::schema(format!(
                        "{}: job '{}' has an invalid walltime ({}): it should either be -1 \
                         (no walltime) or a strictly positive number",
                        error_prefix, id, w
                    )));
                }
            }
        };

        let requested_nb_res = obj
            .get("res")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ConfigError::schema(format!(
                    "{}: job '{}' has no integer 'res' field",
                    error_prefix, id
                ))
            })? as u32;

        let profile_name = obj
            .get("profile")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConfigError::schema(format!(
                    "{}: job '{}' has no string 'profile' field",
                    error_prefix, id
                ))
            })?;
        let profile = self
            .profiles
            .acquire(profile_name)
            .map_err(|_| {
                ConfigError::schema(format!(
                    "{}: the profile '{}' for job '{}' does not exist",
                    error_prefix, profile_name, id
                ))
            })?;

        let purpose = match obj.get("purpose").and_then(Value::as_str) {
            None | Some("job") => JobPurpose::Job,
            Some("reservation") => JobPurpose::Reservation,
            Some(other) => {
                return Err(ConfigError::schema(format!(
                    "{}: job '{}' has an invalid 'purpose' value '{}'",
                    error_prefix, id, other
                )))
            }
        };

        let mut start = obj.get("start").and_then(Value::as_f64);
        if let (Some(s), Some(order)) = (start, obj.get("order").and_then(Value::as_u64)) {
            if let Some(shift) = self.reservation_shifts.get(&(order as u32)) {
                let shifted = s + shift;
                if shifted <= 0. {
                    return Err(ConfigError::schema(format!(
                        "{}: job '{}' has a start time less than or equal to zero",
                        error_prefix, id
                    )));
                }
                start = Some(shifted);
            }
        }

        let future_allocation = match obj.get("alloc") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.parse::<IntervalSet>()?),
            Some(_) => {
                return Err(ConfigError::schema(format!(
                    "{}: job '{}' has a non-string 'alloc' field",
                    error_prefix, id
                )))
            }
        };

        let smpi_ranks_to_hosts_mapping = match obj.get("smpi_ranks_to_hosts_mapping") {
            None => Vec::new(),
            Some(Value::Array(ranks)) => {
                let mut mapping = Vec::with_capacity(ranks.len());
                for (rank, host) in ranks.iter().enumerate() {
                    let host = host.as_u64().ok_or_else(|| {
                        ConfigError::schema(format!(
                            "{}: job '{}' has a bad 'smpi_ranks_to_hosts_mapping' field: \
                             rank {} does not point to an integral number",
                            error_prefix, id, rank
                        ))
                    })? as u32;
                    if host >= requested_nb_res {
                        return Err(ConfigError::schema(format!(
                            "{}: job '{}' has a bad 'smpi_ranks_to_hosts_mapping' field: \
                             rank {} has an invalid value {}: should be in [0,{})",
                            error_prefix, id, rank, host, requested_nb_res
                        )));
                    }
                    mapping.push(host);
                }
                mapping
            }
            Some(_) => {
                return Err(ConfigError::schema(format!(
                    "{}: job '{}' has a non-array 'smpi_ranks_to_hosts_mapping' field",
                    error_prefix, id
                )))
            }
        };

        let checkpoint = CheckpointKnobs {
            interval: obj.get("checkpoint_interval").and_then(Value::as_f64),
            dump_time: obj.get("dumptime").and_then(Value::as_f64),
            read_time: obj.get("readtime").and_then(Value::as_f64),
        };

        let restore = if checkpoint_gen.is_some() {
            Some(read_restore_bundle(obj))
        } else {
            None
        };

        let mut json_description = desc.clone();
        json_description["id"] = json!(id.to_string());
        if json_description.get("submission_times").is_none() {
            json_description["submission_times"] = json!(submission_times.clone());
        }
        if json_description.get("purpose").is_none() {
            json_description["purpose"] = json!(purpose.as_str());
        }
        if let (None, Some(s)) = (desc.get("start"), start) {
            json_description["start"] = json!(s);
        }

        Ok(Job {
            id,
            profile,
            json_description,
            submission_time,
            walltime,
            original_walltime: obj.get("original_walltime").and_then(Value::as_f64).or(walltime),
            requested_nb_res,
            cores: obj.get("cores").and_then(Value::as_u64).unwrap_or(1) as u32,
            state: JobState::NotSubmitted,
            starting_time: None,
            runtime: None,
            allocation: None,
            future_allocation,
            return_code: None,
            consumed_energy: -1.,
            purpose,
            start,
            submission_times,
            jitter: obj.get("jitter").and_then(Value::as_str).map(str::to_string),
            metadata: obj.get("metadata").and_then(Value::as_str).map(str::to_string),
            checkpoint,
            restore,
            incoming_messages: Vec::new(),
            task: None,
            smpi_ranks_to_hosts_mapping,
            storage_mapping: None,
            kill_requested: false,
            from_workload: true,
        })
    }
}

fn read_restore_bundle(obj: &serde_json::Map<String, Value>) -> RestoreBundle {
    RestoreBundle {
        allocation: obj
            .get("allocation")
            .and_then(Value::as_str)
            .map(str::to_string),
        progress: obj.get("progress").and_then(Value::as_f64).unwrap_or(0.),
        state: obj
            .get("state")
            .and_then(Value::as_str)
            .and_then(JobState::from_wire_name),
        runtime: obj.get("runtime").and_then(Value::as_f64).unwrap_or(0.),
        consumed_energy: obj
            .get("consumed_energy")
            .and_then(Value::as_f64)
            .unwrap_or(-1.),
        jitter: obj.get("jitter").and_then(Value::as_str).map(str::to_string),
        original_submit: obj
            .get("original_submit")
            .and_then(Value::as_f64)
            .unwrap_or(-1.),
        original_start: obj
            .get("original_start")
            .and_then(Value::as_f64)
            .unwrap_or(-1.),
        original_walltime: obj.get("original_walltime").and_then(Value::as_f64),
        progress_time_cpu: obj
            .get("progressTimeCpu")
            .and_then(Value::as_f64)
            .unwrap_or(0.),
    }
}

fn read_u32(doc: &Value, field: &str, source: &str) -> Result<u32, ConfigError> {
    doc.get(field)
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .ok_or_else(|| {
            ConfigError::schema(format!(
                "Invalid JSON file '{}': the '{}' field is missing",
                source, field
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sim_config::CheckpointingConfig;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn workload() -> Workload {
        Workload::new_static(
            "w0",
            "test.json",
            1e9,
            CheckpointingConfig::default(),
            1.0,
            BTreeMap::new(),
        )
    }

    fn basic_doc() -> Value {
        json!({
            "nb_res": 4,
            "profiles": {
                "d10": {"type": "delay", "delay": 10.0}
            },
            "jobs": [
                {"id": 1, "subtime": 0.0, "res": 1, "walltime": 100.0, "profile": "d10"},
                {"id": 2, "subtime": 1.5, "res": 2, "profile": "d10"}
            ]
        })
    }

    #[test]
    fn loads_jobs_and_profiles() {
        let mut w = workload();
        w.load_from_json(&basic_doc(), "test.json").unwrap();
        assert_eq!(w.nb_res, 4);
        assert_eq!(w.jobs.len(), 2);
        let job = w.jobs.get(&"w0!1".parse().unwrap()).unwrap();
        let job = job.borrow();
        assert_eq!(job.walltime, Some(100.));
        assert_eq!(job.profile.name, "d10");
        assert_eq!(job.json_description["id"], json!("w0!1"));
        assert_eq!(job.submission_times, vec![0.0]);
        assert_eq!(job.profile.references(), 2);
    }

    #[test]
    fn rejects_missing_nb_res_and_unknown_profile() {
        let mut w = workload();
        let doc = json!({"profiles": {}, "jobs": []});
        assert!(w.load_from_json(&doc, "t").is_err());

        let mut w = workload();
        let doc = json!({
            "nb_res": 1,
            "profiles": {},
            "jobs": [{"id": 1, "subtime": 0.0, "res": 1, "profile": "nope"}]
        });
        assert!(w.load_from_json(&doc, "t").is_err());
    }

    #[test]
    fn rejects_duplicate_job_ids() {
        let mut w = workload();
        let doc = json!({
            "nb_res": 1,
            "profiles": {"d": {"type": "delay", "delay": 1.0}},
            "jobs": [
                {"id": 1, "subtime": 0.0, "res": 1, "profile": "d"},
                {"id": 1, "subtime": 1.0, "res": 1, "profile": "d"}
            ]
        });
        assert!(w.load_from_json(&doc, "t").is_err());
    }

    #[test]
    fn rejects_zero_walltime() {
        let mut w = workload();
        let doc = json!({
            "nb_res": 1,
            "profiles": {"d": {"type": "delay", "delay": 1.0}},
            "jobs": [{"id": 1, "subtime": 0.0, "res": 1, "walltime": 0.0, "profile": "d"}]
        });
        assert!(w.load_from_json(&doc, "t").is_err());
    }

    #[test]
    fn checkpoint_load_suffixes_ids_and_reads_restore_data() {
        let mut w = workload();
        let doc = json!({
            "nb_res": 4,
            "nb_checkpoint": 2,
            "nb_original_jobs": 5,
            "nb_actually_completed": 3,
            "profiles": {"d$": {"type": "delay", "delay": 6.0, "original_delay": 10.0}},
            "jobs": [{
                "id": "1", "subtime": 0.0, "res": 1, "profile": "d$",
                "allocation": "0", "progress": 0.4, "state": "RUNNING",
                "runtime": 4.0, "original_submit": 0.0, "original_start": 0.0,
                "original_walltime": 100.0, "progressTimeCpu": 0.0
            }]
        });
        let header = w.load_from_json_checkpoint(&doc, "t").unwrap();
        assert_eq!(header.nb_checkpoint, 2);
        assert_eq!(header.nb_actually_completed, 3);
        let job = w.jobs.get(&"w0!1$2".parse().unwrap()).unwrap();
        let job = job.borrow();
        let restore = job.restore.as_ref().unwrap();
        assert_eq!(restore.progress, 0.4);
        assert_eq!(restore.state, Some(JobState::Running));
        assert_eq!(restore.original_walltime, Some(100.0));
    }

    #[test]
    fn reservation_shift_applies_by_order() {
        let mut shifts = BTreeMap::new();
        shifts.insert(0, 5.0);
        let mut w = Workload::new_static(
            "w0",
            "t",
            1e9,
            CheckpointingConfig::default(),
            1.0,
            shifts,
        );
        let doc = json!({
            "nb_res": 2,
            "profiles": {"d": {"type": "delay", "delay": 1.0}},
            "jobs": [{
                "id": 1, "subtime": 0.0, "res": 1, "profile": "d",
                "purpose": "reservation", "start": 10.0, "order": 0, "alloc": "0-1"
            }]
        });
        w.load_from_json(&doc, "t").unwrap();
        let job = w.jobs.get(&"w0!1".parse().unwrap()).unwrap();
        let job = job.borrow();
        assert_eq!(job.start, Some(15.0));
        assert_eq!(job.purpose, JobPurpose::Reservation);
        assert_eq!(job.future_allocation.as_ref().unwrap().to_string(), "0-1");
    }
}
