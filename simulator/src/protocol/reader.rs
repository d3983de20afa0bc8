//! Decoder for scheduler replies. Every schema violation is reported with
//! the index of the offending event; all of them are fatal to the run.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::ProtocolError;
use crate::interval_set::IntervalSet;
use crate::jobs::{JobIdentifier, JobState};
use crate::protocol::messages::{
    ExecuteJobCommand, IoOverlay, KillRequest, MetricKind, SchedulerCommand, SchedulerReply,
    TimedCommand,
};

pub struct JsonProtocolReader {
    pub registration_enabled: bool,
    pub redis_enabled: bool,
}

impl JsonProtocolReader {
    pub fn new(registration_enabled: bool, redis_enabled: bool) -> Self {
        JsonProtocolReader {
            registration_enabled,
            redis_enabled,
        }
    }

    /// Parses one full reply. `registration_finished` is the flag value
    /// before this reply; a `NOTIFY registration_finished` inside the reply
    /// forbids later `REGISTER_*` events of the same batch.
    pub fn parse_message(
        &self,
        message: &str,
        mut registration_finished: bool,
    ) -> Result<SchedulerReply, ProtocolError> {
        let doc: Value = serde_json::from_str(message)
            .map_err(|e| ProtocolError::Parse(format!("could not be parsed: {}", e)))?;
        if !doc.is_object() {
            return Err(ProtocolError::Parse("not a JSON object".to_string()));
        }
        let now = doc
            .get("now")
            .and_then(Value::as_f64)
            .ok_or_else(|| ProtocolError::Parse("the 'now' value should be a number".to_string()))?;
        let events = doc
            .get("events")
            .and_then(Value::as_array)
            .ok_or_else(|| ProtocolError::Parse("the 'events' value should be an array".to_string()))?;

        let mut commands = Vec::with_capacity(events.len());
        let mut last_timestamp = f64::NEG_INFINITY;
        for (index, event) in events.iter().enumerate() {
            let timed = self.parse_event(index, event, now, &mut registration_finished)?;
            if timed.timestamp < last_timestamp {
                return Err(ProtocolError::schema(
                    index,
                    format!(
                        "timestamp {} is lower than the previous event timestamp {}",
                        timed.timestamp, last_timestamp
                    ),
                ));
            }
            last_timestamp = timed.timestamp;
            commands.push(timed);
        }
        Ok(SchedulerReply { now, commands })
    }

    fn parse_event(
        &self,
        index: usize,
        event: &Value,
        now: f64,
        registration_finished: &mut bool,
    ) -> Result<TimedCommand, ProtocolError> {
        let obj = object(index, event, "the event")?;
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_f64)
            .ok_or_else(|| ProtocolError::schema(index, "the 'timestamp' value should be a number"))?;
        if timestamp > now {
            return Err(ProtocolError::schema(
                index,
                format!("timestamp {} should be lower than or equal to now={}", timestamp, now),
            ));
        }
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::schema(index, "the 'type' value should be a string"))?;
        let data = obj
            .get("data")
            .ok_or_else(|| ProtocolError::schema(index, "the event should have a 'data' key"))?;

        let command = match kind {
            "REJECT_JOB" => SchedulerCommand::RejectJob {
                job_id: job_id_field(index, data, "job_id")?,
            },
            "EXECUTE_JOB" => self.parse_execute_job(index, data)?,
            "CHANGE_JOB_STATE" => self.parse_change_job_state(index, data)?,
            "CALL_ME_LATER" => self.parse_call_me_later(index, data)?,
            "KILL_JOB" => self.parse_kill_job(index, data)?,
            "REGISTER_JOB" => self.parse_register_job(index, data, *registration_finished)?,
            "REGISTER_PROFILE" => {
                self.parse_register_profile(index, data, *registration_finished)?
            }
            "SET_RESOURCE_STATE" => self.parse_set_resource_state(index, data)?,
            "SET_JOB_METADATA" => self.parse_set_job_metadata(index, data)?,
            "QUERY" => self.parse_query(index, data)?,
            "ANSWER" => self.parse_answer(index, data)?,
            "TO_JOB_MSG" => SchedulerCommand::ToJobMsg {
                job_id: job_id_field(index, data, "job_id")?,
                message: string_field(index, data, "msg")?,
            },
            "NOTIFY" => {
                let command = self.parse_notify(index, data)?;
                if matches!(command, SchedulerCommand::NotifyRegistrationFinished) {
                    *registration_finished = true;
                }
                command
            }
            other => {
                return Err(ProtocolError::UnknownEvent {
                    event: index,
                    ty: other.to_string(),
                })
            }
        };
        Ok(TimedCommand { timestamp, command })
    }

    fn parse_execute_job(&self, index: usize, data: &Value) -> Result<SchedulerCommand, ProtocolError> {
        let obj = object(index, data, "the 'data' value (EXECUTE_JOB)")?;
        let job_id = job_id_field(index, data, "job_id")?;
        let alloc = interval_set_field(index, data, "alloc")?;
        if alloc.is_empty() {
            return Err(ProtocolError::schema(
                index,
                "the number of allocated resources should be strictly positive",
            ));
        }

        let mapping = match obj.get("mapping") {
            None => None,
            Some(value) => {
                let map = object(index, value, "the 'mapping' value")?;
                if map.is_empty() {
                    return Err(ProtocolError::schema(
                        index,
                        "the 'mapping' object must be non-empty",
                    ));
                }
                let mut pairs: BTreeMap<u32, u32> = BTreeMap::new();
                for (key, value) in map {
                    let executor: u32 = key.parse().map_err(|_| {
                        ProtocolError::schema(index, "a 'mapping' key is not an integer")
                    })?;
                    let resource = match value {
                        Value::Number(n) => n.as_u64().map(|v| v as u32),
                        Value::String(s) => s.parse().ok(),
                        _ => None,
                    }
                    .ok_or_else(|| {
                        ProtocolError::schema(index, "a 'mapping' value is not an integer")
                    })?;
                    if resource >= alloc.size() {
                        return Err(ProtocolError::schema(
                            index,
                            format!(
                                "executor {} should use the {}-th resource within the allocation, \
                                 but there are only {} allocated resources",
                                executor,
                                resource,
                                alloc.size()
                            ),
                        ));
                    }
                    pairs.insert(executor, resource);
                }
                let mut mapping = Vec::with_capacity(pairs.len());
                for (expected, (executor, resource)) in pairs.into_iter().enumerate() {
                    if executor as usize != expected {
                        return Err(ProtocolError::schema(
                            index,
                            format!("no resource associated to executor {}", expected),
                        ));
                    }
                    mapping.push(resource);
                }
                Some(mapping)
            }
        };

        let storage_mapping = match obj.get("storage_mapping") {
            None => None,
            Some(value) => {
                let map = object(index, value, "the 'storage_mapping' value")?;
                if map.is_empty() {
                    return Err(ProtocolError::schema(
                        index,
                        "the 'storage_mapping' object must be non-empty",
                    ));
                }
                let mut mapping = BTreeMap::new();
                for (key, value) in map {
                    let host = value.as_u64().ok_or_else(|| {
                        ProtocolError::schema(index, "a 'storage_mapping' value is not an integer")
                    })? as u32;
                    mapping.insert(key.clone(), host);
                }
                Some(mapping)
            }
        };

        let io = match obj.get("additional_io_job") {
            None => None,
            Some(value) => {
                let io_obj = object(index, value, "the 'additional_io_job' value")?;
                let profile_name = string_field(index, value, "profile_name")?;
                let profile = io_obj.get("profile").cloned();
                if let Some(profile) = &profile {
                    if !profile.is_object() {
                        return Err(ProtocolError::schema(
                            index,
                            "['additional_io_job']['profile'] should be an object",
                        ));
                    }
                }
                let alloc = interval_set_field(index, value, "alloc")?;
                Some(IoOverlay {
                    profile_name,
                    profile,
                    alloc,
                })
            }
        };

        Ok(SchedulerCommand::ExecuteJob(ExecuteJobCommand {
            job_id,
            alloc,
            mapping,
            storage_mapping,
            io,
        }))
    }

    fn parse_change_job_state(
        &self,
        index: usize,
        data: &Value,
    ) -> Result<SchedulerCommand, ProtocolError> {
        let job_id = job_id_field(index, data, "job_id")?;
        let state_name = string_field(index, data, "job_state")?;
        let state = JobState::from_wire_name(&state_name).ok_or_else(|| {
            ProtocolError::schema(
                index,
                format!("['data']['job_state'] has an unknown value '{}'", state_name),
            )
        })?;
        Ok(SchedulerCommand::ChangeJobState { job_id, state })
    }

    fn parse_call_me_later(&self, index: usize, data: &Value) -> Result<SchedulerCommand, ProtocolError> {
        let obj = object(index, data, "the 'data' value (CALL_ME_LATER)")?;
        if obj.len() != 3 {
            return Err(ProtocolError::schema(
                index,
                format!("the 'data' value (CALL_ME_LATER) should be of size 3 (size={})", obj.len()),
            ));
        }
        let target_time = number_field(index, data, "timestamp")?;
        let id = number_field(index, data, "id")? as i64;
        let for_what = number_field(index, data, "forWhat")? as i32;
        Ok(SchedulerCommand::CallMeLater {
            id,
            for_what,
            target_time,
        })
    }

    fn parse_kill_job(&self, index: usize, data: &Value) -> Result<SchedulerCommand, ProtocolError> {
        let obj = object(index, data, "the 'data' value (KILL_JOB)")?;
        let msgs = match (obj.get("job_msgs"), obj.get("job_ids")) {
            (Some(Value::Array(msgs)), _) => {
                let mut requests = Vec::with_capacity(msgs.len());
                for msg in msgs {
                    let job_id = job_id_field(index, msg, "id")?;
                    let for_what = number_field(index, msg, "forWhat")? as i32;
                    requests.push(KillRequest { job_id, for_what });
                }
                requests
            }
            (None, Some(Value::Array(ids))) => {
                let mut requests = Vec::with_capacity(ids.len());
                for id in ids {
                    let id_str = id.as_str().ok_or_else(|| {
                        ProtocolError::schema(index, "a 'job_ids' entry is not a string")
                    })?;
                    let job_id: JobIdentifier = id_str.parse().map_err(|e| {
                        ProtocolError::schema(index, format!("{}", e))
                    })?;
                    requests.push(KillRequest {
                        job_id,
                        for_what: super::messages::kill_types::NONE,
                    });
                }
                requests
            }
            _ => {
                return Err(ProtocolError::schema(
                    index,
                    "the 'data' value (KILL_JOB) should contain a 'job_msgs' array",
                ))
            }
        };
        if msgs.is_empty() {
            return Err(ProtocolError::schema(
                index,
                "the kill list (KILL_JOB) should be non-empty",
            ));
        }
        Ok(SchedulerCommand::KillJobs { requests: msgs })
    }

    fn parse_register_job(
        &self,
        index: usize,
        data: &Value,
        registration_finished: bool,
    ) -> Result<SchedulerCommand, ProtocolError> {
        self.check_registration(index, registration_finished)?;
        let job_id = job_id_field(index, data, "job_id")?;
        let description = match data.get("job") {
            Some(job) if job.is_object() => {
                if self.redis_enabled {
                    return Err(ProtocolError::schema(
                        index,
                        "(REGISTER_JOB) a 'job' object is given but the data storage is enabled",
                    ));
                }
                job.clone()
            }
            Some(_) => {
                return Err(ProtocolError::schema(
                    index,
                    "['data']['job'] should be an object",
                ))
            }
            None => {
                return Err(ProtocolError::schema(
                    index,
                    "(REGISTER_JOB) ['data']['job'] is unset but the data storage is disabled",
                ))
            }
        };
        Ok(SchedulerCommand::RegisterJob {
            job_id,
            description,
        })
    }

    fn parse_register_profile(
        &self,
        index: usize,
        data: &Value,
        registration_finished: bool,
    ) -> Result<SchedulerCommand, ProtocolError> {
        self.check_registration(index, registration_finished)?;
        let workload = string_field(index, data, "workload_name")?;
        let name = string_field(index, data, "profile_name")?;
        let profile = data
            .get("profile")
            .filter(|p| p.is_object())
            .cloned()
            .ok_or_else(|| {
                ProtocolError::schema(index, "['data']['profile'] should be an object")
            })?;
        Ok(SchedulerCommand::RegisterProfile {
            workload,
            name,
            profile,
        })
    }

    fn check_registration(&self, index: usize, finished: bool) -> Result<(), ProtocolError> {
        if !self.registration_enabled {
            return Err(ProtocolError::schema(
                index,
                "dynamic registration received but the option seems disabled",
            ));
        }
        if finished {
            return Err(ProtocolError::schema(
                index,
                "dynamic registration received after a 'registration_finished' notification",
            ));
        }
        Ok(())
    }

    fn parse_set_resource_state(
        &self,
        index: usize,
        data: &Value,
    ) -> Result<SchedulerCommand, ProtocolError> {
        let resources = interval_set_field(index, data, "resources")?;
        if resources.is_empty() {
            return Err(ProtocolError::schema(
                index,
                "the number of resources (SET_RESOURCE_STATE) should be strictly positive",
            ));
        }
        let state_str = string_field(index, data, "state")?;
        let state: i32 = state_str.parse().map_err(|_| {
            ProtocolError::schema(
                index,
                format!(
                    "the 'state' value should be a string corresponding to an integer (got '{}')",
                    state_str
                ),
            )
        })?;
        Ok(SchedulerCommand::SetResourceState { resources, state })
    }

    fn parse_set_job_metadata(
        &self,
        index: usize,
        data: &Value,
    ) -> Result<SchedulerCommand, ProtocolError> {
        let job_id = job_id_field(index, data, "job_id")?;
        let metadata = string_field(index, data, "metadata")?;
        if metadata.contains('"') {
            return Err(ProtocolError::schema(
                index,
                "the 'metadata' value should not contain double quotes",
            ));
        }
        Ok(SchedulerCommand::SetJobMetadata { job_id, metadata })
    }

    fn parse_query(&self, index: usize, data: &Value) -> Result<SchedulerCommand, ProtocolError> {
        let requests = data
            .get("requests")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ProtocolError::schema(index, "the 'data' value (QUERY) must have a 'requests' member")
            })?;
        if requests.len() != 1 {
            return Err(ProtocolError::schema(
                index,
                "the 'requests' object (QUERY) must contain exactly one request",
            ));
        }
        let (key, value) = requests.iter().next().expect("one request");
        match key.as_str() {
            "consumed_energy" => {
                if !value.as_object().map_or(false, |o| o.is_empty()) {
                    return Err(ProtocolError::schema(
                        index,
                        "the 'consumed_energy' request should be an empty object",
                    ));
                }
                Ok(SchedulerCommand::QueryConsumedEnergy)
            }
            other => Err(ProtocolError::schema(
                index,
                format!("request type '{}' is unknown", other),
            )),
        }
    }

    fn parse_answer(&self, index: usize, data: &Value) -> Result<SchedulerCommand, ProtocolError> {
        let obj = object(index, data, "the 'data' value (ANSWER)")?;
        let (key, value) = obj
            .iter()
            .next()
            .ok_or_else(|| ProtocolError::schema(index, "the 'data' object (ANSWER) must be non-empty"))?;
        match key.as_str() {
            "estimate_waiting_time" => Ok(SchedulerCommand::AnswerEstimateWaitingTime {
                job_id: string_field(index, value, "job_id")?,
                estimate: number_field(index, value, "estimated_waiting_time")?,
            }),
            other => Err(ProtocolError::schema(
                index,
                format!("unknown ANSWER type '{}'", other),
            )),
        }
    }

    fn parse_notify(&self, index: usize, data: &Value) -> Result<SchedulerCommand, ProtocolError> {
        let kind = string_field(index, data, "type")?;
        let metric = |metric_kind| {
            let value = match data.get("data") {
                Some(Value::String(s)) => s.parse::<f64>().ok(),
                Some(Value::Number(n)) => n.as_f64(),
                _ => None,
            }
            .ok_or_else(|| {
                ProtocolError::schema(
                    index,
                    format!("the 'data' element of the NOTIFY '{}' is not a number", kind),
                )
            })?;
            Ok::<_, ProtocolError>(SchedulerCommand::NotifyMetric {
                kind: metric_kind,
                value,
            })
        };
        match kind.as_str() {
            "registration_finished" => Ok(SchedulerCommand::NotifyRegistrationFinished),
            "continue_registration" => Ok(SchedulerCommand::NotifyContinueRegistration),
            "queue_size" => metric(MetricKind::QueueSize),
            "schedule_size" => metric(MetricKind::ScheduleSize),
            "number_running_jobs" => metric(MetricKind::NbRunningJobs),
            "utilization" => metric(MetricKind::Utilization),
            "utilization_no_resv" => metric(MetricKind::UtilizationNoResv),
            "PID" => metric(MetricKind::SchedulerPid),
            "checkpoint" => Ok(SchedulerCommand::NotifyCheckpoint),
            "recover_from_checkpoint" => Ok(SchedulerCommand::NotifyRecoverFromCheckpoint),
            other => Err(ProtocolError::schema(
                index,
                format!("unknown NOTIFY type received ('{}')", other),
            )),
        }
    }
}

fn object<'a>(
    index: usize,
    value: &'a Value,
    what: &str,
) -> Result<&'a serde_json::Map<String, Value>, ProtocolError> {
    value
        .as_object()
        .ok_or_else(|| ProtocolError::schema(index, format!("{} should be an object", what)))
}

fn string_field(index: usize, value: &Value, field: &str) -> Result<String, ProtocolError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ProtocolError::schema(index, format!("['data']['{}'] should be a string", field))
        })
}

fn number_field(index: usize, value: &Value, field: &str) -> Result<f64, ProtocolError> {
    value.get(field).and_then(Value::as_f64).ok_or_else(|| {
        ProtocolError::schema(index, format!("['data']['{}'] should be a number", field))
    })
}

fn job_id_field(index: usize, value: &Value, field: &str) -> Result<JobIdentifier, ProtocolError> {
    let id = string_field(index, value, field)?;
    id.parse()
        .map_err(|e| ProtocolError::schema(index, format!("{}", e)))
}

fn interval_set_field(index: usize, value: &Value, field: &str) -> Result<IntervalSet, ProtocolError> {
    let s = string_field(index, value, field)?;
    s.parse()
        .map_err(|e| ProtocolError::schema(index, format!("bad '{}' interval set: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reader() -> JsonProtocolReader {
        JsonProtocolReader::new(false, false)
    }

    fn reply(events: Value) -> String {
        json!({"now": 10.0, "events": events}).to_string()
    }

    #[test]
    fn decodes_execute_with_mapping_and_io() {
        let message = reply(json!([{
            "timestamp": 10.0,
            "type": "EXECUTE_JOB",
            "data": {
                "job_id": "w0!1",
                "alloc": "2-3",
                "mapping": {"0": "0", "1": "0", "2": "1", "3": "1"},
                "additional_io_job": {
                    "alloc": "2-3",
                    "profile_name": "io",
                    "profile": {"type": "parallel_homogeneous", "cpu": 0, "com": 1e6}
                }
            }
        }]));
        let decoded = reader().parse_message(&message, false).unwrap();
        assert_eq!(decoded.now, 10.0);
        match &decoded.commands[0].command {
            SchedulerCommand::ExecuteJob(cmd) => {
                assert_eq!(cmd.job_id.to_string(), "w0!1");
                assert_eq!(cmd.alloc.to_string(), "2-3");
                assert_eq!(cmd.mapping.as_deref(), Some(&[0, 0, 1, 1][..]));
                assert_eq!(cmd.io.as_ref().unwrap().profile_name, "io");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn rejects_timestamp_above_now() {
        let message = reply(json!([{
            "timestamp": 11.0,
            "type": "REJECT_JOB",
            "data": {"job_id": "w0!1"}
        }]));
        let error = reader().parse_message(&message, false).unwrap_err();
        assert!(matches!(error, ProtocolError::Schema { event: 0, .. }));
    }

    #[test]
    fn rejects_timestamp_regression_inside_batch() {
        let message = reply(json!([
            {"timestamp": 6.0, "type": "REJECT_JOB", "data": {"job_id": "w0!1"}},
            {"timestamp": 5.0, "type": "REJECT_JOB", "data": {"job_id": "w0!2"}}
        ]));
        let error = reader().parse_message(&message, false).unwrap_err();
        assert!(matches!(error, ProtocolError::Schema { event: 1, .. }));
    }

    #[test]
    fn unknown_command_names_the_event_index() {
        let message = reply(json!([
            {"timestamp": 1.0, "type": "REJECT_JOB", "data": {"job_id": "w0!1"}},
            {"timestamp": 2.0, "type": "FROBNICATE", "data": {}}
        ]));
        match reader().parse_message(&message, false).unwrap_err() {
            ProtocolError::UnknownEvent { event, ty } => {
                assert_eq!(event, 1);
                assert_eq!(ty, "FROBNICATE");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn registration_gating() {
        let register = reply(json!([{
            "timestamp": 1.0,
            "type": "REGISTER_JOB",
            "data": {"job_id": "dyn!1", "job": {"id": "1", "subtime": 0.0, "res": 1, "profile": "d"}}
        }]));
        assert!(reader().parse_message(&register, false).is_err());

        let enabled = JsonProtocolReader::new(true, false);
        assert!(enabled.parse_message(&register, false).is_ok());
        assert!(enabled.parse_message(&register, true).is_err());

        let finish_then_register = reply(json!([
            {"timestamp": 1.0, "type": "NOTIFY", "data": {"type": "registration_finished"}},
            {"timestamp": 1.0, "type": "REGISTER_PROFILE",
             "data": {"workload_name": "dyn", "profile_name": "p", "profile": {"type": "delay", "delay": 1.0}}}
        ]));
        assert!(enabled.parse_message(&finish_then_register, false).is_err());
    }

    #[test]
    fn decodes_kill_call_me_later_and_notify_metrics() {
        let message = reply(json!([
            {"timestamp": 1.0, "type": "CALL_ME_LATER",
             "data": {"timestamp": 42.0, "id": 7, "forWhat": 5}},
            {"timestamp": 1.0, "type": "KILL_JOB",
             "data": {"job_msgs": [{"id": "w0!1", "forWhat": 1}]}},
            {"timestamp": 2.0, "type": "NOTIFY", "data": {"type": "queue_size", "data": "12"}}
        ]));
        let decoded = reader().parse_message(&message, false).unwrap();
        assert!(matches!(
            decoded.commands[0].command,
            SchedulerCommand::CallMeLater { id: 7, for_what: 5, target_time } if target_time == 42.0
        ));
        match &decoded.commands[1].command {
            SchedulerCommand::KillJobs { requests } => {
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].for_what, 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(matches!(
            decoded.commands[2].command,
            SchedulerCommand::NotifyMetric { kind: MetricKind::QueueSize, value } if value == 12.0
        ));
    }

    #[test]
    fn metadata_with_quotes_is_rejected() {
        let message = reply(json!([{
            "timestamp": 1.0,
            "type": "SET_JOB_METADATA",
            "data": {"job_id": "w0!1", "metadata": "a\"b"}
        }]));
        assert!(reader().parse_message(&message, false).is_err());
    }
}
