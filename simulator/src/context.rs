//! The simulation-wide mutable state threaded through the server.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::{json, Value};

use crate::config::sim_config::StartFromCheckpointInfo;
use crate::workload::Workloads;

/// Total order over f64 timestamps so they can key a BTreeMap.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeKey(pub f64);

impl Eq for TimeKey {}
impl PartialOrd for TimeKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimeKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallMeLaterEntry {
    pub id: i64,
    pub for_what: i32,
    pub target_time: f64,
    pub date_received: f64,
}

/// Time-indexed multimap of pending `CALL_ME_LATER` requests. Entries due at
/// the same instant fire in registration order.
#[derive(Clone, Debug, Default)]
pub struct CallMeLaterStore {
    entries: BTreeMap<TimeKey, Vec<CallMeLaterEntry>>,
}

impl CallMeLaterStore {
    pub fn insert(&mut self, entry: CallMeLaterEntry) {
        self.entries
            .entry(TimeKey(entry.target_time))
            .or_default()
            .push(entry);
    }

    /// Removes and returns every entry with `target_time <= now`.
    pub fn take_due(&mut self, now: f64) -> Vec<CallMeLaterEntry> {
        let due_keys: Vec<TimeKey> = self
            .entries
            .range(..=TimeKey(now))
            .map(|(key, _)| *key)
            .collect();
        let mut due = Vec::new();
        for key in due_keys {
            due.extend(self.entries.remove(&key).expect("key just listed"));
        }
        due
    }

    /// Drops entries strictly before `now`; used when a snapshot is taken.
    pub fn prune_before(&mut self, now: f64) {
        self.entries = self.entries.split_off(&TimeKey(now));
    }

    pub fn next_due(&self) -> Option<f64> {
        self.entries.keys().next().map(|k| k.0)
    }

    pub fn target_times(&self) -> Vec<f64> {
        self.entries.keys().map(|k| k.0).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let entries: Vec<Value> = self
            .entries
            .values()
            .flatten()
            .map(|e| {
                json!({
                    "id": e.id,
                    "forWhat": e.for_what,
                    "target_time": e.target_time,
                    "date_received": e.date_received,
                })
            })
            .collect();
        json!({ "call_me_laters": entries })
    }

    pub fn from_json(value: &Value) -> CallMeLaterStore {
        let mut store = CallMeLaterStore::default();
        if let Some(entries) = value.get("call_me_laters").and_then(Value::as_array) {
            for entry in entries {
                let read = |field: &str| entry.get(field).and_then(Value::as_f64);
                if let (Some(id), Some(for_what), Some(target_time)) =
                    (read("id"), read("forWhat"), read("target_time"))
                {
                    store.insert(CallMeLaterEntry {
                        id: id as i64,
                        for_what: for_what as i32,
                        target_time,
                        date_received: read("date_received").unwrap_or(0.),
                    });
                }
            }
        }
        store
    }
}

/// Mutable metrics periodically reported by the scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerMetrics {
    pub queue_size: u64,
    pub schedule_size: u64,
    pub nb_running_jobs: u64,
    pub utilization: f64,
    pub utilization_no_resv: f64,
    pub scheduler_pid: i64,
}

pub struct BatsimContext {
    pub workloads: Workloads,
    pub config_json: Value,
    pub export_prefix: String,

    pub redis_enabled: bool,
    pub forward_profiles_on_submission: bool,
    pub registration_enabled: bool,
    pub registration_ack: bool,
    pub registration_finished: bool,
    pub garbage_collect_profiles: bool,
    pub allow_compute_sharing: bool,
    pub allow_storage_sharing: bool,

    pub call_me_laters: CallMeLaterStore,
    pub start_from_checkpoint: StartFromCheckpointInfo,
    pub metrics: SchedulerMetrics,

    pub total_consumed_energy: f64,
    pub nb_jobs: u32,
    pub nb_completed_jobs: u32,
    pub wall_clock_start: Instant,
}

impl BatsimContext {
    pub fn new(workloads: Workloads) -> Self {
        BatsimContext {
            workloads,
            config_json: Value::Null,
            export_prefix: "out".to_string(),
            redis_enabled: false,
            forward_profiles_on_submission: false,
            registration_enabled: false,
            registration_ack: false,
            registration_finished: false,
            garbage_collect_profiles: true,
            allow_compute_sharing: false,
            allow_storage_sharing: true,
            call_me_laters: CallMeLaterStore::default(),
            start_from_checkpoint: StartFromCheckpointInfo::default(),
            metrics: SchedulerMetrics::default(),
            total_consumed_energy: 0.,
            nb_jobs: 0,
            nb_completed_jobs: 0,
            wall_clock_start: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, target: f64) -> CallMeLaterEntry {
        CallMeLaterEntry {
            id,
            for_what: 0,
            target_time: target,
            date_received: 0.,
        }
    }

    #[test]
    fn due_entries_fire_in_registration_order() {
        let mut store = CallMeLaterStore::default();
        store.insert(entry(1, 5.));
        store.insert(entry(2, 5.));
        store.insert(entry(3, 9.));
        let due = store.take_due(5.);
        assert_eq!(due.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.next_due(), Some(9.));
    }

    #[test]
    fn prune_keeps_entries_at_or_after_now() {
        let mut store = CallMeLaterStore::default();
        store.insert(entry(1, 2.));
        store.insert(entry(2, 4.));
        store.insert(entry(3, 6.));
        store.prune_before(4.);
        let due = store.take_due(100.);
        assert_eq!(due.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn json_round_trip() {
        let mut store = CallMeLaterStore::default();
        store.insert(entry(7, 42.));
        let json = store.to_json();
        let restored = CallMeLaterStore::from_json(&json);
        assert_eq!(restored.take_due(42.), vec![entry(7, 42.)]);
    }
}
