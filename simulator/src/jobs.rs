//! Job identifiers, job state machine and the per-workload job set.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::{json, Value};

use crate::errors::ConfigError;
use crate::interval_set::IntervalSet;
use crate::profiles::ProfileHandle;
use crate::task_tree::TaskTree;

/// Local identifier inside one workload, rendered `N[#R][$C]` where `#R` is
/// the resubmission generation and `$C` the checkpoint generation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct JobLocalId {
    pub number: u64,
    pub resubmit: Option<u32>,
    pub checkpoint: Option<u32>,
}

impl JobLocalId {
    pub fn plain(number: u64) -> Self {
        JobLocalId {
            number,
            resubmit: None,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, generation: u32) -> Self {
        self.checkpoint = Some(generation);
        self
    }

    pub fn resubmitted(&self) -> Self {
        JobLocalId {
            number: self.number,
            resubmit: Some(self.resubmit.map_or(1, |r| r + 1)),
            checkpoint: self.checkpoint,
        }
    }

    pub fn is_resubmitted(&self) -> bool {
        self.resubmit.is_some()
    }
}

impl fmt::Display for JobLocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number)?;
        if let Some(r) = self.resubmit {
            write!(f, "#{}", r)?;
        }
        if let Some(c) = self.checkpoint {
            write!(f, "${}", c)?;
        }
        Ok(())
    }
}

impl FromStr for JobLocalId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |detail: &str| ConfigError::schema(format!("invalid job name '{}': {}", s, detail));
        if s.contains('!') {
            return Err(bad("contains a '!'"));
        }
        let (rest, checkpoint) = match s.split_once('$') {
            Some((rest, c)) => (
                rest,
                Some(c.parse().map_err(|_| bad("bad checkpoint generation"))?),
            ),
            None => (s, None),
        };
        let (number, resubmit) = match rest.split_once('#') {
            Some((n, r)) => (n, Some(r.parse().map_err(|_| bad("bad resubmission generation"))?)),
            None => (rest, None),
        };
        let number = number.parse().map_err(|_| bad("not a number"))?;
        Ok(JobLocalId {
            number,
            resubmit,
            checkpoint,
        })
    }
}

/// A `(workload, local id)` pair rendered as `workload!local`. The string
/// representation is cached because it is hashed and printed constantly.
#[derive(Clone, Debug, Serialize)]
pub struct JobIdentifier {
    workload: String,
    local: JobLocalId,
    repr: String,
}

impl JobIdentifier {
    pub fn new(workload: &str, local: JobLocalId) -> Result<Self, ConfigError> {
        if workload.contains('!') {
            return Err(ConfigError::schema(format!(
                "invalid workload name '{}': contains a '!'",
                workload
            )));
        }
        let repr = format!("{}!{}", workload, local);
        Ok(JobIdentifier {
            workload: workload.to_string(),
            local,
            repr,
        })
    }

    pub fn workload_name(&self) -> &str {
        &self.workload
    }

    pub fn local(&self) -> &JobLocalId {
        &self.local
    }

    pub fn job_name(&self) -> String {
        self.local.to_string()
    }

    pub fn job_number(&self) -> u64 {
        self.local.number
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }

    /// Rendering used in the job CSV: the checkpoint generation is stripped
    /// so that resumed runs produce the same rows as continuous ones.
    pub fn csv_name(&self) -> String {
        let mut name = format!("{}!{}", self.workload, self.local.number);
        if let Some(r) = self.local.resubmit {
            name.push_str(&format!("#{}", r));
        }
        name
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl FromStr for JobIdentifier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('!');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(workload), Some(local), None) => {
                JobIdentifier::new(workload, local.parse()?)
            }
            _ => Err(ConfigError::schema(format!(
                "invalid job identifier '{}': expected two '!'-separated parts such as 'w0!42'",
                s
            ))),
        }
    }
}

impl PartialEq for JobIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}
impl Eq for JobIdentifier {}

impl std::hash::Hash for JobIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.repr.hash(state);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RejectionReason {
    NotEnoughResources,
    NotEnoughAvailableResources,
    NoWalltime,
    NoReservationAllocation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum JobState {
    NotSubmitted,
    Submitted,
    Running,
    CompletedSuccessfully,
    CompletedFailed,
    CompletedWalltimeReached,
    CompletedKilled,
    Rejected(RejectionReason),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            JobState::NotSubmitted | JobState::Submitted | JobState::Running
        )
    }

    pub fn is_complete(&self) -> bool {
        self.is_terminal()
    }

    /// State name used on the wire and in the CSV outputs. Every rejection
    /// variant collapses to `REJECTED` for wire compatibility.
    pub fn wire_name(&self) -> &'static str {
        match self {
            JobState::NotSubmitted => "NOT_SUBMITTED",
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::CompletedSuccessfully => "COMPLETED_SUCCESSFULLY",
            JobState::CompletedFailed => "COMPLETED_FAILED",
            JobState::CompletedWalltimeReached => "COMPLETED_WALLTIME_REACHED",
            JobState::CompletedKilled => "COMPLETED_KILLED",
            JobState::Rejected(_) => "REJECTED",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<JobState> {
        match name {
            "NOT_SUBMITTED" => Some(JobState::NotSubmitted),
            "SUBMITTED" => Some(JobState::Submitted),
            "RUNNING" => Some(JobState::Running),
            "COMPLETED_SUCCESSFULLY" => Some(JobState::CompletedSuccessfully),
            "COMPLETED_FAILED" => Some(JobState::CompletedFailed),
            "COMPLETED_WALLTIME_REACHED" => Some(JobState::CompletedWalltimeReached),
            "COMPLETED_KILLED" => Some(JobState::CompletedKilled),
            "REJECTED" => Some(JobState::Rejected(RejectionReason::NotEnoughResources)),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPurpose {
    Job,
    Reservation,
}

impl JobPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPurpose::Job => "job",
            JobPurpose::Reservation => "reservation",
        }
    }
}

/// Per-job checkpointing knobs, filled by the workload transformer.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckpointKnobs {
    pub interval: Option<f64>,
    pub dump_time: Option<f64>,
    pub read_time: Option<f64>,
}

/// Restore data carried by jobs loaded from a simulator-level snapshot.
#[derive(Clone, Debug, Default)]
pub struct RestoreBundle {
    pub allocation: Option<String>,
    pub progress: f64,
    pub state: Option<JobState>,
    pub runtime: f64,
    pub consumed_energy: f64,
    pub jitter: Option<String>,
    pub original_submit: f64,
    pub original_start: f64,
    pub original_walltime: Option<f64>,
    pub progress_time_cpu: f64,
}

pub struct Job {
    pub id: JobIdentifier,
    pub profile: ProfileHandle,
    pub json_description: Value,
    pub submission_time: f64,
    pub walltime: Option<f64>,
    pub original_walltime: Option<f64>,
    pub requested_nb_res: u32,
    pub cores: u32,
    pub state: JobState,
    pub starting_time: Option<f64>,
    pub runtime: Option<f64>,
    pub allocation: Option<IntervalSet>,
    pub future_allocation: Option<IntervalSet>,
    pub return_code: Option<i32>,
    pub consumed_energy: f64,
    pub purpose: JobPurpose,
    pub start: Option<f64>,
    pub submission_times: Vec<f64>,
    pub jitter: Option<String>,
    pub metadata: Option<String>,
    pub checkpoint: CheckpointKnobs,
    pub restore: Option<RestoreBundle>,
    pub incoming_messages: Vec<String>,
    pub task: Option<Rc<RefCell<TaskTree>>>,
    pub smpi_ranks_to_hosts_mapping: Vec<u32>,
    pub storage_mapping: Option<std::collections::BTreeMap<String, u32>>,
    pub kill_requested: bool,
    pub from_workload: bool,
}

impl Job {
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Refreshes the fields of the JSON description that transforms and the
    /// protocol depend on. The id is rendered in its `workload!name` form.
    pub fn sync_json_description(&mut self) {
        let desc = &mut self.json_description;
        desc["id"] = json!(self.id.to_string());
        desc["subtime"] = json!(self.submission_time);
        desc["profile"] = json!(self.profile.name.clone());
        desc["submission_times"] = json!(self.submission_times.clone());
        if let Some(walltime) = self.walltime {
            desc["walltime"] = json!(walltime);
        }
        if let Some(jitter) = &self.jitter {
            desc["jitter"] = json!(jitter.clone());
        }
    }
}

pub type JobHandle = Rc<RefCell<Job>>;

/// Orders by submission time, then by job number for equal times.
pub fn job_comparator_subtime_number(a: &JobHandle, b: &JobHandle) -> std::cmp::Ordering {
    let (a, b) = (a.borrow(), b.borrow());
    a.submission_time
        .partial_cmp(&b.submission_time)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.id.job_number().cmp(&b.id.job_number()))
}

/// The jobs of one workload. `met` remembers every id ever inserted so that
/// deleted jobs still count as known (a completed job must not be recreated).
#[derive(Default)]
pub struct Jobs {
    jobs: FxHashMap<JobIdentifier, JobHandle>,
    met: FxHashSet<JobIdentifier>,
}

impl Jobs {
    pub fn new() -> Self {
        Jobs::default()
    }

    pub fn add(&mut self, job: Job) -> Result<JobHandle, ConfigError> {
        if self.exists(&job.id) {
            return Err(ConfigError::schema(format!(
                "duplication of job id '{}'",
                job.id
            )));
        }
        let id = job.id.clone();
        let handle = Rc::new(RefCell::new(job));
        self.jobs.insert(id.clone(), handle.clone());
        self.met.insert(id);
        Ok(handle)
    }

    pub fn exists(&self, id: &JobIdentifier) -> bool {
        self.met.contains(id)
    }

    pub fn get(&self, id: &JobIdentifier) -> Option<JobHandle> {
        self.jobs.get(id).cloned()
    }

    pub fn remove(&mut self, id: &JobIdentifier) -> Option<JobHandle> {
        self.jobs.remove(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&JobIdentifier, &JobHandle)> {
        self.jobs.iter()
    }

    pub fn as_sorted_vec(&self) -> Vec<JobHandle> {
        let mut jobs: Vec<_> = self.jobs.values().cloned().collect();
        jobs.sort_by(job_comparator_subtime_number);
        jobs
    }

    pub fn max_job_number(&self) -> u64 {
        self.jobs.keys().map(|id| id.job_number()).max().unwrap_or(0)
    }

    pub fn replace_all(&mut self, jobs: Vec<JobHandle>) {
        self.jobs.clear();
        for job in jobs {
            let id = job.borrow().id.clone();
            self.met.insert(id.clone());
            self.jobs.insert(id, job);
        }
    }

    pub fn contains_smpi_job(&self) -> bool {
        self.jobs.values().any(|job| {
            matches!(
                *job.borrow().profile.data.borrow(),
                crate::profiles::ProfileData::Smpi { .. }
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_id_renders_generations() {
        assert_eq!(JobLocalId::plain(7).to_string(), "7");
        assert_eq!(JobLocalId::plain(7).resubmitted().to_string(), "7#1");
        assert_eq!(
            JobLocalId::plain(7).resubmitted().with_checkpoint(2).to_string(),
            "7#1$2"
        );
    }

    #[test]
    fn local_id_parses_either_encoding() {
        let id: JobLocalId = "42".parse().unwrap();
        assert_eq!(id, JobLocalId::plain(42));
        let id: JobLocalId = "42#3$1".parse().unwrap();
        assert_eq!(id.number, 42);
        assert_eq!(id.resubmit, Some(3));
        assert_eq!(id.checkpoint, Some(1));
        assert!("a!b".parse::<JobLocalId>().is_err());
        assert!("4#x".parse::<JobLocalId>().is_err());
    }

    #[test]
    fn identifier_round_trip() {
        let id: JobIdentifier = "w0!5#1".parse().unwrap();
        assert_eq!(id.workload_name(), "w0");
        assert_eq!(id.job_name(), "5#1");
        assert_eq!(id.to_string(), "w0!5#1");
        assert!("w!0!1".parse::<JobIdentifier>().is_err());
    }

    #[test]
    fn rejects_bang_in_workload_name() {
        assert!(JobIdentifier::new("w!0", JobLocalId::plain(1)).is_err());
    }

    #[test]
    fn state_wire_names_round_trip() {
        for state in [
            JobState::Submitted,
            JobState::Running,
            JobState::CompletedSuccessfully,
            JobState::CompletedFailed,
            JobState::CompletedWalltimeReached,
            JobState::CompletedKilled,
        ] {
            assert_eq!(JobState::from_wire_name(state.wire_name()), Some(state));
        }
        assert_eq!(
            JobState::Rejected(RejectionReason::NoWalltime).wire_name(),
            "REJECTED"
        );
        assert!(JobState::from_wire_name("NO_SUCH_STATE").is_none());
    }
}
