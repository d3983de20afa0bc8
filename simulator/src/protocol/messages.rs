//! Typed form of the scheduler -> simulator command vocabulary.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::interval_set::IntervalSet;
use crate::jobs::{JobIdentifier, JobState};

/// `forWhat` codes carried by `CALL_ME_LATER` and `REQUESTED_CALL`.
pub mod call_me_later_types {
    pub const FIXED_FAILURE: i32 = 0;
    pub const SMTBF: i32 = 1;
    pub const MTBF: i32 = 2;
    pub const REPAIR_DONE: i32 = 3;
    pub const RESERVATION_START: i32 = 4;
    pub const CHECKPOINT_BATSCHED: i32 = 5;
    pub const RECOVER_FROM_CHECKPOINT: i32 = 6;
}

/// `forWhat` codes carried by `KILL_JOB` and `JOB_KILLED`.
pub mod kill_types {
    pub const NONE: i32 = 0;
    pub const FIXED_FAILURES: i32 = 1;
    pub const SMTBF: i32 = 2;
    pub const MTBF: i32 = 3;
    pub const RESERVATION: i32 = 4;
}

#[derive(Clone, Debug, Serialize)]
pub struct KillRequest {
    pub job_id: JobIdentifier,
    pub for_what: i32,
}

#[derive(Clone, Debug, Serialize)]
pub struct IoOverlay {
    pub profile_name: String,
    /// Inline profile definition, registered on the fly when present.
    pub profile: Option<Value>,
    pub alloc: IntervalSet,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecuteJobCommand {
    pub job_id: JobIdentifier,
    pub alloc: IntervalSet,
    /// Executor index -> position inside `alloc`.
    pub mapping: Option<Vec<u32>>,
    pub storage_mapping: Option<BTreeMap<String, u32>>,
    pub io: Option<IoOverlay>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MetricKind {
    QueueSize,
    ScheduleSize,
    NbRunningJobs,
    Utilization,
    UtilizationNoResv,
    SchedulerPid,
}

#[derive(Clone, Debug, Serialize)]
pub enum SchedulerCommand {
    RejectJob {
        job_id: JobIdentifier,
    },
    ExecuteJob(ExecuteJobCommand),
    ChangeJobState {
        job_id: JobIdentifier,
        state: JobState,
    },
    CallMeLater {
        id: i64,
        for_what: i32,
        target_time: f64,
    },
    KillJobs {
        requests: Vec<KillRequest>,
    },
    RegisterJob {
        job_id: JobIdentifier,
        description: Value,
    },
    RegisterProfile {
        workload: String,
        name: String,
        profile: Value,
    },
    SetResourceState {
        resources: IntervalSet,
        state: i32,
    },
    SetJobMetadata {
        job_id: JobIdentifier,
        metadata: String,
    },
    QueryConsumedEnergy,
    AnswerEstimateWaitingTime {
        job_id: String,
        estimate: f64,
    },
    ToJobMsg {
        job_id: JobIdentifier,
        message: String,
    },
    NotifyRegistrationFinished,
    NotifyContinueRegistration,
    NotifyMetric {
        kind: MetricKind,
        value: f64,
    },
    NotifyCheckpoint,
    NotifyRecoverFromCheckpoint,
}

#[derive(Clone, Debug, Serialize)]
pub struct TimedCommand {
    pub timestamp: f64,
    pub command: SchedulerCommand,
}

/// One decoded scheduler reply: the new simulated clock plus the commands in
/// the order the scheduler sent them.
#[derive(Clone, Debug)]
pub struct SchedulerReply {
    pub now: f64,
    pub commands: Vec<TimedCommand>,
}
