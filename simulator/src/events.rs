//! Internal messages exchanged between the submitters, the server and the
//! job executor.

use serde::Serialize;

use crate::jobs::JobState;
use crate::protocol::messages::SchedulerCommand;
use crate::task_tree::ProgressSnapshot;

/// Kicks the server: emit `SIMULATION_BEGINS` and run the first round trip.
#[derive(Clone, Serialize)]
pub struct ServerStart {}

/// A submitter surfaced one job at its submission time.
#[derive(Clone, Serialize)]
pub struct JobSubmittedInternal {
    pub key: u64,
}

/// A submitter delivered its whole workload.
#[derive(Clone, Serialize)]
pub struct SubmitterFinished {
    pub workload: String,
}

/// Server -> executor: start the job known under `key`; its allocation and
/// execution plan are in the shared storage.
#[derive(Clone, Serialize)]
pub struct StartJobExecution {
    pub key: u64,
}

/// Server -> executor, keyed by the execution key: stop the job's kernel
/// work and report progress.
#[derive(Clone, Serialize)]
pub struct CancelJobExecution {
    pub key: u64,
    pub for_what: i32,
}

/// Executor -> server: the job reached a terminal state on its own.
#[derive(Clone, Serialize)]
pub struct JobExecutionFinished {
    pub key: u64,
    pub state: JobState,
    pub return_code: i32,
}

/// Executor -> server: the job was cancelled; progress was captured at the
/// instant of cancellation.
#[derive(Clone, Serialize)]
pub struct JobExecutionInterrupted {
    pub key: u64,
    pub for_what: i32,
    pub progress: Option<ProgressSnapshot>,
}

/// Server self-message: apply one decoded scheduler command at its stamped
/// timestamp.
#[derive(Clone, Serialize)]
pub struct ApplyCommand {
    pub index: usize,
    pub command: SchedulerCommand,
}

/// Server self-message scheduled at the reply's `now`: the scheduler may be
/// messaged again.
#[derive(Clone, Serialize)]
pub struct SchedulerReadyNow {}

/// Server self-message coalescing one synchronisation point per instant.
#[derive(Clone, Serialize)]
pub struct FlushNow {}

/// Server self-message: some call-me-later entries may be due.
#[derive(Clone, Serialize)]
pub struct RequestedCallDue {}

/// Server self-message: periodic simulator-level checkpoint tick.
#[derive(Clone, Serialize)]
pub struct CheckpointTick {}
