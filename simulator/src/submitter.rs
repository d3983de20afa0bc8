//! Per-workload submitter: surfaces every loaded job to the server at its
//! submission time, then signals completion.

use dslab_core::{log_debug, log_info, Id, SimulationContext};

use crate::events::{JobSubmittedInternal, SubmitterFinished};
use crate::jobs::{job_comparator_subtime_number, JobHandle};
use crate::storage::SharedStorage;

pub struct JobSubmitter {
    workload_name: String,
    storage: SharedStorage,
    server_id: Id,
    ctx: SimulationContext,
}

impl JobSubmitter {
    pub fn new(
        ctx: SimulationContext,
        workload_name: &str,
        storage: SharedStorage,
        server_id: Id,
    ) -> JobSubmitter {
        JobSubmitter {
            workload_name: workload_name.to_string(),
            storage,
            server_id,
            ctx,
        }
    }

    /// Stages the whole job set. Events are emitted in `(t_sub, number)`
    /// order, so the server sees non-decreasing submission times.
    pub fn stage_jobs(&self, mut jobs: Vec<JobHandle>) {
        jobs.sort_by(job_comparator_subtime_number);

        let now = self.ctx.time();
        let mut last_time = now;
        for job in jobs {
            let submission_time = job.borrow().submission_time.max(now);
            let key = self.storage.borrow_mut().register_job(job.clone());
            log_debug!(
                self.ctx,
                "staging job {} at t={}",
                job.borrow().id,
                submission_time
            );
            self.ctx.emit_ordered(
                JobSubmittedInternal { key },
                self.server_id,
                submission_time - now,
            );
            last_time = last_time.max(submission_time);
        }

        self.ctx.emit_ordered(
            SubmitterFinished {
                workload: self.workload_name.clone(),
            },
            self.server_id,
            last_time - now,
        );
        log_info!(
            self.ctx,
            "workload '{}' fully staged, last submission at t={}",
            self.workload_name,
            last_time
        );
    }
}
