//! The central dispatcher: collects outgoing events until a synchronisation
//! point, performs one protocol round trip, re-injects the decoded commands
//! at their timestamps and advances the simulated clock to the reply's
//! `now`. Exactly one round trip is in flight at any time.

use std::cell::RefCell;
use std::rc::Rc;

use dslab_core::{log_debug, log_error, log_info, log_warn, Event, EventHandler, Id, SimulationContext};
use rustc_hash::FxHashSet;
use serde_json::Value;

use crate::checkpoint::Checkpointer;
use crate::config::options::{BatsimCheckpointSpec, CheckpointTimeBase};
use crate::connection::SchedulerLink;
use crate::context::{BatsimContext, CallMeLaterEntry};
use crate::errors::ReferentialError;
use crate::events::{
    ApplyCommand, CancelJobExecution, CheckpointTick, FlushNow, JobExecutionFinished,
    JobExecutionInterrupted, JobSubmittedInternal, RequestedCallDue, SchedulerReadyNow,
    ServerStart, StartJobExecution, SubmitterFinished,
};
use crate::executor::build_exec_plan;
use crate::host::MachineDescription;
use crate::jobs::{JobState, RejectionReason};
use crate::monitoring::Monitoring;
use crate::profiles::ProfileData;
use crate::protocol::messages::{call_me_later_types, ExecuteJobCommand, SchedulerCommand};
use crate::protocol::writer::KilledJobReport;
use crate::protocol::{JsonProtocolReader, JsonProtocolWriter};
use crate::storage::SharedStorage;
use crate::task_tree::TaskTree;

struct KillEntry {
    key: Option<u64>,
    simple_id: String,
    for_what: i32,
    progress: Option<crate::task_tree::ProgressSnapshot>,
}

struct KillGroup {
    pending: FxHashSet<u64>,
    entries: Vec<KillEntry>,
}

pub struct ServerParams {
    pub ack_dynamic_registration: bool,
    pub batsim_checkpoint: Option<BatsimCheckpointSpec>,
    pub nb_submitters: usize,
}

pub struct Server {
    ctx: SimulationContext,
    context: Rc<RefCell<BatsimContext>>,
    storage: SharedStorage,
    monitoring: Rc<RefCell<Monitoring>>,
    checkpointer: Checkpointer,
    link: Box<dyn SchedulerLink>,
    writer: JsonProtocolWriter,
    reader: JsonProtocolReader,
    machines: Vec<MachineDescription>,
    executor_id: Id,

    params: ServerParams,
    sched_ready: bool,
    flush_scheduled: bool,
    submitters_remaining: usize,
    nb_running_jobs: u32,
    nb_open_jobs: u32,
    initial_submissions_seen: u32,
    pending_kills: Vec<KillGroup>,
    last_real_checkpoint: std::time::Instant,
    end_sent: bool,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: SimulationContext,
        context: Rc<RefCell<BatsimContext>>,
        storage: SharedStorage,
        monitoring: Rc<RefCell<Monitoring>>,
        checkpointer: Checkpointer,
        link: Box<dyn SchedulerLink>,
        reader: JsonProtocolReader,
        writer: JsonProtocolWriter,
        machines: Vec<MachineDescription>,
        executor_id: Id,
        params: ServerParams,
    ) -> Server {
        let submitters_remaining = params.nb_submitters;
        Server {
            ctx,
            context,
            storage,
            monitoring,
            checkpointer,
            link,
            writer,
            reader,
            machines,
            executor_id,
            params,
            sched_ready: false,
            flush_scheduled: false,
            submitters_remaining,
            nb_running_jobs: 0,
            nb_open_jobs: 0,
            initial_submissions_seen: 0,
            pending_kills: Vec::new(),
            last_real_checkpoint: std::time::Instant::now(),
            end_sent: false,
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    fn fatal(&self, message: String) -> ! {
        log_error!(self.ctx, "{}", message);
        panic!("{}", message);
    }

    // ------------------------------------------------------------------
    // Synchronisation machinery
    // ------------------------------------------------------------------

    fn schedule_flush(&mut self) {
        if !self.flush_scheduled {
            self.flush_scheduled = true;
            self.ctx.emit_self_now(FlushNow {});
        }
    }

    fn try_sync(&mut self) {
        if !self.sched_ready || self.writer.is_empty() || self.end_sent {
            return;
        }
        // When resuming from a snapshot, the message at the restart instant
        // waits for every job expected back at that instant.
        {
            let context = self.context.borrow();
            let restart = &context.start_from_checkpoint;
            if restart.active
                && self.ctx.time() <= restart.restart_instant
                && self.initial_submissions_seen < restart.expected_submissions
            {
                return;
            }
        }
        self.round_trip();
    }

    fn round_trip(&mut self) {
        let now = self.ctx.time();
        let message = self.writer.generate_message(now);
        self.sched_ready = false;

        let _ = self.monitoring.borrow_mut().tick(
            now,
            self.context.borrow().nb_jobs,
            self.context.borrow().nb_completed_jobs,
            &self.context.borrow().metrics,
        );
        self.maybe_real_time_checkpoint();

        log_debug!(self.ctx, "sending message: {}", message);
        let reply = match self.link.round_trip(&message) {
            Ok(reply) => reply,
            Err(e) => self.fatal(e.to_string()),
        };
        log_debug!(self.ctx, "received reply: {}", reply);

        let registration_finished = self.context.borrow().registration_finished;
        let reply = match self.reader.parse_message(&reply, registration_finished) {
            Ok(reply) => reply,
            Err(e) => self.fatal(e.to_string()),
        };
        if reply.now < now {
            self.fatal(format!(
                "invalid JSON message: the reply 'now' ({}) is before the current simulated time ({})",
                reply.now, now
            ));
        }

        for (index, timed) in reply.commands.into_iter().enumerate() {
            let delay = (timed.timestamp - now).max(0.);
            self.ctx.emit_ordered(
                ApplyCommand {
                    index,
                    command: timed.command,
                },
                self.ctx.id(),
                delay,
            );
        }
        self.ctx
            .emit_ordered(SchedulerReadyNow {}, self.ctx.id(), reply.now - now);
    }

    fn check_end(&mut self) {
        if self.end_sent || !self.sched_ready || !self.writer.is_empty() {
            return;
        }
        if self.submitters_remaining > 0 || self.nb_open_jobs > 0 || self.nb_running_jobs > 0 {
            return;
        }
        {
            let context = self.context.borrow();
            if !context.call_me_laters.is_empty() {
                return;
            }
            if context.registration_enabled && !context.registration_finished {
                return;
            }
        }

        let now = self.ctx.time();
        log_info!(self.ctx, "all workloads are done, ending the simulation");
        self.end_sent = true;
        self.writer.append_simulation_ends(now);
        let message = self.writer.generate_message(now);
        match self.link.round_trip(&message) {
            Ok(reply) => {
                if let Ok(parsed) = self.reader.parse_message(&reply, true) {
                    if !parsed.commands.is_empty() {
                        log_warn!(
                            self.ctx,
                            "the scheduler sent {} command(s) after SIMULATION_ENDS, ignored",
                            parsed.commands.len()
                        );
                    }
                }
            }
            Err(e) => log_error!(self.ctx, "scheduler shutdown handshake failed: {}", e),
        }
        let _ = self.monitoring.borrow_mut().flush();
    }

    // ------------------------------------------------------------------
    // Internal message handlers
    // ------------------------------------------------------------------

    fn on_start(&mut self) {
        let context = self.context.borrow();
        self.writer.append_simulation_begins(
            &self.machines,
            &context.workloads,
            &context.config_json,
            context.allow_compute_sharing,
            context.allow_storage_sharing,
            context.redis_enabled,
            self.ctx.time(),
        );
        drop(context);

        if let Some(spec) = self.params.batsim_checkpoint {
            if spec.time_base == CheckpointTimeBase::Simulated {
                self.ctx.emit_self(CheckpointTick {}, spec.total_seconds as f64);
            }
        }
        // Timers restored from a snapshot still have to fire.
        let now = self.ctx.time();
        for target in self.context.borrow().call_me_laters.target_times() {
            self.ctx.emit_self(RequestedCallDue {}, (target - now).max(0.));
        }
        self.round_trip();
    }

    fn on_job_submitted(&mut self, key: u64) {
        let job = self.storage.borrow().job(key);
        {
            let mut job = job.borrow_mut();
            if job.state != JobState::NotSubmitted {
                return;
            }
            job.state = JobState::Submitted;
        }
        self.nb_open_jobs += 1;
        {
            let context = self.context.borrow();
            if context.start_from_checkpoint.active
                && self.ctx.time() == context.start_from_checkpoint.restart_instant
            {
                self.initial_submissions_seen += 1;
            }
            self.writer
                .append_job_submitted(&job.borrow(), context.redis_enabled, self.ctx.time());
        }
        self.schedule_flush();
    }

    fn on_submitter_finished(&mut self, workload: &str) {
        log_info!(self.ctx, "workload '{}' has no more jobs to submit", workload);
        self.submitters_remaining -= 1;
        if self.submitters_remaining == 0 {
            self.writer
                .append_notify("no_more_static_job_to_submit", self.ctx.time());
            self.schedule_flush();
        }
    }

    fn on_execution_finished(&mut self, key: u64, state: JobState, return_code: i32) {
        let job = self.storage.borrow().job(key);
        if job.borrow().state != JobState::Running {
            return;
        }
        self.finalize_job(key, state, Some(return_code));

        let job = job.borrow();
        self.writer.append_job_completed(
            job.id.as_str(),
            job.state.wire_name(),
            &job.allocation.as_ref().map(|a| a.to_string()).unwrap_or_default(),
            return_code,
            self.ctx.time(),
        );
        drop(job);
        self.schedule_flush();
    }

    fn on_execution_interrupted(
        &mut self,
        key: u64,
        for_what: i32,
        progress: Option<crate::task_tree::ProgressSnapshot>,
    ) {
        let job = self.storage.borrow().job(key);
        if job.borrow().state != JobState::Running {
            // forced terminal through CHANGE_JOB_STATE in the meantime
            return;
        }
        self.finalize_job(key, JobState::CompletedKilled, None);

        let mut completed_group = None;
        for (position, group) in self.pending_kills.iter_mut().enumerate() {
            if group.pending.remove(&key) {
                if let Some(entry) = group.entries.iter_mut().find(|e| e.key == Some(key)) {
                    entry.progress = progress;
                    entry.for_what = for_what;
                }
                if group.pending.is_empty() {
                    completed_group = Some(position);
                }
                break;
            }
        }

        if let Some(position) = completed_group {
            let group = self.pending_kills.remove(position);
            self.emit_kill_report(group);
        }
        self.schedule_flush();
    }

    fn emit_kill_report(&mut self, group: KillGroup) {
        let now = self.ctx.time();
        let reports: Vec<KilledJobReport> = group
            .entries
            .iter()
            .map(|e| KilledJobReport {
                simple_id: e.simple_id.clone(),
                for_what: e.for_what,
                progress: e.progress.clone(),
            })
            .collect();
        self.writer.append_job_killed(&reports, now);

        for entry in &group.entries {
            let Some(key) = entry.key else { continue };
            let job = self.storage.borrow().job(key);
            let job = job.borrow();
            if job.state == JobState::CompletedKilled {
                self.writer.append_job_completed(
                    job.id.as_str(),
                    job.state.wire_name(),
                    &job.allocation.as_ref().map(|a| a.to_string()).unwrap_or_default(),
                    job.return_code.unwrap_or(-1),
                    now,
                );
            }
        }
        self.schedule_flush();
    }

    /// Common bookkeeping for every terminal transition of a running job.
    fn finalize_job(&mut self, key: u64, state: JobState, return_code: Option<i32>) {
        let now = self.ctx.time();
        let job = self.storage.borrow().job(key);
        {
            let mut job = job.borrow_mut();
            job.state = state;
            job.return_code = return_code;
            let elapsed = job.starting_time.map(|start| now - start).unwrap_or(0.);
            let previous = job.restore.as_ref().map(|r| r.runtime).unwrap_or(0.);
            job.runtime = Some(elapsed + previous);
        }
        self.nb_running_jobs -= 1;
        self.nb_open_jobs -= 1;
        self.context.borrow_mut().nb_completed_jobs += 1;

        if let Err(e) = self.monitoring.borrow_mut().job_completed(&job.borrow(), now) {
            log_error!(self.ctx, "cannot write the job trace: {}", e);
        }

        let garbage_collect = self.context.borrow().garbage_collect_profiles;
        if garbage_collect {
            let (workload_name, profile_name) = {
                let job = job.borrow();
                (job.id.workload_name().to_string(), job.profile.name.clone())
            };
            let mut context = self.context.borrow_mut();
            if let Ok(workload) = context.workloads.at_mut(&workload_name) {
                workload.profiles.release(&profile_name);
            }
        }
    }

    fn on_requested_call_due(&mut self) {
        let now = self.ctx.time();
        let due = self.context.borrow_mut().call_me_laters.take_due(now);
        for entry in &due {
            self.writer.append_requested_call(entry.id, entry.for_what, now);
        }
        if !due.is_empty() {
            self.schedule_flush();
        }
    }

    fn on_checkpoint_tick(&mut self) {
        if self.end_sent {
            return;
        }
        self.do_checkpoint();
        if let Some(spec) = self.params.batsim_checkpoint {
            self.ctx.emit_self(CheckpointTick {}, spec.total_seconds as f64);
        }
    }

    fn maybe_real_time_checkpoint(&mut self) {
        let Some(spec) = self.params.batsim_checkpoint else {
            return;
        };
        if spec.time_base != CheckpointTimeBase::Real {
            return;
        }
        if self.last_real_checkpoint.elapsed().as_secs() >= spec.total_seconds {
            self.last_real_checkpoint = std::time::Instant::now();
            self.do_checkpoint();
        }
    }

    fn do_checkpoint(&mut self) {
        let now = self.ctx.time();
        let _ = self.monitoring.borrow_mut().flush();
        let jobs_csv = self.monitoring.borrow().jobs_csv_path().to_path_buf();
        let result = self
            .checkpointer
            .take_snapshot(&self.context.borrow(), now, Some(&jobs_csv));
        match result {
            Ok(dir) => log_info!(self.ctx, "checkpoint written to {}", dir.display()),
            Err(e) => log_error!(self.ctx, "checkpoint abandoned: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Scheduler command application
    // ------------------------------------------------------------------

    fn apply_command(&mut self, index: usize, command: SchedulerCommand) {
        match command {
            SchedulerCommand::RejectJob { job_id } => {
                let job = self.job_or_fatal(index, &job_id);
                let mut job = job.borrow_mut();
                if job.state.is_terminal() {
                    return;
                }
                if job.state == JobState::Running {
                    drop(job);
                    self.fatal(format!(
                        "invalid REJECT_JOB: job '{}' is already running",
                        job_id
                    ));
                }
                job.state = JobState::Rejected(RejectionReason::NotEnoughResources);
                drop(job);
                self.nb_open_jobs -= 1;
                self.context.borrow_mut().nb_completed_jobs += 1;
            }
            SchedulerCommand::ExecuteJob(command) => self.apply_execute_job(index, command),
            SchedulerCommand::ChangeJobState { job_id, state } => {
                let job = self.job_or_fatal(index, &job_id);
                let mut job = job.borrow_mut();
                if job.state.is_terminal() {
                    return;
                }
                let was_running = job.state == JobState::Running;
                job.state = state;
                drop(job);
                if state.is_terminal() {
                    self.nb_open_jobs -= 1;
                    self.context.borrow_mut().nb_completed_jobs += 1;
                    if was_running {
                        self.nb_running_jobs -= 1;
                        let key = self.storage.borrow().key_of(&job_id).expect("running job key");
                        self.ctx.emit_now(
                            CancelJobExecution {
                                key,
                                for_what: crate::protocol::messages::kill_types::NONE,
                            },
                            self.executor_id,
                        );
                    }
                    let now = self.ctx.time();
                    let job = self.job_or_fatal(index, &job_id);
                    let _ = self.monitoring.borrow_mut().job_completed(&job.borrow(), now);
                }
            }
            SchedulerCommand::CallMeLater {
                id,
                for_what,
                target_time,
            } => {
                let now = self.ctx.time();
                let target = if target_time < now {
                    log_warn!(
                        self.ctx,
                        "event {} (CALL_ME_LATER) asks to be called at time {} but it is \
                         already reached",
                        index,
                        target_time
                    );
                    now
                } else {
                    target_time
                };
                self.context.borrow_mut().call_me_laters.insert(CallMeLaterEntry {
                    id,
                    for_what,
                    target_time: target,
                    date_received: now,
                });
                self.ctx.emit_self(RequestedCallDue {}, target - now);
            }
            SchedulerCommand::KillJobs { requests } => self.apply_kill_jobs(index, requests),
            SchedulerCommand::RegisterJob {
                job_id,
                description,
            } => self.apply_register_job(index, job_id, description),
            SchedulerCommand::RegisterProfile {
                workload,
                name,
                profile,
            } => {
                let already_exists = {
                    let mut context = self.context.borrow_mut();
                    if !context.workloads.exists(&workload) {
                        context
                            .workloads
                            .insert(crate::workload::Workload::new_dynamic(&workload))
                            .expect("fresh dynamic workload");
                    }
                    context
                        .workloads
                        .at(&workload)
                        .expect("workload just ensured")
                        .profiles
                        .exists(&name)
                };
                if already_exists {
                    self.fatal(format!(
                        "invalid new profile registration: profile '{}' already existed in \
                         workload '{}'",
                        name, workload
                    ));
                }
                log_info!(
                    self.ctx,
                    "adding dynamically registered profile {} to workload {}",
                    name,
                    workload
                );
                let result = self
                    .context
                    .borrow_mut()
                    .workloads
                    .at_mut(&workload)
                    .expect("workload just ensured")
                    .profiles
                    .add(&name, profile);
                if let Err(e) = result {
                    self.fatal(e.to_string());
                }
            }
            SchedulerCommand::SetResourceState { resources, state } => {
                self.writer.append_resource_state_changed(
                    &resources,
                    &state.to_string(),
                    self.ctx.time(),
                );
                self.schedule_flush();
            }
            SchedulerCommand::SetJobMetadata { job_id, metadata } => {
                let job = self.job_or_fatal(index, &job_id);
                job.borrow_mut().metadata = Some(metadata);
            }
            SchedulerCommand::QueryConsumedEnergy => {
                let consumed = self.context.borrow().total_consumed_energy;
                self.writer.append_answer_energy(consumed, self.ctx.time());
                self.schedule_flush();
            }
            SchedulerCommand::AnswerEstimateWaitingTime { job_id, estimate } => {
                log_warn!(
                    self.ctx,
                    "received an ANSWER of type 'estimate_waiting_time' with job_id='{}' and \
                     estimate={}, nothing to do with it",
                    job_id,
                    estimate
                );
            }
            SchedulerCommand::ToJobMsg { job_id, message } => {
                let job = self.job_or_fatal(index, &job_id);
                let mut job = job.borrow_mut();
                if job.state != JobState::Running {
                    log_warn!(self.ctx, "TO_JOB_MSG for job '{}' which is not running", job_id);
                }
                job.incoming_messages.push(message);
            }
            SchedulerCommand::NotifyRegistrationFinished => {
                self.context.borrow_mut().registration_finished = true;
            }
            SchedulerCommand::NotifyContinueRegistration => {
                self.context.borrow_mut().registration_finished = false;
            }
            SchedulerCommand::NotifyMetric { kind, value } => {
                let mut context = self.context.borrow_mut();
                use crate::protocol::messages::MetricKind;
                match kind {
                    MetricKind::QueueSize => context.metrics.queue_size = value as u64,
                    MetricKind::ScheduleSize => context.metrics.schedule_size = value as u64,
                    MetricKind::NbRunningJobs => context.metrics.nb_running_jobs = value as u64,
                    MetricKind::Utilization => context.metrics.utilization = value,
                    MetricKind::UtilizationNoResv => context.metrics.utilization_no_resv = value,
                    MetricKind::SchedulerPid => context.metrics.scheduler_pid = value as i64,
                }
            }
            SchedulerCommand::NotifyCheckpoint => {
                self.do_checkpoint();
                let now = self.ctx.time();
                self.context.borrow_mut().call_me_laters.insert(CallMeLaterEntry {
                    id: 1,
                    for_what: call_me_later_types::CHECKPOINT_BATSCHED,
                    target_time: now,
                    date_received: now,
                });
                self.ctx.emit_self_now(RequestedCallDue {});
            }
            SchedulerCommand::NotifyRecoverFromCheckpoint => {
                let now = self.ctx.time();
                self.context.borrow_mut().call_me_laters.insert(CallMeLaterEntry {
                    id: 1,
                    for_what: call_me_later_types::RECOVER_FROM_CHECKPOINT,
                    target_time: now,
                    date_received: now,
                });
                self.ctx.emit_self_now(RequestedCallDue {});
            }
        }
    }

    fn apply_execute_job(&mut self, index: usize, command: ExecuteJobCommand) {
        let ExecuteJobCommand {
            job_id,
            alloc,
            mapping,
            storage_mapping,
            io,
        } = command;
        let job = self.job_or_fatal(index, &job_id);
        {
            let job = job.borrow();
            if job.state != JobState::Submitted {
                self.fatal(format!(
                    "invalid EXECUTE_JOB: job '{}' is {}, not SUBMITTED",
                    job_id,
                    job.state.wire_name()
                ));
            }
            let provided = match &mapping {
                Some(mapping) => mapping.len() as u32,
                None => alloc.size(),
            };
            if provided != job.requested_nb_res {
                self.fatal(
                    ReferentialError::AllocationMismatch {
                        job: job_id.to_string(),
                        requested: job.requested_nb_res,
                        got: provided,
                        alloc: alloc.to_string(),
                    }
                    .to_string(),
                );
            }
        }

        // Resolve the optional I/O overlay profile within the job's workload.
        let io_profile = io.map(|io| {
            let mut context = self.context.borrow_mut();
            let workload = context
                .workloads
                .at_mut(job_id.workload_name())
                .unwrap_or_else(|e| self.fatal(e.to_string()));
            if let Some(definition) = io.profile {
                if workload.profiles.exists(&io.profile_name) {
                    self.fatal(format!(
                        "the profile name '{}' given for an additional_io_job already exists",
                        io.profile_name
                    ));
                }
                if let Err(e) = workload.profiles.add(&io.profile_name, definition) {
                    self.fatal(e.to_string());
                }
            }
            workload
                .profiles
                .get(&io.profile_name)
                .unwrap_or_else(|e| self.fatal(e.to_string()))
        });

        let context = self.context.borrow();
        let workload = context
            .workloads
            .at(job_id.workload_name())
            .unwrap_or_else(|e| self.fatal(e.to_string()));
        let registry = &workload.profiles;

        if let Some(io_profile) = &io_profile {
            // Sequence overlays must pair with a same-length main sequence.
            let io_data = io_profile.data.borrow();
            if let ProfileData::Sequence { children: io_children, .. } = &*io_data {
                let job = job.borrow();
                let main = job.profile.data.borrow();
                match &*main {
                    ProfileData::Sequence { children, .. } => {
                        if children.len() != io_children.len() {
                            self.fatal(format!(
                                "the I/O profile sequence size ({}) and the job profile \
                                 sequence size ({}) should be the same",
                                io_children.len(),
                                children.len()
                            ));
                        }
                    }
                    _ => {
                        self.fatal(
                            "the additional I/O profile is a sequence but the job profile is not"
                                .to_string(),
                        );
                    }
                }
            }
        }

        let (tree, plan) = {
            let job = job.borrow();
            let tree = TaskTree::from_profile(&job.profile, registry)
                .unwrap_or_else(|e| self.fatal(e.to_string()));
            let plan = build_exec_plan(
                &job.profile,
                registry,
                job.requested_nb_res as usize,
                io_profile.as_ref(),
            )
            .unwrap_or_else(|e| self.fatal(e.to_string()));
            (tree, plan)
        };
        drop(context);

        let key = {
            let mut job_mut = job.borrow_mut();
            job_mut.allocation = Some(alloc);
            job_mut.starting_time = Some(self.ctx.time());
            job_mut.state = JobState::Running;
            job_mut.task = Some(Rc::new(RefCell::new(tree)));
            if let Some(mapping) = mapping {
                job_mut.smpi_ranks_to_hosts_mapping = mapping;
            }
            job_mut.storage_mapping = storage_mapping;
            drop(job_mut);
            self.storage.borrow_mut().register_job(job.clone())
        };
        self.storage.borrow_mut().set_plan(key, plan);
        self.nb_running_jobs += 1;

        log_debug!(self.ctx, "dispatching job {} to the executor", job_id);
        self.ctx.emit_now(StartJobExecution { key }, self.executor_id);
    }

    fn apply_kill_jobs(&mut self, index: usize, requests: Vec<crate::protocol::messages::KillRequest>) {
        let mut group = KillGroup {
            pending: FxHashSet::default(),
            entries: Vec::with_capacity(requests.len()),
        };
        for request in requests {
            let job = self.job_or_fatal(index, &request.job_id);
            let mut job = job.borrow_mut();
            let key = self.storage.borrow().key_of(&request.job_id);
            let mut entry = KillEntry {
                key,
                simple_id: request.job_id.to_string(),
                for_what: request.for_what,
                progress: None,
            };
            if job.state == JobState::Running && !job.kill_requested {
                job.kill_requested = true;
                let key = key.expect("running jobs are registered");
                entry.key = Some(key);
                group.pending.insert(key);
                self.ctx.emit_now(
                    CancelJobExecution {
                        key,
                        for_what: request.for_what,
                    },
                    self.executor_id,
                );
            } else {
                // already complete (or already being killed): acknowledged
                // without progress, per the at-most-once completion rule
                entry.key = None;
            }
            group.entries.push(entry);
        }

        if group.pending.is_empty() {
            self.emit_kill_report(group);
        } else {
            self.pending_kills.push(group);
        }
    }

    fn apply_register_job(&mut self, index: usize, job_id: crate::jobs::JobIdentifier, description: Value) {
        let _ = index;
        let mut context = self.context.borrow_mut();
        if !context.workloads.exists(job_id.workload_name()) {
            drop(context);
            self.fatal(format!(
                "cannot register job '{}': workload '{}' does not exist",
                job_id,
                job_id.workload_name()
            ));
        }
        if context.workloads.job_is_registered(&job_id) {
            drop(context);
            self.fatal(format!(
                "cannot register new job '{}', it already exists in the workload",
                job_id
            ));
        }

        let workload = context.workloads.at_mut(job_id.workload_name()).expect("workload");
        let job = match workload.job_from_json(&description, "Invalid JSON job submitted by the scheduler", None) {
            Ok(mut job) => {
                job.state = JobState::Submitted;
                job.from_workload = false;
                job
            }
            Err(e) => {
                drop(context);
                self.fatal(e.to_string());
            }
        };
        let handle = match workload.jobs.add(job) {
            Ok(handle) => handle,
            Err(e) => {
                drop(context);
                self.fatal(e.to_string());
            }
        };
        context.nb_jobs += 1;
        drop(context);

        self.storage.borrow_mut().register_job(handle.clone());
        self.nb_open_jobs += 1;

        if self.params.ack_dynamic_registration {
            let redis_enabled = self.context.borrow().redis_enabled;
            self.writer
                .append_job_submitted(&handle.borrow(), redis_enabled, self.ctx.time());
            self.schedule_flush();
        }
    }

    fn job_or_fatal(&self, index: usize, id: &crate::jobs::JobIdentifier) -> crate::jobs::JobHandle {
        match self.context.borrow().workloads.job_at(id) {
            Ok(job) => job,
            Err(e) => self.fatal(format!("event {}: {}", index, e)),
        }
    }
}

impl EventHandler for Server {
    fn on(&mut self, event: Event) {
        if event.data.downcast_ref::<ServerStart>().is_some() {
            self.on_start();
        } else if let Some(e) = event.data.downcast_ref::<JobSubmittedInternal>() {
            self.on_job_submitted(e.key);
        } else if let Some(e) = event.data.downcast_ref::<SubmitterFinished>() {
            let workload = e.workload.clone();
            self.on_submitter_finished(&workload);
        } else if let Some(e) = event.data.downcast_ref::<JobExecutionFinished>() {
            self.on_execution_finished(e.key, e.state, e.return_code);
        } else if let Some(e) = event.data.downcast_ref::<JobExecutionInterrupted>() {
            self.on_execution_interrupted(e.key, e.for_what, e.progress.clone());
        } else if let Some(e) = event.data.downcast_ref::<ApplyCommand>() {
            let (index, command) = (e.index, e.command.clone());
            self.apply_command(index, command);
            self.schedule_flush();
        } else if event.data.downcast_ref::<SchedulerReadyNow>().is_some() {
            self.sched_ready = true;
            self.try_sync();
            self.check_end();
        } else if event.data.downcast_ref::<FlushNow>().is_some() {
            self.flush_scheduled = false;
            self.try_sync();
            self.check_end();
        } else if event.data.downcast_ref::<RequestedCallDue>().is_some() {
            self.on_requested_call_due();
        } else if event.data.downcast_ref::<CheckpointTick>().is_some() {
            self.on_checkpoint_tick();
        }
    }
}
