//! The job executor: turns execution plans into kernel work units on the
//! allocated hosts, races them against the walltime and external kills, and
//! reports the outcome back to the server.

use std::rc::Rc;

use dslab_compute::multicore::{
    AllocationFailed, AllocationSuccess, CompFailed, CompFinished, CoresDependency,
    DeallocationSuccess,
};
use dslab_core::{log_debug, log_error, log_warn, Event, EventHandler, Id, SimulationContext};
use dslab_network::{DataTransferCompleted, Network};
use futures::future::{join_all, LocalBoxFuture};
use futures::{pin_mut, select, FutureExt};
use rustc_hash::FxHashMap;
use std::cell::RefCell;

use crate::errors::ReferentialError;
use crate::events::{
    CancelJobExecution, JobExecutionFinished, JobExecutionInterrupted, StartJobExecution,
};
use crate::host::{ClusterHost, HostProcessInstance};
use crate::jobs::{JobHandle, JobState};
use crate::profiles::{ProfileData, ProfileHandle, ProfileRegistry};
use crate::storage::SharedStorage;
use crate::task_tree::{ExecNode, TaskTree};

enum Outcome {
    Completed,
    Failed(i32),
    WalltimeReached,
    Killed(i32),
}

pub struct JobExecutor {
    hosts: FxHashMap<u32, Rc<ClusterHost>>,
    network: Option<Rc<RefCell<Network>>>,
    storage: SharedStorage,
    server_id: Id,
    process_cnt: RefCell<u64>,
    ctx: SimulationContext,
}

impl JobExecutor {
    pub fn new(
        ctx: SimulationContext,
        storage: SharedStorage,
        network: Option<Rc<RefCell<Network>>>,
    ) -> JobExecutor {
        JobExecutor {
            hosts: FxHashMap::default(),
            network,
            storage,
            server_id: u32::MAX,
            process_cnt: RefCell::new(0),
            ctx,
        }
    }

    pub fn id(&self) -> Id {
        self.ctx.id()
    }

    pub fn set_server(&mut self, server_id: Id) {
        self.server_id = server_id;
    }

    pub fn add_host(&mut self, host: Rc<ClusterHost>) {
        self.hosts.insert(host.machine_id, host);
    }

    fn start_job(&self, key: u64) {
        let job = self.storage.borrow().job(key);
        let plan = self
            .storage
            .borrow_mut()
            .take_plan(key)
            .expect("job dispatched without an execution plan");

        let hosts: Vec<Rc<ClusterHost>> = {
            let job = job.borrow();
            let allocation = job.allocation.as_ref().expect("job dispatched without an allocation");
            let machines: Vec<u32> = allocation.iter().collect();
            let order: Vec<u32> = match &job.smpi_ranks_to_hosts_mapping {
                mapping if !mapping.is_empty() => {
                    mapping.iter().map(|&pos| machines[pos as usize]).collect()
                }
                _ => machines,
            };
            order
                .iter()
                .map(|id| self.hosts.get(id).expect("allocation outside the platform").clone())
                .collect()
        };

        log_debug!(self.ctx, "start job: {}", job.borrow().id);
        self.ctx.spawn(self.execute_job(key, job, plan, hosts));
    }

    async fn execute_job(
        &self,
        key: u64,
        job: JobHandle,
        plan: ExecNode,
        hosts: Vec<Rc<ClusterHost>>,
    ) {
        let (cores, walltime) = {
            let job = job.borrow();
            (job.cores, job.walltime)
        };

        let mut processes = Vec::with_capacity(hosts.len());
        for host in &hosts {
            match self.allocate_process(host, cores).await {
                Ok(process) => processes.push(process),
                Err(reason) => {
                    log_error!(self.ctx, "allocation failed on {}: {}", host.name, reason);
                    self.release_processes(processes).await;
                    self.ctx.emit_now(
                        JobExecutionFinished {
                            key,
                            state: JobState::CompletedFailed,
                            return_code: 1,
                        },
                        self.server_id,
                    );
                    return;
                }
            }
        }

        let tree = job.borrow().task.clone().expect("job dispatched without a task tree");

        let outcome = {
            let run = self.run_plan(&plan, &processes, &tree, Vec::new()).fuse();
            let deadline = async {
                match walltime {
                    Some(walltime) => self.ctx.sleep(walltime).await,
                    None => futures::future::pending::<()>().await,
                }
            }
            .fuse();
            let kill = self.ctx.recv_event_by_key::<CancelJobExecution>(key).fuse();
            pin_mut!(run, deadline, kill);
            select! {
                result = run => match result {
                    Ok(()) => Outcome::Completed,
                    Err(code) => Outcome::Failed(code),
                },
                _ = deadline => Outcome::WalltimeReached,
                cancel = kill => Outcome::Killed(cancel.data.for_what),
            }
        };

        // Capture progress before tearing the kernel state down.
        let progress = tree.borrow().snapshot(self.ctx.time());

        self.release_processes(processes).await;

        let id = job.borrow().id.clone();
        match outcome {
            Outcome::Completed => {
                log_debug!(self.ctx, "finish job: {}", id);
                self.ctx.emit_now(
                    JobExecutionFinished {
                        key,
                        state: JobState::CompletedSuccessfully,
                        return_code: 0,
                    },
                    self.server_id,
                );
            }
            Outcome::Failed(return_code) => {
                log_debug!(self.ctx, "job {} failed with code {}", id, return_code);
                self.ctx.emit_now(
                    JobExecutionFinished {
                        key,
                        state: JobState::CompletedFailed,
                        return_code,
                    },
                    self.server_id,
                );
            }
            Outcome::WalltimeReached => {
                log_debug!(self.ctx, "job {} reached its walltime", id);
                self.ctx.emit_now(
                    JobExecutionFinished {
                        key,
                        state: JobState::CompletedWalltimeReached,
                        return_code: -1,
                    },
                    self.server_id,
                );
            }
            Outcome::Killed(for_what) => {
                log_debug!(self.ctx, "job {} killed (forWhat={})", id, for_what);
                self.ctx.emit_now(
                    JobExecutionInterrupted {
                        key,
                        for_what,
                        progress: Some(progress),
                    },
                    self.server_id,
                );
            }
        }
    }

    async fn allocate_process(
        &self,
        host: &Rc<ClusterHost>,
        cores: u32,
    ) -> Result<HostProcessInstance, String> {
        let allocation_id = host
            .compute
            .borrow_mut()
            .allocate_managed(cores, 0, self.ctx.id());

        let success = self.ctx.recv_event_by_key::<AllocationSuccess>(allocation_id).fuse();
        let failure = self.ctx.recv_event_by_key::<AllocationFailed>(allocation_id).fuse();
        pin_mut!(success, failure);
        select! {
            _ = success => {}
            failed = failure => {
                return Err(format!("{:?}", failed.data.reason));
            }
        }

        let process_id = *self.process_cnt.borrow();
        *self.process_cnt.borrow_mut() += 1;
        Ok(HostProcessInstance {
            id: process_id,
            compute_allocation_id: allocation_id,
            host: host.clone(),
        })
    }

    async fn release_processes(&self, processes: Vec<HostProcessInstance>) {
        for process in processes {
            let deallocation_id = process
                .host
                .compute
                .borrow_mut()
                .deallocate_managed(process.compute_allocation_id, self.ctx.id());
            self.ctx
                .recv_event_by_key::<DeallocationSuccess>(deallocation_id)
                .await;
        }
    }

    fn run_plan<'a>(
        &'a self,
        plan: &'a ExecNode,
        processes: &'a [HostProcessInstance],
        tree: &'a Rc<RefCell<TaskTree>>,
        path: Vec<usize>,
    ) -> LocalBoxFuture<'a, Result<(), i32>> {
        async move {
            match plan {
                ExecNode::Delay { seconds } => {
                    with_tree_node(tree, &path, |node| {
                        node.mark_started(self.ctx.time(), Some(*seconds))
                    });
                    self.ctx.sleep(*seconds).await;
                    Ok(())
                }
                ExecNode::Parallel { cpu, com } => {
                    let expected = processes
                        .iter()
                        .zip(cpu)
                        .map(|(p, flops)| flops / p.host.speed)
                        .fold(0., f64::max);
                    with_tree_node(tree, &path, |node| {
                        node.mark_started(self.ctx.time(), Some(expected))
                    });
                    self.run_parallel(cpu, com, processes).await
                }
                ExecNode::Sequence { children } => {
                    for (index, child) in children.iter().enumerate() {
                        with_tree_node(tree, &path, |node| node.advance_sequence(index));
                        let mut child_path = path.clone();
                        child_path.push(index);
                        self.run_plan(child, processes, tree, child_path).await?;
                    }
                    Ok(())
                }
                ExecNode::Opaque => {
                    log_warn!(
                        self.ctx,
                        "opaque work unit (e.g. a replay trace) is forwarded outside the \
                         kernel and completes immediately"
                    );
                    Ok(())
                }
            }
        }
        .boxed_local()
    }

    async fn run_parallel(
        &self,
        cpu: &[f64],
        com: &[f64],
        processes: &[HostProcessInstance],
    ) -> Result<(), i32> {
        let n = processes.len();
        let mut work: Vec<LocalBoxFuture<'_, Result<(), i32>>> = Vec::new();

        for (process, flops) in processes.iter().zip(cpu) {
            if *flops > 0. {
                work.push(self.run_flops(process, *flops).boxed_local());
            }
        }
        for i in 0..n {
            for j in 0..n {
                let bytes = com.get(i * n + j).copied().unwrap_or(0.);
                if i != j && bytes > 0. {
                    work.push(
                        async move {
                            self.transfer(&processes[i], &processes[j], bytes).await;
                            Ok(())
                        }
                        .boxed_local(),
                    );
                }
            }
        }

        for result in join_all(work).await {
            result?;
        }
        Ok(())
    }

    async fn run_flops(&self, process: &HostProcessInstance, flops: f64) -> Result<(), i32> {
        // Profiles express flops per host, not per core: speedup stays 1.
        let computation_id = process.host.compute.borrow_mut().run_on_allocation(
            flops,
            process.compute_allocation_id,
            CoresDependency::LinearWithFixed { fixed_part: 1.0 },
            self.ctx.id(),
        );
        let finished = self.ctx.recv_event_by_key::<CompFinished>(computation_id).fuse();
        let failed = self.ctx.recv_event_by_key::<CompFailed>(computation_id).fuse();
        pin_mut!(finished, failed);
        select! {
            _ = finished => Ok(()),
            failure = failed => {
                log_error!(self.ctx, "kernel work unit failed: {:?}", failure.data.reason);
                Err(1)
            }
        }
    }

    async fn transfer(&self, from: &HostProcessInstance, to: &HostProcessInstance, bytes: f64) {
        let Some(network) = &self.network else {
            return;
        };
        let transfer_id = network.borrow_mut().transfer_data(
            from.host.id(),
            to.host.id(),
            bytes,
            self.ctx.id(),
        );
        self.ctx
            .recv_event_by_key::<DataTransferCompleted>(transfer_id as u64)
            .await;
    }
}

impl EventHandler for JobExecutor {
    fn on(&mut self, event: Event) {
        if let Some(start) = event.data.downcast_ref::<StartJobExecution>() {
            self.start_job(start.key);
        }
        // Everything else is a completion for work that was cancelled in the
        // meantime (kill or walltime); it has no waiter left and is dropped.
    }
}

fn with_tree_node<R>(
    tree: &Rc<RefCell<TaskTree>>,
    path: &[usize],
    f: impl FnOnce(&mut TaskTree) -> R,
) -> R {
    let mut borrow = tree.borrow_mut();
    let mut node = &mut *borrow;
    for &index in path {
        node = node.child_mut(index).expect("execution plan out of sync with the task tree");
    }
    f(node)
}

/// Builds the execution plan of a profile, expanding sequence repeats and
/// merging the optional I/O overlay leaf by leaf (additive on flops and
/// communication).
pub fn build_exec_plan(
    profile: &ProfileHandle,
    registry: &ProfileRegistry,
    nb_hosts: usize,
    io_profile: Option<&ProfileHandle>,
) -> Result<ExecNode, ReferentialError> {
    let main = plan_of(profile, registry, nb_hosts)?;
    match io_profile {
        None => Ok(main),
        Some(io) => {
            let io = plan_of(io, registry, nb_hosts)?;
            Ok(merge_io(main, io))
        }
    }
}

fn plan_of(
    profile: &ProfileHandle,
    registry: &ProfileRegistry,
    nb_hosts: usize,
) -> Result<ExecNode, ReferentialError> {
    let data = profile.data.borrow().clone();
    Ok(match data {
        ProfileData::Delay { delay, .. } => ExecNode::Delay { seconds: delay },
        ProfileData::ParallelHomogeneous { cpu, com, .. } => {
            let mut matrix = vec![com; nb_hosts * nb_hosts];
            for i in 0..nb_hosts {
                matrix[i * nb_hosts + i] = 0.;
            }
            ExecNode::Parallel {
                cpu: vec![cpu; nb_hosts],
                com: matrix,
            }
        }
        ProfileData::ParallelHeterogeneous { cpu, com } => ExecNode::Parallel { cpu, com },
        ProfileData::Sequence { repeat, children } => {
            let mut plans = Vec::with_capacity(children.len() * repeat as usize);
            for _ in 0..repeat {
                for child in &children {
                    let child_profile = registry.get(child)?;
                    plans.push(plan_of(&child_profile, registry, nb_hosts)?);
                }
            }
            ExecNode::Sequence { children: plans }
        }
        ProfileData::Smpi { .. } => ExecNode::Opaque,
    })
}

fn merge_io(main: ExecNode, io: ExecNode) -> ExecNode {
    match (main, io) {
        (ExecNode::Parallel { mut cpu, mut com }, ExecNode::Parallel { cpu: io_cpu, com: io_com }) => {
            for (slot, add) in cpu.iter_mut().zip(io_cpu) {
                *slot += add;
            }
            for (slot, add) in com.iter_mut().zip(io_com) {
                *slot += add;
            }
            ExecNode::Parallel { cpu, com }
        }
        (ExecNode::Sequence { children }, ExecNode::Sequence { children: io_children }) => {
            let merged = children
                .into_iter()
                .zip(io_children)
                .map(|(main, io)| merge_io(main, io))
                .collect();
            ExecNode::Sequence { children: merged }
        }
        (main, _) => main,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::ProfileRegistry;
    use serde_json::json;

    fn registry() -> ProfileRegistry {
        let mut registry = ProfileRegistry::new("w0");
        registry
            .add("ph", json!({"type": "parallel_homogeneous", "cpu": 8.0, "com": 2.0}))
            .unwrap();
        registry
            .add("io", json!({"type": "parallel_homogeneous", "cpu": 1.0, "com": 1.0}))
            .unwrap();
        registry
            .add("seq", json!({"type": "composed", "repeat": 2, "seq": ["ph"]}))
            .unwrap();
        registry
            .add("io_seq", json!({"type": "composed", "repeat": 2, "seq": ["io"]}))
            .unwrap();
        registry
    }

    #[test]
    fn homogeneous_plan_expands_to_vectors() {
        let registry = registry();
        let plan = build_exec_plan(&registry.get("ph").unwrap(), &registry, 2, None).unwrap();
        assert_eq!(
            plan,
            ExecNode::Parallel {
                cpu: vec![8., 8.],
                com: vec![0., 2., 2., 0.],
            }
        );
    }

    #[test]
    fn io_overlay_is_additive() {
        let registry = registry();
        let plan = build_exec_plan(
            &registry.get("ph").unwrap(),
            &registry,
            2,
            Some(&registry.get("io").unwrap()),
        )
        .unwrap();
        assert_eq!(
            plan,
            ExecNode::Parallel {
                cpu: vec![9., 9.],
                com: vec![0., 3., 3., 0.],
            }
        );
    }

    #[test]
    fn sequence_overlay_merges_pairwise() {
        let registry = registry();
        let plan = build_exec_plan(
            &registry.get("seq").unwrap(),
            &registry,
            1,
            Some(&registry.get("io_seq").unwrap()),
        )
        .unwrap();
        assert_eq!(
            plan,
            ExecNode::Sequence {
                children: vec![
                    ExecNode::Parallel { cpu: vec![9.], com: vec![0.] },
                    ExecNode::Parallel { cpu: vec![9.], com: vec![0.] },
                ],
            }
        );
    }
}
