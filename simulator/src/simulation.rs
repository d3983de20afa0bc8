//! Top-level wiring: builds the platform hosts, loads and transforms the
//! workloads, spawns the actors and runs the kernel event loop.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use dslab_compute::multicore::{
    AllocationFailed, AllocationSuccess, CompFailed, CompFinished, CompStarted, Compute,
    DeallocationSuccess,
};
use dslab_core::{Id, Simulation};
use dslab_network::{
    models::{ConstantBandwidthNetworkModel, SharedBandwidthNetworkModel},
    DataTransferCompleted, Network, NetworkModel,
};
use sugars::{boxed, rc, refcell};

use crate::checkpoint::Checkpointer;
use crate::config::sim_config::{HostGroupConfig, NetworkConfig, SimulationConfig};
use crate::connection::SchedulerLink;
use crate::context::BatsimContext;
use crate::errors::ConfigError;
use crate::events::{CancelJobExecution, ServerStart};
use crate::executor::JobExecutor;
use crate::host::{ClusterHost, MachineDescription};
use crate::monitoring::Monitoring;
use crate::protocol::{JsonProtocolReader, JsonProtocolWriter};
use crate::server::{Server, ServerParams};
use crate::storage::{SharedInfoStorage, SharedStorage};
use crate::submitter::JobSubmitter;
use crate::workload::loader::read_document;
use crate::workload::transform::apply_pipeline;
use crate::workload::{Workload, Workloads};

pub struct BatsimSimulation {
    sim: Simulation,
    context: Rc<RefCell<BatsimContext>>,
    storage: SharedStorage,
    monitoring: Rc<RefCell<Monitoring>>,
    server_id: Id,
    submitters: Vec<(String, JobSubmitter)>,
}

impl BatsimSimulation {
    pub fn new(
        mut sim: Simulation,
        config: SimulationConfig,
        link: Box<dyn SchedulerLink>,
    ) -> Result<BatsimSimulation, ConfigError> {
        config.validate()?;

        let network = config
            .platform
            .network
            .as_ref()
            .map(|network_config| Self::build_network(&mut sim, network_config));

        let storage: SharedStorage = rc!(refcell!(SharedInfoStorage::new()));

        let executor_ctx = sim.create_context("executor");
        let mut executor = JobExecutor::new(executor_ctx, storage.clone(), network.clone());

        let mut machines = Vec::new();
        let mut machine_id: u32 = 0;
        for group in &config.platform.hosts {
            for instance in 0..group.count.unwrap_or(1) {
                let host = Self::build_host(
                    &mut sim,
                    group,
                    instance,
                    machine_id,
                    config.platform.network.as_ref(),
                    network.clone(),
                );
                machines.push(MachineDescription {
                    id: machine_id,
                    name: host.name.clone(),
                    state: "idle".to_string(),
                    core_count: host.cores,
                    speed: host.speed,
                    role: host.role,
                    properties: group.properties.clone(),
                    zone_properties: Default::default(),
                });
                executor.add_host(host);
                machine_id += 1;
            }
        }
        let host_speed = machines
            .first()
            .map(|m| m.speed)
            .expect("the platform has at least one host");

        // Workloads: either the configured files, or the snapshot workload
        // when resuming from a simulator-level checkpoint.
        let mut workloads = Workloads::new();
        let mut restart_info = crate::config::sim_config::StartFromCheckpointInfo::default();
        let mut restored_call_me_laters: Option<crate::context::CallMeLaterStore> = None;
        let mut nb_jobs: u32 = 0;

        let descriptions = match config.start_from_checkpoint {
            Some(slot) => {
                let base = Path::new(&config.export_prefix)
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let path = base
                    .join(format!("checkpoint_{}", slot))
                    .join("workload.json");
                vec![crate::config::sim_config::WorkloadDescription {
                    path: path.to_string_lossy().to_string(),
                    name: "w0".to_string(),
                }]
            }
            None => config.workloads.clone(),
        };

        for desc in &descriptions {
            let mut workload = Workload::new_static(
                &desc.name,
                &desc.path,
                host_speed,
                config.checkpointing,
                config.transforms.performance_factor,
                config.reservations_start.clone(),
            );
            let doc = read_document(&desc.path)?;

            if let Some(slot) = config.start_from_checkpoint {
                let header = workload.load_from_json_checkpoint(&doc, &desc.path)?;
                let variables_path = Path::new(&desc.path)
                    .parent()
                    .map(|p| p.join("batsim_variables.chkpt"));
                if let Some(variables_path) = variables_path {
                    if let Ok(content) = std::fs::read_to_string(&variables_path) {
                        if let Ok(value) = serde_json::from_str(&content) {
                            restored_call_me_laters =
                                Some(crate::context::CallMeLaterStore::from_json(&value));
                        }
                    }
                }
                restart_info.active = true;
                restart_info.nb_folder = slot;
                restart_info.nb_checkpoint = header.nb_checkpoint;
                restart_info.nb_previously_completed = header.nb_actually_completed;
                restart_info.nb_original_jobs = header.nb_original_jobs;
                let restart_instant = workload
                    .jobs
                    .iter()
                    .map(|(_, j)| j.borrow().submission_time)
                    .fold(f64::INFINITY, f64::min);
                if restart_instant.is_finite() {
                    restart_info.restart_instant = restart_instant;
                    restart_info.expected_submissions = workload
                        .jobs
                        .iter()
                        .filter(|(_, j)| j.borrow().submission_time == restart_instant)
                        .count() as u32;
                }
                // the snapshot already carries transformed values
            } else {
                workload.load_from_json(&doc, &desc.path)?;
                apply_pipeline(
                    &mut workload,
                    config.transforms.submission_time_before.as_ref(),
                    config.transforms.copy.as_ref(),
                    config.transforms.submission_time_after.as_ref(),
                )?;
            }
            workload.check_validity()?;
            workload.profiles.remove_unreferenced();

            if workload.nb_res > machines.len() as u32 {
                log::warn!(
                    "workload '{}' declares {} machines but the platform only has {}",
                    desc.name,
                    workload.nb_res,
                    machines.len()
                );
            }
            nb_jobs += workload.jobs.len() as u32;
            workloads.insert(workload)?;
        }
        if !restart_info.active {
            restart_info.nb_original_jobs = nb_jobs;
        }

        let mut context = BatsimContext::new(workloads);
        context.config_json = config.config_json(&restart_info);
        context.export_prefix = config.export_prefix.clone();
        context.redis_enabled = config.redis.enabled;
        context.forward_profiles_on_submission = config.forward_profiles_on_submission;
        context.registration_enabled = config.dynamic_registration_enabled;
        context.registration_ack = config.ack_dynamic_registration;
        context.garbage_collect_profiles =
            !(config.dynamic_registration_enabled && config.profile_reuse_enabled);
        context.allow_compute_sharing = config.allow_compute_sharing;
        context.allow_storage_sharing = config.allow_storage_sharing;
        context.start_from_checkpoint = restart_info.clone();
        if let Some(store) = restored_call_me_laters {
            context.call_me_laters = store;
        }
        context.nb_jobs = nb_jobs;
        context.wall_clock_start = Instant::now();
        let context = rc!(refcell!(context));

        let monitoring = rc!(refcell!(Monitoring::new(
            &config.export_prefix,
            config.output_extra_info
        )
        .map_err(|e| ConfigError::Io {
            path: config.export_prefix.clone(),
            source: e,
        })?));

        let checkpointer = Checkpointer::new(
            &config.export_prefix,
            config.batsim_checkpoint.map(|s| s.keep).unwrap_or(1),
            restart_info.nb_checkpoint,
        );

        let reader = JsonProtocolReader::new(config.dynamic_registration_enabled, config.redis.enabled);
        let writer = JsonProtocolWriter::new(config.forward_profiles_on_submission);

        let server_ctx = sim.create_context("server");
        let server = Server::new(
            server_ctx,
            context.clone(),
            storage.clone(),
            monitoring.clone(),
            checkpointer,
            link,
            reader,
            writer,
            machines,
            executor.id(),
            ServerParams {
                ack_dynamic_registration: config.ack_dynamic_registration,
                batsim_checkpoint: config.batsim_checkpoint,
                nb_submitters: descriptions.len(),
            },
        );
        let server_id = server.id();
        sim.add_handler("server", rc!(refcell!(server)));

        executor.set_server(server_id);
        sim.add_handler("executor", rc!(refcell!(executor)));

        let mut submitters = Vec::new();
        for desc in &descriptions {
            let name = format!("workload_submitter_{}", desc.name);
            let submitter_ctx = sim.create_context(&name);
            submitters.push((
                desc.name.clone(),
                JobSubmitter::new(submitter_ctx, &desc.name, storage.clone(), server_id),
            ));
        }

        Self::register_key_getters(&sim);

        Ok(BatsimSimulation {
            sim,
            context,
            storage,
            monitoring,
            server_id,
            submitters,
        })
    }

    fn build_network(sim: &mut Simulation, config: &NetworkConfig) -> Rc<RefCell<Network>> {
        let model: Box<dyn NetworkModel> = if config.shared {
            boxed!(SharedBandwidthNetworkModel::new(config.bandwidth, config.latency))
        } else {
            boxed!(ConstantBandwidthNetworkModel::new(config.bandwidth, config.latency))
        };
        let network_ctx = sim.create_context("network");
        let network = rc!(refcell!(Network::new(model, network_ctx)));
        sim.add_handler("network", network.clone());
        network
    }

    fn build_host(
        sim: &mut Simulation,
        group: &HostGroupConfig,
        instance: u32,
        machine_id: u32,
        network_config: Option<&NetworkConfig>,
        network: Option<Rc<RefCell<Network>>>,
    ) -> Rc<ClusterHost> {
        let host_name = if group.count.unwrap_or(1) > 1 {
            format!("{}-{}", group.name, instance)
        } else {
            group.name.clone()
        };
        let host_ctx = sim.create_context(&host_name);

        let compute_name = format!("compute-{}", host_name);
        let compute_ctx = sim.create_context(&compute_name);
        let compute = rc!(refcell!(Compute::new(
            group.speed,
            group.cores,
            group.memory.unwrap_or(0),
            compute_ctx
        )));
        sim.add_handler(&compute_name, compute.clone());

        if let (Some(network), Some(network_config)) = (network, network_config) {
            network.borrow_mut().add_node(
                &host_name,
                boxed!(SharedBandwidthNetworkModel::new(
                    network_config.bandwidth,
                    network_config.latency,
                )),
            );
            network.borrow_mut().set_location(host_ctx.id(), &host_name);
        }

        rc!(ClusterHost::new(
            machine_id,
            host_name,
            group.role,
            group.speed,
            group.cores,
            compute,
            host_ctx,
        ))
    }

    fn register_key_getters(sim: &Simulation) {
        sim.register_key_getter_for::<CompFinished>(|e| e.id);
        sim.register_key_getter_for::<CompStarted>(|e| e.id);
        sim.register_key_getter_for::<CompFailed>(|e| e.id);
        sim.register_key_getter_for::<AllocationSuccess>(|e| e.id);
        sim.register_key_getter_for::<AllocationFailed>(|e| e.id);
        sim.register_key_getter_for::<DeallocationSuccess>(|e| e.id);
        sim.register_key_getter_for::<DataTransferCompleted>(|e| e.dt.id as u64);
        sim.register_key_getter_for::<CancelJobExecution>(|e| e.key);
    }

    pub fn context(&self) -> Rc<RefCell<BatsimContext>> {
        self.context.clone()
    }

    pub fn time(&self) -> f64 {
        self.sim.time()
    }

    /// Stages every workload, kicks the server and drives the kernel until
    /// no event remains.
    pub fn run(&mut self) {
        // The server must speak first: SIMULATION_BEGINS goes out before any
        // staged submission is processed.
        let bootstrap = self.sim.create_context("bootstrap");
        bootstrap.emit_now(ServerStart {}, self.server_id);

        for (workload_name, submitter) in &self.submitters {
            let jobs = {
                let context = self.context.borrow();
                let workload = context
                    .workloads
                    .at(workload_name)
                    .expect("submitters reference loaded workloads");
                workload.jobs.iter().map(|(_, j)| j.clone()).collect()
            };
            submitter.stage_jobs(jobs);
        }

        let start = Instant::now();
        self.sim.step_until_no_events();
        log::info!(
            "simulation finished at t={} after {:.3}s of real time ({} events, {} tracked jobs)",
            self.sim.time(),
            start.elapsed().as_secs_f64(),
            self.sim.event_count(),
            self.storage.borrow().len(),
        );
        let _ = self.monitoring.borrow_mut().flush();
    }
}
