mod scheduler;

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use env_logger::Builder;

use batsim::config::sim_config::{PlatformConfig, SimulationConfig, WorkloadDescription};
use batsim::config::{parse_reservation_starts, BatsimCheckpointSpec};
use batsim::{BatsimSimulation, FnSchedulerLink};
use dslab_core::Simulation;
use scheduler::FcfsScheduler;

mod exit_codes {
    pub const PLATFORM: i32 = 0x01;
    pub const WORKLOAD: i32 = 0x02;
    pub const WORKFLOW: i32 = 0x04;
    pub const WORKFLOW_START_PARSE: i32 = 0x08;
    pub const CUT_WORKFLOW_FILE: i32 = 0x10;
    pub const START_TIME_NEGATIVE: i32 = 0x20;
    pub const START_TIME_PARSE: i32 = 0x40;
}

#[derive(Debug, Parser)]
#[command(name = "fcfs-demo", about = "Simulate a workload with a built-in FCFS scheduler")]
struct Args {
    /// The platform description (YAML)
    #[arg(short, long)]
    platform: PathBuf,

    /// Workload JSON files to simulate
    #[arg(short, long)]
    workload: Vec<PathBuf>,

    /// Workflow XML files (accepted for CLI compatibility, not simulated)
    #[arg(short = 'W', long)]
    workflow: Vec<PathBuf>,

    /// Cut workflows with a start time, formatted as `file:start`
    #[arg(long = "workflow-start")]
    workflow_start: Vec<String>,

    /// External event files (accepted for CLI compatibility)
    #[arg(long)]
    events: Vec<PathBuf>,

    /// Export filename prefix for simulation outputs
    #[arg(short, long, default_value = "out")]
    export: String,

    #[arg(short, long, default_value = "tcp://localhost:28000")]
    socket_endpoint: String,

    #[arg(long)]
    enable_redis: bool,
    #[arg(long, default_value = "127.0.0.1")]
    redis_hostname: String,
    #[arg(long, default_value_t = 6379)]
    redis_port: u16,
    #[arg(long, default_value = "default")]
    redis_prefix: String,

    #[arg(long)]
    enable_dynamic_jobs: bool,
    #[arg(long)]
    acknowledge_dynamic_jobs: bool,
    #[arg(long)]
    enable_profile_reuse: bool,
    #[arg(long)]
    forward_profiles_on_submission: bool,

    #[arg(long)]
    enable_compute_sharing: bool,
    #[arg(long)]
    disable_storage_sharing: bool,

    /// Copy multiplication spec, e.g. "2:+:3:fixed"
    #[arg(long)]
    copy: Option<String>,
    #[arg(long)]
    submission_time_before: Option<String>,
    #[arg(long)]
    submission_time_after: Option<String>,
    #[arg(long, default_value_t = 1.0)]
    performance_factor: f64,

    #[arg(long = "MTBF")]
    mtbf: Option<f64>,
    #[arg(long = "SMTBF")]
    smtbf: Option<f64>,
    #[arg(long = "MTTR")]
    mttr: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    repair_time: f64,
    #[arg(long)]
    fixed_failures: Option<f64>,

    #[arg(long)]
    checkpointing_on: bool,
    #[arg(long)]
    checkpointing_interval: Option<f64>,
    #[arg(long = "compute_checkpointing")]
    compute_checkpointing: bool,
    #[arg(long = "compute_checkpointing_error", default_value_t = 1.0)]
    compute_checkpointing_error: f64,

    /// "(real|simulated):D-HH:MM:SS[:keep]" simulator-level checkpoint interval
    #[arg(long)]
    checkpoint_batsim_interval: Option<String>,
    /// Overrides the interval's trailing keep count
    #[arg(long)]
    checkpoint_batsim_keep: Option<u32>,
    #[arg(long)]
    checkpoint_batsim_signal: Option<i32>,
    #[arg(long)]
    start_from_checkpoint: Option<u32>,

    /// "ord:{+|-}secs[, ...]" reservation start shifts
    #[arg(long)]
    reservations_start: Option<String>,
    #[arg(long, default_value = "RESCHEDULE_AFFECTED")]
    reschedule_policy: String,
    #[arg(long, default_value = "LEAST_KILLING_LARGEST_FIRST")]
    impact_policy: String,

    /// Simulation seed
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
    std::process::exit(run(Args::parse()));
}

fn run(args: Args) -> i32 {
    let mut return_code = 0;

    if !args.platform.exists() {
        log::error!("platform file '{}' cannot be read", args.platform.display());
        return_code |= exit_codes::PLATFORM;
    }
    for workload in &args.workload {
        if !workload.exists() {
            log::error!("workload file '{}' cannot be read", workload.display());
            return_code |= exit_codes::WORKLOAD;
        }
    }
    for workflow in &args.workflow {
        if !workflow.exists() {
            log::error!("workflow file '{}' cannot be read", workflow.display());
            return_code |= exit_codes::WORKFLOW;
        }
    }
    for spec in &args.workflow_start {
        let Some((file, start)) = spec.rsplit_once(':') else {
            log::error!("workflow-start '{}' is not formatted as file:start", spec);
            return_code |= exit_codes::WORKFLOW_START_PARSE;
            continue;
        };
        if !PathBuf::from(file).exists() {
            log::error!("cut workflow file '{}' cannot be read", file);
            return_code |= exit_codes::CUT_WORKFLOW_FILE;
        }
        match start.parse::<f64>() {
            Ok(t) if t < 0. => {
                log::error!("workflow start time {} should be positive", t);
                return_code |= exit_codes::START_TIME_NEGATIVE;
            }
            Ok(_) => {}
            Err(_) => {
                log::error!("cannot read the workflow start time '{}' as a number", start);
                return_code |= exit_codes::START_TIME_PARSE;
            }
        }
    }
    if return_code != 0 {
        return return_code;
    }
    if !args.workflow.is_empty() || !args.workflow_start.is_empty() {
        log::warn!("workflow files are accepted but not simulated by this demo");
    }

    let platform = match PlatformConfig::from_file(&args.platform.to_string_lossy()) {
        Ok(platform) => platform,
        Err(e) => {
            log::error!("{}", e);
            return exit_codes::PLATFORM;
        }
    };

    let mut config = SimulationConfig::new(platform);
    config.export_prefix = args.export.clone();
    config.socket_endpoint = args.socket_endpoint.clone();
    config.workloads = args
        .workload
        .iter()
        .enumerate()
        .map(|(i, path)| WorkloadDescription {
            path: path.to_string_lossy().to_string(),
            name: format!("w{}", i),
        })
        .collect();

    config.redis.enabled = args.enable_redis;
    config.redis.hostname = args.redis_hostname.clone();
    config.redis.port = args.redis_port;
    config.redis.prefix = args.redis_prefix.clone();

    config.dynamic_registration_enabled = args.enable_dynamic_jobs;
    config.ack_dynamic_registration = args.acknowledge_dynamic_jobs;
    config.profile_reuse_enabled = args.enable_profile_reuse;
    config.forward_profiles_on_submission = args.forward_profiles_on_submission;
    config.allow_compute_sharing = args.enable_compute_sharing;
    config.allow_storage_sharing = !args.disable_storage_sharing;

    config.transforms.performance_factor = args.performance_factor;
    if let Err(e) = parse_transforms(&args, &mut config) {
        log::error!("{}", e);
        return exit_codes::WORKLOAD;
    }

    config.checkpointing.enabled = args.checkpointing_on;
    config.checkpointing.global_interval = args.checkpointing_interval;
    config.checkpointing.compute_optimal = args.compute_checkpointing;
    config.checkpointing.compute_error = args.compute_checkpointing_error;
    config.checkpointing.mtbf = args.mtbf;
    config.checkpointing.smtbf = args.smtbf;
    config.checkpointing.mttr = args.mttr;
    config.checkpointing.repair_time = args.repair_time;
    config.checkpointing.fixed_failures = args.fixed_failures;

    if let Some(spec) = &args.checkpoint_batsim_interval {
        match spec.parse::<BatsimCheckpointSpec>() {
            Ok(mut spec) => {
                if let Some(keep) = args.checkpoint_batsim_keep {
                    spec.keep = keep.max(1);
                }
                config.batsim_checkpoint = Some(spec);
            }
            Err(e) => {
                log::error!("{}", e);
                return exit_codes::WORKLOAD;
            }
        }
    }
    config.batsim_checkpoint_signal = args.checkpoint_batsim_signal;
    config.start_from_checkpoint = args.start_from_checkpoint;

    if let Some(spec) = &args.reservations_start {
        config.reservations_start = parse_reservation_starts(spec);
    }
    config.reschedule_policy = args.reschedule_policy.clone();
    config.impact_policy = args.impact_policy.clone();

    let mut fcfs = FcfsScheduler::new();
    let link = Box::new(FnSchedulerLink::new(move |message: &str| fcfs.handle(message)));

    let sim = Simulation::new(args.seed);
    let mut simulation = match BatsimSimulation::new(sim, config, link) {
        Ok(simulation) => simulation,
        Err(e) => {
            log::error!("{}", e);
            return exit_codes::WORKLOAD;
        }
    };
    simulation.run();
    0
}

fn parse_transforms(args: &Args, config: &mut SimulationConfig) -> Result<(), batsim::errors::ConfigError> {
    if let Some(spec) = &args.copy {
        config.transforms.copy = Some(spec.parse()?);
    }
    if let Some(spec) = &args.submission_time_before {
        config.transforms.submission_time_before = Some(spec.parse()?);
    }
    if let Some(spec) = &args.submission_time_after {
        config.transforms.submission_time_after = Some(spec.parse()?);
    }
    Ok(())
}
