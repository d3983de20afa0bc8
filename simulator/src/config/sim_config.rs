//! Simulation and platform configuration, loaded from YAML files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::options::{BatsimCheckpointSpec, CopySpec, SubmissionTimeSpec};
use crate::errors::ConfigError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadDescription {
    pub path: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    #[default]
    Compute,
    Storage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostGroupConfig {
    pub name: String,
    pub count: Option<u32>,
    pub cores: u32,
    /// Core speed in flop/s.
    pub speed: f64,
    pub memory: Option<u64>,
    #[serde(default)]
    pub role: HostRole,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub hosts: Vec<HostGroupConfig>,
    pub network: Option<NetworkConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bandwidth: f64,
    pub latency: f64,
    #[serde(default)]
    pub shared: bool,
}

impl PlatformConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Yaml {
            path: path.to_string(),
            detail: e.to_string(),
        })
    }

    pub fn total_hosts(&self) -> u32 {
        self.hosts.iter().map(|g| g.count.unwrap_or(1)).sum()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_hostname")]
    pub hostname: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

fn default_redis_hostname() -> String {
    "127.0.0.1".to_string()
}
fn default_redis_port() -> u16 {
    6379
}
fn default_redis_prefix() -> String {
    "default".to_string()
}

/// The workload rewriting pipeline, in application order: submission times
/// before the copy, the copy itself, submission times after, the performance
/// factor, then checkpoint augmentation (driven by [`CheckpointingConfig`]).
#[derive(Clone, Debug, Default)]
pub struct TransformConfig {
    pub submission_time_before: Option<SubmissionTimeSpec>,
    pub copy: Option<CopySpec>,
    pub submission_time_after: Option<SubmissionTimeSpec>,
    pub performance_factor: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct CheckpointingConfig {
    pub enabled: bool,
    pub global_interval: Option<f64>,
    pub compute_optimal: bool,
    pub compute_error: f64,
    pub mtbf: Option<f64>,
    pub smtbf: Option<f64>,
    pub mttr: Option<f64>,
    pub repair_time: f64,
    pub fixed_failures: Option<f64>,
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        CheckpointingConfig {
            enabled: false,
            global_interval: None,
            compute_optimal: false,
            compute_error: 1.0,
            mtbf: None,
            smtbf: None,
            mttr: None,
            repair_time: 0.0,
            fixed_failures: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FailureConfig {
    pub seed_failures: bool,
    pub seed_repair_time: bool,
}

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub platform: PlatformConfig,
    pub workloads: Vec<WorkloadDescription>,
    pub export_prefix: String,
    pub socket_endpoint: String,

    pub redis: RedisConfig,
    pub forward_profiles_on_submission: bool,
    pub dynamic_registration_enabled: bool,
    pub ack_dynamic_registration: bool,
    pub profile_reuse_enabled: bool,

    pub allow_compute_sharing: bool,
    pub allow_storage_sharing: bool,

    pub transforms: TransformConfig,
    pub checkpointing: CheckpointingConfig,
    pub failures: FailureConfig,

    pub batsim_checkpoint: Option<BatsimCheckpointSpec>,
    pub batsim_checkpoint_signal: Option<i32>,
    pub start_from_checkpoint: Option<u32>,

    pub reservations_start: BTreeMap<u32, f64>,
    pub reschedule_policy: String,
    pub impact_policy: String,
    pub queue_policy: String,
    pub sched_config: String,
    pub output_extra_info: bool,
}

impl SimulationConfig {
    pub fn new(platform: PlatformConfig) -> Self {
        SimulationConfig {
            platform,
            workloads: Vec::new(),
            export_prefix: "out".to_string(),
            socket_endpoint: "tcp://localhost:28000".to_string(),
            redis: RedisConfig::default(),
            forward_profiles_on_submission: false,
            dynamic_registration_enabled: false,
            ack_dynamic_registration: false,
            profile_reuse_enabled: false,
            allow_compute_sharing: false,
            allow_storage_sharing: true,
            transforms: TransformConfig {
                performance_factor: 1.0,
                ..TransformConfig::default()
            },
            checkpointing: CheckpointingConfig::default(),
            failures: FailureConfig::default(),
            batsim_checkpoint: None,
            batsim_checkpoint_signal: None,
            start_from_checkpoint: None,
            reservations_start: BTreeMap::new(),
            reschedule_policy: "RESCHEDULE_AFFECTED".to_string(),
            impact_policy: "LEAST_KILLING_LARGEST_FIRST".to_string(),
            queue_policy: "FCFS".to_string(),
            sched_config: String::new(),
            output_extra_info: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profile_reuse_enabled && !self.dynamic_registration_enabled {
            return Err(ConfigError::schema(
                "profile reuse is enabled but dynamic registration is not",
            ));
        }
        if self.workloads.is_empty() && self.start_from_checkpoint.is_none() {
            return Err(ConfigError::schema("no workload to simulate"));
        }
        if self.platform.hosts.is_empty() {
            return Err(ConfigError::schema("the platform has no hosts"));
        }
        Ok(())
    }

    /// The configuration object forwarded to the scheduler inside
    /// `SIMULATION_BEGINS`.
    pub fn config_json(&self, start_from_checkpoint: &StartFromCheckpointInfo) -> Value {
        let checkpointing = &self.checkpointing;
        json!({
            "redis-enabled": self.redis.enabled,
            "redis-hostname": self.redis.hostname,
            "redis-port": self.redis.port,
            "redis-prefix": self.redis.prefix,
            "profiles-forwarded-on-submission": self.forward_profiles_on_submission,
            "dynamic-jobs-enabled": self.dynamic_registration_enabled,
            "dynamic-jobs-acknowledged": self.ack_dynamic_registration,
            "profile-reuse-enabled": self.profile_reuse_enabled,
            "checkpointing_on": checkpointing.enabled,
            "compute_checkpointing": checkpointing.compute_optimal,
            "checkpointing_interval": checkpointing.global_interval.unwrap_or(-1.0),
            "MTBF": checkpointing.mtbf.unwrap_or(-1.0),
            "SMTBF": checkpointing.smtbf.unwrap_or(-1.0),
            "MTTR": checkpointing.mttr.unwrap_or(-1.0),
            "repair_time": checkpointing.repair_time,
            "fixed_failures": checkpointing.fixed_failures.unwrap_or(-1.0),
            "seed-failures": self.failures.seed_failures,
            "seed-repair-time": self.failures.seed_repair_time,
            "output-folder": self.export_prefix,
            "reschedule-policy": self.reschedule_policy,
            "impact-policy": self.impact_policy,
            "queue-policy": self.queue_policy,
            "sched-config": self.sched_config,
            "checkpoint-batsim-interval": self.batsim_checkpoint.map(|spec| json!({
                "type": match spec.time_base {
                    super::options::CheckpointTimeBase::Real => "real",
                    super::options::CheckpointTimeBase::Simulated => "simulated",
                },
                "total_seconds": spec.total_seconds,
                "keep": spec.keep,
            })).unwrap_or(Value::Null),
            "checkpoint-signal": self.batsim_checkpoint_signal.unwrap_or(-1),
            "start-from-checkpoint": {
                "nb_folder": self.start_from_checkpoint.map(|n| n as i64).unwrap_or(-1),
                "nb_checkpoint": start_from_checkpoint.nb_checkpoint,
                "nb_previously_completed": start_from_checkpoint.nb_previously_completed,
                "nb_original_jobs": start_from_checkpoint.nb_original_jobs,
                "started_from_checkpoint": start_from_checkpoint.active,
            },
        })
    }
}

/// Metadata describing a run resumed from a simulator-level snapshot.
#[derive(Clone, Debug, Default)]
pub struct StartFromCheckpointInfo {
    pub active: bool,
    pub nb_folder: u32,
    pub nb_checkpoint: u32,
    pub nb_previously_completed: u32,
    pub nb_original_jobs: u32,
    /// Jobs whose submission time equals the restart instant; the dispatcher
    /// waits for all of them before messaging the scheduler at that instant.
    pub expected_submissions: u32,
    /// The simulated time the snapshot was taken at.
    pub restart_instant: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> PlatformConfig {
        PlatformConfig {
            hosts: vec![HostGroupConfig {
                name: "node".to_string(),
                count: Some(4),
                cores: 8,
                speed: 1e9,
                memory: None,
                role: HostRole::Compute,
                properties: BTreeMap::new(),
            }],
            network: None,
        }
    }

    #[test]
    fn platform_counts_grouped_hosts() {
        assert_eq!(platform().total_hosts(), 4);
    }

    #[test]
    fn validate_rejects_profile_reuse_without_dynamic_jobs() {
        let mut config = SimulationConfig::new(platform());
        config.workloads.push(WorkloadDescription {
            path: "w.json".to_string(),
            name: "w0".to_string(),
        });
        config.profile_reuse_enabled = true;
        assert!(config.validate().is_err());
        config.dynamic_registration_enabled = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_json_reports_checkpoint_block() {
        let mut config = SimulationConfig::new(platform());
        config.batsim_checkpoint = Some("simulated:0-00:01:00:3".parse().unwrap());
        let value = config.config_json(&StartFromCheckpointInfo::default());
        assert_eq!(value["checkpoint-batsim-interval"]["total_seconds"], 60);
        assert_eq!(value["checkpoint-batsim-interval"]["keep"], 3);
        assert_eq!(value["start-from-checkpoint"]["started_from_checkpoint"], false);
    }
}
