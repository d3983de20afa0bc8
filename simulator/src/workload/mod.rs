//! Workloads: job sets with their interned profiles, plus the deterministic
//! rewriting pipeline applied at load time.

pub mod loader;
pub mod transform;

use std::collections::BTreeMap;

use crate::config::sim_config::CheckpointingConfig;
use crate::errors::{ConfigError, ReferentialError};
use crate::jobs::{JobHandle, JobIdentifier, Jobs};
use crate::profiles::{ProfileData, ProfileRegistry};

pub struct Workload {
    pub name: String,
    pub file: String,
    pub jobs: Jobs,
    pub profiles: ProfileRegistry,
    pub nb_res: u32,
    pub is_static: bool,
    /// Core speed of the platform hosts, used to convert flops to seconds.
    pub host_speed: f64,
    pub checkpointing: CheckpointingConfig,
    pub performance_factor: f64,
    pub reservation_shifts: BTreeMap<u32, f64>,
}

impl Workload {
    pub fn new_static(
        name: &str,
        file: &str,
        host_speed: f64,
        checkpointing: CheckpointingConfig,
        performance_factor: f64,
        reservation_shifts: BTreeMap<u32, f64>,
    ) -> Workload {
        Workload {
            name: name.to_string(),
            file: file.to_string(),
            jobs: Jobs::new(),
            profiles: ProfileRegistry::new(name),
            nb_res: 0,
            is_static: true,
            host_speed,
            checkpointing,
            performance_factor,
            reservation_shifts,
        }
    }

    pub fn new_dynamic(name: &str) -> Workload {
        let mut workload = Workload::new_static(
            name,
            "dynamic",
            1.0,
            CheckpointingConfig::default(),
            1.0,
            BTreeMap::new(),
        );
        workload.is_static = false;
        workload
    }

    /// Checks the workload after loading and transformation: every sequence
    /// child must resolve (taking a reference on it), and every
    /// heterogeneous profile must match its consumers' host counts.
    pub fn check_validity(&mut self) -> Result<(), ConfigError> {
        let mut child_refs: Vec<String> = Vec::new();
        for (name, profile) in self.profiles.iter() {
            if let ProfileData::Sequence { children, repeat } = &*profile.data.borrow() {
                for child in children {
                    if !self.profiles.exists(child) {
                        return Err(ConfigError::schema(format!(
                            "invalid composed profile '{}': the used profile '{}' does not exist",
                            name, child
                        )));
                    }
                    for _ in 0..*repeat {
                        child_refs.push(child.clone());
                    }
                }
            }
        }
        for child in child_refs {
            self.profiles
                .acquire(&child)
                .map_err(|e| ConfigError::schema(e.to_string()))?;
        }

        for (id, job) in self.jobs.iter() {
            let job = job.borrow();
            if let ProfileData::ParallelHeterogeneous { cpu, .. } = &*job.profile.data.borrow() {
                if cpu.len() as u32 != job.requested_nb_res {
                    return Err(ConfigError::schema(format!(
                        "invalid job {}: the requested number of resources ({}) does not match \
                         the profile '{}' ({} hosts)",
                        id,
                        job.requested_nb_res,
                        job.profile.name,
                        cpu.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Removes a job, optionally dropping its profile when unreferenced.
    pub fn delete_job(&mut self, id: &JobIdentifier, garbage_collect_profiles: bool) {
        if let Some(job) = self.jobs.remove(id) {
            if garbage_collect_profiles {
                let profile_name = job.borrow().profile.name.clone();
                self.profiles.release(&profile_name);
            }
        }
    }
}

/// The named set of workloads of one run.
#[derive(Default)]
pub struct Workloads {
    workloads: BTreeMap<String, Workload>,
}

impl Workloads {
    pub fn new() -> Self {
        Workloads::default()
    }

    pub fn insert(&mut self, workload: Workload) -> Result<(), ConfigError> {
        if self.workloads.contains_key(&workload.name) {
            return Err(ConfigError::schema(format!(
                "workload '{}' already exists",
                workload.name
            )));
        }
        self.workloads.insert(workload.name.clone(), workload);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.workloads.contains_key(name)
    }

    pub fn at(&self, name: &str) -> Result<&Workload, ReferentialError> {
        self.workloads
            .get(name)
            .ok_or_else(|| ReferentialError::UnknownWorkload(name.to_string()))
    }

    pub fn at_mut(&mut self, name: &str) -> Result<&mut Workload, ReferentialError> {
        self.workloads
            .get_mut(name)
            .ok_or_else(|| ReferentialError::UnknownWorkload(name.to_string()))
    }

    pub fn job_at(&self, id: &JobIdentifier) -> Result<JobHandle, ReferentialError> {
        self.at(id.workload_name())?
            .jobs
            .get(id)
            .ok_or_else(|| ReferentialError::UnknownJob(id.to_string()))
    }

    pub fn job_is_registered(&self, id: &JobIdentifier) -> bool {
        self.workloads
            .get(id.workload_name())
            .map_or(false, |w| w.jobs.exists(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Workload)> {
        self.workloads.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Workload)> {
        self.workloads.iter_mut()
    }

    pub fn nb_workloads(&self) -> usize {
        self.workloads.len()
    }

    pub fn nb_static_workloads(&self) -> usize {
        self.workloads.values().filter(|w| w.is_static).count()
    }

    pub fn contains_smpi_job(&self) -> bool {
        self.workloads.values().any(|w| w.jobs.contains_smpi_job())
    }

    pub fn delete_jobs(&mut self, ids: &[JobIdentifier], garbage_collect_profiles: bool) {
        for id in ids {
            if let Some(workload) = self.workloads.get_mut(id.workload_name()) {
                workload.delete_job(id, garbage_collect_profiles);
            }
        }
    }
}
