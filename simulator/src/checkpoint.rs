//! Simulator-level checkpointing: freeze the in-flight jobs of the static
//! workload into a re-loadable workload snapshot, with rotating folders.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::context::BatsimContext;
use crate::errors::SnapshotError;
use crate::jobs::{Job, JobState};
use crate::profiles::ProfileData;
use crate::workload::Workload;

pub struct Checkpointer {
    base_dir: PathBuf,
    keep: u32,
    nb_checkpoints: u32,
}

impl Checkpointer {
    /// `already_taken` seeds the checkpoint counter when the run itself was
    /// resumed from a snapshot.
    pub fn new(export_prefix: &str, keep: u32, already_taken: u32) -> Checkpointer {
        let base_dir = Path::new(export_prefix)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Checkpointer {
            base_dir,
            keep: keep.max(1),
            nb_checkpoints: already_taken,
        }
    }

    pub fn nb_checkpoints(&self) -> u32 {
        self.nb_checkpoints
    }

    fn slot_dir(&self, slot: u32) -> PathBuf {
        self.base_dir.join(format!("checkpoint_{}", slot))
    }

    /// Takes one snapshot into `checkpoint_1`, shifting older snapshots down
    /// one slot. On I/O failure the partial snapshot is removed and the run
    /// goes on.
    pub fn take_snapshot(
        &mut self,
        context: &BatsimContext,
        now: f64,
        jobs_csv: Option<&Path>,
    ) -> Result<PathBuf, SnapshotError> {
        self.rotate()?;
        let dir = self.slot_dir(1);
        std::fs::create_dir_all(&dir)?;

        match self.write_contents(&dir, context, now, jobs_csv) {
            Ok(()) => {
                self.nb_checkpoints += 1;
                self.update_latest_symlink(&dir);
                Ok(dir)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }

    fn rotate(&self) -> Result<(), SnapshotError> {
        if self.keep <= 1 {
            let _ = std::fs::remove_dir_all(self.slot_dir(1));
            return Ok(());
        }
        for slot in (1..self.keep).rev() {
            let from = self.slot_dir(slot);
            if from.exists() {
                let to = self.slot_dir(slot + 1);
                let _ = std::fs::remove_dir_all(&to);
                std::fs::rename(&from, &to)?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn update_latest_symlink(&self, dir: &Path) {
        let link = self.base_dir.join("checkpoint_latest");
        let _ = std::fs::remove_file(&link);
        let _ = std::os::unix::fs::symlink(dir.file_name().expect("slot dir name"), &link);
    }

    #[cfg(not(unix))]
    fn update_latest_symlink(&self, _dir: &Path) {}

    fn write_contents(
        &self,
        dir: &Path,
        context: &BatsimContext,
        now: f64,
        jobs_csv: Option<&Path>,
    ) -> Result<(), SnapshotError> {
        if let Some(jobs_csv) = jobs_csv {
            if jobs_csv.exists() {
                std::fs::copy(jobs_csv, dir.join("out_jobs.csv"))?;
            }
        }

        let workload = context
            .workloads
            .iter()
            .map(|(_, w)| w)
            .find(|w| w.is_static)
            .expect("a static workload is always present");

        let document = self.render_workload(workload, context, now);
        std::fs::write(
            dir.join("workload.json"),
            serde_json::to_string_pretty(&document)?,
        )?;

        let mut variables = context.call_me_laters.clone();
        variables.prune_before(now);
        std::fs::write(
            dir.join("batsim_variables.chkpt"),
            serde_json::to_string_pretty(&variables.to_json())?,
        )?;
        Ok(())
    }

    fn render_workload(&self, workload: &Workload, context: &BatsimContext, now: f64) -> Value {
        let mut profiles = Map::new();
        for (name, profile) in workload.profiles.iter() {
            profiles.insert(name.clone(), profile.json.borrow().clone());
        }

        let mut jobs = Vec::new();
        for job in workload.jobs.as_sorted_vec() {
            let job = job.borrow();
            if job.is_complete() {
                continue;
            }
            jobs.push(self.render_job(&job, now, &mut profiles));
        }

        json!({
            "nb_res": workload.nb_res,
            "nb_checkpoint": self.nb_checkpoints + 1,
            "nb_original_jobs": context.start_from_checkpoint.nb_original_jobs,
            "nb_actually_completed":
                context.nb_completed_jobs + context.start_from_checkpoint.nb_previously_completed,
            "profiles": profiles,
            "jobs": jobs,
        })
    }

    /// One incomplete job as a restartable record. Delay and homogeneous
    /// parallel profiles are regenerated under `<name>$` with only the
    /// remaining work; the walltime shrinks by the time already spent.
    fn render_job(&self, job: &Job, now: f64, profiles: &mut Map<String, Value>) -> Value {
        let running = job.state == JobState::Running;
        let progress = if running {
            job.task
                .as_ref()
                .map(|t| t.borrow().scalar_progress(now))
                .unwrap_or(0.)
        } else {
            job.restore.as_ref().map(|r| r.progress).unwrap_or(0.)
        };
        let elapsed = match (running, job.starting_time) {
            (true, Some(start)) => now - start,
            _ => 0.,
        };

        let profile_name = self.render_remaining_profile(job, progress, profiles);

        let subtime = if running { now } else { job.submission_time.max(now) };
        let walltime = job.walltime.map(|w| (w - elapsed).max(0.));
        let restore = job.restore.clone().unwrap_or_default();

        json!({
            "id": job.id.job_name(),
            "subtime": subtime,
            "res": job.requested_nb_res,
            "profile": profile_name,
            "walltime": walltime.unwrap_or(-1.),
            "allocation": job.allocation.as_ref().map(|a| a.to_string()),
            "alloc": job.future_allocation.as_ref().map(|a| a.to_string()),
            "submission_times": job.submission_times,
            "runtime": elapsed + restore.runtime,
            "state": job.state.wire_name(),
            "metadata": job.metadata,
            "jitter": job.jitter,
            "progress": progress,
            "purpose": job.purpose.as_str(),
            "original_submit": if restore.original_submit >= 0. {
                restore.original_submit
            } else {
                job.submission_time
            },
            "original_start": if restore.original_start >= 0. {
                restore.original_start
            } else {
                job.starting_time.unwrap_or(-1.)
            },
            "original_walltime": job.original_walltime.unwrap_or(-1.),
            "progressTimeCpu": restore.progress_time_cpu,
            "checkpoint_interval": job.checkpoint.interval,
            "dumptime": job.checkpoint.dump_time,
            "readtime": job.checkpoint.read_time,
        })
    }

    fn render_remaining_profile(
        &self,
        job: &Job,
        progress: f64,
        profiles: &mut Map<String, Value>,
    ) -> String {
        let data = job.profile.data.borrow();
        let (remaining, original) = match &*data {
            ProfileData::Delay { delay, real_delay } => (
                delay * (1. - progress),
                real_delay.unwrap_or(*delay),
            ),
            ProfileData::ParallelHomogeneous { cpu, real_cpu, .. } => (
                cpu * (1. - progress),
                real_cpu.unwrap_or(*cpu),
            ),
            _ => return job.profile.name.clone(),
        };

        let name = format!("{}$", job.profile.name);
        let mut json = job.profile.json.borrow().clone();
        match &*data {
            ProfileData::Delay { .. } => {
                json["delay"] = json!(remaining);
                json["original_delay"] = json!(original);
            }
            _ => {
                json["cpu"] = json!(remaining);
                json["original_cpu"] = json!(original);
            }
        }
        profiles.insert(name.clone(), json);
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sim_config::CheckpointingConfig;
    use crate::context::BatsimContext;
    use crate::context::{CallMeLaterEntry, CallMeLaterStore};
    use crate::task_tree::TaskTree;
    use crate::workload::{Workload, Workloads};
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    fn context_with_running_job() -> BatsimContext {
        let mut workload = Workload::new_static(
            "w0",
            "w.json",
            1e9,
            CheckpointingConfig::default(),
            1.0,
            BTreeMap::new(),
        );
        let doc = json!({
            "nb_res": 4,
            "profiles": {"d10": {"type": "delay", "delay": 10.0}},
            "jobs": [
                {"id": 1, "subtime": 0.0, "res": 1, "walltime": 100.0, "profile": "d10"},
                {"id": 2, "subtime": 3.0, "res": 1, "profile": "d10"}
            ]
        });
        workload.load_from_json(&doc, "w.json").unwrap();

        {
            let job = workload.jobs.get(&"w0!1".parse().unwrap()).unwrap();
            let mut job = job.borrow_mut();
            job.state = JobState::Running;
            job.starting_time = Some(0.);
            job.allocation = Some("0".parse().unwrap());
            let mut tree = TaskTree::from_profile(&job.profile, &workload.profiles).unwrap();
            tree.mark_started(0., Some(10.));
            job.task = Some(Rc::new(RefCell::new(tree)));
        }

        let mut workloads = Workloads::new();
        workloads.insert(workload).unwrap();
        let mut context = BatsimContext::new(workloads);
        context.call_me_laters = CallMeLaterStore::default();
        context.call_me_laters.insert(CallMeLaterEntry {
            id: 1,
            for_what: 0,
            target_time: 2.0,
            date_received: 0.,
        });
        context.call_me_laters.insert(CallMeLaterEntry {
            id: 2,
            for_what: 0,
            target_time: 50.0,
            date_received: 0.,
        });
        context.start_from_checkpoint.nb_original_jobs = 2;
        context
    }

    #[test]
    fn snapshot_regenerates_remaining_work_profiles() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = tmp.path().join("out").to_string_lossy().to_string();
        let mut checkpointer = Checkpointer::new(&prefix, 2, 0);
        let context = context_with_running_job();

        let dir = checkpointer.take_snapshot(&context, 4.0, None).unwrap();
        let document: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("workload.json")).unwrap())
                .unwrap();

        assert_eq!(document["nb_checkpoint"], json!(1));
        assert_eq!(document["nb_original_jobs"], json!(2));
        let jobs = document["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 2);

        let running = jobs.iter().find(|j| j["id"] == json!("1")).unwrap();
        assert_eq!(running["subtime"], json!(4.0));
        assert_eq!(running["profile"], json!("d10$"));
        assert_eq!(running["walltime"], json!(96.0));
        assert_eq!(running["state"], json!("RUNNING"));
        let regenerated = &document["profiles"]["d10$"];
        assert!((regenerated["delay"].as_f64().unwrap() - 6.0).abs() < 1e-9);
        assert_eq!(regenerated["original_delay"], json!(10.0));

        // waiting job keeps its full profile but its subtime moves to now
        let waiting = jobs.iter().find(|j| j["id"] == json!("2")).unwrap();
        assert_eq!(waiting["subtime"], json!(4.0));

        // entries before now were pruned from the call-me-later dump
        let variables: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.join("batsim_variables.chkpt")).unwrap(),
        )
        .unwrap();
        let entries = variables["call_me_laters"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["target_time"], json!(50.0));
    }

    #[test]
    fn rotation_keeps_the_requested_number_of_slots() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = tmp.path().join("out").to_string_lossy().to_string();
        let mut checkpointer = Checkpointer::new(&prefix, 2, 0);
        let context = context_with_running_job();

        checkpointer.take_snapshot(&context, 4.0, None).unwrap();
        checkpointer.take_snapshot(&context, 5.0, None).unwrap();
        checkpointer.take_snapshot(&context, 6.0, None).unwrap();
        assert_eq!(checkpointer.nb_checkpoints(), 3);

        assert!(tmp.path().join("checkpoint_1").exists());
        assert!(tmp.path().join("checkpoint_2").exists());
        assert!(!tmp.path().join("checkpoint_3").exists());

        // slot 1 is the newest snapshot
        let newest: Value = serde_json::from_str(
            &std::fs::read_to_string(tmp.path().join("checkpoint_1/workload.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(newest["nb_checkpoint"], json!(3));
    }
}
