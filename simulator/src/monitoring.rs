//! Persistent simulation outputs: one CSV row per completed job, one CSV row
//! of metrics per synchronisation tick.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use csv::Writer;

use crate::context::SchedulerMetrics;
use crate::jobs::{Job, JobState};

pub struct Monitoring {
    jobs_writer: Writer<File>,
    jobs_csv_path: PathBuf,
    extra_info_writer: Option<Writer<File>>,
    wall_clock_start: Instant,
}

impl Monitoring {
    pub fn new(export_prefix: &str, output_extra_info: bool) -> std::io::Result<Monitoring> {
        if let Some(parent) = Path::new(export_prefix).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let jobs_csv_path = PathBuf::from(format!("{}_jobs.csv", export_prefix));
        let mut jobs_writer = Writer::from_path(&jobs_csv_path)?;
        jobs_writer.write_record([
            "job_id",
            "workload_name",
            "profile",
            "submission_time",
            "requested_number_of_resources",
            "requested_time",
            "success",
            "final_state",
            "starting_time",
            "execution_time",
            "finish_time",
            "waiting_time",
            "turnaround_time",
            "stretch",
            "allocated_resources",
            "consumed_energy",
            "metadata",
        ])?;
        jobs_writer.flush()?;

        let extra_info_writer = if output_extra_info {
            let mut writer = Writer::from_path(format!("{}_extra_info.csv", export_prefix))?;
            writer.write_record([
                "actually_completed_jobs",
                "nb_jobs",
                "percent_done",
                "real_time",
                "sim_time",
                "queue_size",
                "schedule_size",
                "nb_jobs_running",
                "utilization",
                "utilization_without_resv",
                "node_mem_total",
                "node_mem_available",
                "batsim_RSS",
            ])?;
            writer.flush()?;
            Some(writer)
        } else {
            None
        };

        Ok(Monitoring {
            jobs_writer,
            jobs_csv_path,
            extra_info_writer,
            wall_clock_start: Instant::now(),
        })
    }

    pub fn jobs_csv_path(&self) -> &Path {
        &self.jobs_csv_path
    }

    /// One row per completed job. For jobs resumed from a snapshot the
    /// original submission/start times are reported and the checkpoint
    /// generation is stripped from the id, so that the resumed run's rows
    /// concatenate with the original run's into those of a continuous run.
    pub fn job_completed(&mut self, job: &Job, now: f64) -> std::io::Result<()> {
        let restore = job.restore.as_ref();
        let submission_time = restore
            .filter(|r| r.original_submit >= 0.)
            .map(|r| r.original_submit)
            .unwrap_or(job.submission_time);
        let starting_time = restore
            .filter(|r| r.original_start >= 0.)
            .map(|r| r.original_start)
            .or(job.starting_time)
            .unwrap_or(-1.);
        let execution_time = job.runtime.unwrap_or(0.);
        let finish_time = if restore.is_some() && starting_time >= 0. {
            starting_time + execution_time
        } else {
            now
        };
        let requested_time = match restore {
            Some(r) => r.original_walltime.or(job.original_walltime).or(job.walltime),
            None => job.walltime,
        }
        .unwrap_or(-1.);
        let waiting_time = if starting_time >= 0. {
            starting_time - submission_time
        } else {
            -1.
        };
        let turnaround_time = finish_time - submission_time;
        let stretch = if execution_time > 0. {
            turnaround_time / execution_time
        } else {
            -1.
        };
        let success = matches!(job.state, JobState::CompletedSuccessfully);
        let profile_name = job.profile.name.strip_suffix('$').unwrap_or(&job.profile.name);

        self.jobs_writer.write_record([
            job.id.csv_name(),
            job.id.workload_name().to_string(),
            profile_name.to_string(),
            format!("{:.6}", submission_time),
            job.requested_nb_res.to_string(),
            format!("{:.6}", requested_time),
            (success as u8).to_string(),
            job.state.wire_name().to_string(),
            format!("{:.6}", starting_time),
            format!("{:.6}", execution_time),
            format!("{:.6}", finish_time),
            format!("{:.6}", waiting_time),
            format!("{:.6}", turnaround_time),
            format!("{:.6}", stretch),
            job.allocation.as_ref().map(|a| a.to_string()).unwrap_or_default(),
            format!("{:.6}", job.consumed_energy),
            job.metadata.clone().unwrap_or_default(),
        ])?;
        self.jobs_writer.flush()
    }

    pub fn tick(
        &mut self,
        sim_time: f64,
        nb_jobs: u32,
        nb_completed: u32,
        metrics: &SchedulerMetrics,
    ) -> std::io::Result<()> {
        let Some(writer) = &mut self.extra_info_writer else {
            return Ok(());
        };
        let percent_done = if nb_jobs > 0 {
            nb_completed as f64 / nb_jobs as f64 * 100.
        } else {
            0.
        };
        let memory = MemoryStats::sample();
        writer.write_record([
            nb_completed.to_string(),
            nb_jobs.to_string(),
            format!("{:.2}", percent_done),
            format!("{:.3}", self.wall_clock_start.elapsed().as_secs_f64()),
            format!("{:.6}", sim_time),
            metrics.queue_size.to_string(),
            metrics.schedule_size.to_string(),
            metrics.nb_running_jobs.to_string(),
            format!("{:.6}", metrics.utilization),
            format!("{:.6}", metrics.utilization_no_resv),
            memory.total_kb.to_string(),
            memory.available_kb.to_string(),
            memory.rss_kb.to_string(),
        ])?;
        writer.flush()
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.jobs_writer.flush()?;
        if let Some(writer) = &mut self.extra_info_writer {
            writer.flush()?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryStats {
    total_kb: u64,
    available_kb: u64,
    rss_kb: u64,
}

impl MemoryStats {
    #[cfg(target_os = "linux")]
    fn sample() -> MemoryStats {
        let mut stats = MemoryStats::default();
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("MemTotal:"), Some(v)) => stats.total_kb = v.parse().unwrap_or(0),
                    (Some("MemAvailable:"), Some(v)) => stats.available_kb = v.parse().unwrap_or(0),
                    _ => {}
                }
            }
        }
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(pages) = statm.split_whitespace().nth(1) {
                stats.rss_kb = pages.parse::<u64>().unwrap_or(0) * 4;
            }
        }
        stats
    }

    #[cfg(not(target_os = "linux"))]
    fn sample() -> MemoryStats {
        MemoryStats::default()
    }
}
