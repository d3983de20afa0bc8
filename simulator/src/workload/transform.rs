//! The deterministic workload rewriting pipeline. Every randomized step draws
//! from a Pcg64 generator seeded by the step's own seed, so a (workload,
//! spec, seed) triple always produces the same job set.

use rand::prelude::*;
use rand_distr::{Exp, Uniform};
use rand_pcg::Pcg64;
use rustc_hash::FxHashMap;
use serde_json::json;

use crate::config::options::{
    CopyDistribution, CopyOp, CopySpec, DrawScope, SubmissionDistribution, SubmissionTimeSpec,
};
use crate::errors::ConfigError;
use crate::jobs::{Job, JobIdentifier, JobLocalId, JobState};
use crate::profiles::{ProfileData, ProfileHandle};
use crate::workload::Workload;

const DEFAULT_SEED: u64 = 0;

/// Applies the whole pipeline in order: submission times before, copy,
/// submission times after, performance scaling, checkpoint augmentation.
pub fn apply_pipeline(
    workload: &mut Workload,
    submission_time_before: Option<&SubmissionTimeSpec>,
    copy: Option<&CopySpec>,
    submission_time_after: Option<&SubmissionTimeSpec>,
) -> Result<(), ConfigError> {
    if let Some(spec) = submission_time_before {
        change_submits(workload, spec);
    }
    if let Some(spec) = copy {
        apply_copy(workload, spec)?;
    }
    if let Some(spec) = submission_time_after {
        change_submits(workload, spec);
    }
    apply_performance_factor(workload);
    apply_checkpoint_augmentation(workload)?;

    for (_, job) in workload.jobs.iter() {
        let mut job = job.borrow_mut();
        if job.submission_times.len() == 1 {
            let t = job.submission_time;
            job.submission_times[0] = t;
        }
        job.sync_json_description();
    }
    Ok(())
}

/// Rewrites submission times over the job set sorted by `(t_sub, number)`.
pub fn change_submits(workload: &mut Workload, spec: &SubmissionTimeSpec) {
    let mut rng = Pcg64::seed_from_u64(spec.seed.unwrap_or(DEFAULT_SEED));

    if let Some(distribution) = spec.distribution {
        let sorted = workload.jobs.as_sorted_vec();
        let mut previous: Option<f64> = None;
        for job in &sorted {
            let new_time = match distribution {
                SubmissionDistribution::Fixed(v) => {
                    let t = previous.map_or(v, |p| p + v);
                    if v != 0. {
                        previous = Some(t);
                    }
                    t
                }
                SubmissionDistribution::Exponential(mean) => {
                    let sample = rng.sample(Exp::new(1. / mean).unwrap());
                    let t = previous.unwrap_or(0.) + sample;
                    previous = Some(t);
                    t
                }
                SubmissionDistribution::Uniform(low, high) => {
                    let sample = rng.sample(Uniform::new_inclusive(low, high));
                    let t = previous.unwrap_or(0.) + sample;
                    previous = Some(t);
                    t
                }
            };
            let mut job = job.borrow_mut();
            job.submission_time = new_time;
            job.sync_json_description();
        }
    }

    if spec.shuffle {
        let sorted = workload.jobs.as_sorted_vec();
        let times: Vec<f64> = sorted.iter().map(|j| j.borrow().submission_time).collect();
        let mut indices: Vec<usize> = (0..times.len()).collect();
        indices.shuffle(&mut rng);
        for (i, job) in sorted.iter().enumerate() {
            let mut job = job.borrow_mut();
            job.submission_time = times[indices[i]];
            job.sync_json_description();
        }
    }
}

/// Clones the post-step-1 job set `copies - 1` times. Clones get fresh ids
/// above the current maximum and their profiles are re-interned under the
/// new id, so later per-profile rewriting stays per-job.
pub fn apply_copy(workload: &mut Workload, spec: &CopySpec) -> Result<(), ConfigError> {
    let sources = workload.jobs.as_sorted_vec();
    let mut next_id = workload.jobs.max_job_number() + 1;
    let mut rng = Pcg64::seed_from_u64(spec.seed.unwrap_or(DEFAULT_SEED));
    let mut cached_draw: Option<f64> = None;
    let mut staged: Vec<Job> = Vec::new();

    for _copy in 1..spec.copies {
        let mut previous: Option<f64> = None;
        for source in &sources {
            let source = source.borrow();
            let id = JobIdentifier::new(&workload.name, JobLocalId::plain(next_id))?;
            let profile_name = next_id.to_string();
            let profile_json = source.profile.json.borrow().clone();
            workload.profiles.add(&profile_name, profile_json)?;
            let profile = workload
                .profiles
                .acquire(&profile_name)
                .expect("freshly added profile");

            let mut job = clone_job(&source, id, profile);
            if let Some(adjustment) = &spec.adjustment {
                let old_time = source.submission_time;
                match (&adjustment.distribution, adjustment.op) {
                    (CopyDistribution::Fixed(v), CopyOp::Set) => {
                        let t = previous.map_or(*v, |p| p + v);
                        if *v != 0. {
                            previous = Some(t);
                        }
                        job.submission_time = t;
                    }
                    (CopyDistribution::Fixed(v), op) => {
                        apply_jitter(&mut job, old_time, *v, op);
                    }
                    (CopyDistribution::Exponential(mean), _) => {
                        let sample = rng.sample(Exp::new(1. / mean).unwrap());
                        let t = previous.unwrap_or(0.) + sample;
                        previous = Some(t);
                        job.submission_time = t;
                    }
                    (CopyDistribution::Uniform { low, high, scope }, CopyOp::Set) => {
                        let _ = scope;
                        let sample = rng.sample(Uniform::new_inclusive(*low, *high));
                        let t = previous.unwrap_or(0.) + sample;
                        previous = Some(t);
                        job.submission_time = t;
                    }
                    (CopyDistribution::Uniform { low, high, scope }, op) => {
                        let draw = match scope {
                            DrawScope::All => rng.sample(Uniform::new_inclusive(*low, *high)),
                            _ => *cached_draw.get_or_insert_with(|| {
                                rng.sample(Uniform::new_inclusive(*low, *high))
                            }),
                        };
                        apply_jitter(&mut job, old_time, draw, op);
                    }
                }
            }
            job.submission_times = vec![job.submission_time];
            job.sync_json_description();
            staged.push(job);
            next_id += 1;
        }
        if let Some(CopyDistribution::Uniform {
            scope: DrawScope::EachCopy,
            ..
        }) = spec.adjustment.as_ref().map(|a| a.distribution)
        {
            cached_draw = None;
        }
    }

    for job in staged {
        workload.jobs.add(job)?;
    }
    Ok(())
}

fn apply_jitter(job: &mut Job, old_time: f64, amount: f64, op: CopyOp) {
    match op {
        CopyOp::Add => {
            job.submission_time = old_time + amount;
            job.jitter = Some(format!("+{}", amount));
        }
        CopyOp::Sub => {
            job.submission_time = old_time - amount;
            job.jitter = Some(format!("-{}", amount));
        }
        CopyOp::Set => unreachable!("handled by the caller"),
    }
}

fn clone_job(source: &Job, id: JobIdentifier, profile: ProfileHandle) -> Job {
    Job {
        id,
        profile,
        json_description: source.json_description.clone(),
        submission_time: source.submission_time,
        walltime: source.walltime,
        original_walltime: source.original_walltime,
        requested_nb_res: source.requested_nb_res,
        cores: source.cores,
        state: JobState::NotSubmitted,
        starting_time: None,
        runtime: None,
        allocation: None,
        future_allocation: source.future_allocation.clone(),
        return_code: None,
        consumed_energy: -1.,
        purpose: source.purpose,
        start: source.start,
        submission_times: source.submission_times.clone(),
        jitter: source.jitter.clone(),
        metadata: None,
        checkpoint: source.checkpoint,
        restore: None,
        incoming_messages: Vec::new(),
        task: None,
        smpi_ranks_to_hosts_mapping: source.smpi_ranks_to_hosts_mapping.clone(),
        storage_mapping: None,
        kill_requested: false,
        from_workload: source.from_workload,
    }
}

/// Multiplies the visible work of non-resubmitted jobs by the workload's
/// performance factor. Each profile is rewritten at most once.
pub fn apply_performance_factor(workload: &mut Workload) {
    let pf = workload.performance_factor;
    if pf == 1.0 {
        return;
    }
    let mut scaled: FxHashMap<String, ()> = FxHashMap::default();
    let jobs: Vec<_> = workload.jobs.iter().map(|(_, j)| j.clone()).collect();
    for job in jobs {
        let mut job = job.borrow_mut();
        if job.id.local().is_resubmitted() {
            continue;
        }
        if workload.checkpointing.enabled {
            job.checkpoint.dump_time = job.checkpoint.dump_time.map(|d| pf * d);
            job.checkpoint.read_time = job.checkpoint.read_time.map(|r| pf * r);
        }
        if scaled.insert(job.profile.name.clone(), ()).is_none() {
            let new_work = match &*job.profile.data.borrow() {
                ProfileData::Delay { delay, .. } => Some(pf * delay),
                ProfileData::ParallelHomogeneous { cpu, .. } => Some(pf * cpu),
                _ => None,
            };
            if let Some(work) = new_work {
                job.profile.rewrite_work(work, None);
            }
        }
    }
}

/// Injects checkpoint dumps into eligible profiles: the visible work becomes
/// `W + (n - sub) * D` and the walltime is extended by the same amount.
pub fn apply_checkpoint_augmentation(workload: &mut Workload) -> Result<(), ConfigError> {
    let cfg = workload.checkpointing;
    if !cfg.enabled {
        return Ok(());
    }

    let mut extras: FxHashMap<String, f64> = FxHashMap::default();
    let jobs: Vec<_> = workload.jobs.iter().map(|(_, j)| j.clone()).collect();
    for job in jobs {
        let mut job = job.borrow_mut();
        if job.id.local().is_resubmitted() {
            continue;
        }
        let is_delay = matches!(&*job.profile.data.borrow(), ProfileData::Delay { .. });
        let is_parallel_homogeneous = matches!(
            &*job.profile.data.borrow(),
            ProfileData::ParallelHomogeneous { .. }
        );
        if !is_delay && !is_parallel_homogeneous {
            continue;
        }
        let Some(dump_time) = job.checkpoint.dump_time else {
            continue;
        };

        let mut interval = job.checkpoint.interval;
        if cfg.compute_optimal {
            let mean = match (cfg.smtbf, cfg.mtbf) {
                (Some(smtbf), _) => {
                    workload.nb_res as f64 * smtbf / job.requested_nb_res as f64
                }
                (None, Some(mtbf)) => mtbf,
                (None, None) => {
                    return Err(ConfigError::schema(
                        "checkpoint-interval computation requested but no (S)MTBF set",
                    ))
                }
            };
            interval = Some(cfg.compute_error * (2. * dump_time * mean).sqrt() - dump_time);
        }
        if let Some(global) = cfg.global_interval {
            interval = Some(global - dump_time);
        }
        let Some(interval) = interval else {
            continue;
        };
        if interval <= 0. {
            return Err(ConfigError::schema(format!(
                "job '{}': the checkpoint interval is computed as negative, the dump time does \
                 not fit the (S)MTBF",
                job.id
            )));
        }
        job.checkpoint.interval = Some(interval);

        let extra = match extras.get(&job.profile.name) {
            Some(extra) => *extra,
            None => {
                let work = job
                    .profile
                    .data
                    .borrow()
                    .raw_work_seconds(workload.host_speed)
                    .expect("delay or homogeneous profile");
                let n = (work / interval).floor();
                let sub = if work % interval == 0. { 1. } else { 0. };
                let extra = if n > 0. { (n - sub) * dump_time } else { 0. };
                if is_delay {
                    job.profile.rewrite_work(work + extra, Some(work));
                } else {
                    job.profile.rewrite_work(
                        (work + extra) * workload.host_speed,
                        Some(work * workload.host_speed),
                    );
                }
                extras.insert(job.profile.name.clone(), extra);
                extra
            }
        };

        if let Some(walltime) = job.walltime {
            job.walltime = Some(walltime + extra);
            job.original_walltime = Some(walltime + extra);
        }
        job.json_description["checkpoint_interval"] = json!(interval);
        job.json_description["dumptime"] = json!(dump_time);
        if let Some(read_time) = job.checkpoint.read_time {
            job.json_description["readtime"] = json!(read_time);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sim_config::CheckpointingConfig;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn workload_with_jobs(subtimes: &[f64]) -> Workload {
        let mut w = Workload::new_static(
            "w0",
            "t",
            1e9,
            CheckpointingConfig::default(),
            1.0,
            BTreeMap::new(),
        );
        let jobs: Vec<Value> = subtimes
            .iter()
            .enumerate()
            .map(|(i, t)| json!({"id": i + 1, "subtime": t, "res": 1, "profile": "d10"}))
            .collect();
        let doc = json!({
            "nb_res": 100,
            "profiles": {"d10": {"type": "delay", "delay": 10.0}},
            "jobs": jobs,
        });
        w.load_from_json(&doc, "t").unwrap();
        w
    }

    fn subtimes_sorted(workload: &Workload) -> Vec<f64> {
        let mut times: Vec<f64> = workload
            .jobs
            .iter()
            .map(|(_, j)| j.borrow().submission_time)
            .collect();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap());
        times
    }

    #[test]
    fn fixed_inter_arrival_and_all_at_zero() {
        let mut w = workload_with_jobs(&[5., 8., 2.]);
        change_submits(&mut w, &"100.0:fixed".parse().unwrap());
        assert_eq!(subtimes_sorted(&w), vec![100., 200., 300.]);

        let mut w = workload_with_jobs(&[5., 8., 2.]);
        change_submits(&mut w, &"0:fixed".parse().unwrap());
        assert_eq!(subtimes_sorted(&w), vec![0., 0., 0.]);
    }

    #[test]
    fn exponential_rewrite_is_cumulative_and_deterministic() {
        let mut a = workload_with_jobs(&[0., 1., 2.]);
        change_submits(&mut a, &"50.0:exp:7".parse().unwrap());
        let mut b = workload_with_jobs(&[0., 1., 2.]);
        change_submits(&mut b, &"50.0:exp:7".parse().unwrap());
        let times = subtimes_sorted(&a);
        assert_eq!(times, subtimes_sorted(&b));
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(times[0] > 0.);
    }

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        let input = [0., 1., 2., 3., 4., 5., 6., 7.];
        let mut a = workload_with_jobs(&input);
        change_submits(&mut a, &"shuffle:42".parse().unwrap());
        let mut b = workload_with_jobs(&input);
        change_submits(&mut b, &"shuffle:42".parse().unwrap());

        let order = |w: &Workload| -> Vec<(u64, f64)> {
            let mut jobs: Vec<_> = w
                .jobs
                .iter()
                .map(|(id, j)| (id.job_number(), j.borrow().submission_time))
                .collect();
            jobs.sort();
            jobs
        };
        assert_eq!(order(&a), order(&b));
        // the multiset of times is preserved
        assert_eq!(subtimes_sorted(&a), input.to_vec());
    }

    #[test]
    fn copy_then_shift_produces_fresh_ids() {
        let mut w = workload_with_jobs(&[0., 1.]);
        apply_copy(&mut w, &"2:+:3:fixed".parse().unwrap()).unwrap();
        assert_eq!(w.jobs.len(), 4);
        assert_eq!(subtimes_sorted(&w), vec![0., 1., 3., 4.]);

        let max_original = 2;
        let clones: Vec<_> = w
            .jobs
            .iter()
            .filter(|(id, _)| id.job_number() > max_original)
            .collect();
        assert_eq!(clones.len(), 2);
        for (id, job) in clones {
            let job = job.borrow();
            assert_eq!(job.jitter.as_deref(), Some("+3"));
            // the clone's profile was re-interned under its own id
            assert_eq!(job.profile.name, id.job_number().to_string());
        }
    }

    #[test]
    fn copy_set_exponential_is_cumulative() {
        let mut w = workload_with_jobs(&[0., 1.]);
        apply_copy(&mut w, &"2:=:100:exp:9".parse().unwrap()).unwrap();
        let clones: Vec<f64> = w
            .jobs
            .iter()
            .filter(|(id, _)| id.job_number() > 2)
            .map(|(_, j)| j.borrow().submission_time)
            .collect();
        assert_eq!(clones.len(), 2);
        let mut sorted = clones.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!(sorted[0] > 0. && sorted[0] < sorted[1]);
    }

    #[test]
    fn copy_uniform_single_reuses_one_draw() {
        let mut w = workload_with_jobs(&[0., 10.]);
        apply_copy(&mut w, &"3:+:5:10:unif:single:4".parse().unwrap()).unwrap();
        let jitters: Vec<String> = w
            .jobs
            .iter()
            .filter_map(|(_, j)| j.borrow().jitter.clone())
            .collect();
        assert_eq!(jitters.len(), 4);
        assert!(jitters.iter().all(|j| j == &jitters[0]));
    }

    #[test]
    fn performance_factor_scales_each_profile_once() {
        let mut w = workload_with_jobs(&[0., 1.]);
        w.performance_factor = 2.0;
        apply_performance_factor(&mut w);
        let job = w.jobs.get(&"w0!1".parse().unwrap()).unwrap();
        let job = job.borrow();
        assert_eq!(
            *job.profile.data.borrow(),
            ProfileData::Delay { delay: 20., real_delay: None }
        );
    }

    #[test]
    fn checkpoint_augmentation_rewrites_work_and_walltime() {
        let mut w = Workload::new_static(
            "w0",
            "t",
            1e9,
            CheckpointingConfig {
                enabled: true,
                global_interval: Some(4.0),
                ..CheckpointingConfig::default()
            },
            1.0,
            BTreeMap::new(),
        );
        let doc = json!({
            "nb_res": 10,
            "profiles": {"d10": {"type": "delay", "delay": 10.0}},
            "jobs": [{
                "id": 1, "subtime": 0.0, "res": 1, "walltime": 100.0,
                "profile": "d10", "dumptime": 1.0, "readtime": 0.5
            }]
        });
        w.load_from_json(&doc, "t").unwrap();
        apply_checkpoint_augmentation(&mut w).unwrap();

        let job = w.jobs.get(&"w0!1".parse().unwrap()).unwrap();
        let job = job.borrow();
        // I = 4 - 1 = 3, n = floor(10/3) = 3, 10 % 3 != 0 -> W' = 10 + 3
        assert_eq!(
            *job.profile.data.borrow(),
            ProfileData::Delay { delay: 13., real_delay: Some(10.) }
        );
        assert_eq!(job.walltime, Some(103.));
        assert_eq!(job.checkpoint.interval, Some(3.));
    }

    #[test]
    fn compute_optimal_interval_uses_smtbf_scaling() {
        let mut w = Workload::new_static(
            "w0",
            "t",
            1e9,
            CheckpointingConfig {
                enabled: true,
                compute_optimal: true,
                smtbf: Some(1000.),
                compute_error: 1.0,
                ..CheckpointingConfig::default()
            },
            1.0,
            BTreeMap::new(),
        );
        let doc = json!({
            "nb_res": 100,
            "profiles": {"d": {"type": "delay", "delay": 1000.0}},
            "jobs": [{
                "id": 1, "subtime": 0.0, "res": 4, "profile": "d", "dumptime": 2.0
            }]
        });
        w.load_from_json(&doc, "t").unwrap();
        apply_checkpoint_augmentation(&mut w).unwrap();
        let job = w.jobs.get(&"w0!1".parse().unwrap()).unwrap();
        let interval = job.borrow().checkpoint.interval.unwrap();
        // M = 100 * 1000 / 4, I = sqrt(2 * 2 * M) - 2
        assert!((interval - ((2f64 * 2. * 25000.).sqrt() - 2.)).abs() < 1e-9);
    }

    #[test]
    fn negative_computed_interval_is_a_configuration_error() {
        let mut w = Workload::new_static(
            "w0",
            "t",
            1e9,
            CheckpointingConfig {
                enabled: true,
                global_interval: Some(1.0),
                ..CheckpointingConfig::default()
            },
            1.0,
            BTreeMap::new(),
        );
        let doc = json!({
            "nb_res": 1,
            "profiles": {"d": {"type": "delay", "delay": 10.0}},
            "jobs": [{"id": 1, "subtime": 0.0, "res": 1, "profile": "d", "dumptime": 2.0}]
        });
        w.load_from_json(&doc, "t").unwrap();
        assert!(apply_checkpoint_augmentation(&mut w).is_err());
    }
}
