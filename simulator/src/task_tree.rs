//! Runtime mirror of a job profile, used for progress accounting when a job
//! is killed or checkpointed.

use serde::Serialize;
use serde_json::{json, Value};

use crate::errors::ReferentialError;
use crate::profiles::{ProfileData, ProfileHandle, ProfileRegistry};

pub enum TaskNode {
    Delay {
        required: f64,
        started_at: Option<f64>,
    },
    /// Any parallel kernel work unit. `expected` is the duration the kernel
    /// computed at dispatch time, under its constant-speed contract.
    Parallel {
        expected: Option<f64>,
        started_at: Option<f64>,
    },
    Sequence {
        children: Vec<TaskTree>,
        current: Option<usize>,
    },
    /// SMPI and future kinds: progress is undefined and reported as such.
    Opaque,
}

pub struct TaskTree {
    pub profile_name: String,
    pub node: TaskNode,
}

impl TaskTree {
    /// Builds the mirror of `profile`, resolving sequence children in the
    /// registry. A `repeat` of r expands the child list r times.
    pub fn from_profile(
        profile: &ProfileHandle,
        registry: &ProfileRegistry,
    ) -> Result<TaskTree, ReferentialError> {
        let node = match &*profile.data.borrow() {
            ProfileData::Delay { delay, .. } => TaskNode::Delay {
                required: *delay,
                started_at: None,
            },
            ProfileData::ParallelHomogeneous { .. } | ProfileData::ParallelHeterogeneous { .. } => {
                TaskNode::Parallel {
                    expected: None,
                    started_at: None,
                }
            }
            ProfileData::Sequence { repeat, children } => {
                let mut subs = Vec::with_capacity(children.len() * *repeat as usize);
                for _ in 0..*repeat {
                    for child in children {
                        let child_profile = registry.get(child)?;
                        subs.push(TaskTree::from_profile(&child_profile, registry)?);
                    }
                }
                TaskNode::Sequence {
                    children: subs,
                    current: None,
                }
            }
            ProfileData::Smpi { .. } => TaskNode::Opaque,
        };
        Ok(TaskTree {
            profile_name: profile.name.clone(),
            node,
        })
    }

    pub fn mark_started(&mut self, now: f64, expected: Option<f64>) {
        match &mut self.node {
            TaskNode::Delay { started_at, .. } => *started_at = Some(now),
            TaskNode::Parallel {
                started_at,
                expected: slot,
            } => {
                *started_at = Some(now);
                *slot = expected;
            }
            _ => {}
        }
    }

    pub fn advance_sequence(&mut self, index: usize) {
        if let TaskNode::Sequence { current, .. } = &mut self.node {
            *current = Some(index);
        }
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut TaskTree> {
        match &mut self.node {
            TaskNode::Sequence { children, .. } => children.get_mut(index),
            _ => None,
        }
    }

    fn leaf_progress(&self, now: f64) -> Option<f64> {
        match &self.node {
            TaskNode::Delay { required, started_at } => match started_at {
                _ if *required == 0. => Some(1.),
                Some(start) => Some(((now - start) / required).clamp(0., 1.)),
                None => Some(0.),
            },
            TaskNode::Parallel { expected, started_at } => match (started_at, expected) {
                (Some(start), Some(expected)) if *expected > 0. => {
                    Some(((now - start) / expected).clamp(0., 1.))
                }
                (Some(_), _) => Some(1.),
                (None, _) => Some(0.),
            },
            TaskNode::Opaque => None,
            TaskNode::Sequence { .. } => None,
        }
    }

    /// Point-in-time snapshot of the whole tree.
    pub fn snapshot(&self, now: f64) -> ProgressSnapshot {
        let detail = match &self.node {
            TaskNode::Sequence { children, current } => ProgressDetail::Interior {
                current_task_index: *current,
                current_task: current
                    .and_then(|i| children.get(i))
                    .map(|child| Box::new(child.snapshot(now))),
            },
            _ => ProgressDetail::Leaf {
                progress: self.leaf_progress(now),
            },
        };
        ProgressSnapshot {
            profile_name: self.profile_name.clone(),
            detail,
        }
    }

    /// Collapses the tree into one fraction of completed work, used when a
    /// snapshot regenerates a remaining-work profile.
    pub fn scalar_progress(&self, now: f64) -> f64 {
        match &self.node {
            TaskNode::Sequence { children, current } => {
                if children.is_empty() {
                    return 1.;
                }
                match current {
                    Some(i) => {
                        let done = *i as f64;
                        let inner = children[*i].scalar_progress(now);
                        ((done + inner) / children.len() as f64).clamp(0., 1.)
                    }
                    None => 0.,
                }
            }
            _ => self.leaf_progress(now).unwrap_or(0.),
        }
    }
}

/// Flattened execution plan handed to the executor, mirroring the task tree
/// node for node. I/O overlays are already merged in at build time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ExecNode {
    Delay {
        seconds: f64,
    },
    /// Per-host flops and a row-major n*n byte matrix.
    Parallel {
        cpu: Vec<f64>,
        com: Vec<f64>,
    },
    Sequence {
        children: Vec<ExecNode>,
    },
    Opaque,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProgressSnapshot {
    pub profile_name: String,
    pub detail: ProgressDetail,
}

#[derive(Clone, Debug, Serialize)]
pub enum ProgressDetail {
    Leaf {
        progress: Option<f64>,
    },
    Interior {
        current_task_index: Option<usize>,
        current_task: Option<Box<ProgressSnapshot>>,
    },
}

impl ProgressSnapshot {
    pub fn to_json(&self) -> Value {
        match &self.detail {
            ProgressDetail::Leaf { progress } => json!({
                "profile_name": self.profile_name,
                "progress": progress,
            }),
            ProgressDetail::Interior {
                current_task_index,
                current_task,
            } => json!({
                "profile_name": self.profile_name,
                "current_task_index": current_task_index.map(|i| i as i64).unwrap_or(-1),
                "current_task": current_task.as_ref().map(|t| t.to_json()),
            }),
        }
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
            .add("d10", json!({"type": "delay", "delay": 10.0}))
            .unwrap();
        registry
            .add("d0", json!({"type": "delay", "delay": 0.0}))
            .unwrap();
        registry
            .add("seq", json!({"type": "composed", "repeat": 2, "seq": ["d10", "d0"]}))
            .unwrap();
        registry
            .add("mpi", json!({"type": "smpi", "trace": "t"}))
            .unwrap();
        registry
    }

    #[test]
    fn delay_progress_is_clamped() {
        let registry = registry();
        let mut tree = TaskTree::from_profile(&registry.get("d10").unwrap(), &registry).unwrap();
        assert_eq!(tree.leaf_progress(5.), Some(0.));
        tree.mark_started(2., None);
        assert_eq!(tree.leaf_progress(7.), Some(0.5));
        assert_eq!(tree.leaf_progress(100.), Some(1.));
    }

    #[test]
    fn zero_duration_delay_reports_one() {
        let registry = registry();
        let tree = TaskTree::from_profile(&registry.get("d0").unwrap(), &registry).unwrap();
        assert_eq!(tree.leaf_progress(0.), Some(1.));
    }

    #[test]
    fn sequence_expands_repeat_and_tracks_index() {
        let registry = registry();
        let mut tree = TaskTree::from_profile(&registry.get("seq").unwrap(), &registry).unwrap();
        match &tree.node {
            TaskNode::Sequence { children, .. } => assert_eq!(children.len(), 4),
            _ => panic!("expected a sequence node"),
        }
        tree.advance_sequence(1);
        tree.child_mut(1).unwrap().mark_started(0., None);
        let snapshot = tree.snapshot(0.);
        let value = snapshot.to_json();
        assert_eq!(value["current_task_index"], json!(1));
        assert_eq!(value["current_task"]["progress"], json!(1.0));
        assert!((tree.scalar_progress(0.) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn smpi_progress_is_undefined() {
        let registry = registry();
        let tree = TaskTree::from_profile(&registry.get("mpi").unwrap(), &registry).unwrap();
        let value = tree.snapshot(3.).to_json();
        assert_eq!(value["progress"], Value::Null);
    }
}
