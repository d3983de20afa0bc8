//! Cross-actor registry mapping numeric execution keys to jobs. Events only
//! carry the key; the submitter, server and executor all share this store.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::jobs::{JobHandle, JobIdentifier};
use crate::task_tree::ExecNode;

#[derive(Default)]
pub struct SharedInfoStorage {
    next_key: u64,
    key_by_id: FxHashMap<JobIdentifier, u64>,
    jobs: FxHashMap<u64, JobHandle>,
    plans: FxHashMap<u64, ExecNode>,
}

pub type SharedStorage = Rc<RefCell<SharedInfoStorage>>;

impl SharedInfoStorage {
    pub fn new() -> Self {
        SharedInfoStorage::default()
    }

    pub fn register_job(&mut self, job: JobHandle) -> u64 {
        let id = job.borrow().id.clone();
        if let Some(key) = self.key_by_id.get(&id) {
            return *key;
        }
        let key = self.next_key;
        self.next_key += 1;
        self.key_by_id.insert(id, key);
        self.jobs.insert(key, job);
        key
    }

    pub fn job(&self, key: u64) -> JobHandle {
        self.jobs.get(&key).expect("unknown execution key").clone()
    }

    pub fn key_of(&self, id: &JobIdentifier) -> Option<u64> {
        self.key_by_id.get(id).copied()
    }

    pub fn set_plan(&mut self, key: u64, plan: ExecNode) {
        self.plans.insert(key, plan);
    }

    pub fn take_plan(&mut self, key: u64) -> Option<ExecNode> {
        self.plans.remove(&key)
    }

    pub fn remove(&mut self, key: u64) {
        if let Some(job) = self.jobs.remove(&key) {
            self.key_by_id.remove(&job.borrow().id);
        }
        self.plans.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
