use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::job::{Job, JobId};

/// A job shared between the dispatcher and the nodes rendering it.
///
/// The lock is never held across an `.await`.
pub type SharedJob = Arc<Mutex<Job>>;

/// Table of every registered job that has not been deleted.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, SharedJob>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> SharedJob {
        let id = job.id;
        let shared = Arc::new(Mutex::new(job));
        self.jobs.write().insert(id, Arc::clone(&shared));
        shared
    }

    pub fn get(&self, id: JobId) -> Option<SharedJob> {
        self.jobs.read().get(&id).cloned()
    }

    pub fn remove(&self, id: JobId) -> Option<SharedJob> {
        self.jobs.write().remove(&id)
    }

    /// Copy of the job as it is right now.
    pub fn snapshot(&self, id: JobId) -> Option<Job> {
        self.get(id).map(|job| job.lock().clone())
    }

    /// Copies of every job, oldest registration first.
    pub fn all(&self) -> Vec<Job> {
        let shared: Vec<SharedJob> = self.jobs.read().values().cloned().collect();
        let mut jobs: Vec<Job> = shared.iter().map(|job| job.lock().clone()).collect();
        jobs.sort_by_key(|job| job.init_time);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}
