//! Concurrency-safe registry of deployment jobs.
//!
//! Records and the "latest job" pointer sit behind a single reader/writer
//! lock so that readers run concurrently while every mutation is exclusive.
//! Job IDs come from an independent atomic counter and never wait on the
//! record lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};
use crate::types::{DeploymentJob, JobId, JobStatus};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, DeploymentJob>,
    latest: Option<JobId>,
}

/// Shared job registry.
#[derive(Debug, Default)]
pub struct JobStore {
    inner: RwLock<Inner>,
    sequence: AtomicU64,
}

impl JobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue a fresh, strictly increasing job ID.
    pub fn next_id(&self) -> JobId {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        JobId::from_sequence(n)
    }

    /// Insert a new job and make it the latest.
    ///
    /// Fails if a job with the same ID already exists.
    pub fn create(&self, job: DeploymentJob) -> DeployResult<()> {
        let mut inner = self.write();
        if inner.jobs.contains_key(&job.id) {
            return Err(DeployError::DuplicateJob(job.id.to_string()));
        }
        let id = job.id.clone();
        inner.jobs.insert(id.clone(), job);
        inner.latest = Some(id.clone());
        debug!(job_id = %id, "job stored");
        Ok(())
    }

    /// Snapshot of a job.
    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<DeploymentJob> {
        self.read().jobs.get(id).cloned()
    }

    /// Snapshot of the most recently created job.
    #[must_use]
    pub fn latest(&self) -> Option<DeploymentJob> {
        let inner = self.read();
        inner
            .latest
            .as_ref()
            .and_then(|id| inner.jobs.get(id))
            .cloned()
    }

    /// Number of jobs created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().jobs.len()
    }

    /// Whether no job has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set status, output and error of a job.
    ///
    /// Returns `false` if the job is unknown or the transition would not
    /// move the job forward.
    pub fn update(&self, id: &JobId, status: JobStatus, output: &str, error: &str) -> bool {
        self.mutate(id, status, |job| {
            job.output = output.to_owned();
            job.error = error.to_owned();
            if status == JobStatus::Failed {
                job.revision.clear();
            }
        })
    }

    /// Mark a job ready with its deployed revision, clearing any error.
    ///
    /// Returns `false` if the job is unknown or not in `DEPLOY_IN_PROGRESS`.
    pub fn mark_ready(&self, id: &JobId, output: &str, revision: &str) -> bool {
        self.mutate(id, JobStatus::Ready, |job| {
            job.output = output.to_owned();
            job.revision = revision.to_owned();
            job.error.clear();
        })
    }

    fn mutate(&self, id: &JobId, status: JobStatus, apply: impl FnOnce(&mut DeploymentJob)) -> bool {
        let mut inner = self.write();
        let Some(job) = inner.jobs.get_mut(id) else {
            return false;
        };
        if !job.status.can_transition_to(status) {
            warn!(
                job_id = %id,
                from = %job.status,
                to = %status,
                "refusing backward status transition"
            );
            return false;
        }
        job.status = status;
        apply(job);
        job.updated_at = Utc::now();
        true
    }
}
