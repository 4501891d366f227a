/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Job records and lifecycle state machine
//!
//! Every archive or cleanup operation is tracked as an auditable job.
//! Jobs start in `Pending`, move to `Running` exactly once, and end in
//! one of the terminal states. Terminal jobs are immutable except for
//! being read or deleted. All job writes funnel through [`JobTracker`]
//! so statistics stay derivable from the job collection alone.

use crate::{
    error::{LifecycleError, Result},
    store::JobStore,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Valid transitions: pending -> running, running -> any terminal state
    pub fn can_transition(&self, to: JobStatus) -> bool {
        match (self, to) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Running, t) if t.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Kind of lifecycle job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Archive,
    Cleanup,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Archive => f.write_str("archive"),
            JobKind::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// An auditable unit of lifecycle work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: JobKind,
    /// Directory the job operates on.
    pub source_path: PathBuf,
    /// Policy that produced the job, if any.
    pub policy_id: Option<String>,
    pub status: JobStatus,
    /// Completion percentage, clamped to 0..=100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Total bytes of the items the job operated on.
    pub original_bytes: u64,
    /// Compressed bundle size for archive jobs, bytes freed for
    /// cleanup jobs.
    pub reclaimed_bytes: u64,
    /// Percentage size reduction, 0..=100.
    pub compression_ratio: f64,
    pub total_items: usize,
    pub processed_items: usize,
    /// Orchestration failure, set when the job itself failed.
    pub error: Option<String>,
    /// Per-item failures. A populated list does not fail the job.
    pub errors: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Job {
    /// Create a new pending job with a generated id
    pub fn new(kind: JobKind, name: impl Into<String>, source_path: PathBuf) -> Self {
        Self {
            id: generate_job_id(kind),
            name: name.into(),
            description: String::new(),
            kind,
            source_path,
            policy_id: None,
            status: JobStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            original_bytes: 0,
            reclaimed_bytes: 0,
            compression_ratio: 0.0,
            total_items: 0,
            processed_items: 0,
            error: None,
            errors: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Wall-clock duration, available once the job has started and ended
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

/// Generate a unique job id: kind, timestamp, random suffix
fn generate_job_id(kind: JobKind) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
    format!("{}_{}_{:06x}", kind, timestamp, rand::random::<u32>() & 0xff_ffff)
}

/// Field updates applied together with a status transition
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub progress: Option<u8>,
    pub original_bytes: Option<u64>,
    pub reclaimed_bytes: Option<u64>,
    pub compression_ratio: Option<f64>,
    pub total_items: Option<usize>,
    pub processed_items: Option<usize>,
    pub error: Option<String>,
    pub errors: Option<Vec<String>>,
}

/// Tracks job records and enforces the lifecycle state machine
#[derive(Debug, Clone)]
pub struct JobTracker {
    store: Arc<dyn JobStore>,
    cancel_flags: Arc<RwLock<HashMap<String, Arc<AtomicBool>>>>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            cancel_flags: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Persist a new job record
    pub async fn create(&self, job: Job) -> Result<String> {
        let id = job.id.clone();
        self.store.insert(&job).await?;
        debug!(job_id = %id, kind = %job.kind, "job created");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store.list().await
    }

    /// Transition a job to a new status, applying field updates.
    ///
    /// Fails with `InvalidTransition` unless the transition is
    /// pending -> running or running -> a terminal state. Entering
    /// `Running` stamps `started_at`; entering a terminal state stamps
    /// `completed_at`.
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        update: JobUpdate,
    ) -> Result<Job> {
        let mut job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("job {id}")))?;

        if !job.status.can_transition(status) {
            return Err(LifecycleError::InvalidTransition {
                from: job.status,
                to: status,
            });
        }

        job.status = status;
        let now = Utc::now();
        match status {
            JobStatus::Running => job.started_at = Some(now),
            s if s.is_terminal() => job.completed_at = Some(now),
            _ => {}
        }
        apply_update(&mut job, update);

        self.store.upsert(&job).await?;
        debug!(job_id = %id, status = %status, "job status updated");

        if status.is_terminal() {
            self.cancel_flags.write().await.remove(id);
        }
        Ok(job)
    }

    /// Record mid-run progress without a status transition.
    ///
    /// Only running jobs accept progress; anything else is a caller bug.
    pub async fn record_progress(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let mut job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("job {id}")))?;

        if job.status != JobStatus::Running {
            return Err(LifecycleError::InvalidState {
                job_id: id.to_string(),
                status: job.status,
                expected: JobStatus::Running,
            });
        }
        apply_update(&mut job, update);
        self.store.upsert(&job).await?;
        Ok(job)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.cancel_flags.write().await.remove(id);
        self.store.delete(id).await
    }

    /// Cooperative cancellation flag for a job, created on demand.
    /// Execution loops check it between items.
    pub async fn cancellation_flag(&self, id: &str) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.write().await;
        flags
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Mark a running job cancelled and raise its cancellation flag.
    ///
    /// Returns `false` without touching the job when it is not running;
    /// pending jobs are deleted instead of cancelled.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("job {id}")))?;

        if job.status != JobStatus::Running {
            return Ok(false);
        }

        if let Some(flag) = self.cancel_flags.read().await.get(id) {
            flag.store(true, Ordering::SeqCst);
        }
        match self
            .update_status(id, JobStatus::Cancelled, JobUpdate::default())
            .await
        {
            Ok(_) => {
                info!(job_id = %id, "job cancelled");
                Ok(true)
            }
            // The job reached a terminal state between the read above
            // and the transition; the cancel lost that race.
            Err(LifecycleError::InvalidTransition { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Reconcile jobs left `Running` by a crash.
    ///
    /// Any running job started more than `grace_secs` ago is marked
    /// failed. Returns the number of jobs reconciled.
    pub async fn recover_stale(&self, grace_secs: u64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::seconds(grace_secs as i64);
        let mut recovered = 0;

        for job in self.store.list().await? {
            if job.status != JobStatus::Running {
                continue;
            }
            let stale = match job.started_at {
                Some(started) => started < cutoff,
                // Running without a start time is itself inconsistent.
                None => true,
            };
            if stale {
                warn!(job_id = %job.id, "reconciling stale running job as failed");
                self.update_status(
                    &job.id,
                    JobStatus::Failed,
                    JobUpdate {
                        error: Some("job did not survive process restart".to_string()),
                        ..JobUpdate::default()
                    },
                )
                .await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

fn apply_update(job: &mut Job, update: JobUpdate) {
    if let Some(progress) = update.progress {
        job.progress = progress.min(100);
    }
    if let Some(bytes) = update.original_bytes {
        job.original_bytes = bytes;
    }
    if let Some(bytes) = update.reclaimed_bytes {
        job.reclaimed_bytes = bytes;
    }
    if let Some(ratio) = update.compression_ratio {
        job.compression_ratio = ratio;
    }
    if let Some(total) = update.total_items {
        job.total_items = total;
    }
    if let Some(processed) = update.processed_items {
        job.processed_items = processed;
    }
    if let Some(error) = update.error {
        job.error = Some(error);
    }
    if let Some(errors) = update.errors {
        job.errors = errors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> JobTracker {
        JobTracker::new(Arc::new(MemoryStore::new()))
    }

    fn test_job() -> Job {
        Job::new(JobKind::Cleanup, "test", PathBuf::from("/tmp/data"))
    }

    #[test]
    fn transitions_follow_state_machine() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Running));
        assert!(JobStatus::Running.can_transition(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition(JobStatus::Cancelled));

        assert!(!JobStatus::Pending.can_transition(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition(JobStatus::Pending));
        assert!(!JobStatus::Cancelled.can_transition(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition(JobStatus::Pending));
    }

    #[test]
    fn job_ids_are_unique() {
        let a = generate_job_id(JobKind::Archive);
        let b = generate_job_id(JobKind::Archive);
        assert_ne!(a, b);
        assert!(a.starts_with("archive_"));
    }

    #[tokio::test]
    async fn update_status_rejects_invalid_transition() {
        let tracker = tracker();
        let id = tracker.create(test_job()).await.unwrap();

        let err = tracker
            .update_status(&id, JobStatus::Completed, JobUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Completed,
            }
        ));
    }

    #[tokio::test]
    async fn running_stamps_start_and_terminal_stamps_completion() {
        let tracker = tracker();
        let id = tracker.create(test_job()).await.unwrap();

        let job = tracker
            .update_status(&id, JobStatus::Running, JobUpdate::default())
            .await
            .unwrap();
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());

        let job = tracker
            .update_status(&id, JobStatus::Completed, JobUpdate::default())
            .await
            .unwrap();
        assert!(job.completed_at.is_some());
        assert!(job.duration().is_some());
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let tracker = tracker();
        let id = tracker.create(test_job()).await.unwrap();
        tracker
            .update_status(&id, JobStatus::Running, JobUpdate::default())
            .await
            .unwrap();
        tracker
            .update_status(&id, JobStatus::Failed, JobUpdate::default())
            .await
            .unwrap();

        let err = tracker
            .update_status(&id, JobStatus::Completed, JobUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

        // Reads and deletes still work.
        assert!(tracker.get(&id).await.unwrap().is_some());
        assert!(tracker.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_is_a_noop_unless_running() {
        let tracker = tracker();
        let id = tracker.create(test_job()).await.unwrap();

        assert!(!tracker.cancel(&id).await.unwrap());

        tracker
            .update_status(&id, JobStatus::Running, JobUpdate::default())
            .await
            .unwrap();
        let flag = tracker.cancellation_flag(&id).await;
        assert!(tracker.cancel(&id).await.unwrap());
        assert!(flag.load(Ordering::SeqCst));

        let job = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());

        // Cancelling a second time is a no-op.
        assert!(!tracker.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn recover_stale_fails_old_running_jobs() {
        let tracker = tracker();
        let id = tracker.create(test_job()).await.unwrap();
        tracker
            .update_status(&id, JobStatus::Running, JobUpdate::default())
            .await
            .unwrap();

        // Grace of zero seconds makes any running job stale.
        let recovered = tracker.recover_stale(0).await.unwrap();
        assert_eq!(recovered, 1);

        let job = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.is_some());

        // A second pass finds nothing.
        assert_eq!(tracker.recover_stale(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let tracker = tracker();
        let id = tracker.create(test_job()).await.unwrap();
        tracker
            .update_status(&id, JobStatus::Running, JobUpdate::default())
            .await
            .unwrap();

        let job = tracker
            .record_progress(
                &id,
                JobUpdate {
                    progress: Some(250),
                    ..JobUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn progress_requires_running() {
        let tracker = tracker();
        let id = tracker.create(test_job()).await.unwrap();

        let err = tracker
            .record_progress(
                &id,
                JobUpdate {
                    progress: Some(10),
                    ..JobUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { .. }));
    }
}
