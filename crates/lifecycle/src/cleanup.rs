/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Retention-driven cleanup orchestration
//!
//! A cleanup job scans its source, evaluates every item against the
//! policy's rules in ascending priority order, and hands each rule's
//! batch to the action executor. Rule evaluation within a policy is
//! strictly sequential; only item processing inside a batch may be
//! reordered. Partial success is a first-class outcome: item failures
//! land in the job's error list while the job itself completes.

use crate::{
    archive::RunGuard,
    config::LifecycleConfig,
    error::{LifecycleError, Result},
    executor::ActionExecutor,
    job::{Job, JobKind, JobStatus, JobTracker, JobUpdate},
    metrics::JobStats,
    policy::{CleanupRule, PolicyRegistry, RetentionPolicy},
    scanner::{FileScanner, StorageItem},
};
use chrono::Utc;
use metrics::counter;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{error, info, warn};

/// Request for a new cleanup job
#[derive(Debug, Clone)]
pub struct CleanupJobSpec {
    pub name: String,
    pub description: String,
    /// Directory to clean; defaults to the configured data root.
    pub source_path: Option<PathBuf>,
    pub policy_id: String,
    /// Evaluate and report without mutating the filesystem.
    pub dry_run: bool,
}

impl CleanupJobSpec {
    pub fn new(name: impl Into<String>, policy_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            source_path: None,
            policy_id: policy_id.into(),
            dry_run: false,
        }
    }
}

struct RunOutcome {
    original_bytes: u64,
    freed_bytes: u64,
    total_items: usize,
    processed_items: usize,
    errors: Vec<String>,
}

/// Orchestrates retention cleanup jobs
#[derive(Debug, Clone)]
pub struct CleanupManager {
    tracker: JobTracker,
    registry: PolicyRegistry,
    executor: ActionExecutor,
    scanner: FileScanner,
    config: LifecycleConfig,
    in_flight: Arc<AtomicBool>,
}

impl CleanupManager {
    pub fn new(tracker: JobTracker, registry: PolicyRegistry, config: LifecycleConfig) -> Self {
        Self {
            tracker,
            registry,
            executor: ActionExecutor::new(&config),
            scanner: FileScanner::new(),
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a pending cleanup job after validating its source path
    /// and policy
    pub async fn create_job(&self, spec: CleanupJobSpec) -> Result<String> {
        let source = spec
            .source_path
            .unwrap_or_else(|| self.config.data_root.clone());
        if !source.is_dir() {
            return Err(LifecycleError::SourceNotFound(source));
        }
        if self.registry.get_retention(&spec.policy_id).await?.is_none() {
            return Err(LifecycleError::NotFound(format!(
                "retention policy {}",
                spec.policy_id
            )));
        }

        let job = Job::new(JobKind::Cleanup, spec.name, source)
            .with_description(spec.description)
            .with_policy(spec.policy_id)
            .with_metadata("dry_run", spec.dry_run.to_string());
        self.tracker.create(job).await
    }

    /// Execute a pending job to completion; see
    /// [`ArchiveManager::execute_job`](crate::archive::ArchiveManager::execute_job)
    /// for the state discipline.
    pub async fn execute_job(&self, job_id: &str) -> Result<Job> {
        self.execute_with_policy(job_id, None).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        self.tracker.cancel(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .tracker
            .list()
            .await?
            .into_iter()
            .filter(|job| job.kind == JobKind::Cleanup)
            .collect())
    }

    pub async fn statistics(&self) -> Result<JobStats> {
        Ok(JobStats::compute(&self.list_jobs().await?))
    }

    /// Scheduled entry point: run every enabled retention policy over
    /// the data root, guarded by the manager's single-flight flag.
    pub async fn run_scheduled(&self) -> Result<Vec<String>> {
        let Some(_guard) = RunGuard::try_acquire(&self.in_flight) else {
            warn!("cleanup run already in flight, skipping");
            counter!("lifecycle_cleanup_runs_skipped").increment(1);
            return Ok(Vec::new());
        };
        self.run_policies(false).await
    }

    /// Run a full cleanup pass with every policy threshold halved.
    ///
    /// Triggered when storage usage exceeds the configured ceiling.
    /// Halving happens on in-memory copies handed to rule evaluation;
    /// the persisted policies are never mutated, so the original
    /// thresholds are intact afterwards even if the pass fails.
    pub async fn run_emergency_cleanup(&self) -> Result<Vec<String>> {
        let Some(_guard) = RunGuard::try_acquire(&self.in_flight) else {
            warn!("cleanup run already in flight, skipping emergency pass");
            return Ok(Vec::new());
        };
        warn!("storage ceiling exceeded, running emergency cleanup");
        counter!("lifecycle_emergency_cleanups").increment(1);
        self.run_policies(true).await
    }

    async fn run_policies(&self, emergency: bool) -> Result<Vec<String>> {
        let mut executed = Vec::new();
        for policy in self.registry.list_retention().await? {
            if !policy.enabled {
                continue;
            }
            let name = if emergency {
                format!("emergency cleanup: {}", policy.name)
            } else {
                format!("scheduled cleanup: {}", policy.name)
            };
            let mut spec = CleanupJobSpec::new(name, policy.id.clone());
            spec.description = policy.description.clone();
            let job_id = self.create_job(spec).await?;

            let override_policy = emergency.then(|| policy.halved());
            match self
                .execute_with_policy(&job_id, override_policy.as_ref())
                .await
            {
                Ok(_) => executed.push(job_id),
                Err(err) => {
                    // The job record carries the failure; keep going so
                    // one bad policy does not starve the rest.
                    error!(job_id, error = %err, "cleanup job failed");
                    executed.push(job_id);
                }
            }
        }
        Ok(executed)
    }

    /// Shared execution body. `policy_override` substitutes an
    /// in-memory policy (emergency halving) for the persisted one.
    async fn execute_with_policy(
        &self,
        job_id: &str,
        policy_override: Option<&RetentionPolicy>,
    ) -> Result<Job> {
        let job = self
            .tracker
            .get(job_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("job {job_id}")))?;
        if job.status != JobStatus::Pending {
            return Err(LifecycleError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                expected: JobStatus::Pending,
            });
        }

        let job = self
            .tracker
            .update_status(job_id, JobStatus::Running, JobUpdate::default())
            .await?;
        info!(job_id, source = %job.source_path.display(), "cleanup job started");

        let cancel = self.tracker.cancellation_flag(job_id).await;
        let outcome = self.run_cleanup(&job, policy_override, &cancel).await;
        self.finalize(job_id, outcome).await
    }

    async fn run_cleanup(
        &self,
        job: &Job,
        policy_override: Option<&RetentionPolicy>,
        cancel: &AtomicBool,
    ) -> Result<RunOutcome> {
        let policy_id = job
            .policy_id
            .as_deref()
            .ok_or_else(|| LifecycleError::Storage("cleanup job without policy".to_string()))?;
        let stored;
        let policy = match policy_override {
            Some(policy) => policy,
            None => {
                stored = self
                    .registry
                    .get_retention(policy_id)
                    .await?
                    .ok_or_else(|| {
                        LifecycleError::NotFound(format!("retention policy {policy_id}"))
                    })?;
                &stored
            }
        };
        let dry_run = job
            .metadata
            .get("dry_run")
            .map(|v| v == "true")
            .unwrap_or(false);

        if !policy.enabled {
            warn!(job_id = %job.id, policy_id, "policy is disabled, nothing to do");
            return Ok(RunOutcome {
                original_bytes: 0,
                freed_bytes: 0,
                total_items: 0,
                processed_items: 0,
                errors: Vec::new(),
            });
        }

        let items = if job.source_path == self.config.data_root {
            self.scanner.scan_root(&job.source_path)?
        } else {
            let data_type = job
                .source_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string());
            self.scanner.scan(&job.source_path, &data_type)?
        };

        let now = Utc::now();
        let ranks = recency_ranks(&items);
        // Partition items by the first rule that matches them. Batches
        // are then executed in rule priority order, never in parallel
        // across rules.
        let mut batches: HashMap<String, Vec<StorageItem>> = HashMap::new();
        for (index, item) in items.into_iter().enumerate() {
            if !policy.applies_to(&item.data_type) {
                continue;
            }
            if let Some(rule) = policy.match_rule(&item, now, ranks[index]) {
                batches.entry(rule.id.clone()).or_default().push(item);
            }
        }

        let total_items: usize = batches.values().map(|batch| batch.len()).sum();
        let original_bytes: u64 = batches
            .values()
            .flat_map(|batch| batch.iter())
            .map(|item| item.size)
            .sum();
        self.tracker
            .record_progress(
                &job.id,
                JobUpdate {
                    progress: Some(10),
                    total_items: Some(total_items),
                    ..JobUpdate::default()
                },
            )
            .await?;

        let mut processed = 0;
        let mut freed = 0;
        let mut errors = Vec::new();
        let mut ordered: Vec<&CleanupRule> =
            policy.rules.iter().filter(|rule| rule.enabled).collect();
        ordered.sort_by_key(|rule| rule.priority);

        for rule in ordered {
            let Some(batch) = batches.get(&rule.id) else {
                continue;
            };
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let outcome = self
                .executor
                .apply(rule.action, batch, &rule.params, dry_run, Some(cancel))
                .await?;
            processed += outcome.processed;
            freed += outcome.size_freed;
            errors.extend(outcome.errors);

            if total_items > 0 {
                let progress = 10 + (processed * 85 / total_items) as u8;
                self.tracker
                    .record_progress(
                        &job.id,
                        JobUpdate {
                            progress: Some(progress.min(95)),
                            processed_items: Some(processed),
                            ..JobUpdate::default()
                        },
                    )
                    .await?;
            }
            if outcome.cancelled {
                break;
            }
        }

        Ok(RunOutcome {
            original_bytes,
            freed_bytes: freed,
            total_items,
            processed_items: processed,
            errors,
        })
    }

    async fn finalize(&self, job_id: &str, outcome: Result<RunOutcome>) -> Result<Job> {
        let current = self
            .tracker
            .get(job_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("job {job_id}")))?;
        if current.status.is_terminal() {
            info!(job_id, status = %current.status, "job finished in state set during execution");
            return Ok(current);
        }

        match outcome {
            Ok(run) => {
                counter!("lifecycle_cleanup_jobs_completed").increment(1);
                counter!("lifecycle_bytes_freed").increment(run.freed_bytes);
                info!(
                    job_id,
                    items = run.processed_items,
                    freed = run.freed_bytes,
                    "cleanup job completed"
                );
                self.tracker
                    .update_status(
                        job_id,
                        JobStatus::Completed,
                        JobUpdate {
                            progress: Some(100),
                            original_bytes: Some(run.original_bytes),
                            reclaimed_bytes: Some(run.freed_bytes),
                            total_items: Some(run.total_items),
                            processed_items: Some(run.processed_items),
                            errors: Some(run.errors),
                            ..JobUpdate::default()
                        },
                    )
                    .await
            }
            Err(err) => {
                counter!("lifecycle_cleanup_jobs_failed").increment(1);
                error!(job_id, error = %err, "cleanup job failed");
                self.tracker
                    .update_status(
                        job_id,
                        JobStatus::Failed,
                        JobUpdate {
                            error: Some(err.to_string()),
                            ..JobUpdate::default()
                        },
                    )
                    .await?;
                Err(err)
            }
        }
    }
}

/// One-based recency rank of each item within its data type; the most
/// recently modified item has rank 1
fn recency_ranks(items: &[StorageItem]) -> Vec<usize> {
    let mut by_type: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        by_type.entry(item.data_type.as_str()).or_default().push(index);
    }

    let mut ranks = vec![0; items.len()];
    for indices in by_type.values_mut() {
        indices.sort_by(|a, b| items[*b].modified.cmp(&items[*a].modified));
        for (rank, index) in indices.iter().enumerate() {
            ranks[*index] = rank + 1;
        }
    }
    ranks
}
