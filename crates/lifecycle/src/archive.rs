/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Archival job orchestration
//!
//! The archive manager drives scan -> filter -> bundle -> verify ->
//! remove-originals for each job. A job becomes durably `Running`
//! before the first filesystem mutation and always reaches a terminal
//! state before `execute_job` returns, so a crash mid-operation leaves
//! an auditable record. Originals are only removed after the bundle
//! verifies; a failed verification fails the job and loses nothing.

use crate::{
    bundle::ArchiveBuilder,
    config::LifecycleConfig,
    error::{LifecycleError, Result},
    executor::{ActionExecutor, ActionParams},
    job::{Job, JobKind, JobStatus, JobTracker, JobUpdate},
    metrics::JobStats,
    policy::{ArchivePolicy, ArchiveRuleAction},
    scanner::FileScanner,
};
use chrono::Utc;
use metrics::counter;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{error, info, warn};

/// RAII single-flight guard over a manager's in-flight flag.
///
/// Scheduled runs acquire it before doing any work; a second scheduled
/// invocation while it is held is skipped rather than queued, so a run
/// outlasting its schedule interval cannot pile up a backlog.
pub(crate) struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then_some(Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Request for a new archive job
#[derive(Debug, Clone)]
pub struct ArchiveJobSpec {
    pub name: String,
    pub description: String,
    pub source_path: PathBuf,
    /// Logical data type label for scanned items.
    pub data_type: String,
    /// Bundle destination; defaults to the configured archive dir.
    pub destination: Option<PathBuf>,
    /// Only items strictly older than this many days are archived;
    /// zero or below archives everything.
    pub older_than_days: i64,
    /// Remove originals after the bundle verifies.
    pub remove_source: bool,
    /// Action applied to eligible items. Non-archive actions skip the
    /// bundling pipeline and go through the action executor.
    pub action: ArchiveRuleAction,
    pub policy_id: Option<String>,
}

impl ArchiveJobSpec {
    pub fn new(name: impl Into<String>, source_path: PathBuf) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            source_path,
            data_type: "default".to_string(),
            destination: None,
            older_than_days: 0,
            remove_source: true,
            action: ArchiveRuleAction::Archive,
            policy_id: None,
        }
    }
}

struct RunOutcome {
    original_bytes: u64,
    reclaimed_bytes: u64,
    compression_ratio: f64,
    total_items: usize,
    processed_items: usize,
    errors: Vec<String>,
}

/// Orchestrates archival jobs
#[derive(Debug, Clone)]
pub struct ArchiveManager {
    tracker: JobTracker,
    executor: ActionExecutor,
    scanner: FileScanner,
    config: LifecycleConfig,
    in_flight: Arc<AtomicBool>,
}

impl ArchiveManager {
    pub fn new(tracker: JobTracker, config: LifecycleConfig) -> Self {
        Self {
            tracker,
            executor: ActionExecutor::new(&config),
            scanner: FileScanner::new(),
            config,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a pending archive job after validating its source path
    pub async fn create_job(&self, spec: ArchiveJobSpec) -> Result<String> {
        if !spec.source_path.is_dir() {
            return Err(LifecycleError::SourceNotFound(spec.source_path));
        }

        let mut job = Job::new(JobKind::Archive, spec.name, spec.source_path)
            .with_description(spec.description)
            .with_metadata("data_type", spec.data_type)
            .with_metadata("older_than_days", spec.older_than_days.to_string())
            .with_metadata("remove_source", spec.remove_source.to_string())
            .with_metadata("action", action_name(spec.action));
        if let Some(destination) = spec.destination {
            job.metadata
                .insert("destination".to_string(), destination.display().to_string());
        }
        if let Some(policy_id) = spec.policy_id {
            job.policy_id = Some(policy_id);
        }
        self.tracker.create(job).await
    }

    /// Execute a pending job to completion.
    ///
    /// The job transitions to `Running` before any work happens and to
    /// a terminal state before this returns, whatever the outcome. An
    /// orchestration failure marks the job failed and is also returned
    /// to the caller; per-item failures only land in the job's error
    /// list.
    pub async fn execute_job(&self, job_id: &str) -> Result<Job> {
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
        info!(job_id, source = %job.source_path.display(), "archive job started");

        let cancel = self.tracker.cancellation_flag(job_id).await;
        let outcome = self.run_archive(&job, &cancel).await;
        self.finalize(job_id, outcome).await
    }

    /// Mark a running job cancelled; the execution loop observes the
    /// flag between items
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        self.tracker.cancel(job_id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .tracker
            .list()
            .await?
            .into_iter()
            .filter(|job| job.kind == JobKind::Archive)
            .collect())
    }

    pub async fn statistics(&self) -> Result<JobStats> {
        Ok(JobStats::compute(&self.list_jobs().await?))
    }

    /// Scheduled entry point: run every rule of an archive policy over
    /// the data root, guarded by the manager's single-flight flag.
    ///
    /// Returns the executed job ids, or an empty list when the run was
    /// skipped because another one is still in flight.
    pub async fn run_scheduled(&self, policy: &ArchivePolicy) -> Result<Vec<String>> {
        let Some(_guard) = RunGuard::try_acquire(&self.in_flight) else {
            warn!(policy_id = %policy.id, "archive run already in flight, skipping");
            counter!("lifecycle_archive_runs_skipped").increment(1);
            return Ok(Vec::new());
        };

        let mut executed = Vec::new();
        for (index, rule) in policy.rules.iter().enumerate() {
            let mut spec = ArchiveJobSpec::new(
                format!("{} #{}", policy.name, index + 1),
                self.config.data_root.clone(),
            );
            spec.older_than_days = rule.max_age_days;
            spec.action = rule.action;
            spec.policy_id = Some(policy.id.clone());

            let job_id = self.create_job(spec).await?;
            match self.execute_job(&job_id).await {
                Ok(_) => executed.push(job_id),
                Err(err) => {
                    // The job record carries the failure; keep going so
                    // one bad rule does not starve the rest.
                    error!(job_id, error = %err, "scheduled archive job failed");
                    executed.push(job_id);
                }
            }
        }
        Ok(executed)
    }

    async fn run_archive(&self, job: &Job, cancel: &AtomicBool) -> Result<RunOutcome> {
        let older_than_days: i64 = job
            .metadata
            .get("older_than_days")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let data_type = job
            .metadata
            .get("data_type")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let remove_source = job
            .metadata
            .get("remove_source")
            .map(|v| v == "true")
            .unwrap_or(true);
        let destination = job
            .metadata
            .get("destination")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.archive_dir.clone());
        let action = job
            .metadata
            .get("action")
            .map(|v| parse_action(v))
            .unwrap_or(ArchiveRuleAction::Archive);

        let items = self.scanner.scan(&job.source_path, &data_type)?;
        let eligible = FileScanner::filter_by_age(items, older_than_days, Utc::now());
        self.tracker
            .record_progress(
                &job.id,
                JobUpdate {
                    progress: Some(10),
                    total_items: Some(eligible.len()),
                    ..JobUpdate::default()
                },
            )
            .await?;

        if eligible.is_empty() {
            return Ok(RunOutcome {
                original_bytes: 0,
                reclaimed_bytes: 0,
                compression_ratio: 0.0,
                total_items: 0,
                processed_items: 0,
                errors: Vec::new(),
            });
        }

        if action != ArchiveRuleAction::Archive {
            // Delete/compress rules bypass bundling entirely.
            let outcome = self
                .executor
                .apply(
                    action.into(),
                    &eligible,
                    &ActionParams::default(),
                    false,
                    Some(cancel),
                )
                .await?;
            return Ok(RunOutcome {
                original_bytes: FileScanner::total_size(&eligible),
                reclaimed_bytes: outcome.size_freed,
                compression_ratio: 0.0,
                total_items: eligible.len(),
                processed_items: outcome.processed,
                errors: outcome.errors,
            });
        }

        let builder = ArchiveBuilder::new(self.config.compression, self.config.compression_level)?;
        let result = builder.build(&job.source_path, &eligible, &destination, &job.id)?;
        self.tracker
            .record_progress(
                &job.id,
                JobUpdate {
                    progress: Some(70),
                    ..JobUpdate::default()
                },
            )
            .await?;

        if self.config.verify_archives {
            // An integrity failure aborts here, before any original is
            // touched.
            builder.verify(&result)?;
        }

        let mut processed = 0;
        let mut errors = Vec::new();
        if remove_source {
            for item in &eligible {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::fs::remove_file(&item.path).await {
                    Ok(()) => processed += 1,
                    Err(err) => {
                        warn!(path = %item.path.display(), error = %err, "removing archived original failed");
                        errors.push(format!("{}: {}", item.path.display(), err));
                    }
                }
            }
        } else {
            processed = eligible.len();
        }

        Ok(RunOutcome {
            original_bytes: result.original_size,
            reclaimed_bytes: result.compressed_size,
            compression_ratio: result.compression_ratio,
            total_items: eligible.len(),
            processed_items: processed,
            errors,
        })
    }

    /// Drive the job to a terminal state, unless a concurrent cancel
    /// already did
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
                counter!("lifecycle_archive_jobs_completed").increment(1);
                counter!("lifecycle_bytes_archived").increment(run.original_bytes);
                info!(
                    job_id,
                    items = run.processed_items,
                    original = run.original_bytes,
                    "archive job completed"
                );
                self.tracker
                    .update_status(
                        job_id,
                        JobStatus::Completed,
                        JobUpdate {
                            progress: Some(100),
                            original_bytes: Some(run.original_bytes),
                            reclaimed_bytes: Some(run.reclaimed_bytes),
                            compression_ratio: Some(run.compression_ratio),
                            total_items: Some(run.total_items),
                            processed_items: Some(run.processed_items),
                            errors: Some(run.errors),
                            ..JobUpdate::default()
                        },
                    )
                    .await
            }
            Err(err) => {
                counter!("lifecycle_archive_jobs_failed").increment(1);
                error!(job_id, error = %err, "archive job failed");
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

fn action_name(action: ArchiveRuleAction) -> &'static str {
    match action {
        ArchiveRuleAction::Archive => "archive",
        ArchiveRuleAction::Delete => "delete",
        ArchiveRuleAction::Compress => "compress",
    }
}

fn parse_action(name: &str) -> ArchiveRuleAction {
    match name {
        "delete" => ArchiveRuleAction::Delete,
        "compress" => ArchiveRuleAction::Compress,
        _ => ArchiveRuleAction::Archive,
    }
}
