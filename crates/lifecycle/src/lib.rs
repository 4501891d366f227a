/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # Data Lifecycle Management Core
//!
//! This crate archives, retains, and purges accumulated operational
//! data (test results, performance metrics, logs, uploaded artifacts)
//! under configurable retention policies, including:
//!
//! - Retention policies with prioritized condition/action rules
//! - Cron-scheduled archival with tar+gzip bundles and integrity checks
//! - Auditable jobs with a strict lifecycle state machine
//! - Dry-run evaluation and emergency cleanup under storage pressure
//! - Derived statistics and component health checks
//!
//! [`LifecycleService`] is the façade other subsystems call; the
//! managers, stores, and scheduler underneath are public for embedders
//! that need finer control.

pub mod archive;
pub mod bundle;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod metrics;
pub mod policy;
pub mod scanner;
pub mod scheduler;
pub mod store;

pub use archive::{ArchiveJobSpec, ArchiveManager};
pub use bundle::{ArchiveBuilder, ArchiveResult, CompressionFormat};
pub use cleanup::{CleanupJobSpec, CleanupManager};
pub use config::LifecycleConfig;
pub use error::{LifecycleError, Result};
pub use executor::{ActionExecutor, ActionOutcome, ActionParams, LifecycleAction};
pub use job::{Job, JobKind, JobStatus, JobTracker, JobUpdate};
pub use metrics::{JobStats, LifecycleStats};
pub use policy::{
    ArchivePolicy, ArchivePolicyUpdate, ArchiveRule, ArchiveRuleAction, CleanupRule,
    PolicyRegistry, RetentionPolicy, RetentionPolicyUpdate, RuleField, RuleOperator, RuleValue,
};
pub use scanner::{FileScanner, StorageItem};
pub use scheduler::{Scheduler, SchedulerStatus, Trigger, TriggerFuture};
pub use store::{FileStore, JobStore, MemoryStore, PolicyStore};

use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{error, info, warn};

/// Identifier the scheduled retention pass registers under
const CLEANUP_SCHEDULE_ID: &str = "retention-cleanup";

/// Component-level health flags.
///
/// Each flag is independently actionable; `overall` is their AND and a
/// partial failure must not be treated as full failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub storage_reachable: bool,
    pub archive_writable: bool,
    pub state_writable: bool,
    pub overall: bool,
}

/// Result of a façade-level cleanup invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub job_id: String,
    pub processed: usize,
    pub freed_bytes: u64,
}

/// Top-level lifecycle management service
#[derive(Debug, Clone)]
pub struct LifecycleService {
    inner: Arc<LifecycleServiceInner>,
}

#[derive(Debug)]
struct LifecycleServiceInner {
    config: LifecycleConfig,
    tracker: JobTracker,
    registry: PolicyRegistry,
    archive: ArchiveManager,
    cleanup: CleanupManager,
    scheduler: Scheduler,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleService {
    /// Create a service persisting state under the configured state
    /// directory
    pub async fn new(config: LifecycleConfig) -> Result<Self> {
        let store = Arc::new(FileStore::open(&config.state_dir).await?);
        Self::with_stores(config, store.clone(), store).await
    }

    /// Create a service over explicit storage backends
    pub async fn with_stores(
        config: LifecycleConfig,
        job_store: Arc<dyn JobStore>,
        policy_store: Arc<dyn PolicyStore>,
    ) -> Result<Self> {
        info!("initializing lifecycle service");
        tokio::fs::create_dir_all(&config.data_root).await?;
        tokio::fs::create_dir_all(&config.archive_dir).await?;

        let tracker = JobTracker::new(job_store);
        let registry = PolicyRegistry::new(policy_store);
        registry.seed_defaults().await?;

        let archive = ArchiveManager::new(tracker.clone(), config.clone());
        let cleanup = CleanupManager::new(tracker.clone(), registry.clone(), config.clone());
        let scheduler = Scheduler::new(Duration::from_secs(config.scheduler_tick_secs.max(1)));

        Ok(Self {
            inner: Arc::new(LifecycleServiceInner {
                config,
                tracker,
                registry,
                archive,
                cleanup,
                scheduler,
                monitor: Mutex::new(None),
            }),
        })
    }

    /// Start scheduled operation: reconcile stale jobs, register every
    /// enabled policy with the scheduler, and begin pressure checks
    pub async fn start(&self) -> Result<()> {
        let recovered = self
            .inner
            .tracker
            .recover_stale(self.inner.config.stale_job_grace_secs)
            .await?;
        if recovered > 0 {
            warn!(recovered, "reconciled stale running jobs from previous run");
        }

        self.register_schedules().await?;
        self.inner.scheduler.start().await;
        self.start_pressure_monitor().await;
        info!("lifecycle service started");
        Ok(())
    }

    /// Stop the scheduler and the pressure monitor; in-flight jobs run
    /// to completion
    pub async fn stop(&self) {
        self.inner.scheduler.stop().await;
        if let Some(handle) = self.inner.monitor.lock().await.take() {
            handle.abort();
        }
        info!("lifecycle service stopped");
    }

    /// Create and execute an archive job, returning its id
    pub async fn archive(&self, spec: ArchiveJobSpec) -> Result<String> {
        let job_id = self.inner.archive.create_job(spec).await?;
        self.inner.archive.execute_job(&job_id).await?;
        Ok(job_id)
    }

    /// Create and execute a cleanup job, returning what it processed
    pub async fn cleanup(&self, spec: CleanupJobSpec) -> Result<CleanupOutcome> {
        let job_id = self.inner.cleanup.create_job(spec).await?;
        let job = self.inner.cleanup.execute_job(&job_id).await?;
        Ok(CleanupOutcome {
            job_id,
            processed: job.processed_items,
            freed_bytes: job.reclaimed_bytes,
        })
    }

    /// Statistics derived from the job collection
    pub async fn statistics(&self) -> Result<LifecycleStats> {
        Ok(LifecycleStats::compute(&self.inner.tracker.list().await?))
    }

    /// Probe storage, archive, and state directories
    pub async fn health_check(&self) -> HealthReport {
        let storage_reachable = tokio::fs::read_dir(&self.inner.config.data_root)
            .await
            .is_ok();
        let archive_writable = probe_writable(&self.inner.config.archive_dir).await;
        let state_writable = probe_writable(&self.inner.config.state_dir).await;
        HealthReport {
            storage_reachable,
            archive_writable,
            state_writable,
            overall: storage_reachable && archive_writable && state_writable,
        }
    }

    /// Whether data-root usage exceeds the configured ceiling
    pub async fn check_storage_pressure(&self) -> Result<bool> {
        let Some(ceiling) = self.inner.config.emergency_ceiling_bytes else {
            return Ok(false);
        };
        let items = FileScanner::new().scan_root(&self.inner.config.data_root)?;
        let usage = FileScanner::total_size(&items);
        Ok(usage > ceiling)
    }

    /// Check the ceiling and run an emergency pass when it is exceeded.
    /// Returns the executed job ids, empty when under the ceiling.
    pub async fn enforce_storage_ceiling(&self) -> Result<Vec<String>> {
        if self.check_storage_pressure().await? {
            self.inner.cleanup.run_emergency_cleanup().await
        } else {
            Ok(Vec::new())
        }
    }

    /// Run the emergency cleanup pass immediately
    pub async fn run_emergency_cleanup(&self) -> Result<Vec<String>> {
        self.inner.cleanup.run_emergency_cleanup().await
    }

    pub fn archive_manager(&self) -> &ArchiveManager {
        &self.inner.archive
    }

    pub fn cleanup_manager(&self) -> &CleanupManager {
        &self.inner.cleanup
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    // Job control passthrough

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.inner.tracker.list().await
    }

    pub async fn job(&self, id: &str) -> Result<Option<Job>> {
        self.inner.tracker.get(id).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        self.inner.tracker.cancel(id).await
    }

    pub async fn delete_job(&self, id: &str) -> Result<bool> {
        self.inner.tracker.delete(id).await
    }

    // Policy CRUD passthrough

    pub async fn retention_policies(&self) -> Result<Vec<RetentionPolicy>> {
        self.inner.registry.list_retention().await
    }

    pub async fn retention_policy(&self, id: &str) -> Result<Option<RetentionPolicy>> {
        self.inner.registry.get_retention(id).await
    }

    pub async fn create_retention_policy(&self, policy: RetentionPolicy) -> Result<String> {
        self.inner.registry.create_retention(policy).await
    }

    pub async fn update_retention_policy(
        &self,
        id: &str,
        update: RetentionPolicyUpdate,
    ) -> Result<RetentionPolicy> {
        self.inner.registry.update_retention(id, update).await
    }

    pub async fn delete_retention_policy(&self, id: &str) -> Result<bool> {
        self.inner.registry.delete_retention(id).await
    }

    pub async fn archive_policies(&self) -> Result<Vec<ArchivePolicy>> {
        self.inner.registry.list_archive().await
    }

    pub async fn archive_policy(&self, id: &str) -> Result<Option<ArchivePolicy>> {
        self.inner.registry.get_archive(id).await
    }

    /// Create an archive policy and, when enabled, register its
    /// schedule
    pub async fn create_archive_policy(&self, policy: ArchivePolicy) -> Result<String> {
        let id = self.inner.registry.create_archive(policy).await?;
        self.sync_archive_schedule(&id).await?;
        Ok(id)
    }

    pub async fn update_archive_policy(
        &self,
        id: &str,
        update: ArchivePolicyUpdate,
    ) -> Result<ArchivePolicy> {
        let policy = self.inner.registry.update_archive(id, update).await?;
        self.sync_archive_schedule(id).await?;
        Ok(policy)
    }

    pub async fn delete_archive_policy(&self, id: &str) -> Result<bool> {
        let deleted = self.inner.registry.delete_archive(id).await?;
        if deleted {
            self.inner.scheduler.unschedule(id).await;
        }
        Ok(deleted)
    }

    /// Bring the scheduler entry for one archive policy in line with
    /// its stored state
    async fn sync_archive_schedule(&self, id: &str) -> Result<()> {
        let Some(policy) = self.inner.registry.get_archive(id).await? else {
            self.inner.scheduler.unschedule(id).await;
            return Ok(());
        };
        if policy.enabled {
            let trigger = archive_trigger(self.inner.archive.clone(), policy.clone());
            self.inner
                .scheduler
                .schedule(&policy.id, &policy.schedule, trigger)
                .await?;
        } else {
            self.inner.scheduler.unschedule(id).await;
        }
        Ok(())
    }

    async fn register_schedules(&self) -> Result<()> {
        for policy in self.inner.registry.list_archive().await? {
            if !policy.enabled {
                continue;
            }
            let trigger = archive_trigger(self.inner.archive.clone(), policy.clone());
            if let Err(err) = self
                .inner
                .scheduler
                .schedule(&policy.id, &policy.schedule, trigger)
                .await
            {
                // The policy stays unscheduled but visible; operators
                // fix the expression and re-enable.
                error!(policy_id = %policy.id, error = %err, "could not schedule archive policy");
            }
        }

        let cleanup = self.inner.cleanup.clone();
        let trigger: Trigger = Arc::new(move || {
            let cleanup = cleanup.clone();
            Box::pin(async move {
                if let Err(err) = cleanup.run_scheduled().await {
                    error!(error = %err, "scheduled cleanup pass failed");
                }
            })
        });
        self.inner
            .scheduler
            .schedule(
                CLEANUP_SCHEDULE_ID,
                &self.inner.config.cleanup_schedule,
                trigger,
            )
            .await
    }

    async fn start_pressure_monitor(&self) {
        if self.inner.config.emergency_ceiling_bytes.is_none() {
            return;
        }
        let service = self.clone();
        let period = Duration::from_secs(self.inner.config.pressure_check_secs.max(1));
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick is skipped so startup does not
            // race the stale-job reconciliation.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = service.enforce_storage_ceiling().await {
                    error!(error = %err, "storage pressure check failed");
                }
            }
        });
        *self.inner.monitor.lock().await = Some(task);
    }
}

/// Probe a directory for writability by creating and removing a marker
async fn probe_writable(dir: &std::path::Path) -> bool {
    let probe = dir.join(".probe");
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            true
        }
        Err(_) => false,
    }
}

fn archive_trigger(manager: ArchiveManager, policy: ArchivePolicy) -> Trigger {
    Arc::new(move || {
        let manager = manager.clone();
        let policy = policy.clone();
        Box::pin(async move {
            if let Err(err) = manager.run_scheduled(&policy).await {
                error!(policy_id = %policy.id, error = %err, "scheduled archive run failed");
            }
        })
    })
}
