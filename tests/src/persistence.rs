/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Restart behavior over the file-backed store

use crate::common;
use lifecycle::{
    CleanupJobSpec, FileStore, Job, JobKind, JobStatus, JobTracker, JobUpdate, LifecycleConfig,
    LifecycleService,
};
use std::{path::PathBuf, sync::Arc};
use tempfile::TempDir;

#[tokio::test]
async fn jobs_survive_a_restart() {
    let root = TempDir::new().unwrap();
    let job_id = {
        let service = common::service(&root).await;
        common::aged_results_fixture(&root);
        let policy_id = service
            .create_retention_policy(common::delete_after_days(30))
            .await
            .unwrap();
        service
            .cleanup(CleanupJobSpec::new("before-restart", policy_id))
            .await
            .unwrap()
            .job_id
    };

    // A fresh service over the same state dir sees the finished job.
    let service = common::service(&root).await;
    let job = service.job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_items, 2);
}

#[tokio::test]
async fn seeding_does_not_repeat_across_restarts() {
    let root = TempDir::new().unwrap();
    {
        let service = common::service(&root).await;
        assert_eq!(service.retention_policies().await.unwrap().len(), 1);
    }
    for _ in 0..3 {
        let service = common::service(&root).await;
        assert_eq!(service.retention_policies().await.unwrap().len(), 1);
        assert_eq!(service.archive_policies().await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn stale_running_jobs_are_reconciled_on_start() {
    let root = TempDir::new().unwrap();
    let mut config = LifecycleConfig::default_with_path(root.path());
    config.stale_job_grace_secs = 0;

    // Simulate a crash: a job left `running` in the store.
    let stale_id = {
        let store = Arc::new(FileStore::open(&config.state_dir).await.unwrap());
        let tracker = JobTracker::new(store);
        let job = Job::new(JobKind::Cleanup, "crashed", PathBuf::from("/tmp/data"));
        let id = tracker.create(job).await.unwrap();
        tracker
            .update_status(&id, JobStatus::Running, JobUpdate::default())
            .await
            .unwrap();
        id
    };

    let service = LifecycleService::new(config).await.unwrap();
    // Still queryable as running before reconciliation.
    assert_eq!(
        service.job(&stale_id).await.unwrap().unwrap().status,
        JobStatus::Running
    );

    service.start().await.unwrap();
    let job = service.job(&stale_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.is_some());
    service.stop().await;
}

#[tokio::test]
async fn deleted_jobs_stay_deleted() {
    let root = TempDir::new().unwrap();
    let job_id = {
        let service = common::service(&root).await;
        common::aged_results_fixture(&root);
        let policy_id = service
            .create_retention_policy(common::delete_after_days(30))
            .await
            .unwrap();
        let outcome = service
            .cleanup(CleanupJobSpec::new("ephemeral", policy_id))
            .await
            .unwrap();
        assert!(service.delete_job(&outcome.job_id).await.unwrap());
        outcome.job_id
    };

    let service = common::service(&root).await;
    assert!(service.job(&job_id).await.unwrap().is_none());
}
