/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! End-to-end scenarios over the service façade

use crate::common;
use lifecycle::{
    ArchiveBuilder, ArchiveJobSpec, ArchiveResult, CleanupJobSpec, CompressionFormat, JobKind,
    JobStatus, LifecycleConfig, LifecycleService,
};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn scenario_a_cleanup_deletes_only_expired_files() {
    let root = TempDir::new().unwrap();
    let service = common::service(&root).await;
    let dir = common::aged_results_fixture(&root);

    let policy_id = service
        .create_retention_policy(common::delete_after_days(30))
        .await
        .unwrap();
    let outcome = service
        .cleanup(CleanupJobSpec::new("expire-results", policy_id))
        .await
        .unwrap();

    assert_eq!(outcome.processed, 2);
    assert!(outcome.freed_bytes > 0);
    assert!(dir.join("ten.json").exists());
    assert!(!dir.join("forty.json").exists());
    assert!(!dir.join("ninety-five.json").exists());
}

#[tokio::test]
async fn scenario_b_archive_bundle_contents_and_integrity() {
    let root = TempDir::new().unwrap();
    let service = common::service(&root).await;
    let source = TempDir::new().unwrap();
    common::write_aged(source.path(), "a.json", &[b'a'; 100], 1);
    common::write_aged(source.path(), "b.json", &[b'b'; 100], 1);
    common::write_aged(source.path(), "c.json", &[b'c'; 100], 1);

    let job_id = service
        .archive(ArchiveJobSpec::new("bundle-all", source.path().to_path_buf()))
        .await
        .unwrap();
    let job = service.job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.original_bytes, 300);

    // Exactly one bundle, readable by a standard tar reader, holding
    // all three entries.
    let bundle = std::fs::read_dir(root.path().join("archive"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let decoder = flate2::read::GzDecoder::new(std::fs::File::open(&bundle).unwrap());
    let mut archive = tar::Archive::new(decoder);
    assert_eq!(archive.entries().unwrap().count(), 3);

    // Deleting one byte from the middle must fail verification.
    let mut bytes = std::fs::read(&bundle).unwrap();
    bytes.remove(bytes.len() / 2);
    std::fs::write(&bundle, &bytes).unwrap();

    let builder = ArchiveBuilder::new(CompressionFormat::Gzip, 6).unwrap();
    let result = ArchiveResult {
        path: bundle,
        original_size: 300,
        compressed_size: bytes.len() as u64,
        compression_ratio: 0.0,
        file_count: 3,
        checksum: String::new(),
    };
    let err = builder.verify(&result).unwrap_err();
    assert!(matches!(err, lifecycle::LifecycleError::Integrity { .. }));
}

#[tokio::test]
async fn scenario_c_dry_run_reports_without_deleting() {
    let root = TempDir::new().unwrap();
    let service = common::service(&root).await;
    let dir = common::aged_results_fixture(&root);

    let policy_id = service
        .create_retention_policy(common::delete_after_days(30))
        .await
        .unwrap();
    let mut spec = CleanupJobSpec::new("preview", policy_id);
    spec.dry_run = true;
    let outcome = service.cleanup(spec).await.unwrap();

    assert_eq!(outcome.processed, 2);
    assert!(outcome.freed_bytes > 0);
    assert!(dir.join("ten.json").exists());
    assert!(dir.join("forty.json").exists());
    assert!(dir.join("ninety-five.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_d_cancelling_a_running_job() {
    let root = TempDir::new().unwrap();
    let service = common::service(&root).await;
    let dir = root.path().join("data/bulk");
    for i in 0..2000 {
        common::write_aged(&dir, &format!("f{i}.dat"), b"xxxx", 60);
    }
    let policy_id = service
        .create_retention_policy(common::delete_after_days(30))
        .await
        .unwrap();

    let svc = service.clone();
    let worker = tokio::spawn(async move {
        svc.cleanup(CleanupJobSpec::new("bulk-expire", policy_id)).await
    });

    // Catch the job mid-batch and cancel it.
    let mut cancelled = false;
    for _ in 0..5000 {
        let jobs = service.jobs().await.unwrap();
        if let Some(job) = jobs
            .iter()
            .find(|j| j.kind == JobKind::Cleanup && j.status == JobStatus::Running)
        {
            if service.cancel_job(&job.id).await.unwrap() {
                cancelled = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(cancelled, "job finished before it could be cancelled");
    worker.await.unwrap().unwrap();

    let job = service
        .jobs()
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.status == JobStatus::Cancelled)
        .unwrap();
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert_eq!(
        job.duration().unwrap(),
        job.completed_at.unwrap() - job.started_at.unwrap()
    );
    // The pass never reached the completion checkpoint.
    assert!(job.progress < 100);
}

#[tokio::test]
async fn archive_job_leaves_originals_when_verification_is_impossible() {
    // An unwritable destination fails the job before any original is
    // removed.
    let root = TempDir::new().unwrap();
    let service = common::service(&root).await;
    let source = TempDir::new().unwrap();
    common::write_aged(source.path(), "keep.json", &[b'k'; 64], 10);

    let mut spec = ArchiveJobSpec::new("bad-dest", source.path().to_path_buf());
    spec.destination = Some(root.path().join("archive/not-a-dir/file.txt/nested"));
    // Make the destination path unusable by shadowing it with a file.
    std::fs::create_dir_all(root.path().join("archive")).unwrap();
    std::fs::write(root.path().join("archive/not-a-dir"), b"file").unwrap();

    let err = service.archive(spec).await.unwrap_err();
    assert!(matches!(err, lifecycle::LifecycleError::Io(_)));

    // The job is recorded as failed and the source file is untouched.
    let jobs = service.jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error.is_some());
    assert!(source.path().join("keep.json").exists());
}

#[tokio::test]
async fn emergency_cleanup_fires_above_the_ceiling() {
    let root = TempDir::new().unwrap();
    let mut config = LifecycleConfig::default_with_path(root.path());
    config.emergency_ceiling_bytes = Some(100);
    let service = LifecycleService::new(config).await.unwrap();

    let dir = root.path().join("data/results");
    common::write_aged(&dir, "fifty.json", &[b'x'; 200], 50);
    common::write_aged(&dir, "ninety-five.json", &[b'y'; 200], 95);
    let policy_id = service
        .create_retention_policy(common::delete_after_days(90))
        .await
        .unwrap();
    // Drop the seeded default so only the 90-day policy runs.
    service
        .delete_retention_policy("default-retention")
        .await
        .unwrap();

    let executed = service.enforce_storage_ceiling().await.unwrap();
    assert_eq!(executed.len(), 1);
    // Halved to 45 days, both files qualify.
    assert!(!dir.join("fifty.json").exists());
    assert!(!dir.join("ninety-five.json").exists());

    // The persisted policy still carries the original threshold.
    let policy = service.retention_policy(&policy_id).await.unwrap().unwrap();
    assert_eq!(
        policy.rules[0].value,
        lifecycle::RuleValue::Number(90)
    );
}

#[tokio::test]
async fn statistics_aggregate_both_managers() {
    let root = TempDir::new().unwrap();
    let service = common::service(&root).await;
    common::aged_results_fixture(&root);
    let source = TempDir::new().unwrap();
    common::write_aged(source.path(), "old.json", &[b'o'; 128], 40);

    let policy_id = service
        .create_retention_policy(common::delete_after_days(30))
        .await
        .unwrap();
    service
        .cleanup(CleanupJobSpec::new("expire", policy_id))
        .await
        .unwrap();
    service
        .archive(ArchiveJobSpec::new("bundle", source.path().to_path_buf()))
        .await
        .unwrap();

    let stats = service.statistics().await.unwrap();
    assert_eq!(stats.total_jobs, 2);
    assert_eq!(stats.cleanup.completed, 1);
    assert_eq!(stats.archive.completed, 1);
    assert!(stats.total_reclaimed_bytes > 0);
    assert_eq!(stats.cleanup.success_rate, 100.0);
}

#[tokio::test]
async fn scheduler_fires_registered_policies_without_waiting() {
    let root = TempDir::new().unwrap();
    let service = common::service(&root).await;
    common::aged_results_fixture(&root);
    service.start().await.unwrap();

    // Fire the seeded retention pass directly instead of waiting for
    // its cron schedule.
    service.scheduler().fire("retention-cleanup").await.unwrap();

    let jobs = service.jobs().await.unwrap();
    let cleanup_jobs: Vec<_> = jobs
        .iter()
        .filter(|j| j.kind == JobKind::Cleanup)
        .collect();
    assert_eq!(cleanup_jobs.len(), 1);
    assert_eq!(cleanup_jobs[0].status, JobStatus::Completed);
    // The seeded default deletes >90d and archives >30d.
    assert!(cleanup_jobs[0].processed_items >= 1);

    service.stop().await;
}
