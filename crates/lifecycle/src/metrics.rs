/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Derived lifecycle statistics
//!
//! Statistics are computed by folding over the job collection and are
//! never stored independently of jobs, so they cannot drift from the
//! records they summarize.

use crate::job::{Job, JobKind, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Aggregate statistics over one manager's jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_original_bytes: u64,
    pub total_reclaimed_bytes: u64,
    /// Mean compression ratio over completed jobs that processed data.
    pub average_compression_ratio: f64,
    /// Completed share of finished jobs, as a percentage.
    pub success_rate: f64,
    pub last_completed: Option<DateTime<Utc>>,
    /// Job counts per originating policy id.
    pub jobs_by_policy: HashMap<String, u64>,
}

impl JobStats {
    /// Fold a job collection into aggregate statistics
    pub fn compute<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut stats = JobStats::default();
        let mut ratio_sum = 0.0;
        let mut ratio_count = 0u64;

        for job in jobs {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_original_bytes += job.original_bytes;
            stats.total_reclaimed_bytes += job.reclaimed_bytes;

            if job.status == JobStatus::Completed && job.original_bytes > 0 {
                ratio_sum += job.compression_ratio;
                ratio_count += 1;
            }
            if job.status == JobStatus::Completed {
                stats.last_completed = match (stats.last_completed, job.completed_at) {
                    (Some(current), Some(candidate)) => Some(current.max(candidate)),
                    (None, candidate) => candidate,
                    (current, None) => current,
                };
            }
            if let Some(policy_id) = &job.policy_id {
                *stats.jobs_by_policy.entry(policy_id.clone()).or_insert(0) += 1;
            }
        }

        if ratio_count > 0 {
            stats.average_compression_ratio = ratio_sum / ratio_count as f64;
        }
        let finished = stats.completed + stats.failed + stats.cancelled;
        if finished > 0 {
            stats.success_rate = stats.completed as f64 / finished as f64 * 100.0;
        }
        stats
    }
}

/// Combined statistics across both managers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub archive: JobStats,
    pub cleanup: JobStats,
    pub total_jobs: u64,
    pub total_reclaimed_bytes: u64,
}

impl LifecycleStats {
    pub fn compute(jobs: &[Job]) -> Self {
        let archive = JobStats::compute(jobs.iter().filter(|j| j.kind == JobKind::Archive));
        let cleanup = JobStats::compute(jobs.iter().filter(|j| j.kind == JobKind::Cleanup));
        Self {
            total_jobs: archive.total + cleanup.total,
            total_reclaimed_bytes: archive.total_reclaimed_bytes
                + cleanup.total_reclaimed_bytes,
            archive,
            cleanup,
        }
    }
}
