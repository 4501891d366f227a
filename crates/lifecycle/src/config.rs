/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Configuration for the lifecycle management core

use crate::bundle::CompressionFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the lifecycle management core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Root directory holding managed data, one subdirectory per
    /// logical data type.
    pub data_root: PathBuf,
    /// Directory archive bundles are written to.
    pub archive_dir: PathBuf,
    /// Directory for persisted jobs and policies.
    pub state_dir: PathBuf,
    /// Bundle compression format. Only gzip is supported; other
    /// formats are rejected when a builder is constructed.
    pub compression: CompressionFormat,
    /// Gzip compression level (0-9).
    pub compression_level: u32,
    /// Re-read bundles after writing and compare entry counts.
    pub verify_archives: bool,
    /// Running jobs older than this are reconciled to failed on startup.
    pub stale_job_grace_secs: u64,
    /// Cron expression (with seconds field) for the scheduled
    /// retention cleanup pass.
    pub cleanup_schedule: String,
    /// How often the scheduler loop checks for due triggers.
    pub scheduler_tick_secs: u64,
    /// How often global storage usage is checked against the ceiling.
    pub pressure_check_secs: u64,
    /// Storage usage above this triggers an emergency cleanup pass.
    /// `None` disables the pressure monitor.
    pub emergency_ceiling_bytes: Option<u64>,
}

impl LifecycleConfig {
    /// Create a default configuration rooted at the specified path
    pub fn default_with_path(path: &Path) -> Self {
        Self {
            data_root: path.join("data"),
            archive_dir: path.join("archive"),
            state_dir: path.join("state"),
            ..Self::default()
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            data_root: "/var/lib/datakeeper/data".into(),
            archive_dir: "/var/lib/datakeeper/archive".into(),
            state_dir: "/var/lib/datakeeper/state".into(),
            compression: CompressionFormat::Gzip,
            compression_level: 6,
            verify_archives: true,
            stale_job_grace_secs: 6 * 3600,
            cleanup_schedule: "0 0 3 * * *".to_string(),
            scheduler_tick_secs: 30,
            pressure_check_secs: 3600,
            emergency_ceiling_bytes: None,
        }
    }
}
