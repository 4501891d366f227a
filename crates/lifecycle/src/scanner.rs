/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Filesystem scanning for managed data
//!
//! Scans produce [`StorageItem`] values with size and age metadata.
//! Items are derived per scan and never persisted; entries that cannot
//! be stat'd are skipped so a permission error on one file does not
//! abort lifecycle management for the rest of the tree.

use crate::error::{LifecycleError, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A scanned file with the metadata rule evaluation needs
#[derive(Debug, Clone, PartialEq)]
pub struct StorageItem {
    pub path: PathBuf,
    /// Logical data type the item belongs to.
    pub data_type: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Walks data-type storage roots into [`StorageItem`] lists
#[derive(Debug, Clone, Copy, Default)]
pub struct FileScanner;

impl FileScanner {
    pub fn new() -> Self {
        Self
    }

    /// Recursively scan a data-type root.
    ///
    /// Fails with `SourceNotFound` when the root itself is missing;
    /// unreadable entries below it are skipped with a debug log since a
    /// partial result is preferable to aborting the whole scan.
    pub fn scan(&self, root: &Path, data_type: &str) -> Result<Vec<StorageItem>> {
        if !root.is_dir() {
            return Err(LifecycleError::SourceNotFound(root.to_path_buf()));
        }

        let mut items = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(root = %root.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = %entry.path().display(), error = %err, "skipping unstatable entry");
                    continue;
                }
            };
            let modified = match metadata.modified() {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(err) => {
                    debug!(path = %entry.path().display(), error = %err, "skipping entry without mtime");
                    continue;
                }
            };
            items.push(StorageItem {
                path: entry.path().to_path_buf(),
                data_type: data_type.to_string(),
                size: metadata.len(),
                modified,
            });
        }
        Ok(items)
    }

    /// Scan every immediate subdirectory of the data root, labelling
    /// items with the subdirectory name as their data type. Files
    /// sitting directly in the root are labelled `default`.
    pub fn scan_root(&self, root: &Path) -> Result<Vec<StorageItem>> {
        if !root.is_dir() {
            return Err(LifecycleError::SourceNotFound(root.to_path_buf()));
        }

        let mut items = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(root = %root.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            if path.is_dir() {
                let data_type = entry.file_name().to_string_lossy().into_owned();
                items.extend(self.scan(&path, &data_type)?);
            } else if let Ok(metadata) = entry.metadata() {
                if let Ok(modified) = metadata.modified() {
                    items.push(StorageItem {
                        path,
                        data_type: "default".to_string(),
                        size: metadata.len(),
                        modified: DateTime::<Utc>::from(modified),
                    });
                }
            }
        }
        Ok(items)
    }

    /// Total size of a set of scanned items
    pub fn total_size(items: &[StorageItem]) -> u64 {
        items.iter().map(|item| item.size).sum()
    }

    /// Keep items strictly older than `threshold_days` as of `now`.
    ///
    /// A threshold of zero or below disables filtering and returns all
    /// items, which is how "archive everything now" operations are
    /// expressed.
    pub fn filter_by_age(
        items: Vec<StorageItem>,
        threshold_days: i64,
        now: DateTime<Utc>,
    ) -> Vec<StorageItem> {
        if threshold_days <= 0 {
            return items;
        }
        let threshold = Duration::days(threshold_days);
        items
            .into_iter()
            .filter(|item| now.signed_duration_since(item.modified) > threshold)
            .collect()
    }
}
