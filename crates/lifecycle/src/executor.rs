/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Lifecycle action execution
//!
//! Applies a single action to a batch of stale items. Items are
//! processed independently; one failure is recorded and the rest of
//! the batch continues, since a cleanup pass over thousands of files
//! must survive individual permission errors. In dry-run mode no
//! filesystem mutation happens but `size_freed` is still computed so
//! dry-run reports stay meaningful.

use crate::{
    bundle::{ArchiveBuilder, CompressionFormat},
    config::LifecycleConfig,
    error::{LifecycleError, Result},
    scanner::StorageItem,
};
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, info, warn};

/// Action applied to items selected by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    /// Remove the item permanently.
    Delete,
    /// Bundle the item and remove the original.
    Archive,
    /// Gzip the item in place with a `.gz` suffix.
    Compress,
    /// Relocate the item to a target directory.
    Move,
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleAction::Delete => f.write_str("delete"),
            LifecycleAction::Archive => f.write_str("archive"),
            LifecycleAction::Compress => f.write_str("compress"),
            LifecycleAction::Move => f.write_str("move"),
        }
    }
}

/// Parameters carried by a rule's action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionParams {
    /// Target directory for `Archive` bundles and `Move` relocations.
    /// Archives fall back to the configured archive directory.
    pub destination: Option<PathBuf>,
    pub format: CompressionFormat,
    pub level: u32,
}

impl Default for ActionParams {
    fn default() -> Self {
        Self {
            destination: None,
            format: CompressionFormat::Gzip,
            level: 6,
        }
    }
}

/// Outcome of applying one action to a batch
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub processed: usize,
    pub size_freed: u64,
    pub errors: Vec<String>,
    /// Set when a cancellation flag stopped the batch early.
    pub cancelled: bool,
}

/// Applies lifecycle actions to batches of items
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    archive_dir: PathBuf,
}

impl ActionExecutor {
    pub fn new(config: &LifecycleConfig) -> Self {
        Self {
            archive_dir: config.archive_dir.clone(),
        }
    }

    /// Apply `action` to every item, accumulating per-item failures.
    ///
    /// The cancellation flag is checked between items; an in-flight
    /// single-item operation always completes before cancellation is
    /// observed.
    pub async fn apply(
        &self,
        action: LifecycleAction,
        items: &[StorageItem],
        params: &ActionParams,
        dry_run: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<ActionOutcome> {
        if action == LifecycleAction::Move && params.destination.is_none() {
            return Err(LifecycleError::Storage(
                "move action requires a destination".to_string(),
            ));
        }

        let mut outcome = ActionOutcome::default();
        debug!(action = %action, items = items.len(), dry_run, "applying action");

        if action == LifecycleAction::Archive {
            return self.apply_archive(items, params, dry_run, cancel).await;
        }

        for item in items {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                outcome.cancelled = true;
                break;
            }
            if dry_run {
                outcome.processed += 1;
                outcome.size_freed += item.size;
                continue;
            }
            let result = match action {
                LifecycleAction::Delete => self.delete_item(item).await,
                LifecycleAction::Compress => self.compress_item(item, params).await,
                LifecycleAction::Move => {
                    // Presence checked above.
                    let destination = params.destination.as_deref().unwrap_or(&self.archive_dir);
                    self.move_item(item, destination).await
                }
                LifecycleAction::Archive => unreachable!("archive handled above"),
            };
            match result {
                Ok(freed) => {
                    outcome.processed += 1;
                    outcome.size_freed += freed;
                }
                Err(err) => {
                    warn!(path = %item.path.display(), error = %err, "action failed for item");
                    outcome
                        .errors
                        .push(format!("{}: {}", item.path.display(), err));
                }
            }
        }
        Ok(outcome)
    }

    /// Bundle the whole batch, then remove the originals.
    ///
    /// Originals are only removed after the bundle verifies, so a bad
    /// write can never lose data.
    async fn apply_archive(
        &self,
        items: &[StorageItem],
        params: &ActionParams,
        dry_run: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<ActionOutcome> {
        let mut outcome = ActionOutcome::default();
        if items.is_empty() {
            return Ok(outcome);
        }

        if dry_run {
            outcome.processed = items.len();
            outcome.size_freed = items.iter().map(|item| item.size).sum();
            return Ok(outcome);
        }

        let destination = params.destination.as_deref().unwrap_or(&self.archive_dir);
        let source_root = common_root(items);
        let builder = ArchiveBuilder::new(params.format, params.level)?;
        let result = match builder.build(&source_root, items, destination, "rule") {
            Ok(result) => result,
            Err(err) => {
                outcome.errors.push(format!("bundle failed: {err}"));
                return Ok(outcome);
            }
        };
        if let Err(err) = builder.verify(&result) {
            // Keep the originals; a broken bundle must not lose data.
            outcome.errors.push(format!("bundle verify failed: {err}"));
            return Ok(outcome);
        }

        for item in items {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                outcome.cancelled = true;
                break;
            }
            match self.delete_item(item).await {
                Ok(freed) => {
                    outcome.processed += 1;
                    outcome.size_freed += freed;
                }
                Err(err) => {
                    warn!(path = %item.path.display(), error = %err, "removing archived original failed");
                    outcome
                        .errors
                        .push(format!("{}: {}", item.path.display(), err));
                }
            }
        }
        info!(
            bundle = %result.path.display(),
            processed = outcome.processed,
            "batch archived"
        );
        Ok(outcome)
    }

    async fn delete_item(&self, item: &StorageItem) -> Result<u64> {
        tokio::fs::remove_file(&item.path).await?;
        Ok(item.size)
    }

    /// Gzip the file next to itself and remove the uncompressed original
    async fn compress_item(&self, item: &StorageItem, params: &ActionParams) -> Result<u64> {
        if params.format != CompressionFormat::Gzip {
            return Err(LifecycleError::UnsupportedFormat(params.format.to_string()));
        }
        let target = gz_path(&item.path);
        let data = tokio::fs::read(&item.path).await?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(params.level.min(9)));
        encoder.write_all(&data)?;
        let compressed = encoder.finish()?;
        let compressed_size = compressed.len() as u64;

        tokio::fs::write(&target, compressed).await?;
        tokio::fs::remove_file(&item.path).await?;
        Ok(item.size.saturating_sub(compressed_size))
    }

    /// Relocate the item, creating intermediate directories as needed
    async fn move_item(&self, item: &StorageItem, destination: &Path) -> Result<u64> {
        let file_name = item
            .path
            .file_name()
            .ok_or_else(|| LifecycleError::SourceNotFound(item.path.clone()))?;
        let target = destination.join(file_name);
        tokio::fs::create_dir_all(destination).await?;

        if tokio::fs::rename(&item.path, &target).await.is_err() {
            // Rename fails across filesystems; fall back to copy+remove.
            tokio::fs::copy(&item.path, &target).await?;
            tokio::fs::remove_file(&item.path).await?;
        }
        Ok(item.size)
    }
}

/// Deepest directory containing every item, used to root rule bundles
fn common_root(items: &[StorageItem]) -> PathBuf {
    let mut root: Option<PathBuf> = None;
    for item in items {
        let parent = item.path.parent().unwrap_or(Path::new("/")).to_path_buf();
        root = Some(match root {
            None => parent,
            Some(current) => {
                let mut ancestor = current.clone();
                while !parent.starts_with(&ancestor) {
                    match ancestor.parent() {
                        Some(p) => ancestor = p.to_path_buf(),
                        None => break,
                    }
                }
                ancestor
            }
        });
    }
    root.unwrap_or_else(|| PathBuf::from("/"))
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}
