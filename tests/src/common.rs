/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Shared fixtures for the integration suite

use lifecycle::{
    CleanupRule, LifecycleAction, LifecycleConfig, LifecycleService, RetentionPolicy, RuleField,
    RuleOperator, RuleValue,
};
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tempfile::TempDir;

/// Write a file and backdate its modification time by `age_days`
pub fn write_aged(dir: &Path, name: &str, content: &[u8], age_days: u64) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    let mtime = SystemTime::now() - Duration::from_secs(age_days * 86_400);
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(mtime).unwrap();
    path
}

/// Service rooted at a fresh temp dir
pub async fn service(root: &TempDir) -> LifecycleService {
    let config = LifecycleConfig::default_with_path(root.path());
    LifecycleService::new(config).await.unwrap()
}

/// The canonical aged fixture: three 100-byte files aged 10, 40, and
/// 95 days under `<data_root>/results`
pub fn aged_results_fixture(root: &TempDir) -> PathBuf {
    let dir = root.path().join("data/results");
    write_aged(&dir, "ten.json", &[b'a'; 100], 10);
    write_aged(&dir, "forty.json", &[b'b'; 100], 40);
    write_aged(&dir, "ninety-five.json", &[b'c'; 100], 95);
    dir
}

/// A retention policy deleting items older than `days`
pub fn delete_after_days(days: i64) -> RetentionPolicy {
    RetentionPolicy::new(
        format!("delete-after-{days}d"),
        vec![CleanupRule::new(
            RuleField::AgeDays,
            RuleOperator::GreaterThan,
            RuleValue::Number(days),
            LifecycleAction::Delete,
            10,
        )],
    )
}
