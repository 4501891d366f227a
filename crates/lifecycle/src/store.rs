/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Storage backend abstraction for jobs and policies
//!
//! Managers never touch persistence directly; they go through
//! [`JobStore`] and [`PolicyStore`] so the same orchestration code runs
//! against the in-memory adapter (tests), the file adapter (single
//! node), or any database-backed implementation a deployment provides.

use crate::{
    error::{LifecycleError, Result},
    job::Job,
    policy::{ArchivePolicy, RetentionPolicy},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    io::Write,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Persistence for job records
#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Insert a new job; fails when the id already exists
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Insert or replace a job by id
    async fn upsert(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Job>>;

    async fn list(&self) -> Result<Vec<Job>>;

    /// Remove a job, reporting whether it existed
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Persistence for retention and archive policies
#[async_trait]
pub trait PolicyStore: Send + Sync + std::fmt::Debug {
    async fn insert_retention(&self, policy: &RetentionPolicy) -> Result<()>;
    async fn upsert_retention(&self, policy: &RetentionPolicy) -> Result<()>;
    async fn get_retention(&self, id: &str) -> Result<Option<RetentionPolicy>>;
    async fn list_retention(&self) -> Result<Vec<RetentionPolicy>>;
    async fn delete_retention(&self, id: &str) -> Result<bool>;

    async fn insert_archive(&self, policy: &ArchivePolicy) -> Result<()>;
    async fn upsert_archive(&self, policy: &ArchivePolicy) -> Result<()>;
    async fn get_archive(&self, id: &str) -> Result<Option<ArchivePolicy>>;
    async fn list_archive(&self) -> Result<Vec<ArchivePolicy>>;
    async fn delete_archive(&self, id: &str) -> Result<bool>;
}

/// Volatile in-memory adapter, primarily for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<String, Job>>,
    retention: RwLock<HashMap<String, RetentionPolicy>>,
    archive: RwLock<HashMap<String, ArchivePolicy>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(LifecycleError::Storage(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn upsert(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.jobs.write().await.remove(id).is_some())
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn insert_retention(&self, policy: &RetentionPolicy) -> Result<()> {
        let mut retention = self.retention.write().await;
        if retention.contains_key(&policy.id) {
            return Err(LifecycleError::Storage(format!(
                "retention policy {} already exists",
                policy.id
            )));
        }
        retention.insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    async fn upsert_retention(&self, policy: &RetentionPolicy) -> Result<()> {
        self.retention
            .write()
            .await
            .insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    async fn get_retention(&self, id: &str) -> Result<Option<RetentionPolicy>> {
        Ok(self.retention.read().await.get(id).cloned())
    }

    async fn list_retention(&self) -> Result<Vec<RetentionPolicy>> {
        let mut policies: Vec<RetentionPolicy> =
            self.retention.read().await.values().cloned().collect();
        policies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(policies)
    }

    async fn delete_retention(&self, id: &str) -> Result<bool> {
        Ok(self.retention.write().await.remove(id).is_some())
    }

    async fn insert_archive(&self, policy: &ArchivePolicy) -> Result<()> {
        let mut archive = self.archive.write().await;
        if archive.contains_key(&policy.id) {
            return Err(LifecycleError::Storage(format!(
                "archive policy {} already exists",
                policy.id
            )));
        }
        archive.insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    async fn upsert_archive(&self, policy: &ArchivePolicy) -> Result<()> {
        self.archive
            .write()
            .await
            .insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    async fn get_archive(&self, id: &str) -> Result<Option<ArchivePolicy>> {
        Ok(self.archive.read().await.get(id).cloned())
    }

    async fn list_archive(&self) -> Result<Vec<ArchivePolicy>> {
        let mut policies: Vec<ArchivePolicy> =
            self.archive.read().await.values().cloned().collect();
        policies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(policies)
    }

    async fn delete_archive(&self, id: &str) -> Result<bool> {
        Ok(self.archive.write().await.remove(id).is_some())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyDocument {
    retention: BTreeMap<String, RetentionPolicy>,
    archive: BTreeMap<String, ArchivePolicy>,
}

/// File-backed adapter persisting JSON documents under a state
/// directory.
///
/// Jobs and policies live in `jobs.json` and `policies.json`. Every
/// mutation rewrites the affected document through a temp file and an
/// atomic rename, so a crash mid-write leaves the previous state
/// intact and jobs created before the crash remain queryable.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    jobs: RwLock<BTreeMap<String, Job>>,
    policies: RwLock<PolicyDocument>,
}

impl FileStore {
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let jobs = read_document::<BTreeMap<String, Job>>(&dir.join("jobs.json")).await?;
        let policies = read_document::<PolicyDocument>(&dir.join("policies.json")).await?;
        info!(
            dir = %dir.display(),
            jobs = jobs.len(),
            "opened file store"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            jobs: RwLock::new(jobs),
            policies: RwLock::new(policies),
        })
    }

    fn persist<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let data = serde_json::to_vec_pretty(value)?;

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(&data)?;
        temp.persist(&path)
            .map_err(|err| LifecycleError::Storage(format!("persisting {name}: {err}")))?;
        debug!(path = %path.display(), bytes = data.len(), "document persisted");
        Ok(())
    }
}

async fn read_document<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl JobStore for FileStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(LifecycleError::Storage(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        self.persist("jobs.json", &*jobs)
    }

    async fn upsert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job.clone());
        self.persist("jobs.json", &*jobs)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let existed = jobs.remove(id).is_some();
        if existed {
            self.persist("jobs.json", &*jobs)?;
        }
        Ok(existed)
    }
}

#[async_trait]
impl PolicyStore for FileStore {
    async fn insert_retention(&self, policy: &RetentionPolicy) -> Result<()> {
        let mut policies = self.policies.write().await;
        if policies.retention.contains_key(&policy.id) {
            return Err(LifecycleError::Storage(format!(
                "retention policy {} already exists",
                policy.id
            )));
        }
        policies.retention.insert(policy.id.clone(), policy.clone());
        self.persist("policies.json", &*policies)
    }

    async fn upsert_retention(&self, policy: &RetentionPolicy) -> Result<()> {
        let mut policies = self.policies.write().await;
        policies.retention.insert(policy.id.clone(), policy.clone());
        self.persist("policies.json", &*policies)
    }

    async fn get_retention(&self, id: &str) -> Result<Option<RetentionPolicy>> {
        Ok(self.policies.read().await.retention.get(id).cloned())
    }

    async fn list_retention(&self) -> Result<Vec<RetentionPolicy>> {
        Ok(self.policies.read().await.retention.values().cloned().collect())
    }

    async fn delete_retention(&self, id: &str) -> Result<bool> {
        let mut policies = self.policies.write().await;
        let existed = policies.retention.remove(id).is_some();
        if existed {
            self.persist("policies.json", &*policies)?;
        }
        Ok(existed)
    }

    async fn insert_archive(&self, policy: &ArchivePolicy) -> Result<()> {
        let mut policies = self.policies.write().await;
        if policies.archive.contains_key(&policy.id) {
            return Err(LifecycleError::Storage(format!(
                "archive policy {} already exists",
                policy.id
            )));
        }
        policies.archive.insert(policy.id.clone(), policy.clone());
        self.persist("policies.json", &*policies)
    }

    async fn upsert_archive(&self, policy: &ArchivePolicy) -> Result<()> {
        let mut policies = self.policies.write().await;
        policies.archive.insert(policy.id.clone(), policy.clone());
        self.persist("policies.json", &*policies)
    }

    async fn get_archive(&self, id: &str) -> Result<Option<ArchivePolicy>> {
        Ok(self.policies.read().await.archive.get(id).cloned())
    }

    async fn list_archive(&self) -> Result<Vec<ArchivePolicy>> {
        Ok(self.policies.read().await.archive.values().cloned().collect())
    }

    async fn delete_archive(&self, id: &str) -> Result<bool> {
        let mut policies = self.policies.write().await;
        let existed = policies.archive.remove(id).is_some();
        if existed {
            self.persist("policies.json", &*policies)?;
        }
        Ok(existed)
    }
}
