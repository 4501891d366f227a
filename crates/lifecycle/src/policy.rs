/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Retention and archive policies
//!
//! A retention policy is an ordered rule set; rules are evaluated in
//! ascending priority and the first matching enabled rule decides the
//! action for an item. Archive policies carry a cron schedule and a
//! short list of age-threshold rules. [`PolicyRegistry`] owns policy
//! lifecycle on top of a [`PolicyStore`] backend and seeds a default
//! set exactly once, when the store holds no policies at all.

use crate::{
    error::{LifecycleError, Result},
    executor::{ActionParams, LifecycleAction},
    scanner::StorageItem,
    store::PolicyStore,
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, info};

/// Item attribute a rule condition tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    /// Age of the item in days.
    AgeDays,
    /// Size of the item in bytes.
    SizeBytes,
    /// File name of the item.
    FileName,
    /// One-based recency rank of the item within its data type; rank 1
    /// is the newest item. Lets a rule keep the N newest items and act
    /// on the rest.
    Count,
}

/// Comparison applied between the field and the rule value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    GreaterThan,
    LessThan,
    Equals,
    Contains,
}

/// Rule comparison value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Number(i64),
    Text(String),
}

impl RuleValue {
    fn as_number(&self) -> Option<i64> {
        match self {
            RuleValue::Number(n) => Some(*n),
            RuleValue::Text(_) => None,
        }
    }
}

/// A single condition/action pair within a retention policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRule {
    pub id: String,
    pub field: RuleField,
    pub operator: RuleOperator,
    pub value: RuleValue,
    pub action: LifecycleAction,
    #[serde(default)]
    pub params: ActionParams,
    /// Rules are evaluated in ascending priority order.
    pub priority: i32,
    pub enabled: bool,
}

impl CleanupRule {
    pub fn new(
        field: RuleField,
        operator: RuleOperator,
        value: RuleValue,
        action: LifecycleAction,
        priority: i32,
    ) -> Self {
        Self {
            id: generate_id("rule"),
            field,
            operator,
            value,
            action,
            params: ActionParams::default(),
            priority,
            enabled: true,
        }
    }

    /// Whether the rule condition holds for an item.
    ///
    /// `recency_rank` is the item's one-based rank by modification time
    /// within its data type (1 = newest), used only by `Count` rules.
    pub fn matches(&self, item: &StorageItem, now: DateTime<Utc>, recency_rank: usize) -> bool {
        let actual = match self.field {
            RuleField::AgeDays => now.signed_duration_since(item.modified).num_days(),
            RuleField::SizeBytes => item.size as i64,
            RuleField::Count => recency_rank as i64,
            RuleField::FileName => {
                let name = item
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return match (&self.operator, &self.value) {
                    (RuleOperator::Equals, RuleValue::Text(text)) => name == *text,
                    (RuleOperator::Contains, RuleValue::Text(text)) => name.contains(text),
                    _ => false,
                };
            }
        };
        let Some(expected) = self.value.as_number() else {
            return false;
        };
        match self.operator {
            RuleOperator::GreaterThan => actual > expected,
            RuleOperator::LessThan => actual < expected,
            RuleOperator::Equals => actual == expected,
            RuleOperator::Contains => false,
        }
    }

    /// Copy of the rule with its numeric threshold halved, used by
    /// emergency cleanup passes
    fn halved(&self) -> Self {
        let mut rule = self.clone();
        if let RuleValue::Number(n) = rule.value {
            rule.value = RuleValue::Number(n / 2);
        }
        rule
    }
}

/// Rule set applied by cleanup runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Logical data types the policy applies to; empty means all.
    pub data_types: Vec<String>,
    pub rules: Vec<CleanupRule>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetentionPolicy {
    pub fn new(name: impl Into<String>, rules: Vec<CleanupRule>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("policy"),
            name: name.into(),
            description: String::new(),
            data_types: Vec::new(),
            rules,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn applies_to(&self, data_type: &str) -> bool {
        self.data_types.is_empty() || self.data_types.iter().any(|t| t == data_type)
    }

    /// First matching enabled rule in ascending priority order
    pub fn match_rule(
        &self,
        item: &StorageItem,
        now: DateTime<Utc>,
        recency_rank: usize,
    ) -> Option<&CleanupRule> {
        let mut rules: Vec<&CleanupRule> = self.rules.iter().filter(|r| r.enabled).collect();
        rules.sort_by_key(|r| r.priority);
        rules
            .into_iter()
            .find(|rule| rule.matches(item, now, recency_rank))
    }

    /// In-memory copy with every numeric rule threshold halved.
    ///
    /// Emergency cleanup evaluates against this copy; the persisted
    /// policy is never mutated, so original thresholds survive even a
    /// failing emergency pass.
    pub fn halved(&self) -> Self {
        let mut policy = self.clone();
        policy.rules = self.rules.iter().map(CleanupRule::halved).collect();
        policy
    }
}

/// Action taken by an archive policy rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveRuleAction {
    Archive,
    Delete,
    Compress,
}

impl From<ArchiveRuleAction> for LifecycleAction {
    fn from(action: ArchiveRuleAction) -> Self {
        match action {
            ArchiveRuleAction::Archive => LifecycleAction::Archive,
            ArchiveRuleAction::Delete => LifecycleAction::Delete,
            ArchiveRuleAction::Compress => LifecycleAction::Compress,
        }
    }
}

/// Simple age-threshold rule within an archive policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRule {
    pub max_age_days: i64,
    pub action: ArchiveRuleAction,
}

/// Scheduled archival policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivePolicy {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Rules applied in order on each scheduled run.
    pub rules: Vec<ArchiveRule>,
    /// Cron expression with a seconds field, e.g. `0 0 2 * * *`.
    pub schedule: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArchivePolicy {
    pub fn new(name: impl Into<String>, rules: Vec<ArchiveRule>, schedule: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("policy"),
            name: name.into(),
            description: String::new(),
            rules,
            schedule: schedule.into(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// A policy may only be enabled with a parseable schedule
    pub fn validate(&self) -> Result<()> {
        if self.enabled {
            validate_schedule(&self.schedule)?;
        }
        Ok(())
    }
}

/// Parse a cron expression, mapping failures to `InvalidSchedule`
pub fn validate_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr).map_err(|err| LifecycleError::InvalidSchedule {
        expr: expr.to_string(),
        reason: err.to_string(),
    })
}

fn generate_id(prefix: &str) -> String {
    format!(
        "{}_{}_{:06x}",
        prefix,
        Utc::now().format("%Y%m%d_%H%M%S%3f"),
        rand::random::<u32>() & 0xff_ffff
    )
}

/// Partial update for a retention policy
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicyUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub data_types: Option<Vec<String>>,
    pub rules: Option<Vec<CleanupRule>>,
    pub enabled: Option<bool>,
}

/// Partial update for an archive policy
#[derive(Debug, Clone, Default)]
pub struct ArchivePolicyUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub rules: Option<Vec<ArchiveRule>>,
    pub schedule: Option<String>,
    pub enabled: Option<bool>,
}

/// Owns policy lifecycle over a storage backend
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    store: Arc<dyn PolicyStore>,
}

impl PolicyRegistry {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Seed the default policies when the store is completely empty.
    ///
    /// Idempotent across restarts: a store holding any policy at all,
    /// including previously-seeded defaults, is left untouched.
    pub async fn seed_defaults(&self) -> Result<usize> {
        if !self.store.list_retention().await?.is_empty()
            || !self.store.list_archive().await?.is_empty()
        {
            return Ok(0);
        }

        let mut purge = CleanupRule::new(
            RuleField::AgeDays,
            RuleOperator::GreaterThan,
            RuleValue::Number(90),
            LifecycleAction::Delete,
            10,
        );
        purge.id = "rule-purge-90d".to_string();
        let mut archive = CleanupRule::new(
            RuleField::AgeDays,
            RuleOperator::GreaterThan,
            RuleValue::Number(30),
            LifecycleAction::Archive,
            20,
        );
        archive.id = "rule-archive-30d".to_string();

        let mut retention = RetentionPolicy::new("default-retention", vec![purge, archive]);
        retention.id = "default-retention".to_string();
        retention.description =
            "Archive data older than 30 days, delete data older than 90 days".to_string();
        self.store.upsert_retention(&retention).await?;

        let mut archive_policy = ArchivePolicy::new(
            "default-archive",
            vec![ArchiveRule {
                max_age_days: 30,
                action: ArchiveRuleAction::Archive,
            }],
            "0 0 2 * * *",
        );
        archive_policy.id = "default-archive".to_string();
        archive_policy.description = "Nightly archival of data older than 30 days".to_string();
        self.store.upsert_archive(&archive_policy).await?;

        info!("seeded default lifecycle policies");
        Ok(2)
    }

    pub async fn create_retention(&self, policy: RetentionPolicy) -> Result<String> {
        let id = policy.id.clone();
        self.store.insert_retention(&policy).await?;
        debug!(policy_id = %id, "retention policy created");
        Ok(id)
    }

    pub async fn get_retention(&self, id: &str) -> Result<Option<RetentionPolicy>> {
        self.store.get_retention(id).await
    }

    pub async fn list_retention(&self) -> Result<Vec<RetentionPolicy>> {
        self.store.list_retention().await
    }

    pub async fn update_retention(
        &self,
        id: &str,
        update: RetentionPolicyUpdate,
    ) -> Result<RetentionPolicy> {
        let mut policy = self
            .store
            .get_retention(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("retention policy {id}")))?;

        if let Some(name) = update.name {
            policy.name = name;
        }
        if let Some(description) = update.description {
            policy.description = description;
        }
        if let Some(data_types) = update.data_types {
            policy.data_types = data_types;
        }
        if let Some(rules) = update.rules {
            policy.rules = rules;
        }
        if let Some(enabled) = update.enabled {
            policy.enabled = enabled;
        }
        policy.updated_at = Utc::now();
        self.store.upsert_retention(&policy).await?;
        Ok(policy)
    }

    pub async fn delete_retention(&self, id: &str) -> Result<bool> {
        self.store.delete_retention(id).await
    }

    pub async fn create_archive(&self, policy: ArchivePolicy) -> Result<String> {
        policy.validate()?;
        let id = policy.id.clone();
        self.store.insert_archive(&policy).await?;
        debug!(policy_id = %id, "archive policy created");
        Ok(id)
    }

    pub async fn get_archive(&self, id: &str) -> Result<Option<ArchivePolicy>> {
        self.store.get_archive(id).await
    }

    pub async fn list_archive(&self) -> Result<Vec<ArchivePolicy>> {
        self.store.list_archive().await
    }

    pub async fn update_archive(
        &self,
        id: &str,
        update: ArchivePolicyUpdate,
    ) -> Result<ArchivePolicy> {
        let mut policy = self
            .store
            .get_archive(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("archive policy {id}")))?;

        if let Some(name) = update.name {
            policy.name = name;
        }
        if let Some(description) = update.description {
            policy.description = description;
        }
        if let Some(rules) = update.rules {
            policy.rules = rules;
        }
        if let Some(schedule) = update.schedule {
            policy.schedule = schedule;
        }
        if let Some(enabled) = update.enabled {
            policy.enabled = enabled;
        }
        // The updated policy must still satisfy the schedule invariant.
        policy.validate()?;
        policy.updated_at = Utc::now();
        self.store.upsert_archive(&policy).await?;
        Ok(policy)
    }

    pub async fn delete_archive(&self, id: &str) -> Result<bool> {
        self.store.delete_archive(id).await
    }
}
