/*
 * SPDX-FileCopyrightText: 2024 DataKeeper Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Cron-driven trigger scheduling
//!
//! Each enabled policy registers a cron expression and a trigger
//! function. The scheduler owns explicit handles instead of ambient
//! timers: triggers can be fired directly (`fire`) or evaluated
//! against an explicit clock (`run_due`), so tests never wait for real
//! time to pass. Expressions are validated up front; an invalid
//! expression leaves the policy unscheduled rather than silently
//! dropped.

use crate::{
    error::{LifecycleError, Result},
    policy::validate_schedule,
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::Mutex, sync::RwLock, task::JoinHandle};
use tracing::{debug, info, warn};

/// Future returned by a trigger invocation
pub type TriggerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Trigger function invoked when a schedule comes due
pub type Trigger = Arc<dyn Fn() -> TriggerFuture + Send + Sync>;

struct ScheduleEntry {
    expr: String,
    schedule: Schedule,
    trigger: Trigger,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
}

/// Point-in-time scheduler state
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_schedules: usize,
    pub next_trigger: Option<DateTime<Utc>>,
}

/// Registers cron triggers per policy and drives them from a
/// background loop
pub struct Scheduler {
    entries: Arc<RwLock<HashMap<String, ScheduleEntry>>>,
    running: Arc<AtomicBool>,
    tick: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("tick", &self.tick)
            .finish()
    }
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            tick,
            handle: Mutex::new(None),
        }
    }

    /// Register a trigger under a policy id.
    ///
    /// Fails with `InvalidSchedule` on a malformed expression and
    /// registers nothing. Re-registering a policy id replaces its
    /// previous entry.
    pub async fn schedule(&self, policy_id: &str, expr: &str, trigger: Trigger) -> Result<()> {
        let schedule = validate_schedule(expr)?;
        let next_run = schedule.upcoming(Utc).next();

        self.entries.write().await.insert(
            policy_id.to_string(),
            ScheduleEntry {
                expr: expr.to_string(),
                schedule,
                trigger,
                next_run,
                last_run: None,
            },
        );
        debug!(policy_id, expr, next = ?next_run, "schedule registered");
        Ok(())
    }

    /// Remove a policy's trigger, reporting whether one was registered
    pub async fn unschedule(&self, policy_id: &str) -> bool {
        let removed = self.entries.write().await.remove(policy_id).is_some();
        if removed {
            debug!(policy_id, "schedule removed");
        }
        removed
    }

    /// Replace the cron expression of an existing entry, keeping its
    /// trigger
    pub async fn reschedule(&self, policy_id: &str, expr: &str) -> Result<()> {
        let schedule = validate_schedule(expr)?;
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(policy_id)
            .ok_or_else(|| LifecycleError::NotFound(format!("schedule {policy_id}")))?;
        entry.expr = expr.to_string();
        entry.next_run = schedule.upcoming(Utc).next();
        entry.schedule = schedule;
        Ok(())
    }

    /// Invoke a registered trigger immediately, bypassing its cron
    /// schedule. This is the test seam: no real time needs to pass.
    pub async fn fire(&self, policy_id: &str) -> Result<()> {
        let trigger = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(policy_id)
                .ok_or_else(|| LifecycleError::NotFound(format!("schedule {policy_id}")))?;
            entry.trigger.clone()
        };
        trigger().await;

        let now = Utc::now();
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(policy_id) {
            entry.last_run = Some(now);
            entry.next_run = entry.schedule.after(&now).next();
        }
        Ok(())
    }

    /// Fire every trigger due at `now`, returning how many ran
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        Self::run_due_inner(&self.entries, now).await
    }

    async fn run_due_inner(
        entries: &RwLock<HashMap<String, ScheduleEntry>>,
        now: DateTime<Utc>,
    ) -> usize {
        let due: Vec<(String, Trigger)> = {
            let entries = entries.read().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.next_run.is_some_and(|next| next <= now))
                .map(|(id, entry)| (id.clone(), entry.trigger.clone()))
                .collect()
        };

        for (policy_id, trigger) in &due {
            debug!(policy_id, "firing scheduled trigger");
            trigger().await;

            let mut entries = entries.write().await;
            if let Some(entry) = entries.get_mut(policy_id) {
                entry.last_run = Some(now);
                entry.next_run = entry.schedule.after(&now).next();
            }
        }
        due.len()
    }

    /// Start the background loop checking for due triggers
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler is already running");
            return;
        }
        info!(tick = ?self.tick, "starting scheduler");

        let entries = self.entries.clone();
        let running = self.running.clone();
        let tick = self.tick;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                Self::run_due_inner(&entries, Utc::now()).await;
            }
        });
        *self.handle.lock().await = Some(task);
    }

    /// Stop the background loop; registered entries are kept
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    pub async fn status(&self) -> SchedulerStatus {
        let entries = self.entries.read().await;
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            total_schedules: entries.len(),
            next_trigger: entries.values().filter_map(|entry| entry.next_run).min(),
        }
    }
}
