//! Runner registry — the controller's authoritative view of its own fleet.
//!
//! Every mutation goes through [`Registry`], which keeps names unique and
//! only lets status move forward along the lifecycle. The one backward
//! edge is [`Registry::record_timeout`], which returns a silent runner to
//! `ready` once it has missed enough scrapes.
//!
//! Garbage collection is the pure [`sweep`] function; the registry applies
//! its verdicts in [`Registry::sweep`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::sync::RwLock;
use tracing::{debug, info};

use fleet_state::{MetricSample, RunnerStatus};

/// Address a runner reports until its task has one.
pub const PLACEHOLDER_ADDRESS: &str = "0.0.0.0";

/// Random alphanumeric suffix, e.g. the `abc123` in `linux-abc123`.
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// One runner as tracked by this controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Runner {
    pub name: String,
    pub status: RunnerStatus,
    pub private_address: String,
    pub metrics: Option<MetricSample>,
    /// When the current status was entered (epoch seconds).
    pub updated_at: u64,
    /// Consecutive scrape timeouts since the last successful scrape.
    pub missed_scrapes: u32,
}

impl Runner {
    pub fn new(name: impl Into<String>, now: u64) -> Self {
        Self {
            name: name.into(),
            status: RunnerStatus::Creating,
            private_address: PLACEHOLDER_ADDRESS.to_string(),
            metrics: None,
            updated_at: now,
            missed_scrapes: 0,
        }
    }

    /// Whether the runner has an address worth scraping.
    pub fn has_address(&self) -> bool {
        !self.private_address.is_empty() && self.private_address != PLACEHOLDER_ADDRESS
    }

    fn enter(&mut self, status: RunnerStatus, now: u64) {
        self.status = status;
        self.updated_at = now;
        self.missed_scrapes = 0;
        if status.is_terminal() {
            self.metrics = None;
        }
    }
}

/// Age limits driving garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// `finished`/`failed` → `terminated`.
    pub deregister: Duration,
    /// `terminated` → removed.
    pub delete: Duration,
    /// `creating` → `failed`.
    pub provisioning: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            deregister: Duration::from_secs(60),
            delete: Duration::from_secs(120),
            provisioning: Duration::from_secs(300),
        }
    }
}

/// GC verdict for one runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    Keep,
    Transition(RunnerStatus),
    Remove,
}

/// Decide what garbage collection does to `runner` at `now`.
///
/// One step per call: a finished runner becomes terminated, and only a
/// later sweep can remove it.
pub fn sweep(runner: &Runner, now: u64, timeouts: &Timeouts) -> SweepAction {
    let age = now.saturating_sub(runner.updated_at);
    match runner.status {
        RunnerStatus::Finished | RunnerStatus::Failed if age > timeouts.deregister.as_secs() => {
            SweepAction::Transition(RunnerStatus::Terminated)
        }
        RunnerStatus::Terminated if age > timeouts.delete.as_secs() => SweepAction::Remove,
        RunnerStatus::Creating if age > timeouts.provisioning.as_secs() => {
            SweepAction::Transition(RunnerStatus::Failed)
        }
        _ => SweepAction::Keep,
    }
}

/// Shared, lock-guarded runner set. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    runners: Arc<RwLock<HashMap<String, Runner>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runner. Returns `false` (and changes nothing) if the name is taken.
    pub async fn insert(&self, runner: Runner) -> bool {
        let mut runners = self.runners.write().await;
        if runners.contains_key(&runner.name) {
            return false;
        }
        runners.insert(runner.name.clone(), runner);
        true
    }

    /// Create a `creating` runner named `{prefix}{6 random chars}`,
    /// drawing a fresh suffix until the name is unused.
    pub async fn create(&self, prefix: &str, now: u64) -> String {
        let mut runners = self.runners.write().await;
        let name = loop {
            let candidate = format!("{prefix}{}", random_suffix(6));
            if !runners.contains_key(&candidate) {
                break candidate;
            }
            debug!(%candidate, "runner name collision, regenerating");
        };
        runners.insert(name.clone(), Runner::new(name.clone(), now));
        name
    }

    pub async fn get(&self, name: &str) -> Option<Runner> {
        self.runners.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.runners.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.runners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runners.read().await.is_empty()
    }

    /// Snapshot of every runner, ordered by name.
    pub async fn all(&self) -> Vec<Runner> {
        let mut all: Vec<Runner> = self.runners.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Count of runners per status.
    pub async fn status_counts(&self) -> HashMap<RunnerStatus, usize> {
        let mut counts = HashMap::new();
        for runner in self.runners.read().await.values() {
            *counts.entry(runner.status).or_insert(0) += 1;
        }
        counts
    }

    /// Move a runner forward to `next`. Returns `false` if the runner is
    /// unknown or `next` is not ahead of its current status.
    pub async fn advance(&self, name: &str, next: RunnerStatus, now: u64) -> bool {
        let mut runners = self.runners.write().await;
        let Some(runner) = runners.get_mut(name) else {
            return false;
        };
        if !runner.status.can_advance_to(next) {
            debug!(runner = %name, from = %runner.status, to = %next, "ignoring backward transition");
            return false;
        }
        runner.enter(next, now);
        true
    }

    /// Record the task's address and mark the runner `ready`.
    pub async fn mark_provisioned(&self, name: &str, address: &str, now: u64) -> bool {
        let mut runners = self.runners.write().await;
        let Some(runner) = runners.get_mut(name) else {
            return false;
        };
        runner.private_address = address.to_string();
        if runner.status.can_advance_to(RunnerStatus::Ready) {
            runner.enter(RunnerStatus::Ready, now);
        }
        true
    }

    /// Store a fresh sample and clear the miss counter.
    pub async fn record_sample(&self, name: &str, sample: MetricSample) {
        let mut runners = self.runners.write().await;
        if let Some(runner) = runners.get_mut(name) {
            runner.missed_scrapes = 0;
            if !runner.status.is_terminal() {
                runner.metrics = Some(sample);
            }
        }
    }

    /// Count a scrape timeout. Once `threshold` consecutive misses are
    /// reached a `creating` or `busy` runner is rolled back to `ready`.
    /// Returns `true` if it was rolled back.
    pub async fn record_timeout(&self, name: &str, threshold: u32, now: u64) -> bool {
        let mut runners = self.runners.write().await;
        let Some(runner) = runners.get_mut(name) else {
            return false;
        };
        runner.missed_scrapes = runner.missed_scrapes.saturating_add(1);
        if runner.missed_scrapes >= threshold && runner.status.can_roll_back() {
            info!(runner = %name, from = %runner.status, misses = runner.missed_scrapes, "rolling back silent runner to ready");
            runner.enter(RunnerStatus::Ready, now);
            return true;
        }
        false
    }

    /// Name → address of every non-terminal runner that has an address.
    pub async fn scrape_targets(&self) -> HashMap<String, String> {
        self.runners
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_terminal() && r.has_address())
            .map(|r| (r.name.clone(), r.private_address.clone()))
            .collect()
    }

    /// Apply [`sweep`] to every runner. Returns the non-`Keep` verdicts.
    pub async fn sweep(&self, now: u64, timeouts: &Timeouts) -> Vec<(String, SweepAction)> {
        let mut runners = self.runners.write().await;
        let mut applied = Vec::new();
        runners.retain(|name, runner| match sweep(runner, now, timeouts) {
            SweepAction::Keep => true,
            SweepAction::Transition(next) => {
                info!(runner = %name, from = %runner.status, to = %next, "runner aged out");
                runner.enter(next, now);
                applied.push((name.clone(), SweepAction::Transition(next)));
                true
            }
            SweepAction::Remove => {
                info!(runner = %name, "runner removed");
                applied.push((name.clone(), SweepAction::Remove));
                false
            }
        });
        applied
    }
}
