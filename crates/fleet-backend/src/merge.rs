//! Aggregate mutations for controller registration and snapshot sync.
//!
//! These functions operate on a `UserRecord` in memory and are meant to run
//! inside `StateStore::update_user`, so each one is applied atomically.
//!
//! Merge rules for an incoming snapshot:
//! - runners are matched by name;
//! - a matched runner keeps its `id`, `color` and `created_at`, takes the
//!   incoming address and status, and has `updated_at` bumped only when its
//!   status changed;
//! - an unmatched runner gets a fresh id and color, and bumps the
//!   controller's `updated_at`;
//! - runners missing from the snapshot are kept as they are.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use fleet_state::{
    ControllerId, ControllerRecord, RunnerId, StateError, StateResult, StoredRunner, SyncRunner,
    UserRecord,
};

/// How long a controller with no runners is kept after its last new runner.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Random 24-hex-digit identifier.
pub fn new_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..12).map(|_| format!("{:02x}", rng.r#gen::<u8>())).collect()
}

/// Random `#RRGGBB` color with every component in `100..=255`.
pub fn random_color<R: Rng + ?Sized>(rng: &mut R) -> String {
    let r: u8 = rng.gen_range(100..=255);
    let g: u8 = rng.gen_range(100..=255);
    let b: u8 = rng.gen_range(100..=255);
    format!("#{r:02x}{g:02x}{b:02x}")
}

/// Attach a controller named `name` to `user`.
///
/// A controller that re-registers under a name the user already has is
/// re-bound to its existing record so its runners keep their identity.
pub fn register_controller<R: Rng + ?Sized>(
    user: &mut UserRecord,
    name: &str,
    now: u64,
    rng: &mut R,
) -> ControllerId {
    if let Some(existing) = user.controller_by_name_mut(name) {
        existing.updated_at = now;
        info!(controller = %name, ctrl_id = %existing.id, "controller re-registered");
        return existing.id.clone();
    }

    let id = new_id(rng);
    user.controllers.push(ControllerRecord {
        id: id.clone(),
        name: name.to_string(),
        runners: Vec::new(),
        created_at: now,
        updated_at: now,
    });
    info!(controller = %name, ctrl_id = %id, "controller registered");
    id
}

/// Outcome of [`merge_snapshot`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeReport {
    /// Runner name → stored id for every runner in the snapshot.
    pub runner_ids: HashMap<String, RunnerId>,
    pub added: usize,
    pub status_changes: usize,
    /// Controllers removed by retention.
    pub pruned: Vec<ControllerId>,
}

/// Merge `incoming` into controller `ctrl_id`, then prune idle controllers.
pub fn merge_snapshot<R: Rng + ?Sized>(
    user: &mut UserRecord,
    ctrl_id: &str,
    incoming: &[SyncRunner],
    now: u64,
    retention: Duration,
    rng: &mut R,
) -> StateResult<MergeReport> {
    let controller = user
        .controller_mut(ctrl_id)
        .ok_or_else(|| StateError::NotFound(format!("controller {ctrl_id}")))?;

    let mut report = merge_runners(controller, incoming, now, rng);
    report.pruned = prune_controllers(user, now, retention);
    Ok(report)
}

fn merge_runners<R: Rng + ?Sized>(
    controller: &mut ControllerRecord,
    incoming: &[SyncRunner],
    now: u64,
    rng: &mut R,
) -> MergeReport {
    let mut report = MergeReport::default();
    let mut by_name: HashMap<String, StoredRunner> = controller
        .runners
        .drain(..)
        .map(|r| (r.name.clone(), r))
        .collect();

    for runner in incoming {
        match by_name.get_mut(&runner.name) {
            Some(stored) => {
                if stored.status != runner.status {
                    debug!(runner = %runner.name, from = %stored.status, to = %runner.status, "runner status changed");
                    stored.status = runner.status;
                    stored.updated_at = now;
                    report.status_changes += 1;
                }
                stored.private_ipv4 = runner.private_ipv4.clone();
                report.runner_ids.insert(runner.name.clone(), stored.id.clone());
            }
            None => {
                let stored = StoredRunner {
                    id: new_id(rng),
                    name: runner.name.clone(),
                    color: random_color(rng),
                    private_ipv4: runner.private_ipv4.clone(),
                    status: runner.status,
                    created_at: now,
                    updated_at: now,
                };
                report.runner_ids.insert(runner.name.clone(), stored.id.clone());
                by_name.insert(runner.name.clone(), stored);
                controller.updated_at = now;
                report.added += 1;
            }
        }
    }

    let mut runners: Vec<StoredRunner> = by_name.into_values().collect();
    runners.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
    controller.runners = runners;
    report
}

/// Drop controllers that have no runners and have not gained one within
/// `retention`. Returns the removed ids.
pub fn prune_controllers(user: &mut UserRecord, now: u64, retention: Duration) -> Vec<ControllerId> {
    let cutoff = now.saturating_sub(retention.as_secs());
    let mut pruned = Vec::new();
    user.controllers.retain(|c| {
        let idle = c.runners.is_empty() && c.updated_at < cutoff;
        if idle {
            info!(controller = %c.name, ctrl_id = %c.id, "pruning idle controller");
            pruned.push(c.id.clone());
        }
        !idle
    });
    pruned
}
