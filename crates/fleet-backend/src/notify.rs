//! Push notifications to UI clients.
//!
//! After every sync the backend pushes two events to the owning user: the
//! full controller list (`ctrls`) and the synced controller's recent
//! metrics (`metrics`). Transport is pluggable through [`PushNotifier`];
//! [`BroadcastNotifier`] fans events out over a tokio broadcast channel
//! for whatever session layer subscribes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use fleet_state::{
    ControllerRecord, MetricSample, RunnerStatus, StateResult, StateStore, UserId, UserRecord,
};

/// One UI event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushEvent {
    pub event: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty: Option<bool>,
}

/// Delivers events to a user's sessions. Must not block.
pub trait PushNotifier: Send + Sync {
    fn push(&self, user_id: &str, event: PushEvent);
}

/// [`PushNotifier`] over a broadcast channel of `(user, event)` pairs.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<(UserId, PushEvent)>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(UserId, PushEvent)> {
        self.tx.subscribe()
    }
}

impl PushNotifier for BroadcastNotifier {
    fn push(&self, user_id: &str, event: PushEvent) {
        let name = event.event.clone();
        match self.tx.send((user_id.to_string(), event)) {
            Ok(n) => debug!(%user_id, event = %name, receivers = n, "push event sent"),
            Err(_) => debug!(%user_id, event = %name, "no push subscribers"),
        }
    }
}

// ── Views ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerView {
    pub id: String,
    pub name: String,
    pub color: String,
    pub private_ipv4: String,
    pub status: RunnerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerView {
    pub id: String,
    pub name: String,
    pub runners: Vec<RunnerView>,
}

impl From<&ControllerRecord> for ControllerView {
    fn from(c: &ControllerRecord) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            runners: c
                .runners
                .iter()
                .map(|r| RunnerView {
                    id: r.id.clone(),
                    name: r.name.clone(),
                    color: r.color.clone(),
                    private_ipv4: r.private_ipv4.clone(),
                    status: r.status,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerMetricsView {
    pub name: String,
    pub color: String,
    pub metrics: Vec<MetricSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsView {
    pub ctrl_id: String,
    pub runners: Vec<RunnerMetricsView>,
}

/// `ctrls` event: every controller of the user.
pub fn controllers_event(user: &UserRecord) -> PushEvent {
    let views: Vec<ControllerView> = user.controllers.iter().map(ControllerView::from).collect();
    PushEvent {
        event: "ctrls".to_string(),
        empty: views.is_empty().then_some(true),
        data: serde_json::to_value(views).unwrap_or_default(),
    }
}

/// `metrics` event: the last `history` samples of each of the controller's runners.
pub fn metrics_event(
    store: &StateStore,
    controller: &ControllerRecord,
    history: usize,
) -> StateResult<PushEvent> {
    let mut runners = Vec::with_capacity(controller.runners.len());
    for runner in &controller.runners {
        let metrics = store
            .list_metrics_for_runner(&runner.id, history)?
            .into_iter()
            .map(|m| MetricSample {
                timestamp: m.timestamp,
                values: m.values,
            })
            .collect();
        runners.push(RunnerMetricsView {
            name: runner.name.clone(),
            color: runner.color.clone(),
            metrics,
        });
    }
    let view = MetricsView {
        ctrl_id: controller.id.clone(),
        runners,
    };
    Ok(PushEvent {
        event: "metrics".to_string(),
        empty: None,
        data: serde_json::to_value(view).unwrap_or_default(),
    })
}
