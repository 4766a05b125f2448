//! Domain types shared by the controller and the backend.
//!
//! These types cover the runner lifecycle, metric samples, and the
//! persisted backend aggregate (users → controllers → runners). All types
//! serialize to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a user.
pub type UserId = String;

/// Unique identifier for a controller record.
pub type ControllerId = String;

/// Unique identifier for a stored runner.
pub type RunnerId = String;

// ── Runner lifecycle ───────────────────────────────────────────────

/// Lifecycle status of a runner.
///
/// `creating → ready → busy → {finished | failed} → terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Creating,
    Ready,
    Busy,
    Finished,
    Failed,
    Terminated,
}

impl RunnerStatus {
    /// Position in the lifecycle graph. `finished` and `failed` share a stage.
    fn stage(self) -> u8 {
        match self {
            RunnerStatus::Creating => 0,
            RunnerStatus::Ready => 1,
            RunnerStatus::Busy => 2,
            RunnerStatus::Finished | RunnerStatus::Failed => 3,
            RunnerStatus::Terminated => 4,
        }
    }

    /// Whether the runner's job is over (`finished`, `failed`, `terminated`).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunnerStatus::Finished | RunnerStatus::Failed | RunnerStatus::Terminated
        )
    }

    /// Whether moving to `next` goes strictly forward along the lifecycle.
    pub fn can_advance_to(self, next: RunnerStatus) -> bool {
        next.stage() > self.stage()
    }

    /// Whether a silent runner in this status may be rolled back to `ready`.
    pub fn can_roll_back(self) -> bool {
        matches!(self, RunnerStatus::Creating | RunnerStatus::Busy)
    }

    /// Wire value.
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerStatus::Creating => "creating",
            RunnerStatus::Ready => "ready",
            RunnerStatus::Busy => "busy",
            RunnerStatus::Finished => "finished",
            RunnerStatus::Failed => "failed",
            RunnerStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// One scrape of a runner's numeric gauges and counters.
///
/// Serialized flat: `{"timestamp": 1700000000, "ecs_memory_bytes": 1.5e8}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Unix timestamp (seconds) when the sample was taken.
    pub timestamp: u64,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

impl MetricSample {
    /// Create an empty sample stamped at `timestamp`.
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
        }
    }

    /// Store `value` under `name`. Non-finite values are refused, since
    /// JSON has no encoding for them. Returns whether the value was stored.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        self.values.insert(name.into(), value);
        true
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ── Backend aggregate ──────────────────────────────────────────────

/// A user and every controller registered under their API key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    /// Key controllers present when registering.
    pub api_key: String,
    pub controllers: Vec<ControllerRecord>,
    /// Unix timestamp (seconds) when this user was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last aggregate write.
    pub updated_at: u64,
}

impl UserRecord {
    pub fn controller(&self, id: &str) -> Option<&ControllerRecord> {
        self.controllers.iter().find(|c| c.id == id)
    }

    pub fn controller_mut(&mut self, id: &str) -> Option<&mut ControllerRecord> {
        self.controllers.iter_mut().find(|c| c.id == id)
    }

    pub fn controller_by_name_mut(&mut self, name: &str) -> Option<&mut ControllerRecord> {
        self.controllers.iter_mut().find(|c| c.name == name)
    }
}

/// One controller process as seen by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerRecord {
    pub id: ControllerId,
    pub name: String,
    pub runners: Vec<StoredRunner>,
    pub created_at: u64,
    /// Bumped when a runner is first seen; drives retention pruning.
    pub updated_at: u64,
}

/// Backend view of a runner. `id`, `color`, and `created_at` are assigned
/// once and survive every merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRunner {
    pub id: RunnerId,
    pub name: String,
    /// Display color (`#RRGGBB`) for dashboards.
    pub color: String,
    pub private_ipv4: String,
    pub status: RunnerStatus,
    pub created_at: u64,
    /// Last status change.
    pub updated_at: u64,
}

/// A metric sample persisted against a stored runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMetric {
    pub runner_id: RunnerId,
    pub timestamp: u64,
    pub values: BTreeMap<String, f64>,
}

impl StoredMetric {
    /// Build the composite key for the metrics table.
    ///
    /// The timestamp is zero-padded so keys sort chronologically.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.runner_id, self.timestamp)
    }
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        use RunnerStatus::*;
        assert!(Creating.can_advance_to(Ready));
        assert!(Ready.can_advance_to(Busy));
        assert!(Busy.can_advance_to(Finished));
        assert!(Busy.can_advance_to(Failed));
        assert!(Finished.can_advance_to(Terminated));
        assert!(Creating.can_advance_to(Failed));

        assert!(!Busy.can_advance_to(Ready));
        assert!(!Terminated.can_advance_to(Finished));
        assert!(!Finished.can_advance_to(Failed));
        assert!(!Ready.can_advance_to(Ready));
    }

    #[test]
    fn status_wire_values() {
        let json = serde_json::to_string(&RunnerStatus::Terminated).unwrap();
        assert_eq!(json, "\"terminated\"");
        let parsed: RunnerStatus = serde_json::from_str("\"busy\"").unwrap();
        assert_eq!(parsed, RunnerStatus::Busy);
        assert!(serde_json::from_str::<RunnerStatus>("\"idle\"").is_err());
    }

    #[test]
    fn metric_sample_refuses_non_finite_values() {
        let mut sample = MetricSample::new(1);
        assert!(!sample.insert("a", f64::NAN));
        assert!(!sample.insert("b", f64::INFINITY));
        assert!(!sample.insert("c", f64::NEG_INFINITY));
        assert!(sample.insert("d", 0.5));
        assert_eq!(serde_json::to_string(&sample).unwrap(), r#"{"timestamp":1,"d":0.5}"#);
    }

    #[test]
    fn metric_sample_is_flat_on_the_wire() {
        let mut sample = MetricSample::new(1_700_000_000);
        sample.insert("ecs_memory_bytes", 1024.0);

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["timestamp"], 1_700_000_000u64);
        assert_eq!(json["ecs_memory_bytes"], 1024.0);

        let back: MetricSample = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn metric_sample_rejects_non_numeric_values() {
        let raw = r#"{"timestamp": 10, "cpu": "high"}"#;
        assert!(serde_json::from_str::<MetricSample>(raw).is_err());
    }

    #[test]
    fn metric_key_sorts_by_time() {
        let early = StoredMetric {
            runner_id: "r".to_string(),
            timestamp: 9,
            values: BTreeMap::new(),
        };
        let late = StoredMetric {
            timestamp: 10,
            ..early.clone()
        };
        assert!(early.table_key() < late.table_key());
    }
}
