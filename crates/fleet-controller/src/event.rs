//! `workflow_job` webhook events.

use serde::{Deserialize, Serialize};

/// What happened to a CI job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Queued,
    InProgress,
    Completed,
    Failed,
    /// Any action string this controller does not model (e.g. `waiting`).
    #[serde(other)]
    Other,
}

/// Raw webhook body posted by the source-control host.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub action: JobAction,
    #[serde(default)]
    pub workflow_job: Option<WorkflowJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// The part of a webhook the reconciler acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowJobEvent {
    pub action: JobAction,
    /// Empty until the host has assigned the job to a runner.
    pub runner_name: String,
    pub labels: Vec<String>,
}

impl WebhookPayload {
    /// Flatten into an event. `None` when the payload carries no job.
    pub fn into_event(self) -> Option<WorkflowJobEvent> {
        let job = self.workflow_job?;
        Some(WorkflowJobEvent {
            action: self.action,
            runner_name: job.runner_name.unwrap_or_default(),
            labels: job.labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_payload_parses() {
        let raw = r#"{
            "action": "queued",
            "workflow_job": {"runner_name": null, "labels": ["self-hosted", "linux"], "id": 42},
            "repository": {"full_name": "octo/widgets"}
        }"#;
        let payload: WebhookPayload = serde_json::from_str(raw).unwrap();
        let event = payload.into_event().unwrap();
        assert_eq!(event.action, JobAction::Queued);
        assert_eq!(event.runner_name, "");
        assert_eq!(event.labels, vec!["self-hosted", "linux"]);
    }

    #[test]
    fn unknown_action_is_other() {
        let raw = r#"{"action": "waiting", "workflow_job": {"runner_name": "linux-abc123"}}"#;
        let payload: WebhookPayload = serde_json::from_str(raw).unwrap();
        let event = payload.into_event().unwrap();
        assert_eq!(event.action, JobAction::Other);
        assert_eq!(event.runner_name, "linux-abc123");
        assert!(event.labels.is_empty());
    }

    #[test]
    fn payload_without_job_yields_no_event() {
        let payload: WebhookPayload = serde_json::from_str(r#"{"action": "completed"}"#).unwrap();
        assert!(payload.into_event().is_none());
    }

    #[test]
    fn missing_action_is_rejected() {
        assert!(serde_json::from_str::<WebhookPayload>(r#"{"workflow_job": {}}"#).is_err());
    }
}
