//! JSON wire format between a controller and the backend.

use serde::{Deserialize, Serialize};

use crate::types::{MetricSample, RunnerStatus};

/// Response wrapper used by every backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// `POST /api/ctrl/` body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterRequest {
    pub name: String,
    pub api_key: String,
}

/// `POST /api/ctrl/` response payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterResponse {
    pub ctrl_id: String,
    pub access_token: String,
    /// Seconds until the token expires.
    pub expired_at: u64,
}

/// `POST /api/runners/` body: the full snapshot of one controller's fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    pub name: String,
    pub runners: Vec<SyncRunner>,
}

/// One runner inside a [`SyncRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRunner {
    pub name: String,
    pub private_ipv4: String,
    pub status: RunnerStatus,
    /// Zero or one sample; always empty once the runner's job is over.
    #[serde(default)]
    pub metrics: Vec<MetricSample>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_request_field_names() {
        let req = SyncRequest {
            name: "controller-abc123".to_string(),
            runners: vec![SyncRunner {
                name: "linux-abc123".to_string(),
                private_ipv4: "10.0.1.7".to_string(),
                status: RunnerStatus::Ready,
                metrics: vec![],
            }],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["runners"][0]["private_ipv4"], "10.0.1.7");
        assert_eq!(json["runners"][0]["status"], "ready");
        assert!(json["runners"][0]["metrics"].as_array().unwrap().is_empty());
    }

    #[test]
    fn register_response_reads_from_envelope() {
        let raw = r#"{"success":true,"data":{"ctrl_id":"c1","access_token":"tok","expired_at":3600}}"#;
        let rsp: ApiResponse<RegisterResponse> = serde_json::from_str(raw).unwrap();
        assert_eq!(rsp.data.unwrap().access_token, "tok");
    }

    #[test]
    fn missing_metrics_defaults_to_empty() {
        let raw = r#"{"name":"r","private_ipv4":"0.0.0.0","status":"creating"}"#;
        let runner: SyncRunner = serde_json::from_str(raw).unwrap();
        assert!(runner.metrics.is_empty());
    }
}
