//! Outbound state sync to the backend.
//!
//! The controller registers once at startup to get a bearer token, then
//! posts its full runner snapshot after every change. Rejected or failed
//! pushes are reported to the caller and not retried; the next tick sends
//! a fresh snapshot anyway. A 401 or 404 means the backend no longer
//! knows this controller, so the client re-registers under the same name
//! and pushes once more.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use fleet_state::{ApiResponse, RegisterRequest, RegisterResponse, SyncRequest, SyncRunner};

use crate::error::{ControllerError, ControllerResult};
use crate::registry::Runner;

const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the wire snapshot for `runners`.
///
/// Metrics travel only for runners still doing work.
pub fn snapshot(controller: &str, runners: &[Runner]) -> SyncRequest {
    SyncRequest {
        name: controller.to_string(),
        runners: runners
            .iter()
            .map(|r| SyncRunner {
                name: r.name.clone(),
                private_ipv4: r.private_address.clone(),
                status: r.status,
                metrics: match &r.metrics {
                    Some(sample) if !r.status.is_terminal() => vec![sample.clone()],
                    _ => Vec::new(),
                },
            })
            .collect(),
    }
}

/// HTTP client for the backend's controller API.
#[derive(Debug)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    name: String,
    token: RwLock<Option<String>>,
}

impl BackendClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        name: impl Into<String>,
    ) -> ControllerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .user_agent(concat!("fleet-controller/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            name: name.into(),
            token: RwLock::new(None),
        })
    }

    /// Controller name this client registers and syncs as.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn has_token(&self) -> bool {
        self.token.read().await.is_some()
    }

    /// `POST /api/ctrl/`. Stores the returned token for later pushes.
    pub async fn register(&self) -> ControllerResult<RegisterResponse> {
        let url = format!("{}/api/ctrl/", self.base_url);
        let body = RegisterRequest {
            name: self.name.clone(),
            api_key: self.api_key.clone(),
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ControllerError::Registration(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ControllerError::Registration(format!("{status}: {text}")));
        }

        let envelope: ApiResponse<RegisterResponse> = response
            .json()
            .await
            .map_err(|e| ControllerError::Registration(format!("bad response body: {e}")))?;
        let registered = envelope
            .data
            .filter(|d| !d.access_token.is_empty())
            .ok_or_else(|| ControllerError::Registration("no access token in response".into()))?;

        *self.token.write().await = Some(registered.access_token.clone());
        info!(controller = %self.name, ctrl_id = %registered.ctrl_id, expires_in = registered.expired_at, "registered with backend");
        Ok(registered)
    }

    /// `POST /api/runners/` with the current snapshot.
    pub async fn push(&self, request: &SyncRequest) -> ControllerResult<()> {
        match self.send(request).await? {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                warn!(controller = %self.name, "backend lost this controller, re-registering");
                self.register().await?;
                match self.send(request).await? {
                    status if status.is_success() => Ok(()),
                    status => Err(ControllerError::Sync(format!("rejected after re-register: {status}"))),
                }
            }
            status => Err(ControllerError::Sync(format!("rejected: {status}"))),
        }
    }

    async fn send(&self, request: &SyncRequest) -> ControllerResult<StatusCode> {
        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or_else(|| ControllerError::Sync("not registered".to_string()))?;

        let url = format!("{}/api/runners/", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        debug!(controller = %self.name, runners = request.runners.len(), %status, "snapshot pushed");
        Ok(status)
    }
}
