//! The controller's own network identity on the compute platform.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ControllerError, ControllerResult};

/// Environment variable the ECS agent sets in v4-capable tasks.
pub const METADATA_V4_ENV: &str = "ECS_CONTAINER_METADATA_URI_V4";
/// Set by older agents; only the v4 layout is understood.
pub const METADATA_V3_ENV: &str = "ECS_CONTAINER_METADATA_URI";

/// Subset of the ECS task metadata v4 document.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaskMetadata {
    #[serde(rename = "Cluster", default)]
    pub cluster: String,
    #[serde(rename = "TaskARN", default)]
    pub task_arn: String,
    #[serde(rename = "Containers", default)]
    pub containers: Vec<ContainerMetadata>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ContainerMetadata {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Networks", default)]
    pub networks: Vec<NetworkMetadata>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NetworkMetadata {
    #[serde(rename = "IPv4Addresses", default)]
    pub ipv4_addresses: Vec<String>,
}

impl TaskMetadata {
    /// First IPv4 address attached to any container of the task.
    pub fn address(&self) -> Option<&str> {
        self.containers
            .iter()
            .flat_map(|c| &c.networks)
            .flat_map(|n| &n.ipv4_addresses)
            .map(String::as_str)
            .find(|a| !a.is_empty())
    }

    /// Region segment of the task ARN (`arn:aws:ecs:{region}:{account}:task/…`).
    pub fn region(&self) -> Option<&str> {
        self.task_arn.split(':').nth(3).filter(|s| !s.is_empty())
    }

    pub fn account_id(&self) -> Option<&str> {
        self.task_arn.split(':').nth(4).filter(|s| !s.is_empty())
    }
}

/// Fetch `{base}/task` from the metadata endpoint.
pub async fn fetch_task_metadata(base: &str) -> ControllerResult<TaskMetadata> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let url = format!("{}/task", base.trim_end_matches('/'));
    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| ControllerError::Platform(format!("{url}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ControllerError::Platform(format!("{url}: {status}")));
    }
    response
        .json()
        .await
        .map_err(|e| ControllerError::Platform(format!("bad task metadata: {e}")))
}

/// Work out the address the webhook should target.
///
/// An explicit address wins. Otherwise the v4 metadata endpoint named by
/// `v4_endpoint` is queried. A task that only exposes the v3 endpoint is
/// reported as [`ControllerError::NotImplemented`].
pub async fn resolve_public_address(
    explicit: Option<&str>,
    v4_endpoint: Option<&str>,
    v3_endpoint: Option<&str>,
) -> ControllerResult<String> {
    if let Some(address) = explicit.filter(|a| !a.is_empty()) {
        debug!(%address, "using configured public address");
        return Ok(address.to_string());
    }

    match (v4_endpoint.filter(|e| !e.is_empty()), v3_endpoint) {
        (Some(endpoint), _) => {
            let metadata = fetch_task_metadata(endpoint).await?;
            let address = metadata
                .address()
                .ok_or_else(|| ControllerError::Platform("task has no IPv4 address".into()))?
                .to_string();
            info!(
                cluster = %metadata.cluster,
                region = metadata.region().unwrap_or("?"),
                %address,
                "resolved task address from metadata"
            );
            Ok(address)
        }
        (None, Some(v3)) if !v3.is_empty() => Err(ControllerError::NotImplemented(
            "task metadata v3".to_string(),
        )),
        _ => Err(ControllerError::Platform(
            "no public address configured and no task metadata endpoint".to_string(),
        )),
    }
}
