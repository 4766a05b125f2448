//! Controller API handlers.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fleet_state::{
    ApiResponse, RegisterRequest, RegisterResponse, StoredMetric, SyncRequest, epoch_secs,
};

use crate::BackendState;
use crate::error::{BackendError, BackendResult};
use crate::merge;
use crate::notify::{controllers_event, metrics_event};

/// Summary returned by a successful sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSummary {
    pub runners: usize,
    pub added: usize,
    pub pruned: usize,
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> BackendResult<T> {
    serde_json::from_slice(body).map_err(|e| BackendError::BadRequest(e.to_string()))
}

/// POST /api/ctrl/
pub async fn register_controller(
    State(state): State<BackendState>,
    body: Bytes,
) -> BackendResult<Json<ApiResponse<RegisterResponse>>> {
    let req: RegisterRequest = parse_json(&body)?;
    if req.name.trim().is_empty() {
        return Err(BackendError::BadRequest("name is required".into()));
    }
    if req.api_key.is_empty() {
        return Err(BackendError::BadRequest("api_key is required".into()));
    }

    let user = state
        .store
        .find_user_by_api_key(&req.api_key)?
        .ok_or_else(|| BackendError::Unauthorized("invalid api key".into()))?;

    let now = epoch_secs();
    let ctrl_id = state.store.update_user(&user.id, |u| {
        Ok(merge::register_controller(
            u,
            &req.name,
            now,
            &mut rand::thread_rng(),
        ))
    })?;

    let (access_token, expired_at) = state.tokens.issue(&user.id, &ctrl_id)?;
    info!(user = %user.id, %ctrl_id, controller = %req.name, "issued controller token");

    Ok(Json(ApiResponse::ok(RegisterResponse {
        ctrl_id,
        access_token,
        expired_at,
    })))
}

/// POST /api/runners/
pub async fn sync_runners(
    State(state): State<BackendState>,
    headers: HeaderMap,
    body: Bytes,
) -> BackendResult<Json<ApiResponse<SyncSummary>>> {
    let claims = state.tokens.verify_headers(&headers)?;
    let req: SyncRequest = parse_json(&body)?;
    validate(&req)?;

    let now = epoch_secs();
    let (report, user) = state.store.update_user(&claims.sub, |u| {
        let report = merge::merge_snapshot(
            u,
            &claims.ctrl,
            &req.runners,
            now,
            state.retention,
            &mut rand::thread_rng(),
        )?;
        Ok((report, u.clone()))
    })?;

    let samples: Vec<StoredMetric> = req
        .runners
        .iter()
        .filter_map(|r| report.runner_ids.get(&r.name).map(|id| (id, r)))
        .flat_map(|(id, r)| {
            r.metrics.iter().map(move |m| StoredMetric {
                runner_id: id.clone(),
                timestamp: m.timestamp,
                values: m.values.clone(),
            })
        })
        .collect();
    state.store.put_metrics(&samples, state.metrics_retention)?;

    debug!(
        ctrl_id = %claims.ctrl,
        controller = %req.name,
        runners = req.runners.len(),
        added = report.added,
        samples = samples.len(),
        "snapshot merged"
    );

    state.notifier.push(&user.id, controllers_event(&user));
    if let Some(controller) = user.controller(&claims.ctrl) {
        let event = metrics_event(&state.store, controller, state.metrics_history)?;
        state.notifier.push(&user.id, event);
    }

    Ok(Json(ApiResponse::ok(SyncSummary {
        runners: req.runners.len(),
        added: report.added,
        pruned: report.pruned.len(),
    })))
}

fn validate(req: &SyncRequest) -> BackendResult<()> {
    let mut seen = HashSet::new();
    for runner in &req.runners {
        if runner.name.trim().is_empty() {
            return Err(BackendError::BadRequest("runner name is required".into()));
        }
        if !seen.insert(runner.name.as_str()) {
            return Err(BackendError::BadRequest(format!(
                "duplicate runner {}",
                runner.name
            )));
        }
        if runner.private_ipv4.parse::<Ipv4Addr>().is_err() {
            return Err(BackendError::BadRequest(format!(
                "runner {}: {:?} is not an IPv4 address",
                runner.name, runner.private_ipv4
            )));
        }
    }
    Ok(())
}
