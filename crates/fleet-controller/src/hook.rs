//! Controller HTTP surface.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/ecs_runner_hook` | `workflow_job` webhook intake |
//! | GET | `/metrics` | Broker and registry counters (Prometheus text) |
//!
//! Deliveries are signed by GitHub with the secret the controller set on
//! the hook. When the state carries a [`WebhookSecret`], a body whose
//! `X-Hub-Signature-256` does not match is refused with 401.

use std::fmt;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, info, warn};

use fleet_metrics::{MetricFamily, MetricType, Series, render};
use fleet_state::RunnerStatus;

use crate::broker::Broker;
use crate::event::{WebhookPayload, WorkflowJobEvent};
use crate::github::HOOK_PATH;
use crate::registry::{Registry, random_suffix};

type HmacSha256 = Hmac<Sha256>;

/// Header GitHub carries the payload HMAC in.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Shared key between the repository webhook and this controller.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(Arc<str>);

impl WebhookSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into().into())
    }

    /// A fresh random secret, one per controller run.
    pub fn generate() -> Self {
        Self::new(random_suffix(32))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `sha256=<hex>` signature of `body`, as GitHub sends it.
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let mut mac = self.mac()?;
        mac.update(body);
        Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
    }

    /// Check a signature header against `body` in constant time.
    pub fn verify(&self, signature: &str, body: &[u8]) -> bool {
        let hex_digest = signature.strip_prefix("sha256=").unwrap_or(signature);
        let Ok(expected) = hex::decode(hex_digest) else {
            return false;
        };
        let Some(mut mac) = self.mac() else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(self.0.as_bytes()).ok()
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(****)")
    }
}

/// Shared state for the controller's handlers.
#[derive(Clone)]
pub struct HookState {
    pub broker: Broker<WorkflowJobEvent>,
    pub registry: Registry,
    /// Unsigned deliveries are accepted when unset.
    pub secret: Option<WebhookSecret>,
}

pub fn build_router(state: HookState) -> Router {
    Router::new()
        .route(&format!("/{HOOK_PATH}"), post(receive_webhook))
        .route("/metrics", get(controller_metrics))
        .with_state(state)
}

/// POST /ecs_runner_hook
async fn receive_webhook(
    State(state): State<HookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !secret.verify(signature, &body) {
            warn!(signed = !signature.is_empty(), "rejecting webhook with bad signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Invalid webhook signature"})),
            );
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "rejecting webhook body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Failed to parse webhook payload"})),
            );
        }
    };

    match payload.into_event() {
        Some(event) => state.broker.publish(event),
        None => info!("webhook without job data, skipping"),
    }

    (
        StatusCode::OK,
        Json(json!({"message": "Webhook received successfully"})),
    )
}

/// GET /metrics
async fn controller_metrics(State(state): State<HookState>) -> impl IntoResponse {
    let stats = state.broker.stats().snapshot();
    let counts = state.registry.status_counts().await;

    let mut runners = MetricFamily::new("fleet_runners", MetricType::Gauge)
        .with_help("Runners tracked by this controller, by status.");
    for status in [
        RunnerStatus::Creating,
        RunnerStatus::Ready,
        RunnerStatus::Busy,
        RunnerStatus::Finished,
        RunnerStatus::Failed,
        RunnerStatus::Terminated,
    ] {
        let n = counts.get(&status).copied().unwrap_or(0);
        runners = runners
            .with_series(Series::new("fleet_runners", n as f64).with_label("status", status.as_str()));
    }

    let counter = |name: &str, help: &str, value: u64| {
        MetricFamily::new(name, MetricType::Counter)
            .with_help(help)
            .with_series(Series::new(name, value as f64))
    };
    let families = vec![
        counter(
            "fleet_broker_published_total",
            "Webhook events handed to the broker.",
            stats.published,
        ),
        counter(
            "fleet_broker_delivered_total",
            "Events delivered to a subscriber.",
            stats.delivered,
        ),
        counter(
            "fleet_broker_dropped_total",
            "Events dropped because a subscriber was full.",
            stats.dropped,
        ),
        MetricFamily::new("fleet_broker_subscribers", MetricType::Gauge)
            .with_series(Series::new("fleet_broker_subscribers", stats.subscribers as f64)),
        runners,
    ];

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(&families),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::event::JobAction;
    use crate::registry::Runner;

    fn state() -> (HookState, tokio::sync::mpsc::Receiver<WorkflowJobEvent>) {
        let (broker, _worker) = Broker::start(8);
        let rx = broker.subscribe();
        (
            HookState {
                broker,
                registry: Registry::new(),
                secret: None,
            },
            rx,
        )
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_hook(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ecs_runner_hook")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn webhook_is_published() {
        let (state, mut rx) = state();
        let app = build_router(state);

        let resp = app
            .oneshot(post_hook(
                r#"{"action":"queued","workflow_job":{"runner_name":null,"labels":["self-hosted"]}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["message"], "Webhook received successfully");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, JobAction::Queued);
        assert_eq!(event.labels, vec!["self-hosted"]);
    }

    const JOB: &str =
        r#"{"action":"queued","workflow_job":{"runner_name":null,"labels":["self-hosted"]}}"#;

    fn signed_state(
        secret: &str,
    ) -> (HookState, tokio::sync::mpsc::Receiver<WorkflowJobEvent>) {
        let (mut state, rx) = state();
        state.secret = Some(WebhookSecret::new(secret));
        (state, rx)
    }

    fn post_signed(body: &str, signature: &str) -> Request<Body> {
        let mut req = post_hook(body);
        req.headers_mut()
            .insert(SIGNATURE_HEADER, signature.parse().unwrap());
        req
    }

    #[test]
    fn signature_matches_github_reference() {
        // Example delivery from GitHub's webhook validation docs.
        let secret = WebhookSecret::new("It's a Secret to Everybody");
        let expected =
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert_eq!(secret.sign(b"Hello, World!").unwrap(), expected);
        assert!(secret.verify(expected, b"Hello, World!"));
        assert!(!secret.verify(expected, b"Hello, World?"));
        assert!(!secret.verify("sha256=zz", b"Hello, World!"));
        assert!(!secret.verify("", b"Hello, World!"));
        assert_eq!(format!("{secret:?}"), "WebhookSecret(****)");
    }

    #[tokio::test]
    async fn signed_webhook_is_published() {
        let (state, mut rx) = signed_state("hook-key");
        let signature = WebhookSecret::new("hook-key").sign(JOB.as_bytes()).unwrap();

        let resp = build_router(state)
            .oneshot(post_signed(JOB, &signature))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().action, JobAction::Queued);
    }

    #[tokio::test]
    async fn unsigned_or_forged_webhook_is_refused() {
        let forged = WebhookSecret::new("other-key").sign(JOB.as_bytes()).unwrap();
        for req in [post_hook(JOB), post_signed(JOB, &forged)] {
            let (state, _rx) = signed_state("hook-key");
            let broker = state.broker.clone();
            let resp = build_router(state).oneshot(req).await.unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(body_json(resp).await["error"], "Invalid webhook signature");
            tokio::task::yield_now().await;
            assert_eq!(broker.stats().snapshot().published, 0);
        }
    }

    #[tokio::test]
    async fn garbage_body_is_bad_request() {
        let (state, _rx) = state();
        let resp = build_router(state).oneshot(post_hook("not json")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Failed to parse webhook payload");
    }

    #[tokio::test]
    async fn jobless_webhook_is_accepted_but_not_published() {
        let (state, _rx) = state();
        let broker = state.broker.clone();
        let resp = build_router(state)
            .oneshot(post_hook(r#"{"action":"completed"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        tokio::task::yield_now().await;
        assert_eq!(broker.stats().snapshot().published, 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_counters() {
        let (state, _rx) = state();
        state.registry.insert(Runner::new("linux-abc123", 1)).await;
        state.broker.publish(WorkflowJobEvent {
            action: JobAction::Other,
            runner_name: String::new(),
            labels: vec![],
        });
        for _ in 0..100 {
            if state.broker.stats().snapshot().published == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let resp = build_router(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("fleet_broker_published_total 1"));
        assert!(text.contains("fleet_broker_delivered_total 1"));
        assert!(text.contains("fleet_runners{status=\"creating\"} 1"));
        assert!(text.contains("fleet_runners{status=\"busy\"} 0"));
        assert!(fleet_metrics::parse(&text).is_ok());
    }
}
