//! End-to-end tests: controller webhook intake through the reconciler and
//! the backend sync API into the backend store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tower::ServiceExt;

use fleet_backend::{BackendState, BroadcastNotifier, TokenIssuer};
use fleet_controller::provisioner::ProvisionFuture;
use fleet_controller::{
    BackendClient, Broker, ControllerConfig, HookState, Provisioner, Reconciler, Registry, Runner,
    Settings, WebhookSecret, snapshot,
};
use fleet_metrics::MetricsCollector;
use fleet_state::{MetricSample, RunnerStatus, StateStore, UserRecord};

const API_KEY: &str = "integration-key";
const HOOK_SECRET: &str = "integration-hook-secret";
const EXPORTER_BODY: &str = "# TYPE ecs_memory_bytes gauge\n\
ecs_memory_bytes{container=\"github-runner\"} 512\n\
ecs_memory_bytes{container=\"ecs-container-exporter\"} 64\n";
const NON_FINITE_BODY: &str = "# TYPE ecs_memory_bytes gauge\n\
ecs_memory_bytes{container=\"github-runner\"} NaN\n\
# TYPE ecs_pids gauge\n\
ecs_pids{container=\"github-runner\"} 7\n";

fn backend_state() -> BackendState {
    let store = StateStore::open_in_memory().unwrap();
    store
        .create_user(&UserRecord {
            id: "u1".into(),
            email: "ops@example.com".into(),
            api_key: API_KEY.into(),
            controllers: vec![],
            created_at: 1,
            updated_at: 1,
        })
        .unwrap();
    BackendState::new(
        store,
        TokenIssuer::new(b"integration", Duration::from_secs(600)),
        Arc::new(BroadcastNotifier::new(64)),
    )
}

async fn serve_backend(state: BackendState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = fleet_backend::build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Minimal exporter answering every connection with `body`.
async fn serve_exporter(body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = sock.write_all(resp.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });
    port
}

struct LoopbackProvisioner;

impl Provisioner for LoopbackProvisioner {
    fn provision<'a>(&'a self, _runner_name: &'a str) -> ProvisionFuture<'a> {
        Box::pin(async { Ok("127.0.0.1".to_string()) })
    }
}

fn webhook(action: &str, runner_name: Option<&str>) -> Request<Body> {
    let body = serde_json::json!({
        "action": action,
        "workflow_job": {"runner_name": runner_name, "labels": ["self-hosted", "linux"]},
    })
    .to_string();
    let signature = WebhookSecret::new(HOOK_SECRET).sign(body.as_bytes()).unwrap();
    Request::builder()
        .method("POST")
        .uri("/ecs_runner_hook")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", signature)
        .body(Body::from(body))
        .unwrap()
}

/// Tick the reconciler until `done` holds for the backend's view of the
/// controller's runners.
async fn reconcile_until<F>(
    reconciler: &mut Reconciler,
    state: &BackendState,
    ctrl_id: &str,
    done: F,
) -> Vec<fleet_state::StoredRunner>
where
    F: Fn(&[fleet_state::StoredRunner]) -> bool,
{
    for _ in 0..100 {
        reconciler.reconcile().await.unwrap();
        let user = state.store.get_user("u1").unwrap().unwrap();
        let runners = user
            .controller(ctrl_id)
            .map(|c| c.runners.clone())
            .unwrap_or_default();
        if done(&runners) {
            return runners;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("backend never reached the expected state");
}

#[tokio::test]
async fn webhook_to_backend_lifecycle() {
    let state = backend_state();
    let base_url = serve_backend(state.clone()).await;

    let backend = Arc::new(BackendClient::new(&base_url, API_KEY, "controller-e2e").unwrap());
    let ctrl_id = backend.register().await.unwrap().ctrl_id;

    let config = ControllerConfig {
        metrics_port: serve_exporter(EXPORTER_BODY).await,
        scrape_timeout: "1s".to_string(),
        ..ControllerConfig::default()
    };
    let (broker, _worker) = Broker::start(config.broker_capacity);
    let registry = Registry::new();
    let mut reconciler = Reconciler::new(
        registry.clone(),
        broker.subscribe(),
        MetricsCollector::new(config.collector()),
        backend,
        Arc::new(LoopbackProvisioner),
        Settings::from(&config),
    );
    let hook = fleet_controller::build_router(HookState {
        broker,
        registry: registry.clone(),
        secret: Some(WebhookSecret::new(HOOK_SECRET)),
    });

    // queued: a runner is created, provisioned, scraped, and synced.
    let resp = hook.clone().oneshot(webhook("queued", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let state_ref = &state;
    let runners = reconcile_until(&mut reconciler, &state, &ctrl_id, |runners| {
        runners.first().is_some_and(|r| {
            r.status == RunnerStatus::Ready
                && !state_ref
                    .store
                    .list_metrics_for_runner(&r.id, 1)
                    .unwrap()
                    .is_empty()
        })
    })
    .await;
    assert_eq!(runners.len(), 1);
    let stored = &runners[0];
    assert!(stored.name.starts_with("linux-"));
    assert_eq!(stored.private_ipv4, "127.0.0.1");

    let history = state.store.list_metrics_for_runner(&stored.id, 10).unwrap();
    assert_eq!(history.last().unwrap().values["ecs_memory_bytes"], 512.0);

    // in_progress → busy, then completed → finished.
    let name = stored.name.clone();
    hook.clone()
        .oneshot(webhook("in_progress", Some(&name)))
        .await
        .unwrap();
    reconcile_until(&mut reconciler, &state, &ctrl_id, |runners| {
        runners[0].status == RunnerStatus::Busy
    })
    .await;

    hook.clone()
        .oneshot(webhook("completed", Some(&name)))
        .await
        .unwrap();
    let runners = reconcile_until(&mut reconciler, &state, &ctrl_id, |runners| {
        runners[0].status == RunnerStatus::Finished
    })
    .await;
    assert_eq!(runners[0].id, stored.id);
    assert_eq!(registry.get(&name).await.unwrap().metrics, None);
}

#[tokio::test]
async fn controller_snapshot_is_accepted_by_backend() {
    let state = backend_state();
    let app = fleet_backend::build_router(state.clone());

    let register = Request::builder()
        .method("POST")
        .uri("/api/ctrl/")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"name": "controller-snap01", "api_key": API_KEY}).to_string(),
        ))
        .unwrap();
    let resp = app.clone().oneshot(register).await.unwrap();
    let body: serde_json::Value =
        serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();
    let ctrl_id = body["data"]["ctrl_id"].as_str().unwrap().to_string();
    let token = body["data"]["access_token"].as_str().unwrap().to_string();

    let mut sample = MetricSample::new(1_700_000_000);
    sample.insert("ecs_memory_bytes", 1.5e8);

    let mut busy = Runner::new("linux-busy01", 10);
    busy.status = RunnerStatus::Busy;
    busy.private_address = "10.0.1.7".to_string();
    busy.metrics = Some(sample.clone());

    let mut done = Runner::new("linux-done01", 5);
    done.status = RunnerStatus::Finished;
    done.private_address = "10.0.1.8".to_string();
    done.metrics = Some(sample);

    let creating = Runner::new("linux-new001", 20);

    let request = snapshot("controller-snap01", &[busy, done, creating]);
    let sync = Request::builder()
        .method("POST")
        .uri("/api/runners/")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(serde_json::to_vec(&request).unwrap()))
        .unwrap();
    let resp = app.oneshot(sync).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let user = state.store.get_user("u1").unwrap().unwrap();
    let controller = user.controller(&ctrl_id).unwrap();
    let by_name = |name: &str| {
        controller
            .runners
            .iter()
            .find(|r| r.name == name)
            .unwrap()
            .clone()
    };

    let busy = by_name("linux-busy01");
    assert_eq!(busy.status, RunnerStatus::Busy);
    assert_eq!(busy.private_ipv4, "10.0.1.7");
    assert_eq!(by_name("linux-new001").private_ipv4, "0.0.0.0");
    assert_eq!(by_name("linux-done01").status, RunnerStatus::Finished);

    assert_eq!(state.store.list_metrics_for_runner(&busy.id, 10).unwrap().len(), 1);
    let done = by_name("linux-done01");
    assert!(state.store.list_metrics_for_runner(&done.id, 10).unwrap().is_empty());
}

#[tokio::test]
async fn non_finite_metrics_do_not_block_sync() {
    let state = backend_state();
    let base_url = serve_backend(state.clone()).await;
    let backend = BackendClient::new(&base_url, API_KEY, "controller-nan001").unwrap();
    let ctrl_id = backend.register().await.unwrap().ctrl_id;

    let healthy = serve_exporter(EXPORTER_BODY).await;
    let broken = serve_exporter(NON_FINITE_BODY).await;
    let targets = HashMap::from([
        ("linux-good01".to_string(), format!("127.0.0.1:{healthy}")),
        ("linux-nan001".to_string(), format!("127.0.0.1:{broken}")),
    ]);
    let collection = MetricsCollector::default().collect(targets).await.unwrap();
    assert!(collection.failures.is_empty());

    let runners: Vec<Runner> = collection
        .samples
        .into_iter()
        .map(|(name, sample)| {
            let mut runner = Runner::new(name, 1);
            runner.status = RunnerStatus::Busy;
            runner.private_address = "10.0.1.9".to_string();
            runner.metrics = Some(sample);
            runner
        })
        .collect();
    backend.push(&snapshot(backend.name(), &runners)).await.unwrap();

    let user = state.store.get_user("u1").unwrap().unwrap();
    let stored = &user.controller(&ctrl_id).unwrap().runners;
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|r| r.status == RunnerStatus::Busy));

    let nan_runner = stored.iter().find(|r| r.name == "linux-nan001").unwrap();
    let history = state.store.list_metrics_for_runner(&nan_runner.id, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].values.get("ecs_pids"), Some(&7.0));
    assert!(!history[0].values.contains_key("ecs_memory_bytes"));
}
