//! Controller mode: webhook endpoint plus reconciliation loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use fleet_controller::{
    Broker, CommandProvisioner, ControllerConfig, Credentials, HookState, Provisioner, Reconciler,
    Registry, Settings, Startup, UnsupportedProvisioner, build_router, init,
};
use fleet_metrics::MetricsCollector;

use crate::ControllerArgs;

/// Run the controller until Ctrl-C or a fatal reconciler error.
pub async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let credentials = Credentials::new(
        &args.repo,
        args.github_pat,
        args.api_key,
        &args.backend_url,
    )?;
    let config = match &args.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    info!(owner = %credentials.owner, repo = %credentials.repo, "fleet controller starting");

    let identity = init(&credentials, &Startup::from_env(args.public_address)).await?;
    info!(
        controller = %identity.name,
        ctrl_id = %identity.ctrl_id,
        public_address = %identity.public_address,
        "controller registered"
    );

    let provisioner: Arc<dyn Provisioner> = match args.provision_command {
        Some(cmd) => Arc::new(CommandProvisioner::new(cmd)),
        None => {
            warn!("no provision command configured, queued jobs will stop the controller");
            Arc::new(UnsupportedProvisioner)
        }
    };

    // ── Event path ─────────────────────────────────────────────

    let (broker, broker_handle) = Broker::start(config.broker_capacity);
    let registry = Registry::new();
    let reconciler = Reconciler::new(
        registry.clone(),
        broker.subscribe(),
        MetricsCollector::new(config.collector()),
        identity.backend.clone(),
        provisioner,
        Settings::from(&config),
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stopped_tx, stopped_rx) = oneshot::channel::<()>();

    let reconciler_handle = tokio::spawn(async move {
        let result = reconciler.run(shutdown_rx).await;
        let _ = stopped_tx.send(());
        result
    });

    // ── Webhook server ─────────────────────────────────────────

    let router = build_router(HookState {
        broker,
        registry,
        secret: Some(identity.webhook_secret.clone()),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "webhook server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.expect("failed to install CTRL+C handler");
                    info!("shutdown signal received");
                }
                _ = stopped_rx => warn!("reconciler stopped"),
            }
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let result = reconciler_handle.await?;
    let _ = broker_handle.await;

    info!("fleet controller stopped");
    result.map_err(Into::into)
}
