//! Reconciliation loop.
//!
//! [`init`] brings a controller up: it registers with the backend, works
//! out the controller's address, and points the repository webhook at it.
//! [`Reconciler::run`] then ticks on a fixed interval. Each tick either
//! handles one pending webhook event and then polls, or just polls:
//!
//! ```text
//! event?  ── queued ──► create runner(s) ─► sync ─► spawn provisioning
//!    │                                              └► ready + sync
//!    └─ job update ──► busy / finished / failed
//! poll    ── sweep ─► collect metrics ─► apply outcomes ─► sync
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleet_metrics::{Collection, MetricsCollector, ScrapeFailure};
use fleet_state::{RunnerStatus, epoch_secs};

use crate::config::{ControllerConfig, Credentials};
use crate::error::{ControllerError, ControllerResult};
use crate::event::{JobAction, WorkflowJobEvent};
use crate::github::WebhookRegistrar;
use crate::hook::WebhookSecret;
use crate::platform;
use crate::provisioner::Provisioner;
use crate::registry::{Registry, Timeouts, random_suffix};
use crate::sync::{BackendClient, snapshot};

/// Prefix of every runner name this controller creates.
pub const RUNNER_PREFIX: &str = "linux-";

/// Inputs to [`init`].
#[derive(Debug, Clone, Default)]
pub struct Startup {
    /// Address the webhook should target. Skips metadata lookup when set.
    pub public_address: Option<String>,
    pub metadata_v4: Option<String>,
    pub metadata_v3: Option<String>,
    /// GitHub API root; the public API when unset.
    pub github_api: Option<String>,
}

impl Startup {
    /// Read the metadata endpoints from the process environment.
    pub fn from_env(public_address: Option<String>) -> Self {
        Self {
            public_address,
            metadata_v4: std::env::var(platform::METADATA_V4_ENV).ok(),
            metadata_v3: std::env::var(platform::METADATA_V3_ENV).ok(),
            github_api: None,
        }
    }
}

/// A registered controller.
#[derive(Debug)]
pub struct Identity {
    pub name: String,
    pub ctrl_id: String,
    pub public_address: String,
    pub backend: Arc<BackendClient>,
    /// Key the webhook intake verifies deliveries against.
    pub webhook_secret: WebhookSecret,
}

/// Bring the controller up. Every failure except webhook registration is
/// fatal.
pub async fn init(credentials: &Credentials, startup: &Startup) -> ControllerResult<Identity> {
    let name = format!("controller-{}", random_suffix(6));
    info!(controller = %name, "controller starting");

    let backend = Arc::new(BackendClient::new(
        &credentials.backend_url,
        &credentials.api_key,
        &name,
    )?);
    let registered = backend.register().await?;

    let public_address = platform::resolve_public_address(
        startup.public_address.as_deref(),
        startup.metadata_v4.as_deref(),
        startup.metadata_v3.as_deref(),
    )
    .await?;

    let registrar = match &startup.github_api {
        Some(base) => WebhookRegistrar::with_api_base(credentials, base)?,
        None => WebhookRegistrar::new(credentials)?,
    };
    if let Err(e) = registrar.ensure_webhook(&public_address).await {
        error!(error = %e, "webhook registration failed, events will not arrive until fixed");
    }

    Ok(Identity {
        name,
        ctrl_id: registered.ctrl_id,
        public_address,
        backend,
        webhook_secret: registrar.secret().clone(),
    })
}

/// Loop tuning.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tick: Duration,
    pub markers: Vec<String>,
    pub timeouts: Timeouts,
    pub rollback_after_misses: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

impl From<&ControllerConfig> for Settings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            tick: config.tick(),
            markers: config.markers.clone(),
            timeouts: config.timeouts(),
            rollback_after_misses: config.rollback_after_misses,
        }
    }
}

/// Pushes the registry's current snapshot. Failures are logged only.
#[derive(Debug, Clone)]
struct Syncer {
    registry: Registry,
    backend: Arc<BackendClient>,
}

impl Syncer {
    async fn push(&self) {
        let request = snapshot(self.backend.name(), &self.registry.all().await);
        if let Err(e) = self.backend.push(&request).await {
            warn!(error = %e, runners = request.runners.len(), "state sync failed");
        }
    }
}

/// Drives one controller's fleet.
pub struct Reconciler {
    registry: Registry,
    events: mpsc::Receiver<WorkflowJobEvent>,
    collector: MetricsCollector,
    provisioner: Arc<dyn Provisioner>,
    syncer: Syncer,
    settings: Settings,
    fatal_tx: mpsc::UnboundedSender<ControllerError>,
    fatal_rx: mpsc::UnboundedReceiver<ControllerError>,
}

impl Reconciler {
    pub fn new(
        registry: Registry,
        events: mpsc::Receiver<WorkflowJobEvent>,
        collector: MetricsCollector,
        backend: Arc<BackendClient>,
        provisioner: Arc<dyn Provisioner>,
        settings: Settings,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            syncer: Syncer {
                registry: registry.clone(),
                backend,
            },
            registry,
            events,
            collector,
            provisioner,
            settings,
            fatal_tx,
            fatal_rx,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Tick until `shutdown` flips or a fatal error occurs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ControllerResult<()> {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(tick = ?self.settings.tick, markers = ?self.settings.markers, "reconciler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile().await {
                        if e.is_fatal() {
                            error!(error = %e, "reconciler stopping");
                            return Err(e);
                        }
                        warn!(error = %e, "reconcile tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// One tick.
    pub async fn reconcile(&mut self) -> ControllerResult<()> {
        if let Ok(e) = self.fatal_rx.try_recv() {
            return Err(e);
        }

        match self.events.try_recv() {
            Ok(event) => {
                self.handle_event(event).await;
                self.poll().await
            }
            Err(mpsc::error::TryRecvError::Empty) => self.poll().await,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                debug!("event stream closed");
                self.poll().await
            }
        }
    }

    async fn handle_event(&self, event: WorkflowJobEvent) {
        info!(action = ?event.action, runner = %event.runner_name, labels = ?event.labels, "workflow job event");

        let next = match event.action {
            JobAction::Queued => {
                for label in &event.labels {
                    if self.settings.markers.iter().any(|m| m == label) {
                        self.spawn_runner().await;
                    }
                }
                return;
            }
            JobAction::InProgress | JobAction::Other => RunnerStatus::Busy,
            JobAction::Completed => RunnerStatus::Finished,
            JobAction::Failed => RunnerStatus::Failed,
        };

        if !self.registry.contains(&event.runner_name).await {
            info!(runner = %event.runner_name, "runner not owned by this controller, skipping");
            return;
        }
        if self.registry.advance(&event.runner_name, next, epoch_secs()).await {
            debug!(runner = %event.runner_name, status = %next, "runner status updated");
        }
    }

    async fn spawn_runner(&self) {
        let name = self.registry.create(RUNNER_PREFIX, epoch_secs()).await;
        info!(runner = %name, "runner requested");
        self.syncer.push().await;

        let provisioner = self.provisioner.clone();
        let syncer = self.syncer.clone();
        let fatal_tx = self.fatal_tx.clone();
        tokio::spawn(async move {
            match provisioner.provision(&name).await {
                Ok(address) => {
                    syncer
                        .registry
                        .mark_provisioned(&name, &address, epoch_secs())
                        .await;
                    syncer.push().await;
                }
                Err(e) if e.is_fatal() => {
                    error!(runner = %name, error = %e, "provisioning unavailable");
                    let _ = fatal_tx.send(e);
                }
                Err(e) => {
                    error!(runner = %name, error = %e, "provisioning failed");
                }
            }
        });
    }

    async fn poll(&self) -> ControllerResult<()> {
        let now = epoch_secs();
        self.registry.sweep(now, &self.settings.timeouts).await;

        let targets = self.registry.scrape_targets().await;
        let collection = self.collector.collect(targets).await?;
        self.apply(collection, now).await;

        self.syncer.push().await;
        Ok(())
    }

    /// Fold one round of scrape outcomes into the registry. Timeouts count
    /// towards a rollback, a vanished interface finishes the runner, and a
    /// refused or otherwise failed scrape leaves it alone.
    async fn apply(&self, collection: Collection, now: u64) {
        for (name, sample) in collection.samples {
            self.registry.record_sample(&name, sample).await;
        }
        for (name, failure) in collection.failures {
            match failure {
                ScrapeFailure::Timeout => {
                    self.registry
                        .record_timeout(&name, self.settings.rollback_after_misses, now)
                        .await;
                }
                ScrapeFailure::Unreachable => {
                    if self.registry.advance(&name, RunnerStatus::Finished, now).await {
                        info!(runner = %name, "runner unreachable, marked finished");
                    }
                }
                ScrapeFailure::Refused | ScrapeFailure::Other(_) => {}
            }
        }
    }
}
