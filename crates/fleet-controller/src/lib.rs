//! fleet-controller — reconciles one repository's ephemeral runner fleet.
//!
//! Receives `workflow_job` webhooks, provisions a runner for every queued
//! job that asks for one, follows each runner through its lifecycle,
//! scrapes runner metrics, and mirrors the whole fleet to the backend.
//!
//! # Architecture
//!
//! ```text
//! POST /ecs_runner_hook ──► Broker ──► Reconciler (tick)
//!                                        ├── Registry (RwLock, sweep)
//!                                        ├── Provisioner (spawned per runner)
//!                                        ├── MetricsCollector (fleet-metrics)
//!                                        └── BackendClient ──► POST /api/runners/
//! ```
//!
//! The broker decouples webhook intake from processing: a burst of
//! webhooks never blocks the HTTP handler, and the reconciler picks up at
//! most one event per tick.

pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod github;
pub mod hook;
pub mod platform;
pub mod provisioner;
pub mod reconciler;
pub mod registry;
pub mod sync;

pub use broker::{Broker, BrokerStats, StatsSnapshot};
pub use config::{ControllerConfig, Credentials, parse_duration};
pub use error::{ControllerError, ControllerResult};
pub use event::{JobAction, WebhookPayload, WorkflowJobEvent};
pub use github::WebhookRegistrar;
pub use hook::{HookState, WebhookSecret, build_router};
pub use provisioner::{CommandProvisioner, Provisioner, UnsupportedProvisioner};
pub use reconciler::{Identity, Reconciler, Settings, Startup, init};
pub use registry::{Registry, Runner, SweepAction, Timeouts, sweep};
pub use sync::{BackendClient, snapshot};
