//! fleet-backend — the central registry controllers sync into.
//!
//! Controllers register with a user's API key and receive a bearer token
//! bound to their controller record. Every sync merges the controller's
//! full snapshot into the user aggregate in one store transaction, stores
//! any metric samples, and pushes fresh views to the user's UI sessions.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/ctrl/` | Register a controller, get a token |
//! | POST | `/api/runners/` | Sync a controller's runner snapshot |

pub mod auth;
pub mod error;
pub mod handlers;
pub mod merge;
pub mod notify;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::post;
use fleet_state::StateStore;

pub use auth::{Claims, TokenIssuer};
pub use error::{BackendError, BackendResult};
pub use merge::DEFAULT_RETENTION;
pub use notify::{BroadcastNotifier, PushEvent, PushNotifier};

/// Samples per runner included in a `metrics` push.
pub const DEFAULT_METRICS_HISTORY: usize = 60;

/// Samples kept per runner in the store, one hour at the default tick.
pub const DEFAULT_METRICS_RETENTION: usize = 1800;

/// Shared state for backend handlers.
#[derive(Clone)]
pub struct BackendState {
    pub store: StateStore,
    pub tokens: Arc<TokenIssuer>,
    pub notifier: Arc<dyn PushNotifier>,
    /// Idle controllers older than this are pruned on sync.
    pub retention: Duration,
    pub metrics_history: usize,
    /// Stored samples per runner; older ones are dropped on insert.
    pub metrics_retention: usize,
}

impl BackendState {
    pub fn new(store: StateStore, tokens: TokenIssuer, notifier: Arc<dyn PushNotifier>) -> Self {
        Self {
            store,
            tokens: Arc::new(tokens),
            notifier,
            retention: DEFAULT_RETENTION,
            metrics_history: DEFAULT_METRICS_HISTORY,
            metrics_retention: DEFAULT_METRICS_RETENTION,
        }
    }
}

/// Build the backend router.
pub fn build_router(state: BackendState) -> Router {
    let api = Router::new()
        .route("/ctrl/", post(handlers::register_controller))
        .route("/runners/", post(handlers::sync_runners))
        .with_state(state);

    Router::new().nest("/api", api)
}
