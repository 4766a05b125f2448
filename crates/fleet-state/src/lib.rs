//! fleet-state — shared domain types and backend persistence.
//!
//! Holds the runner lifecycle (`RunnerStatus`), the typed metric sample,
//! the JSON wire format exchanged between a controller and the backend,
//! and the [redb](https://docs.rs/redb)-backed `StateStore` the backend
//! keeps its user aggregates in.
//!
//! # Architecture
//!
//! ```text
//! UserRecord (one redb row, JSON)
//!   └── controllers: [ControllerRecord]
//!         └── runners: [StoredRunner]      merge key: name
//!
//! StoredMetric rows keyed by {runner_id}:{timestamp}
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).
//! `StateStore::update_user` runs a read-modify-write inside a single redb
//! write transaction, so concurrent merges for the same user serialize.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod wire;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
pub use wire::*;
