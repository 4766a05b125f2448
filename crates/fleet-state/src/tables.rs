//! redb table definitions for the backend store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// User aggregates (with embedded controllers and runners) keyed by `{user_id}`.
pub const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Secondary index: `{api_key}` → user id (UTF-8 bytes).
pub const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");

/// Runner metric samples keyed by `{runner_id}:{timestamp:020}`.
pub const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");
