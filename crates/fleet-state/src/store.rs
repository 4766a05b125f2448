//! StateStore — redb-backed persistence for the backend.
//!
//! Provides typed operations over user aggregates and runner metric
//! samples. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(StateError::Open)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(StateError::Open)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        txn.open_table(USERS)?;
        txn.open_table(API_KEYS)?;
        txn.open_table(METRICS)?;
        txn.commit()?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────

    /// Insert a new user. Fails if the API key already belongs to someone else.
    pub fn create_user(&self, user: &UserRecord) -> StateResult<()> {
        let value = serde_json::to_vec(user).map_err(StateError::Encode)?;
        let txn = self.db.begin_write()?;
        {
            let mut keys = txn.open_table(API_KEYS)?;
            if keys.get(user.api_key.as_str())?.is_some() {
                return Err(StateError::Conflict("api key already in use".to_string()));
            }
            keys.insert(user.api_key.as_str(), user.id.as_bytes())?;

            let mut users = txn.open_table(USERS)?;
            users.insert(user.id.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        debug!(user_id = %user.id, "user stored");
        Ok(())
    }

    /// Get a user aggregate by id.
    pub fn get_user(&self, user_id: &str) -> StateResult<Option<UserRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(USERS)?;
        match table.get(user_id)? {
            Some(guard) => {
                let user: UserRecord =
                    serde_json::from_slice(guard.value()).map_err(StateError::Corrupt)?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    /// Resolve the user owning an API key.
    pub fn find_user_by_api_key(&self, api_key: &str) -> StateResult<Option<UserRecord>> {
        let user_id = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(API_KEYS)?;
            match table.get(api_key)? {
                Some(guard) => String::from_utf8_lossy(guard.value()).into_owned(),
                None => return Ok(None),
            }
        };
        self.get_user(&user_id)
    }

    /// List all users.
    pub fn list_users(&self) -> StateResult<Vec<UserRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(USERS)?;
        let mut results = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let user: UserRecord =
                serde_json::from_slice(value.value()).map_err(StateError::Corrupt)?;
            results.push(user);
        }
        Ok(results)
    }

    /// Read-modify-write a user aggregate inside one write transaction.
    ///
    /// redb admits a single writer at a time, so two controllers of the same
    /// user syncing concurrently are applied one after the other. If `f`
    /// returns an error nothing is written.
    pub fn update_user<R, F>(&self, user_id: &str, f: F) -> StateResult<R>
    where
        F: FnOnce(&mut UserRecord) -> StateResult<R>,
    {
        let txn = self.db.begin_write()?;
        let result = {
            let mut table = txn.open_table(USERS)?;
            let mut user: UserRecord = match table.get(user_id)? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(StateError::Corrupt)?
                }
                None => return Err(StateError::NotFound(format!("user {user_id}"))),
            };

            let result = f(&mut user)?;
            user.updated_at = epoch_secs();

            let value = serde_json::to_vec(&user).map_err(StateError::Encode)?;
            table.insert(user_id, value.as_slice())?;
            result
        };
        txn.commit()?;
        debug!(%user_id, "user aggregate updated");
        Ok(result)
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Insert a batch of metric samples in one transaction, then drop all
    /// but the newest `keep` samples of every runner in the batch.
    pub fn put_metrics(&self, samples: &[StoredMetric], keep: usize) -> StateResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        let mut trimmed = 0;
        {
            let mut table = txn.open_table(METRICS)?;
            for sample in samples {
                let key = sample.table_key();
                let value = serde_json::to_vec(sample).map_err(StateError::Encode)?;
                table.insert(key.as_str(), value.as_slice())?;
            }

            let runners: BTreeSet<&str> = samples.iter().map(|s| s.runner_id.as_str()).collect();
            for runner_id in runners {
                let (start, end) = runner_bounds(runner_id);
                let mut keys = Vec::new();
                for entry in table.range::<&str>(start.as_str()..end.as_str())? {
                    let (key, _) = entry?;
                    keys.push(key.value().to_string());
                }
                keys.truncate(keys.len().saturating_sub(keep));
                for key in &keys {
                    table.remove(key.as_str())?;
                }
                trimmed += keys.len();
            }
        }
        txn.commit()?;
        debug!(count = samples.len(), trimmed, "metric samples stored");
        Ok(())
    }

    /// Get the most recent `limit` samples for a runner, oldest first.
    ///
    /// Only the runner's own key range is read.
    pub fn list_metrics_for_runner(
        &self,
        runner_id: &str,
        limit: usize,
    ) -> StateResult<Vec<StoredMetric>> {
        let (start, end) = runner_bounds(runner_id);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(METRICS)?;
        let mut results = Vec::new();
        for entry in table
            .range::<&str>(start.as_str()..end.as_str())?
            .rev()
            .take(limit)
        {
            let (_, value) = entry?;
            let sample: StoredMetric =
                serde_json::from_slice(value.value()).map_err(StateError::Corrupt)?;
            results.push(sample);
        }
        results.reverse();
        Ok(results)
    }
}

/// Key range `[{runner_id}:, {runner_id};)` holding exactly one runner's samples.
fn runner_bounds(runner_id: &str) -> (String, String) {
    (format!("{runner_id}:"), format!("{runner_id};"))
}
