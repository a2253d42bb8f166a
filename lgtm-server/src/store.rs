//! Durable approval counter backed by SQLite.
//!
//! One row per merge request maps its `iid` to the number of approvals seen so
//! far. Both columns hold canonical decimal strings. Rows are created on the
//! first approval and are never deleted or decremented.
//!
//! # Concurrency
//!
//! Every increment runs under a single store-wide lock for the whole
//! read-modify-write transaction, so increments on any merge request are
//! serialized and none is lost.
//!
//! # Durability
//!
//! The database runs in WAL mode with `synchronous = FULL`. An increment that
//! returned `Ok` survives a crash; one interrupted mid-transaction leaves the
//! previously committed count in place.


use std::num::NonZeroU64;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tracing::{info, warn};

/// Current schema version. Increment this when making schema changes and add
/// the corresponding step to `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    /// The increment was computed but could not be committed.
    ///
    /// `count` and `threshold_reached` describe the value that failed to
    /// commit. The stored count is unchanged.
    #[error("failed to commit approval count {count}: {message}")]
    Commit {
        count: u64,
        threshold_reached: bool,
        message: String,
    },
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        StoreError::Storage {
            operation,
            message: message.into(),
        }
    }
}

/// Result of one increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalTally {
    pub count: u64,
    pub threshold_reached: bool,
}

/// True when `count` sits on a multiple of `threshold`.
///
/// The counter is never reset, so this fires again at every further multiple.
pub fn threshold_reached(count: u64, threshold: NonZeroU64) -> bool {
    count % threshold.get() == 0
}

#[derive(Clone)]
pub struct ApprovalStore {
    conn: Arc<Mutex<Connection>>,
}

impl ApprovalStore {
    /// Open (or create) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        #[cfg(unix)]
        if !is_in_memory {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps the rollback journal on filesystems without
        // shared memory support. In-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "SQLite returned '{}' instead of 'wal'; the approval store \
                     requires WAL mode",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS approvals (
                    merge_request TEXT PRIMARY KEY,
                    count TEXT NOT NULL
                );
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        info!("Approval store schema at version {}", CURRENT_SCHEMA_VERSION);
        Ok(())
    }

    /// Record one approval for merge request `iid` and report whether the new
    /// count reaches the threshold.
    ///
    /// Callers must check for an error before acting on the decision; a
    /// [`StoreError::Commit`] still carries it for logging.
    pub async fn increment_and_check(
        &self,
        iid: u64,
        threshold: NonZeroU64,
    ) -> Result<ApprovalTally, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.increment_and_check_blocking(iid, threshold))
            .await
            .map_err(|e| StoreError::storage("increment", e.to_string()))?
    }

    /// Blocking form of [`increment_and_check`](Self::increment_and_check).
    pub fn increment_and_check_blocking(
        &self,
        iid: u64,
        threshold: NonZeroU64,
    ) -> Result<ApprovalTally, StoreError> {
        // A panic inside the critical section drops the transaction, which
        // rolls it back, so a poisoned connection is still consistent.
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::storage("begin transaction", e.to_string()))?;

        let key = iid.to_string();
        let stored = read_count(&tx, &key)?;
        let count = match stored {
            Some(raw) => parse_count(iid, &raw),
            None => 0,
        } + 1;

        tx.execute(
            "INSERT INTO approvals (merge_request, count) VALUES (?1, ?2)
             ON CONFLICT(merge_request) DO UPDATE SET count = excluded.count",
            params![key, count.to_string()],
        )
        .map_err(|e| StoreError::storage("write count", e.to_string()))?;

        let threshold_reached = threshold_reached(count, threshold);

        tx.commit().map_err(|e| StoreError::Commit {
            count,
            threshold_reached,
            message: e.to_string(),
        })?;

        info!(mr = iid, count, "Recorded approval");

        Ok(ApprovalTally {
            count,
            threshold_reached,
        })
    }

    /// Current approval count for `iid` (0 if none recorded).
    pub async fn count(&self, iid: u64) -> Result<u64, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let stored = read_count(&conn, &iid.to_string())?;
            Ok(stored.map(|raw| parse_count(iid, &raw)).unwrap_or(0))
        })
        .await
        .map_err(|e| StoreError::storage("count", e.to_string()))?
    }
}

#[cfg(test)]
impl ApprovalStore {
    /// Run raw SQL against the underlying connection.
    pub(crate) fn execute_batch(&self, sql: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch(sql)
    }
}

fn read_count(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    conn.query_row(
        "SELECT count FROM approvals WHERE merge_request = ?1",
        params![key],
        |row| {
            Ok(match row.get_ref(0)? {
                ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                ValueRef::Integer(i) => i.to_string(),
                other => format!("{:?}", other),
            })
        },
    )
    .optional()
    .map_err(|e| StoreError::storage("read count", e.to_string()))
}

/// Malformed counts restart from zero rather than failing the approval.
fn parse_count(iid: u64, raw: &str) -> u64 {
    match raw.parse::<u64>() {
        Ok(count) => count,
        Err(_) => {
            warn!(mr = iid, value = raw, "Malformed approval count, treating as 0");
            0
        }
    }
}
