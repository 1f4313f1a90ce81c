//! Account and call-log collaborator.
//!
//! The relay core only needs a narrow view of the account system: resolve a
//! session token to a peer id, look up a profile, flip the persisted online
//! flag, and append to the call log. `AccountStore` is that seam.
//!
//! Two backends:
//! - [`Detached`]: no persistence. Tokens never verify, writes are dropped.
//! - [`SqliteAccounts`]: SQLite file (or in-memory for tests). Session tokens
//!   are stored as SHA-256 digests, never in clear.
//!
//! Failures from either backend are non-fatal to signaling; callers log them.
//! Writes issued by the relay core go through [`AccountWriter`], which applies
//! them in order on the blocking pool.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::PeerId;

/// Errors from the account store.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("account task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, AccountError>;

/// Run a store query on the blocking pool.
pub async fn run_blocking<T, F>(store: Arc<dyn AccountStore>, query: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn AccountStore) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || query(store.as_ref())).await?
}

/// Public profile data for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// One row of a user's call history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub caller_id: String,
    pub callee_id: String,
    pub duration_secs: u64,
    pub ended_at: String,
}

/// The account-system operations the relay depends on.
pub trait AccountStore: Send + Sync {
    /// Resolve a session token to a peer id.
    fn verify_identity(&self, token: &str) -> Result<Option<PeerId>>;

    fn fetch_profile(&self, peer: &str) -> Result<Option<Profile>>;

    /// Append a finished call to the log.
    fn record_call(&self, caller: &str, callee: &str, duration_secs: u64) -> Result<()>;

    fn set_online(&self, peer: &str, online: bool) -> Result<()>;

    /// Most recent calls involving `peer`, newest first.
    fn call_history(&self, peer: &str, limit: usize) -> Result<Vec<CallRecord>>;
}

/// Store used when no database is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl AccountStore for Detached {
    fn verify_identity(&self, _token: &str) -> Result<Option<PeerId>> {
        Ok(None)
    }

    fn fetch_profile(&self, _peer: &str) -> Result<Option<Profile>> {
        Ok(None)
    }

    fn record_call(&self, caller: &str, callee: &str, duration_secs: u64) -> Result<()> {
        tracing::debug!(caller, callee, duration_secs, "Call log not persisted (detached)");
        Ok(())
    }

    fn set_online(&self, _peer: &str, _online: bool) -> Result<()> {
        Ok(())
    }

    fn call_history(&self, _peer: &str, _limit: usize) -> Result<Vec<CallRecord>> {
        Ok(Vec::new())
    }
}

/// A write the relay core hands off to the account store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountWrite {
    Online {
        peer: PeerId,
        online: bool,
    },
    Call {
        caller: PeerId,
        callee: PeerId,
        duration_secs: u64,
    },
}

impl AccountWrite {
    fn apply(self, store: &dyn AccountStore) {
        match self {
            AccountWrite::Online { peer, online } => {
                if let Err(e) = store.set_online(&peer, online) {
                    tracing::warn!(peer = peer.as_str(), online, error = %e, "Failed to persist online flag");
                }
            }
            AccountWrite::Call {
                caller,
                callee,
                duration_secs,
            } => {
                if let Err(e) = store.record_call(&caller, &callee, duration_secs) {
                    tracing::warn!(
                        caller = caller.as_str(),
                        callee = callee.as_str(),
                        error = %e,
                        "Failed to record call"
                    );
                }
            }
        }
    }
}

/// Ordered write queue in front of an `AccountStore`.
///
/// Inside a Tokio runtime a worker task drains the queue and runs each write
/// through `spawn_blocking`, one at a time. Outside a runtime writes are
/// applied inline.
#[derive(Clone)]
pub struct AccountWriter {
    store: Arc<dyn AccountStore>,
    queue: Option<mpsc::UnboundedSender<AccountWrite>>,
}

impl AccountWriter {
    pub fn start(store: Arc<dyn AccountStore>) -> Self {
        let queue = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let (tx, mut rx) = mpsc::unbounded_channel::<AccountWrite>();
            let worker_store = store.clone();
            handle.spawn(async move {
                while let Some(write) = rx.recv().await {
                    let store = worker_store.clone();
                    let applied =
                        tokio::task::spawn_blocking(move || write.apply(store.as_ref())).await;
                    if let Err(e) = applied {
                        tracing::error!(error = %e, "Account write task failed");
                    }
                }
            });
            tx
        });
        Self { store, queue }
    }

    pub fn submit(&self, write: AccountWrite) {
        match &self.queue {
            Some(queue) => {
                // Worker gone (runtime shutting down): fall back to inline.
                if let Err(mpsc::error::SendError(write)) = queue.send(write) {
                    write.apply(self.store.as_ref());
                }
            }
            None => write.apply(self.store.as_ref()),
        }
    }
}

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS users (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    username    TEXT UNIQUE NOT NULL,
    avatar_url  TEXT,
    created_at  TEXT NOT NULL,
    last_seen   TEXT NOT NULL,
    is_online   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sessions (
    token_hash  TEXT PRIMARY KEY,
    user_id     INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users (id)
);

CREATE TABLE IF NOT EXISTS calls_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    caller_id   TEXT NOT NULL,
    callee_id   TEXT NOT NULL,
    duration    INTEGER NOT NULL,
    end_time    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_username ON users (username);
CREATE INDEX IF NOT EXISTS idx_calls_log_caller ON calls_log (caller_id);
CREATE INDEX IF NOT EXISTS idx_calls_log_callee ON calls_log (callee_id);
";

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// SQLite-backed account store.
#[derive(Clone)]
pub struct SqliteAccounts {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAccounts {
    /// Open or create the database. `None` opens an in-memory database.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(CREATE_TABLES)?;

        tracing::info!(path = path.unwrap_or(":memory:"), "Account store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a user and return its peer id.
    pub fn create_user(&self, username: &str, avatar_url: Option<&str>) -> Result<PeerId> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (username, avatar_url, created_at, last_seen) VALUES (?1, ?2, ?3, ?3)",
            params![username, avatar_url, now],
        )?;
        Ok(conn.last_insert_rowid().to_string())
    }

    /// Issue a fresh session token for `user_id`. Only the digest is stored.
    pub fn issue_session(&self, user_id: &str) -> Result<String> {
        let token = Uuid::new_v4().simple().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![hash_token(&token), user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(token)
    }

    /// Persisted online flag, if the user exists.
    pub fn is_online(&self, user_id: &str) -> Result<Option<bool>> {
        let conn = self.conn.lock();
        let flag = conn
            .query_row(
                "SELECT is_online FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(flag.map(|v| v != 0))
    }
}

impl AccountStore for SqliteAccounts {
    fn verify_identity(&self, token: &str) -> Result<Option<PeerId>> {
        let conn = self.conn.lock();
        let user_id = conn
            .query_row(
                "SELECT s.user_id FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token_hash = ?1",
                params![hash_token(token)],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(user_id.map(|id| id.to_string()))
    }

    fn fetch_profile(&self, peer: &str) -> Result<Option<Profile>> {
        let conn = self.conn.lock();
        let profile = conn
            .query_row(
                "SELECT username, avatar_url FROM users WHERE id = ?1",
                params![peer],
                |row| {
                    Ok(Profile {
                        display_name: row.get(0)?,
                        avatar_url: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    fn record_call(&self, caller: &str, callee: &str, duration_secs: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO calls_log (caller_id, callee_id, duration, end_time) VALUES (?1, ?2, ?3, ?4)",
            params![caller, callee, duration_secs as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn set_online(&self, peer: &str, online: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET is_online = ?1, last_seen = ?2 WHERE id = ?3",
            params![online, Utc::now().to_rfc3339(), peer],
        )?;
        Ok(())
    }

    fn call_history(&self, peer: &str, limit: usize) -> Result<Vec<CallRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT caller_id, callee_id, duration, end_time FROM calls_log
             WHERE caller_id = ?1 OR callee_id = ?1
             ORDER BY end_time DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![peer, limit as i64], |row| {
            Ok(CallRecord {
                caller_id: row.get(0)?,
                callee_id: row.get(1)?,
                duration_secs: row.get::<_, i64>(2)?.max(0) as u64,
                ended_at: row.get(3)?,
            })
        })?;
        let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
