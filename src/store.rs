//! SQLite-backed persistence
//!
//! Sessions are stored as one JSON record per user next to the admin's ban
//! list. The connection is shared behind a mutex and every query runs on
//! the blocking pool.

mod schema;

use crate::ids::UserId;
use crate::runtime::{BanList, BannedUser, SessionStore, StoreError};
use crate::state_machine::UserSession;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use schema::SCHEMA;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Thread-safe database handle
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::with_connection(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "Session store ready");
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn query<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load(&self, user_id: UserId) -> Result<Option<UserSession>, StoreError> {
        let record = self
            .query(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT record FROM sessions WHERE user_id = ?1",
                        params![user_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?)
            })
            .await?;
        match record {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, session: &UserSession) -> Result<(), StoreError> {
        let user_id = session.user_id;
        let record = serde_json::to_string(session)?;
        self.query(move |conn| {
            conn.execute(
                "INSERT INTO sessions (user_id, record, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET record = excluded.record,
                                                    updated_at = excluded.updated_at",
                params![user_id, record, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, user_id: UserId) -> Result<(), StoreError> {
        self.query(move |conn| {
            conn.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BanList for SqliteStore {
    async fn ban(&self, user_id: UserId, reason: &str) -> Result<(), StoreError> {
        let reason = reason.to_string();
        self.query(move |conn| {
            conn.execute(
                "INSERT INTO banned_users (user_id, reason, banned_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET reason = excluded.reason",
                params![user_id, reason, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn unban(&self, user_id: UserId) -> Result<bool, StoreError> {
        self.query(move |conn| {
            let removed =
                conn.execute("DELETE FROM banned_users WHERE user_id = ?1", params![user_id])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn ban_reason(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        self.query(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT reason FROM banned_users WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn banned(&self) -> Result<Vec<BannedUser>, StoreError> {
        self.query(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id, reason FROM banned_users ORDER BY banned_at, user_id")?;
            let rows = stmt.query_map([], |row| {
                Ok(BannedUser {
                    user_id: row.get(0)?,
                    reason: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}
