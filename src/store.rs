//! Durable, append-only notification storage on SQLite.
//!
//! Every operation opens its own connection on a blocking thread and drops it
//! before returning, so no connection outlives a single call.
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::validation::NewNotification;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service TEXT NOT NULL,
    event TEXT NOT NULL DEFAULT '',
    error INTEGER NOT NULL DEFAULT 0,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_service ON notifications(service);
CREATE INDEX IF NOT EXISTS idx_notifications_created_at ON notifications(created_at);
CREATE INDEX IF NOT EXISTS idx_notifications_error ON notifications(error);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("invalid stored timestamp '{0}'")]
    Timestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub id: i64,
    pub service: String,
    pub event: String,
    pub error: bool,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NotificationStore {
    path: PathBuf,
}

impl NotificationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the table and its indexes when absent. Safe to run on every startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "Database journal mode");
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    /// Writes one record and returns its id. `created_at` is stamped inside the
    /// write transaction so it never goes backwards in insertion order.
    pub async fn insert(&self, notification: NewNotification) -> Result<i64, StoreError> {
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let created_at = Utc::now().format(TIMESTAMP_FORMAT).to_string();
            tx.execute(
                "INSERT INTO notifications (service, event, error, message, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    notification.service,
                    notification.event,
                    notification.error,
                    notification.message,
                    created_at
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<NotificationRecord>, StoreError> {
        let row = self
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT id, service, event, error, message, created_at \
                     FROM notifications WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;

        row.map(
            |(id, service, event, error, message, created_at)| -> Result<_, StoreError> {
                Ok(NotificationRecord {
                    id,
                    service,
                    event,
                    error,
                    message,
                    created_at: parse_timestamp(&created_at)?,
                })
            },
        )
        .transpose()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        self.with_connection(|conn| {
            conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))
                .map_err(StoreError::from)
        })
        .await
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            f(&mut conn)
        })
        .await?
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| StoreError::Timestamp(raw.to_string()))
}
