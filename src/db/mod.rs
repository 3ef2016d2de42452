pub mod connections;
pub mod retry_queue;
pub mod sent_orders;
pub mod sync_log;

use std::sync::{Arc, Mutex};

use rusqlite::Connection as SqliteConnection;
use thiserror::Error;
use tokio::task;

pub use connections::{Connection, ConnectionRepo};
pub use retry_queue::{RetryItem, RetryItemStatus, RetryQueueRepo};
pub use sent_orders::SentOrderRepo;
pub use sync_log::{SyncLog, SyncLogRepo};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database worker task failed: {0}")]
    Join(#[from] task::JoinError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Single shared SQLite handle. The engine is the sole writer; WAL mode
/// lets the external CLI read connection/retry rows concurrently without
/// blocking a cycle in progress.
pub struct Db {
    conn: Mutex<SqliteConnection>,
}

impl Db {
    pub fn open(path: &str) -> Result<Arc<Self>, PersistenceError> {
        let conn = SqliteConnection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        ensure_schema(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Arc<Self>, PersistenceError> {
        let conn = SqliteConnection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        ensure_schema(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&SqliteConnection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock().expect("db mutex poisoned");
        f(&conn)
    }
}

fn ensure_schema(conn: &SqliteConnection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS connections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            base_url TEXT NOT NULL,
            db_name TEXT NOT NULL,
            login TEXT NOT NULL,
            api_key TEXT NOT NULL,
            webhook_url TEXT NOT NULL,
            webhook_secret TEXT NOT NULL,
            poll_interval_seconds INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_sync_at TEXT,
            last_success_at TEXT,
            cb_state TEXT NOT NULL DEFAULT 'closed',
            cb_consecutive_failures INTEGER NOT NULL DEFAULT 0,
            cb_open_until TEXT,
            cb_halfopen_successes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sent_orders (
            connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
            odoo_order_id INTEGER NOT NULL,
            write_date TEXT NOT NULL,
            delivered_at TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            PRIMARY KEY (connection_id, odoo_order_id, write_date)
        );

        CREATE TABLE IF NOT EXISTS retry_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
            odoo_order_id INTEGER NOT NULL,
            payload_snapshot TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at TEXT NOT NULL,
            last_error TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_retry_queue_due
            ON retry_queue (connection_id, status, next_attempt_at);

        CREATE TABLE IF NOT EXISTS sync_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            orders_found INTEGER NOT NULL DEFAULT 0,
            orders_sent INTEGER NOT NULL DEFAULT 0,
            orders_failed INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sync_logs_connection
            ON sync_logs (connection_id, started_at DESC);
        ",
    )
}

pub(crate) async fn blocking<T, F>(db: Arc<Db>, f: F) -> Result<T, PersistenceError>
where
    F: FnOnce(&Db) -> Result<T, PersistenceError> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(move || f(&db)).await?
}
