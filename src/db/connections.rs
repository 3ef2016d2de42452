use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::crypto::FieldEncryptor;

use super::{Db, PersistenceError, blocking};

/// A configured Odoo instance the engine polls. Credentials are decrypted
/// on the way out of the repository and encrypted on the way in — callers
/// never see the ciphertext form.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub db_name: String,
    pub login: String,
    pub api_key: String,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub poll_interval_seconds: i64,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub circuit_breaker: CircuitBreaker,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct ConnectionRow {
    id: i64,
    name: String,
    base_url: String,
    db_name: String,
    login: String,
    api_key_ciphertext: String,
    webhook_url: String,
    webhook_secret_ciphertext: String,
    poll_interval_seconds: i64,
    enabled: bool,
    last_sync_at: Option<String>,
    last_success_at: Option<String>,
    cb_state: String,
    cb_consecutive_failures: u32,
    cb_open_until: Option<String>,
    cb_halfopen_successes: u32,
    created_at: String,
    updated_at: String,
}

const SELECT_COLUMNS: &str = "id, name, base_url, db_name, login, api_key, webhook_url, \
    webhook_secret, poll_interval_seconds, enabled, last_sync_at, last_success_at, \
    cb_state, cb_consecutive_failures, cb_open_until, cb_halfopen_successes, created_at, updated_at";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRow> {
    Ok(ConnectionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        base_url: row.get(2)?,
        db_name: row.get(3)?,
        login: row.get(4)?,
        api_key_ciphertext: row.get(5)?,
        webhook_url: row.get(6)?,
        webhook_secret_ciphertext: row.get(7)?,
        poll_interval_seconds: row.get(8)?,
        enabled: row.get(9)?,
        last_sync_at: row.get(10)?,
        last_success_at: row.get(11)?,
        cb_state: row.get(12)?,
        cb_consecutive_failures: row.get(13)?,
        cb_open_until: row.get(14)?,
        cb_halfopen_successes: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_optional_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.map(parse_timestamp)
}

#[derive(Clone)]
pub struct ConnectionRepo {
    db: Arc<Db>,
    encryptor: Arc<FieldEncryptor>,
    cb_config: CircuitBreakerConfig,
}

impl ConnectionRepo {
    pub fn new(db: Arc<Db>, encryptor: Arc<FieldEncryptor>, cb_config: CircuitBreakerConfig) -> Self {
        Self {
            db,
            encryptor,
            cb_config,
        }
    }

    fn decrypt_row(&self, row: ConnectionRow) -> Result<Connection, PersistenceError> {
        let api_key = self.encryptor.decrypt(&row.api_key_ciphertext)?;
        let webhook_secret = self.encryptor.decrypt(&row.webhook_secret_ciphertext)?;
        let circuit_breaker = CircuitBreaker::new(
            CircuitState::parse(&row.cb_state),
            row.cb_consecutive_failures,
            parse_optional_timestamp(row.cb_open_until.as_deref()),
            row.cb_halfopen_successes,
            self.cb_config,
        );

        Ok(Connection {
            id: row.id,
            name: row.name,
            base_url: row.base_url,
            db_name: row.db_name,
            login: row.login,
            api_key,
            webhook_url: row.webhook_url,
            webhook_secret,
            poll_interval_seconds: row.poll_interval_seconds,
            enabled: row.enabled,
            last_sync_at: parse_optional_timestamp(row.last_sync_at.as_deref()),
            last_success_at: parse_optional_timestamp(row.last_success_at.as_deref()),
            circuit_breaker,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }

    pub async fn list_enabled(&self) -> Result<Vec<Connection>, PersistenceError> {
        let rows = blocking(self.db.clone(), |db| {
            db.with_conn(|conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM connections WHERE enabled = 1 ORDER BY id"
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map([], map_row)?.collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(PersistenceError::from)
        })
        .await?;

        rows.into_iter().map(|row| self.decrypt_row(row)).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<Connection>, PersistenceError> {
        let rows = blocking(self.db.clone(), |db| {
            db.with_conn(|conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM connections ORDER BY id");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map([], map_row)?.collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(PersistenceError::from)
        })
        .await?;

        rows.into_iter().map(|row| self.decrypt_row(row)).collect()
    }

    pub async fn get(&self, id: i64) -> Result<Connection, PersistenceError> {
        let row = blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM connections WHERE id = ?1");
                conn.query_row(&sql, params![id], map_row).optional()
            })
            .map_err(PersistenceError::from)
        })
        .await?
        .ok_or_else(|| PersistenceError::NotFound(format!("connection {id}")))?;

        self.decrypt_row(row)
    }

    /// Insert a new connection, encrypting `api_key` and `webhook_secret`
    /// before they ever touch disk. Returns the new row id.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        name: &str,
        base_url: &str,
        db_name: &str,
        login: &str,
        api_key: &str,
        webhook_url: &str,
        webhook_secret: &str,
        poll_interval_seconds: i64,
    ) -> Result<i64, PersistenceError> {
        let api_key_ciphertext = self.encryptor.encrypt(api_key)?;
        let webhook_secret_ciphertext = self.encryptor.encrypt(webhook_secret)?;
        let name = name.to_string();
        let base_url = base_url.to_string();
        let db_name = db_name.to_string();
        let login = login.to_string();
        let webhook_url = webhook_url.to_string();
        let now = Utc::now().to_rfc3339();

        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO connections (
                        name, base_url, db_name, login, api_key, webhook_url, webhook_secret,
                        poll_interval_seconds, enabled, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)",
                    params![
                        name,
                        base_url,
                        db_name,
                        login,
                        api_key_ciphertext,
                        webhook_url,
                        webhook_secret_ciphertext,
                        poll_interval_seconds,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    /// Commits the cycle's `last_sync_at`/`last_success_at` advancement
    /// together with the circuit-breaker snapshot in one row update.
    pub async fn update_after_cycle(
        &self,
        id: i64,
        last_sync_at: Option<DateTime<Utc>>,
        last_success_at: Option<DateTime<Utc>>,
        circuit_breaker: &CircuitBreaker,
    ) -> Result<(), PersistenceError> {
        let last_sync_at = last_sync_at.map(|t| t.to_rfc3339());
        let last_success_at = last_success_at.map(|t| t.to_rfc3339());
        let cb_state = circuit_breaker.state().as_str().to_string();
        let cb_consecutive_failures = circuit_breaker.consecutive_failures();
        let cb_open_until = circuit_breaker.open_until().map(|t| t.to_rfc3339());
        let cb_halfopen_successes = circuit_breaker.halfopen_successes();
        let now = Utc::now().to_rfc3339();

        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "UPDATE connections SET
                        last_sync_at = COALESCE(?1, last_sync_at),
                        last_success_at = COALESCE(?2, last_success_at),
                        cb_state = ?3,
                        cb_consecutive_failures = ?4,
                        cb_open_until = ?5,
                        cb_halfopen_successes = ?6,
                        updated_at = ?7
                    WHERE id = ?8",
                    params![
                        last_sync_at,
                        last_success_at,
                        cb_state,
                        cb_consecutive_failures,
                        cb_open_until,
                        cb_halfopen_successes,
                        now,
                        id,
                    ],
                )?;
                Ok(())
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    pub async fn reset_circuit_breaker(&self, id: i64) -> Result<(), PersistenceError> {
        let now = Utc::now().to_rfc3339();
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                let updated = conn.execute(
                    "UPDATE connections SET
                        cb_state = 'closed',
                        cb_consecutive_failures = 0,
                        cb_open_until = NULL,
                        cb_halfopen_successes = 0,
                        updated_at = ?1
                    WHERE id = ?2",
                    params![now, id],
                )?;
                Ok(updated)
            })
            .map_err(PersistenceError::from)
        })
        .await
        .and_then(|updated| {
            if updated == 0 {
                Err(PersistenceError::NotFound(format!("connection {id}")))
            } else {
                Ok(())
            }
        })
    }
}
