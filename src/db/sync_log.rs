use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{Db, PersistenceError, blocking};

#[derive(Debug, Clone)]
pub struct SyncLog {
    pub id: i64,
    pub connection_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub orders_found: u32,
    pub orders_sent: u32,
    pub orders_failed: u32,
    pub error_message: Option<String>,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncLog> {
    let started_at: String = row.get(2)?;
    let finished_at: String = row.get(3)?;
    Ok(SyncLog {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        finished_at: DateTime::parse_from_rfc3339(&finished_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        orders_found: row.get(4)?,
        orders_sent: row.get(5)?,
        orders_failed: row.get(6)?,
        error_message: row.get(7)?,
    })
}

#[derive(Clone)]
pub struct SyncLogRepo {
    db: Arc<Db>,
}

impl SyncLogRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        connection_id: i64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        orders_found: u32,
        orders_sent: u32,
        orders_failed: u32,
        error_message: Option<&str>,
    ) -> Result<i64, PersistenceError> {
        let started_at = started_at.to_rfc3339();
        let finished_at = finished_at.to_rfc3339();
        let error_message = error_message.map(String::from);

        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sync_logs
                        (connection_id, started_at, finished_at, orders_found, orders_sent, orders_failed, error_message)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![connection_id, started_at, finished_at, orders_found, orders_sent, orders_failed, error_message],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    pub async fn recent(&self, connection_id: i64, limit: u32) -> Result<Vec<SyncLog>, PersistenceError> {
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, connection_id, started_at, finished_at, orders_found, orders_sent, orders_failed, error_message
                     FROM sync_logs WHERE connection_id = ?1 ORDER BY started_at DESC LIMIT ?2",
                )?;
                stmt.query_map(params![connection_id, limit], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(PersistenceError::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo_with_connection() -> SyncLogRepo {
        let db = Db::open_in_memory().unwrap();
        crate::db::blocking(db.clone(), |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO connections (id, name, base_url, db_name, login, api_key, webhook_url, webhook_secret, poll_interval_seconds, enabled, created_at, updated_at)
                     VALUES (1, 'acme', 'http://x', 'db', 'login', 'key', 'url', 'secret', 30, 1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .map_err(PersistenceError::from)
        })
        .await
        .unwrap();
        SyncLogRepo::new(db)
    }

    #[tokio::test]
    async fn test_append_then_recent_ordered_newest_first() {
        let repo = repo_with_connection().await;
        let t0 = Utc::now();
        repo.append(1, t0, t0, 2, 2, 0, None).await.unwrap();
        let t1 = t0 + chrono::Duration::seconds(30);
        repo.append(1, t1, t1, 1, 0, 1, Some("webhook 503")).await.unwrap();

        let logs = repo.recent(1, 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].orders_failed, 1);
        assert_eq!(logs[0].error_message.as_deref(), Some("webhook 503"));
    }

    #[tokio::test]
    async fn test_recent_respects_limit() {
        let repo = repo_with_connection().await;
        for _ in 0..5 {
            let t = Utc::now();
            repo.append(1, t, t, 0, 0, 0, None).await.unwrap();
        }
        assert_eq!(repo.recent(1, 3).await.unwrap().len(), 3);
    }
}
