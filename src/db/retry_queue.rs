use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{Db, PersistenceError, blocking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryItemStatus {
    Pending,
    Exhausted,
    Discarded,
}

impl RetryItemStatus {
    fn as_str(self) -> &'static str {
        match self {
            RetryItemStatus::Pending => "pending",
            RetryItemStatus::Exhausted => "exhausted",
            RetryItemStatus::Discarded => "discarded",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "exhausted" => RetryItemStatus::Exhausted,
            "discarded" => RetryItemStatus::Discarded,
            _ => RetryItemStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryItem {
    pub id: i64,
    pub connection_id: i64,
    pub odoo_order_id: i64,
    pub payload_snapshot: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: RetryItemStatus,
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetryItem> {
    let next_attempt_at: String = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(RetryItem {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        odoo_order_id: row.get(2)?,
        payload_snapshot: row.get(3)?,
        attempts: row.get(4)?,
        next_attempt_at: DateTime::parse_from_rfc3339(&next_attempt_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        last_error: row.get(6)?,
        status: RetryItemStatus::parse(&status),
    })
}

const SELECT_COLUMNS: &str =
    "id, connection_id, odoo_order_id, payload_snapshot, attempts, next_attempt_at, last_error, status";

/// The backoff schedule (§4.6): attempt 1 -> 30s, 2 -> 60s, 3 -> 120s,
/// 4 -> 240s, 5+ -> capped at 600s.
pub fn backoff_delay(attempts: u32) -> chrono::Duration {
    let seconds = match attempts {
        0 | 1 => 30,
        2 => 60,
        3 => 120,
        4 => 240,
        _ => 600,
    };
    chrono::Duration::seconds(seconds)
}

#[derive(Clone)]
pub struct RetryQueueRepo {
    db: Arc<Db>,
    max_attempts: u32,
}

impl RetryQueueRepo {
    pub fn new(db: Arc<Db>, max_attempts: u32) -> Self {
        Self { db, max_attempts }
    }

    /// Create a RetryItem for a freshly failed delivery (attempts = 1).
    pub async fn create(
        &self,
        connection_id: i64,
        odoo_order_id: i64,
        payload_snapshot: &str,
        error: &str,
    ) -> Result<i64, PersistenceError> {
        let payload_snapshot = payload_snapshot.to_string();
        let error = error.to_string();
        let now = Utc::now();
        let next_attempt_at = (now + backoff_delay(1)).to_rfc3339();
        let now_str = now.to_rfc3339();

        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO retry_queue
                        (connection_id, odoo_order_id, payload_snapshot, attempts, next_attempt_at,
                         last_error, status, created_at, updated_at)
                        VALUES (?1, ?2, ?3, 1, ?4, ?5, 'pending', ?6, ?6)",
                    params![connection_id, odoo_order_id, payload_snapshot, next_attempt_at, error, now_str],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    /// Items due for another attempt on this connection, oldest first.
    pub async fn due_items(&self, connection_id: i64, now: DateTime<Utc>) -> Result<Vec<RetryItem>, PersistenceError> {
        let now = now.to_rfc3339();
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM retry_queue \
                     WHERE connection_id = ?1 AND status = 'pending' AND next_attempt_at <= ?2 \
                     ORDER BY created_at ASC, id ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params![connection_id, now], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    /// Record a failed retry attempt: advance the backoff, or mark the item
    /// exhausted once attempts reach the configured cap.
    pub async fn record_failure(&self, id: i64, error: &str) -> Result<(), PersistenceError> {
        let error = error.to_string();
        let max_attempts = self.max_attempts;

        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                let attempts: u32 = conn.query_row(
                    "SELECT attempts FROM retry_queue WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                let new_attempts = attempts.saturating_add(1);
                let now = Utc::now();
                let now_str = now.to_rfc3339();

                if new_attempts >= max_attempts {
                    conn.execute(
                        "UPDATE retry_queue SET attempts = ?1, status = 'exhausted', last_error = ?2, updated_at = ?3 WHERE id = ?4",
                        params![new_attempts, error, now_str, id],
                    )?;
                } else {
                    let next_attempt_at = (now + backoff_delay(new_attempts)).to_rfc3339();
                    conn.execute(
                        "UPDATE retry_queue SET attempts = ?1, next_attempt_at = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?5",
                        params![new_attempts, next_attempt_at, error, now_str, id],
                    )?;
                }
                Ok(())
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    /// A permanent webhook failure exhausts the item immediately, without
    /// consuming further backoff attempts.
    pub async fn mark_exhausted(&self, id: i64, error: &str) -> Result<(), PersistenceError> {
        let error = error.to_string();
        let now = Utc::now().to_rfc3339();
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "UPDATE retry_queue SET status = 'exhausted', last_error = ?1, updated_at = ?2 WHERE id = ?3",
                    params![error, now, id],
                )?;
                Ok(())
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    pub async fn delete(&self, id: i64) -> Result<(), PersistenceError> {
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                conn.execute("DELETE FROM retry_queue WHERE id = ?1", params![id])?;
                Ok(())
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    /// Operator command: make an exhausted/discarded item due again without
    /// resetting its attempt counter.
    pub async fn reset_for_retry(&self, id: i64) -> Result<(), PersistenceError> {
        let now = Utc::now().to_rfc3339();
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                let updated = conn.execute(
                    "UPDATE retry_queue SET status = 'pending', next_attempt_at = ?1, updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                Ok(updated)
            })
            .map_err(PersistenceError::from)
        })
        .await
        .and_then(|updated| {
            if updated == 0 {
                Err(PersistenceError::NotFound(format!("retry item {id}")))
            } else {
                Ok(())
            }
        })
    }

    /// Operator command: permanently stop retrying an item.
    pub async fn discard(&self, id: i64) -> Result<(), PersistenceError> {
        let now = Utc::now().to_rfc3339();
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                let updated = conn.execute(
                    "UPDATE retry_queue SET status = 'discarded', updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?;
                Ok(updated)
            })
            .map_err(PersistenceError::from)
        })
        .await
        .and_then(|updated| {
            if updated == 0 {
                Err(PersistenceError::NotFound(format!("retry item {id}")))
            } else {
                Ok(())
            }
        })
    }

    #[allow(dead_code)]
    pub async fn get(&self, id: i64) -> Result<RetryItem, PersistenceError> {
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM retry_queue WHERE id = ?1");
                conn.query_row(&sql, params![id], map_row).optional()
            })
            .map_err(PersistenceError::from)
        })
        .await?
        .ok_or_else(|| PersistenceError::NotFound(format!("retry item {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_matches_spec() {
        assert_eq!(backoff_delay(1), chrono::Duration::seconds(30));
        assert_eq!(backoff_delay(2), chrono::Duration::seconds(60));
        assert_eq!(backoff_delay(3), chrono::Duration::seconds(120));
        assert_eq!(backoff_delay(4), chrono::Duration::seconds(240));
        assert_eq!(backoff_delay(5), chrono::Duration::seconds(600));
        assert_eq!(backoff_delay(50), chrono::Duration::seconds(600));
    }

    async fn repo_with_connection() -> RetryQueueRepo {
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
        RetryQueueRepo::new(db, 10)
    }

    #[tokio::test]
    async fn test_create_then_due_items() {
        let repo = repo_with_connection().await;
        let id = repo.create(1, 42, "{}", "503 Service Unavailable").await.unwrap();

        let due_now = repo.due_items(1, Utc::now()).await.unwrap();
        assert!(due_now.is_empty(), "not due yet, 30s backoff not elapsed");

        let due_later = repo.due_items(1, Utc::now() + chrono::Duration::seconds(31)).await.unwrap();
        assert_eq!(due_later.len(), 1);
        assert_eq!(due_later[0].id, id);
        assert_eq!(due_later[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_record_failure_advances_backoff() {
        let repo = repo_with_connection().await;
        let id = repo.create(1, 42, "{}", "boom").await.unwrap();
        repo.record_failure(id, "boom again").await.unwrap();

        let item = repo.get(id).await.unwrap();
        assert_eq!(item.attempts, 2);
        assert_eq!(item.status, RetryItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_record_failure_exhausts_at_cap() {
        let repo = RetryQueueRepo::new(repo_with_connection().await.db.clone(), 2);
        let id = repo.create(1, 42, "{}", "boom").await.unwrap();
        repo.record_failure(id, "boom again").await.unwrap();

        let item = repo.get(id).await.unwrap();
        assert_eq!(item.status, RetryItemStatus::Exhausted);
    }

    #[tokio::test]
    async fn test_reset_for_retry_reactivates_exhausted_item() {
        let repo = repo_with_connection().await;
        let id = repo.create(1, 42, "{}", "boom").await.unwrap();
        repo.mark_exhausted(id, "permanent").await.unwrap();

        repo.reset_for_retry(id).await.unwrap();
        let item = repo.get(id).await.unwrap();
        assert_eq!(item.status, RetryItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_discard_sets_status() {
        let repo = repo_with_connection().await;
        let id = repo.create(1, 42, "{}", "boom").await.unwrap();
        repo.discard(id).await.unwrap();
        assert_eq!(repo.get(id).await.unwrap().status, RetryItemStatus::Discarded);
    }

    #[tokio::test]
    async fn test_delete_removes_item() {
        let repo = repo_with_connection().await;
        let id = repo.create(1, 42, "{}", "boom").await.unwrap();
        repo.delete(id).await.unwrap();
        assert!(repo.get(id).await.is_err());
    }
}
