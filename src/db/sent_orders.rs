use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;

use super::{Db, PersistenceError, blocking};

/// The dedup ledger: one row per `(connection_id, odoo_order_id, write_date)`
/// ever successfully delivered. A given triple is inserted at most once —
/// the `PRIMARY KEY` on that triple is the idempotence anchor, not
/// application-level locking.
#[derive(Clone)]
pub struct SentOrderRepo {
    db: Arc<Db>,
}

impl SentOrderRepo {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub async fn exists(
        &self,
        connection_id: i64,
        odoo_order_id: i64,
        write_date: &str,
    ) -> Result<bool, PersistenceError> {
        let write_date = write_date.to_string();
        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                conn.query_row(
                    "SELECT 1 FROM sent_orders WHERE connection_id = ?1 AND odoo_order_id = ?2 AND write_date = ?3",
                    params![connection_id, odoo_order_id, write_date],
                    |_| Ok(()),
                )
                .optional_bool()
            })
            .map_err(PersistenceError::from)
        })
        .await
    }

    /// Inserts the dedup record if absent; a duplicate insert (two cycles
    /// racing on the same order, or a retried crash-then-replay) is silently
    /// ignored rather than surfaced as an error.
    pub async fn insert_if_absent(
        &self,
        connection_id: i64,
        odoo_order_id: i64,
        write_date: &str,
        payload_hash: &str,
    ) -> Result<(), PersistenceError> {
        let write_date = write_date.to_string();
        let payload_hash = payload_hash.to_string();
        let now = Utc::now().to_rfc3339();

        blocking(self.db.clone(), move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO sent_orders
                        (connection_id, odoo_order_id, write_date, delivered_at, payload_hash)
                        VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![connection_id, odoo_order_id, write_date, now, payload_hash],
                )?;
                Ok(())
            })
            .map_err(PersistenceError::from)
        })
        .await
    }
}

trait OptionalBool {
    fn optional_bool(self) -> rusqlite::Result<bool>;
}

impl OptionalBool for rusqlite::Result<()> {
    fn optional_bool(self) -> rusqlite::Result<bool> {
        match self {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
