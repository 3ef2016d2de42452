//! Shared test scaffolding for the integration tests under `tests/`.

#![allow(dead_code)]

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use odoo_order_poller::circuit_breaker::CircuitBreakerConfig;
use odoo_order_poller::crypto::FieldEncryptor;
use odoo_order_poller::db::{ConnectionRepo, Db, RetryQueueRepo, SentOrderRepo, SyncLogRepo};

/// A scratch SQLite database backed by a temp directory. `Db::open_in_memory`
/// is only reachable from the crate's own `#[cfg(test)]` unit tests, not from
/// these black-box integration tests, so every integration test gets its own
/// file-backed database instead.
pub struct TestDb {
    pub dir: TempDir,
    pub db: Arc<Db>,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("poller.db");
        let db = Db::open(path.to_str().unwrap()).expect("failed to open scratch database");
        Self { dir, db }
    }
}

pub fn test_encryptor() -> Arc<FieldEncryptor> {
    Arc::new(FieldEncryptor::new(&BASE64.encode([5u8; 32])).unwrap())
}

pub fn default_cb_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: chrono::Duration::seconds(60),
        halfopen_success_threshold: 1,
    }
}

/// Everything a worker/scheduler test needs wired up against one scratch
/// database: the four repositories plus the breaker config they share.
pub struct TestRepos {
    pub connections: ConnectionRepo,
    pub sent_orders: SentOrderRepo,
    pub retry_queue: RetryQueueRepo,
    pub sync_logs: SyncLogRepo,
    pub cb_config: CircuitBreakerConfig,
}

impl TestRepos {
    pub fn new(db: &TestDb) -> Self {
        let cb_config = default_cb_config();
        Self {
            connections: ConnectionRepo::new(db.db.clone(), test_encryptor(), cb_config),
            sent_orders: SentOrderRepo::new(db.db.clone()),
            retry_queue: RetryQueueRepo::new(db.db.clone(), 10),
            sync_logs: SyncLogRepo::new(db.db.clone()),
            cb_config,
        }
    }
}

/// Mocks the single `/jsonrpc` endpoint an `OdooClient` talks to. Odoo's
/// legacy RPC multiplexes every call (auth, search_read, read) through one
/// path, distinguished only by the method name buried in the request body,
/// so mocks match on body content rather than distinct routes.
pub struct MockOdooServer {
    pub server: MockServer,
}

impl MockOdooServer {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub async fn mock_authenticate(&self, uid: i64) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_string_contains("authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jsonrpc_result(json!(uid))))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_auth_failure(&self) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_string_contains("authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(jsonrpc_result(json!(false))))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_search_read(&self, model: &str, rows: Value) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_string_contains("search_read"))
            .and(body_string_contains(model))
            .respond_with(ResponseTemplate::new(200).set_body_json(jsonrpc_result(rows)))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_read(&self, model: &str, rows: Value) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_string_contains("\"read\""))
            .and(body_string_contains(model))
            .respond_with(ResponseTemplate::new(200).set_body_json(jsonrpc_result(rows)))
            .mount(&self.server)
            .await;
    }

    /// A transport-level outage: every call to `/jsonrpc` gets a 500 with no
    /// JSON-RPC envelope at all.
    pub async fn mock_down(&self) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&self.server)
            .await;
    }
}

pub fn jsonrpc_result(result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": 1, "result": result })
}

pub fn jsonrpc_session_expired_error() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {
            "code": 100,
            "message": "Odoo Session Expired",
            "data": {
                "name": "odoo.http.SessionExpiredException",
                "message": "Session expired"
            }
        }
    })
}

/// A mock webhook receiver, separate from the Odoo mock since a worker test
/// exercises both endpoints at once.
pub struct MockWebhookServer {
    pub server: MockServer,
}

impl MockWebhookServer {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn url(&self) -> String {
        format!("{}/webhook", self.server.uri())
    }

    pub async fn mock_accept(&self) {
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_reject(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }
}

/// Sample confirmed sale order rows shaped the way the Order Mapper expects
/// them back from `search_read` on `sale.order`.
pub fn sample_sale_orders() -> Value {
    json!([
        {
            "id": 101,
            "name": "SO0101",
            "write_date": "2026-01-01 10:00:00",
            "partner_id": [7, "Acme Corp"],
            "currency_id": [1, "USD"],
            "amount_total": 150.0,
            "order_line": [501]
        }
    ])
}

pub fn sample_partners() -> Value {
    json!([
        {"id": 7, "name": "Acme Corp", "email": "buyer@acme.example", "vat": "US123"}
    ])
}

pub fn sample_order_lines() -> Value {
    json!([
        {
            "id": 501,
            "product_id": [42, "Widget"],
            "product_uom_qty": 2.0,
            "price_unit": 75.0,
            "price_subtotal": 150.0
        }
    ])
}

pub fn sample_products() -> Value {
    json!([
        {"id": 42, "default_code": "WIDGET-1", "barcode": false, "product_tmpl_id": [9, "Widget Template"]}
    ])
}
