use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("transport error delivering webhook: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
    #[error("webhook endpoint unreachable for every order attempted this cycle: {0}")]
    AllAttemptsUnreachable(String),
}

/// Outcome of a single delivery attempt. `PermanentFailure` must never be
/// retried; `TransientFailure` is eligible for the retry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    PermanentFailure { status: u16, body: String },
    TransientFailure { status: Option<u16>, message: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryOutcome::TransientFailure { .. })
    }
}

/// Sends normalized order payloads to a connection's configured webhook
/// endpoint with signed headers and a fixed request timeout. Classifies
/// the HTTP outcome into the taxonomy the worker and retry queue act on.
#[derive(Clone)]
pub struct WebhookSender {
    http: reqwest::Client,
}

impl WebhookSender {
    /// `pool_max_idle_per_host` bounds how many idle connections this
    /// sender keeps open to any one host — a bulkhead so one connection's
    /// webhook endpoint can't monopolize the process's HTTP connection
    /// budget (§5).
    pub fn new(timeout: Duration, pool_max_idle_per_host: usize) -> Result<Self, WebhookError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build()?;
        Ok(Self { http })
    }

    pub async fn send(
        &self,
        webhook_url: &str,
        webhook_secret: &str,
        connection_id: i64,
        order_id: i64,
        write_date: &str,
        payload: &Value,
    ) -> DeliveryOutcome {
        let idempotency_key = format!("{connection_id}:{order_id}:{write_date}");

        let headers = match build_headers(webhook_secret, connection_id, &idempotency_key) {
            Ok(h) => h,
            Err(e) => {
                return DeliveryOutcome::TransientFailure {
                    status: None,
                    message: e.to_string(),
                };
            }
        };

        let resp = self
            .http
            .post(webhook_url)
            .headers(headers)
            .json(payload)
            .send()
            .await;

        match resp {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    DeliveryOutcome::Delivered {
                        status: status.as_u16(),
                    }
                } else if is_retryable_status(status.as_u16()) {
                    let body = resp.text().await.unwrap_or_default();
                    DeliveryOutcome::TransientFailure {
                        status: Some(status.as_u16()),
                        message: body,
                    }
                } else {
                    let body = resp.text().await.unwrap_or_default();
                    DeliveryOutcome::PermanentFailure {
                        status: status.as_u16(),
                        body,
                    }
                }
            }
            Err(e) => DeliveryOutcome::TransientFailure {
                status: None,
                message: e.to_string(),
            },
        }
    }
}

/// 408 (request timeout) and 429 (rate limited) are retryable even though
/// they're 4xx; every other 4xx is treated as a permanent rejection.
fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

fn build_headers(
    webhook_secret: &str,
    connection_id: i64,
    idempotency_key: &str,
) -> Result<HeaderMap, WebhookError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static("x-webhook-secret"),
        HeaderValue::from_str(webhook_secret).map_err(|e| WebhookError::InvalidHeader(e.to_string()))?,
    );
    headers.insert(
        HeaderName::from_static("x-odoo-connection-id"),
        HeaderValue::from_str(&connection_id.to_string())
            .map_err(|e| WebhookError::InvalidHeader(e.to_string()))?,
    );
    headers.insert(
        HeaderName::from_static("x-idempotency-key"),
        HeaderValue::from_str(idempotency_key).map_err(|e| WebhookError::InvalidHeader(e.to_string()))?,
    );
    Ok(headers)
}
