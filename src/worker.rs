use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::db::{Connection, ConnectionRepo, RetryQueueRepo, SentOrderRepo, SyncLogRepo};
use crate::error::PollerError;
use crate::mapper::map_connection_orders;
use crate::odoo::OdooClient;
use crate::webhook::{DeliveryOutcome, WebhookSender};

/// Everything one poll cycle needs, bundled per connection so the
/// scheduler can hand a task its own isolated set and never share state
/// across connections.
pub struct WorkerContext {
    pub odoo: OdooClient,
    pub webhook: WebhookSender,
    pub connections: ConnectionRepo,
    pub sent_orders: SentOrderRepo,
    pub retry_queue: RetryQueueRepo,
    pub sync_logs: SyncLogRepo,
    #[allow(dead_code)]
    pub cb_config: CircuitBreakerConfig,
}

/// Outcome of one full cycle, for the caller (scheduler or `test` CLI
/// command) to log or print.
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub orders_found: u32,
    pub orders_sent: u32,
    pub orders_failed: u32,
    pub retries_attempted: u32,
    pub breaker_failure: bool,
    pub short_circuited: bool,
}

/// Run exactly one poll cycle for `connection` (§4.7). In `dry_run` mode
/// webhooks are still sent for real (so an operator's `test` command shows
/// real delivery behavior) but no SentOrder/RetryItem rows are written —
/// only the SyncLog is appended, so a dry run leaves no trace in the
/// dedup index or retry queue.
#[instrument(skip(ctx, connection), fields(connection_id = connection.id, connection_name = %connection.name))]
pub async fn run_cycle(ctx: &WorkerContext, connection: &Connection, dry_run: bool) -> CycleSummary {
    let started_at = Utc::now();
    let mut breaker = connection.circuit_breaker.clone();
    breaker.transition_to_half_open_if_due(started_at);

    if !breaker.allows_request(started_at) {
        let finished_at = Utc::now();
        if let Err(e) = ctx
            .sync_logs
            .append(connection.id, started_at, finished_at, 0, 0, 0, Some("circuit open"))
            .await
        {
            warn!(error = %e, "failed to append sync log for short-circuited cycle");
        }
        return CycleSummary {
            short_circuited: true,
            ..Default::default()
        };
    }

    let mut summary = CycleSummary::default();
    let mut max_write_date: Option<DateTime<Utc>> = None;
    let mut cycle_error: Option<PollerError> = None;

    match run_cycle_body(ctx, connection, dry_run, &mut summary).await {
        Ok(found_write_date) => {
            max_write_date = found_write_date;
            if !dry_run {
                breaker.record_success();
            }
        }
        Err(e) => {
            warn!(error = %e, "poll cycle failed");
            if e.counts_as_breaker_failure() {
                breaker.record_failure(Utc::now());
                summary.breaker_failure = true;
            }
            cycle_error = Some(e);
        }
    }

    let finished_at = Utc::now();
    let error_message = match (&cycle_error, dry_run) {
        (Some(e), _) => Some(e.to_string()),
        (None, true) => Some("dry run".to_string()),
        (None, false) => None,
    };

    if let Err(e) = ctx
        .sync_logs
        .append(
            connection.id,
            started_at,
            finished_at,
            summary.orders_found,
            summary.orders_sent,
            summary.orders_failed,
            error_message.as_deref(),
        )
        .await
    {
        warn!(error = %e, "failed to append sync log");
    }

    if !dry_run {
        let last_sync_at = match (connection.last_sync_at, max_write_date) {
            (Some(existing), Some(found)) => Some(existing.max(found)),
            (existing, found) => existing.or(found),
        };
        let last_success_at = (summary.orders_sent > 0).then(Utc::now);

        if let Err(e) = ctx
            .connections
            .update_after_cycle(connection.id, last_sync_at, last_success_at, &breaker)
            .await
        {
            warn!(error = %e, "failed to persist connection state after cycle");
        }
    }

    info!(
        found = summary.orders_found,
        sent = summary.orders_sent,
        failed = summary.orders_failed,
        retries = summary.retries_attempted,
        "cycle complete"
    );

    summary
}

/// Steps 2-7 of §4.7. Returns the max `write_date` among orders *found*
/// this cycle (regardless of delivery outcome), per the resolved open
/// question in DESIGN.md — `last_sync_at` advances on discovery, not on
/// successful delivery, because SentOrder absorbs any replay.
async fn run_cycle_body(
    ctx: &WorkerContext,
    connection: &Connection,
    dry_run: bool,
    summary: &mut CycleSummary,
) -> Result<Option<DateTime<Utc>>, PollerError> {
    ctx.odoo.authenticate().await?;

    let map_result = map_connection_orders(
        &ctx.odoo,
        connection.id,
        &connection.db_name,
        connection.last_sync_at,
        &ctx.sent_orders,
    )
    .await?;

    summary.orders_found = map_result.found_count as u32;
    summary.orders_failed += map_result.mapping_errors as u32;

    let max_write_date = map_result
        .payloads
        .iter()
        .filter_map(|p| p.get("write_date").and_then(|v| v.as_str()))
        .filter_map(|s| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc())
        })
        .max();

    let mut webhook_attempted = 0usize;
    let mut webhook_all_unreachable = true;

    for payload in &map_result.payloads {
        let order_id = payload["order_id"].as_i64().unwrap_or_default();
        let write_date = payload["write_date"].as_str().unwrap_or_default();

        let outcome = ctx
            .webhook
            .send(
                &connection.webhook_url,
                &connection.webhook_secret,
                connection.id,
                order_id,
                write_date,
                payload,
            )
            .await;

        webhook_attempted += 1;
        if !matches!(outcome, DeliveryOutcome::TransientFailure { status: None, .. }) {
            webhook_all_unreachable = false;
        }

        apply_delivery_outcome(ctx, connection.id, order_id, write_date, payload, &outcome, dry_run, summary).await;
    }

    // A webhook endpoint unreachable (pure transport failure, not an HTTP
    // status) for every order attempted this cycle indicates the endpoint
    // itself is down, which does count against the breaker (§7).
    if webhook_attempted > 0 && webhook_all_unreachable {
        return Err(PollerError::Webhook(crate::webhook::WebhookError::AllAttemptsUnreachable(format!(
            "{webhook_attempted} order(s) attempted, all unreachable"
        ))));
    }

    process_due_retries(ctx, connection, dry_run, summary).await;

    Ok(max_write_date)
}

async fn apply_delivery_outcome(
    ctx: &WorkerContext,
    connection_id: i64,
    order_id: i64,
    write_date: &str,
    payload: &serde_json::Value,
    outcome: &DeliveryOutcome,
    dry_run: bool,
    summary: &mut CycleSummary,
) {
    match outcome {
        DeliveryOutcome::Delivered { .. } => {
            summary.orders_sent += 1;
            if !dry_run {
                let hash = payload_hash(payload);
                if let Err(e) = ctx
                    .sent_orders
                    .insert_if_absent(connection_id, order_id, write_date, &hash)
                    .await
                {
                    warn!(error = %e, order_id, "failed to record sent order");
                }
            }
        }
        DeliveryOutcome::TransientFailure { message, .. } => {
            if !dry_run {
                if let Err(e) = ctx
                    .retry_queue
                    .create(connection_id, order_id, &payload.to_string(), message)
                    .await
                {
                    warn!(error = %e, order_id, "failed to enqueue retry item");
                }
            }
        }
        DeliveryOutcome::PermanentFailure { status, body } => {
            summary.orders_failed += 1;
            warn!(order_id, "webhook rejected order permanently: status {status}, body {body}");
        }
    }
}

/// Step 7: re-attempt RetryItems due for this connection.
async fn process_due_retries(ctx: &WorkerContext, connection: &Connection, dry_run: bool, summary: &mut CycleSummary) {
    if dry_run {
        // Dry runs never touch the retry queue (§4.7): nothing to process.
        return;
    }

    let due = match ctx.retry_queue.due_items(connection.id, Utc::now()).await {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "failed to load due retry items");
            return;
        }
    };

    for item in due {
        summary.retries_attempted += 1;
        let payload: serde_json::Value = match serde_json::from_str(&item.payload_snapshot) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, retry_item_id = item.id, "retry item payload is not valid JSON, discarding");
                let _ = ctx.retry_queue.mark_exhausted(item.id, &e.to_string()).await;
                continue;
            }
        };
        let write_date = payload["write_date"].as_str().unwrap_or_default();

        let outcome = ctx
            .webhook
            .send(
                &connection.webhook_url,
                &connection.webhook_secret,
                connection.id,
                item.odoo_order_id,
                write_date,
                &payload,
            )
            .await;

        match outcome {
            DeliveryOutcome::Delivered { .. } => {
                summary.orders_sent += 1;
                let hash = payload_hash(&payload);
                if let Err(e) = ctx
                    .sent_orders
                    .insert_if_absent(connection.id, item.odoo_order_id, write_date, &hash)
                    .await
                {
                    warn!(error = %e, order_id = item.odoo_order_id, "failed to record sent order from retry");
                }
                if let Err(e) = ctx.retry_queue.delete(item.id).await {
                    warn!(error = %e, retry_item_id = item.id, "failed to delete completed retry item");
                }
            }
            DeliveryOutcome::TransientFailure { message, .. } => {
                if let Err(e) = ctx.retry_queue.record_failure(item.id, &message).await {
                    warn!(error = %e, retry_item_id = item.id, "failed to advance retry item backoff");
                }
            }
            DeliveryOutcome::PermanentFailure { status, body } => {
                summary.orders_failed += 1;
                if let Err(e) = ctx
                    .retry_queue
                    .mark_exhausted(item.id, &format!("permanent failure (status {status}): {body}"))
                    .await
                {
                    warn!(error = %e, retry_item_id = item.id, "failed to mark retry item exhausted");
                }
            }
        }
    }
}

fn payload_hash(payload: &serde_json::Value) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
