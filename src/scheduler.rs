use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::PollerConfig;
use crate::db::{ConnectionRepo, RetryQueueRepo, SentOrderRepo, SyncLogRepo};
use crate::odoo::OdooClient;
use crate::webhook::WebhookSender;
use crate::worker::{WorkerContext, run_cycle};

/// Shared, read-only handles every per-connection task needs to build its
/// own isolated `WorkerContext`. Cloning this is cheap (everything inside
/// is an `Arc` or a small value); each task still builds its own
/// `reqwest::Client`/`OdooClient` so no two connections share an HTTP
/// connection pool or cached session uid.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub connections: ConnectionRepo,
    pub sent_orders: SentOrderRepo,
    pub retry_queue: RetryQueueRepo,
    pub sync_logs: SyncLogRepo,
    pub config: PollerConfig,
    pub cb_config: CircuitBreakerConfig,
}

struct RunningTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns one `tokio::spawn`'d task per enabled connection and the
/// supervisor loop that keeps that set in sync with the Connection table
/// (§4.8). No connection's task ever shares in-memory state with another;
/// each task's `WorkerContext` is built fresh from its own `Connection`
/// row when spawned, and re-read every cycle.
pub struct Scheduler {
    deps: SchedulerDeps,
    shutdown: CancellationToken,
    tasks: HashMap<i64, RunningTask>,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps, shutdown: CancellationToken) -> Self {
        Self {
            deps,
            shutdown,
            tasks: HashMap::new(),
        }
    }

    /// Run until the shutdown token is cancelled (typically tripped by
    /// `tokio::signal::ctrl_c` in `main`), reconciling the task set against
    /// the Connection table on `reconfig_interval`, then wait out the
    /// shutdown grace period before returning.
    pub async fn run(mut self) {
        self.reconcile().await;

        let mut reconfig = tokio::time::interval(self.deps.config.reconfig_interval);
        reconfig.tick().await; // first tick fires immediately; already reconciled above

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown signal received, stopping all connection tasks");
                    break;
                }
                _ = reconfig.tick() => {
                    self.reconcile().await;
                }
            }
        }

        self.shutdown_all().await;
    }

    /// Load enabled connections and spawn/cancel tasks so the running set
    /// matches exactly. A connection's `poll_interval_seconds` change is
    /// picked up by the task itself on its next sleep — no restart needed.
    async fn reconcile(&mut self) {
        let enabled = match self.deps.connections.list_enabled().await {
            Ok(conns) => conns,
            Err(e) => {
                warn!(error = %e, "failed to list enabled connections, backing off 10s");
                tokio::time::sleep(Duration::from_secs(10)).await;
                return;
            }
        };

        let enabled_ids: std::collections::HashSet<i64> = enabled.iter().map(|c| c.id).collect();

        let stale: Vec<i64> = self
            .tasks
            .keys()
            .copied()
            .filter(|id| !enabled_ids.contains(id))
            .collect();
        for id in stale {
            if let Some(task) = self.tasks.remove(&id) {
                info!(connection_id = id, "connection disabled or removed, cancelling task");
                task.cancel.cancel();
                let _ = task.handle.await;
            }
        }

        for connection in enabled {
            if self.tasks.contains_key(&connection.id) {
                continue;
            }
            info!(connection_id = connection.id, connection_name = %connection.name, "starting task for connection");
            let cancel = self.shutdown.child_token();
            let handle = spawn_connection_task(connection.id, self.deps.clone(), cancel.clone());
            self.tasks.insert(connection.id, RunningTask { handle, cancel });
        }
    }

    async fn shutdown_all(self) {
        let deadline = self.deps.config.shutdown_grace;
        let ids: Vec<i64> = self.tasks.keys().copied().collect();
        let handles = self.tasks.into_values().map(|t| t.handle);

        let join_all = futures_join_all(handles);
        match tokio::time::timeout(deadline, join_all).await {
            Ok(_) => info!("all connection tasks stopped cleanly"),
            Err(_) => warn!(?ids, "shutdown grace period elapsed, forcing exit"),
        }
    }
}

async fn futures_join_all(handles: impl IntoIterator<Item = JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// One task per connection: run a cycle, then sleep `max(poll_interval,
/// MIN_INTERVAL)`, forever, until cancelled. A task never terminates on an
/// unexpected error — it logs, the cycle itself already recorded a breaker
/// failure and a SyncLog row, and the loop just continues. Cancellation is
/// only ever observed between cycles, during the sleep — a cycle already in
/// flight always runs to completion first.
fn spawn_connection_task(connection_id: i64, deps: SchedulerDeps, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let connection = match deps.connections.get(connection_id).await {
                Ok(c) if c.enabled => c,
                Ok(_) => {
                    info!(connection_id, "connection disabled between reconcile passes, task exiting");
                    return;
                }
                Err(e) => {
                    warn!(connection_id, error = %e, "failed to load connection snapshot, retrying after min interval");
                    if wait_or_cancelled(deps.config.min_interval, &cancel).await {
                        return;
                    }
                    continue;
                }
            };

            let Ok(odoo) = OdooClient::new(
                &connection.base_url,
                &connection.db_name,
                &connection.login,
                &connection.api_key,
                deps.config.http_timeout,
                deps.config.http_pool_size,
            ) else {
                warn!(connection_id, "invalid Odoo base url for connection, task exiting");
                return;
            };

            let Ok(webhook) = WebhookSender::new(deps.config.http_timeout, deps.config.http_pool_size) else {
                warn!(connection_id, "failed to build webhook HTTP client, task exiting");
                return;
            };

            let ctx = WorkerContext {
                odoo,
                webhook,
                connections: deps.connections.clone(),
                sent_orders: deps.sent_orders.clone(),
                retry_queue: deps.retry_queue.clone(),
                sync_logs: deps.sync_logs.clone(),
                cb_config: deps.cb_config,
            };

            // Never raced against cancellation: an in-flight Odoo/webhook
            // HTTP call always runs to completion before this task can
            // exit, so cancelling never aborts a call mid-flight.
            run_cycle(&ctx, &connection, false).await;

            let interval = Duration::from_secs(connection.poll_interval_seconds.max(deps.config.min_interval.as_secs() as i64) as u64);
            if wait_or_cancelled(interval, &cancel).await {
                return;
            }
        }
    })
}

/// Sleep for `duration`, racing the cancellation token. Returns `true` if
/// cancellation won the race (caller should exit), `false` if the sleep
/// elapsed normally.
async fn wait_or_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
