use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use odoo_order_poller::circuit_breaker::CircuitBreakerConfig;
use odoo_order_poller::config::{self, PollerConfig};
use odoo_order_poller::crypto::FieldEncryptor;
use odoo_order_poller::db::{ConnectionRepo, Db, RetryQueueRepo, SentOrderRepo, SyncLogRepo};
use odoo_order_poller::odoo::OdooClient;
use odoo_order_poller::scheduler::{Scheduler, SchedulerDeps};
use odoo_order_poller::webhook::WebhookSender;
use odoo_order_poller::worker::{WorkerContext, run_cycle};

#[derive(Parser)]
#[command(
    name = "odoo-order-poller",
    about = "Polls confirmed Odoo sales orders across configured connections and delivers them as webhooks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and poll every enabled connection until shutdown.
    Run,
    /// Run one poll cycle for a connection without writing dedup or retry state.
    Test { connection_id: i64 },
    /// Force a connection's circuit breaker back to closed.
    ResetCircuit { connection_id: i64 },
    /// Make an exhausted or discarded retry item due again, without resetting its attempt count.
    Retry { item_id: i64 },
    /// Permanently stop retrying a retry item.
    Discard { item_id: i64 },
    /// List every configured connection.
    ListConnections,
    /// Show one connection's full state, including circuit breaker and sync timestamps.
    ShowConnection { connection_id: i64 },
    /// Show recent sync log entries for a connection, newest first.
    RecentLogs {
        connection_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn main() -> ExitCode {
    config::load_env_file(Path::new(".env"));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(dispatch(cli.command))
}

async fn dispatch(command: Command) -> ExitCode {
    let config = match PollerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration, refusing to start");
            return ExitCode::FAILURE;
        }
    };

    let encryptor = match FieldEncryptor::new(&config.encryption_key) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            error!(error = %e, "invalid POLLER_ENCRYPTION_KEY");
            return ExitCode::FAILURE;
        }
    };

    let db = match Db::open(&config.db_path) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "failed to open database at {}", config.db_path);
            return ExitCode::FAILURE;
        }
    };

    let cb_config = CircuitBreakerConfig {
        failure_threshold: config.cb_failure_threshold,
        recovery_timeout: chrono::Duration::from_std(config.cb_recovery)
            .unwrap_or_else(|_| chrono::Duration::seconds(120)),
        halfopen_success_threshold: config.cb_halfopen_successes,
    };

    let connections = ConnectionRepo::new(db.clone(), encryptor, cb_config);
    let sent_orders = SentOrderRepo::new(db.clone());
    let retry_queue = RetryQueueRepo::new(db.clone(), config.retry_max_attempts);
    let sync_logs = SyncLogRepo::new(db.clone());

    match command {
        Command::Run => cmd_run(connections, sent_orders, retry_queue, sync_logs, config, cb_config).await,
        Command::Test { connection_id } => {
            cmd_test(connections, sent_orders, retry_queue, sync_logs, config, cb_config, connection_id).await
        }
        Command::ResetCircuit { connection_id } => cmd_reset_circuit(connections, connection_id).await,
        Command::Retry { item_id } => cmd_retry(retry_queue, item_id).await,
        Command::Discard { item_id } => cmd_discard(retry_queue, item_id).await,
        Command::ListConnections => cmd_list_connections(connections).await,
        Command::ShowConnection { connection_id } => cmd_show_connection(connections, connection_id).await,
        Command::RecentLogs { connection_id, limit } => cmd_recent_logs(sync_logs, connection_id, limit).await,
    }
}

async fn cmd_run(
    connections: ConnectionRepo,
    sent_orders: SentOrderRepo,
    retry_queue: RetryQueueRepo,
    sync_logs: SyncLogRepo,
    config: PollerConfig,
    cb_config: CircuitBreakerConfig,
) -> ExitCode {
    let shutdown = tokio_util::sync::CancellationToken::new();
    let deps = SchedulerDeps {
        connections,
        sent_orders,
        retry_queue,
        sync_logs,
        config,
        cb_config,
    };

    let scheduler = Scheduler::new(deps, shutdown.clone());
    let scheduler_handle = tokio::spawn(scheduler.run());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c, shutting down anyway");
    }
    info!("shutdown requested, stopping connection tasks");
    shutdown.cancel();

    match scheduler_handle.await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "scheduler task panicked");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_test(
    connections: ConnectionRepo,
    sent_orders: SentOrderRepo,
    retry_queue: RetryQueueRepo,
    sync_logs: SyncLogRepo,
    config: PollerConfig,
    cb_config: CircuitBreakerConfig,
    connection_id: i64,
) -> ExitCode {
    let connection = match connections.get(connection_id).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, connection_id, "connection not found");
            return ExitCode::FAILURE;
        }
    };

    let odoo = match OdooClient::new(
        &connection.base_url,
        &connection.db_name,
        &connection.login,
        &connection.api_key,
        config.http_timeout,
        config.http_pool_size,
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid Odoo connection settings");
            return ExitCode::FAILURE;
        }
    };

    let webhook = match WebhookSender::new(config.http_timeout, config.http_pool_size) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to build webhook HTTP client");
            return ExitCode::FAILURE;
        }
    };

    let ctx = WorkerContext {
        odoo,
        webhook,
        connections,
        sent_orders,
        retry_queue,
        sync_logs,
        cb_config,
    };

    let summary = run_cycle(&ctx, &connection, true).await;
    println!("{summary:#?}");
    ExitCode::SUCCESS
}

async fn cmd_reset_circuit(connections: ConnectionRepo, connection_id: i64) -> ExitCode {
    match connections.reset_circuit_breaker(connection_id).await {
        Ok(()) => {
            println!("connection {connection_id}: circuit breaker reset to closed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, connection_id, "failed to reset circuit breaker");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_retry(retry_queue: RetryQueueRepo, item_id: i64) -> ExitCode {
    match retry_queue.reset_for_retry(item_id).await {
        Ok(()) => {
            println!("retry item {item_id}: marked pending, due immediately");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, item_id, "failed to re-queue retry item");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_discard(retry_queue: RetryQueueRepo, item_id: i64) -> ExitCode {
    match retry_queue.discard(item_id).await {
        Ok(()) => {
            println!("retry item {item_id}: discarded");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, item_id, "failed to discard retry item");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_list_connections(connections: ConnectionRepo) -> ExitCode {
    match connections.list_all().await {
        Ok(rows) => {
            for c in rows {
                println!(
                    "{:<4} {:<24} {:<10} breaker={:<9} enabled={}",
                    c.id,
                    c.name,
                    c.db_name,
                    c.circuit_breaker.state().as_str(),
                    c.enabled,
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to list connections");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_show_connection(connections: ConnectionRepo, connection_id: i64) -> ExitCode {
    match connections.get(connection_id).await {
        Ok(c) => {
            println!("id:                {}", c.id);
            println!("name:              {}", c.name);
            println!("base_url:          {}", c.base_url);
            println!("db_name:           {}", c.db_name);
            println!("login:             {}", c.login);
            println!("api_key:           {}", redact(&c.api_key));
            println!("webhook_url:       {}", c.webhook_url);
            println!("webhook_secret:    {}", redact(&c.webhook_secret));
            println!("poll_interval_s:   {}", c.poll_interval_seconds);
            println!("enabled:           {}", c.enabled);
            println!("last_sync_at:      {:?}", c.last_sync_at);
            println!("last_success_at:   {:?}", c.last_success_at);
            println!("circuit_state:     {}", c.circuit_breaker.state().as_str());
            println!("circuit_failures:  {}", c.circuit_breaker.consecutive_failures());
            println!("circuit_open_until:{:?}", c.circuit_breaker.open_until());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, connection_id, "connection not found");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_recent_logs(sync_logs: SyncLogRepo, connection_id: i64, limit: u32) -> ExitCode {
    match sync_logs.recent(connection_id, limit).await {
        Ok(rows) => {
            for log in rows {
                println!(
                    "{} found={} sent={} failed={} error={:?}",
                    log.started_at, log.orders_found, log.orders_sent, log.orders_failed, log.error_message
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, connection_id, "failed to load recent sync logs");
            ExitCode::FAILURE
        }
    }
}

fn redact(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &secret[..2])
    }
}
