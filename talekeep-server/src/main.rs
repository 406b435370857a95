//! # Talekeep Server
//!
//! HTTP surface and process lifecycle for the Talekeep audiobook library.
//!
//! ## Overview
//!
//! Every long-running activity (scans, organization, metadata enrichment,
//! iTunes import/write-back, dump ingestion, backups) runs through one
//! persistent operation queue; requests return immediately with an operation
//! id and clients observe progress over the `/events` stream.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - SQLite or sled for persistent storage (selected at startup)
//! - an in-process event hub for real-time progress fan-out
//! - a TTL cache for the filesystem size aggregates on `/system/status`
//! - a windowed scheduler for cadenced maintenance

/// Error types and handling
pub mod errors;

/// Request handlers
pub mod handlers;

/// Route organization
pub mod routes;

/// Cadenced maintenance tasks
pub mod scheduled;

/// Shared application state
pub mod state;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use talekeep_config::DatabaseBackend;
use talekeep_core::CoreError;
use talekeep_core::cache::SizeCache;
use talekeep_core::events::EventHub;
use talekeep_core::ops::{self, OpsContext};
use talekeep_core::queue::OperationQueue;
use talekeep_core::scheduler::{ScheduleSpec, Scheduler};
use talekeep_core::secrets::Vault;
use talekeep_core::store::{SledStore, SqliteStore, Store};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::scheduled::ScheduledBackup;
use crate::state::AppState;

const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_SHUTDOWN_TIMEOUT: i32 = 3;

/// Command line arguments for the Talekeep server
#[derive(Parser, Debug)]
#[command(name = "talekeep-server")]
#[command(about = "Personal audiobook library server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, env = "TALEKEEP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port
    #[arg(long)]
    port: Option<u16>,

    /// Passphrase for encrypting secret settings
    #[arg(long, env = "TALEKEEP_SECRETS_PASSPHRASE", hide_env_values = true)]
    secrets_passphrase: Option<String>,

    /// Seconds to wait for running operations at shutdown
    #[arg(long, default_value_t = 30)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talekeep=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match talekeep_config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration error");
            return EXIT_CONFIG_ERROR;
        }
    };
    for warning in talekeep_config::validate(&mut config) {
        warn!(field = warning.field, "{}", warning.message);
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if let Err(err) = std::fs::create_dir_all(&config.database.data_dir) {
        error!(%err, dir = %config.database.data_dir.display(), "cannot create data directory");
        return EXIT_INIT_FAILURE;
    }

    // Initialization order: store → hub → cache → queue → scheduler → HTTP.
    // Teardown runs in reverse.
    let store: Arc<dyn Store> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            match SqliteStore::open(&config.database.sqlite_path()).await {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    error!(%err, "failed to open sqlite store");
                    return EXIT_INIT_FAILURE;
                }
            }
        }
        DatabaseBackend::Sled => match SledStore::open(&config.database.sled_path()) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                error!(%err, "failed to open sled store");
                return EXIT_INIT_FAILURE;
            }
        },
    };
    info!(backend = ?config.database.backend, "store ready");

    let hub = EventHub::new(config.event_hub.client_buffer);
    let heartbeat = hub.spawn_heartbeat(Duration::from_secs(
        config.event_hub.heartbeat_interval_secs.max(1),
    ));

    let cache = Arc::new(SizeCache::new(Duration::from_secs(
        config.cache.library_size_ttl_secs,
    )));

    let queue = OperationQueue::new(hub.clone(), &config.queue);
    queue.set_store(store.clone());
    queue.start();

    let ops_context = OpsContext {
        store: store.clone(),
        root_dir: config.library.root_dir.clone(),
        data_dir: config.database.data_dir.clone(),
        backup: config.backup.clone(),
        metadata: config.metadata.clone(),
    };
    resume_interrupted(&store, &queue, &ops_context).await;

    let scheduler_config = config.scheduler.clone();
    let scheduler = Scheduler::start(
        "backup",
        move || ScheduleSpec {
            enabled: scheduler_config.enabled,
            check_interval_minutes: scheduler_config.check_interval_minutes,
            window_start: scheduler_config.window_start,
            window_end: scheduler_config.window_end,
        },
        Arc::new(ScheduledBackup {
            queue: queue.clone(),
            ops: ops_context.clone(),
        }),
    );

    let vault = args
        .secrets_passphrase
        .as_deref()
        .map(Vault::from_passphrase);

    let app = routes::router(AppState {
        store: store.clone(),
        hub: hub.clone(),
        cache,
        queue: queue.clone(),
        ops: ops_context,
        config: config.clone(),
        vault,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr, "failed to bind");
            return EXIT_INIT_FAILURE;
        }
    };
    info!(addr, "talekeep server listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(%err, "server error");
        return EXIT_INIT_FAILURE;
    }

    info!("shutting down");
    scheduler.stop();
    let grace = Duration::from_secs(args.shutdown_grace_secs.max(1));
    let code = match queue.shutdown(grace).await {
        Ok(()) => EXIT_OK,
        Err(CoreError::Timeout) => {
            error!("operations did not drain within the shutdown grace period");
            EXIT_SHUTDOWN_TIMEOUT
        }
        Err(err) => {
            error!(%err, "queue shutdown failed");
            EXIT_SHUTDOWN_TIMEOUT
        }
    };
    heartbeat.abort();
    code
}

/// Re-enqueue operations a previous lifetime left interrupted.
async fn resume_interrupted(
    store: &Arc<dyn Store>,
    queue: &Arc<OperationQueue>,
    ops_context: &OpsContext,
) {
    let interrupted = match store.list_interrupted_operations().await {
        Ok(interrupted) => interrupted,
        Err(err) => {
            warn!(%err, "could not list interrupted operations");
            return;
        }
    };
    for record in interrupted {
        match ops::resume_body(&record, ops_context) {
            Some(body) => {
                match queue
                    .enqueue_resume(record.id.clone(), record.op_type, record.priority, body)
                    .await
                {
                    Ok(()) => info!(id = %record.id, op_type = %record.op_type, "resumed interrupted operation"),
                    Err(err) => warn!(id = %record.id, %err, "failed to resume operation"),
                }
            }
            None => {
                warn!(
                    id = %record.id,
                    op_type = %record.op_type,
                    "cannot reconstruct request context, leaving interrupted"
                );
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
