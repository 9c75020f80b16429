use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;

use heron_server::agentcomm::AgentClients;
use heron_server::events::EventBus;
use heron_server::http::{self, ApiState};
use heron_server::metrics::MetricsCollector;
use heron_server::pullers::{self, PullerDeps};
use heron_server::reconcile::MachineLocks;
use heron_server::review::ReviewDispatcher;
use heron_server::store::{settings, Db};
use heron_server::{certs, store};

/// Maximum time to wait for orderly shutdown before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Brief pause after cancellation to let in-flight requests complete.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "heron-server", version, about = "Heron fleet monitoring server")]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "HERON_DATABASE_PATH", default_value = "/var/lib/heron/heron.db")]
    database: PathBuf,

    /// REST API bind address
    #[arg(long, env = "HERON_SERVER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// REST API port
    #[arg(long, env = "HERON_SERVER_PORT", default_value = "8080")]
    port: u16,

    /// Name used in the server certificate
    #[arg(long, env = "HERON_SERVER_NAME", default_value = "heron-server")]
    server_name: String,

    /// Agent RPC timeout in seconds
    #[arg(long, env = "HERON_SERVER_RPC_TIMEOUT", default_value = "10")]
    rpc_timeout: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "HERON_SERVER_LOG", default_value = "info")]
    log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "HERON_SERVER_LOG_FILE", value_name = "PATH")]
    log_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _log_guards = init_logging(env_filter, cli.log_file.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Heron server v{} starting", env!("CARGO_PKG_VERSION"));

    // ── Store ──
    let db = Db::open(&cli.database)
        .map_err(|e| anyhow::anyhow!("cannot open database {:?}: {e}", cli.database))?;
    settings::seed_defaults(&db.connection())?;
    let version = store::migrations::current_version(&db.connection())?;
    tracing::info!(schema_version = version, database = %cli.database.display(), "Store ready");

    // ── Secret material and the agent channel ──
    let identity = certs::ensure_server_material(&db, &cli.server_name)?;
    let agents = Arc::new(AgentClients::new(
        identity,
        Duration::from_secs(cli.rpc_timeout),
    ));

    // ── Core services ──
    let bus = Arc::new(EventBus::new(db.clone()));
    let locks = Arc::new(MachineLocks::new());
    let review = ReviewDispatcher::new(db.clone(), bus.clone());
    let metrics = Arc::new(MetricsCollector::new(db.clone()));

    let deps = Arc::new(PullerDeps {
        db: db.clone(),
        agents: agents.clone(),
        locks: locks.clone(),
        bus: bus.clone(),
        review: review.clone(),
    });
    let registry = pullers::build_registry(deps);

    let cancel = CancellationToken::new();
    let mut tasks = registry.spawn_all(&db, &cancel);

    // ── REST API ──
    let state = ApiState {
        db,
        bus,
        agents,
        locks,
        review,
        pullers: registry,
        metrics,
    };
    let host = cli.host.clone();
    let port = cli.port;
    let token = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = http::serve(&host, port, state, token).await {
            tracing::error!(error = %e, "REST API failed");
        }
    }));

    tracing::info!("Ready.");
    shutdown_signal().await;
    tracing::info!("Shutting down...");

    let shutdown = async {
        cancel.cancel();
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        tracing::warn!("Shutdown timed out after {SHUTDOWN_TIMEOUT:?} — forcing exit");
    }
    Ok(())
}

/// Wait for Ctrl+C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
}

/// Initialize tracing with stderr + optional file output.
/// Returns guards that must be held for the lifetime of the program
/// to ensure the non-blocking writers flush on shutdown.
fn init_logging(
    env_filter: tracing_subscriber::EnvFilter,
    log_file: Option<&std::path::Path>,
) -> anyhow::Result<Vec<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::prelude::*;

    let (nb_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(nb_stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (nb_file, file_guard) = tracing_appender::non_blocking(file);
        let file_layer = tracing_subscriber::fmt::layer().with_writer(nb_file);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        Ok(vec![stderr_guard, file_guard])
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();

        Ok(vec![stderr_guard])
    }
}
