use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use heron_agent::credentials::CredentialsStore;
use heron_agent::monitor::AppMonitor;
use heron_agent::rpc::RpcService;
use heron_agent::{dirs, exporter, forward, register, rpc};

/// Maximum time to wait for orderly shutdown before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Brief pause after cancellation to let in-flight requests complete.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "heron-agent", version, about = "Heron fleet monitoring agent")]
struct Cli {
    /// Address the server should use to reach this agent
    #[arg(long, env = "HERON_AGENT_ADDRESS")]
    address: Option<String>,

    /// RPC port the server connects to
    #[arg(long, env = "HERON_AGENT_RPC_PORT", default_value = "8140")]
    rpc_port: u16,

    /// HTTP port for the health probe and metrics re-export
    #[arg(long, env = "HERON_AGENT_HTTP_PORT", default_value = "9119")]
    http_port: u16,

    /// Server URL used to auto-register when no identity exists yet
    #[arg(short = 'u', long, env = "HERON_AGENT_SERVER_URL", global = true)]
    server_url: Option<String>,

    /// Basic-Auth credentials file for the Kea Control Agent
    #[arg(long, env = "HERON_AGENT_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    /// Skip TLS certificate verification when talking to local daemons
    #[arg(long, env = "HERON_AGENT_SKIP_TLS_CERT_VERIFICATION")]
    skip_tls_cert_verification: bool,

    /// Downstream Prometheus endpoints to relay on /metrics
    #[arg(long = "scrape-target", env = "HERON_AGENT_SCRAPE_TARGETS", value_delimiter = ',')]
    scrape_targets: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "HERON_AGENT_LOG", default_value = "info")]
    log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to file (in addition to stderr)
    #[arg(long, env = "HERON_AGENT_LOG_FILE", value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register this agent with a Heron server
    Register,
    /// Show version information
    Version,
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

    if let Some(Command::Version) = &cli.command {
        println!("heron-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let address = match &cli.address {
        Some(address) => address.clone(),
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    if let Some(Command::Register) = &cli.command {
        let server_url = cli
            .server_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("registration requires --server-url"))?;
        register::register(server_url, &address, cli.rpc_port).await?;
        return Ok(());
    }

    daemon_mode(cli, address).await
}

async fn daemon_mode(cli: Cli, address: String) -> anyhow::Result<()> {
    dirs::ensure_state_dir()?;
    tracing::info!("Heron agent v{} starting", env!("CARGO_PKG_VERSION"));

    // ── Identity: register on first boot when a server URL is known ──
    let identity = match register::load_identity() {
        Some(identity) => identity,
        None => {
            let Some(server_url) = cli.server_url.as_deref() else {
                anyhow::bail!(
                    "no agent identity found; run `heron-agent register -u <server-url>` first"
                );
            };
            tracing::info!("No identity found; registering with {server_url}");
            register::register(server_url, &address, cli.rpc_port).await?;
            register::load_identity()
                .ok_or_else(|| anyhow::anyhow!("registration did not produce an identity"))?
        }
    };

    // ── Credentials store ──
    let credentials = Arc::new(CredentialsStore::new());
    let credentials_path = cli
        .credentials_file
        .clone()
        .unwrap_or_else(dirs::credentials_path);
    match credentials.load_if_exists(&credentials_path) {
        Ok(()) if !credentials.is_empty() => {
            tracing::info!(count = credentials.len(), "Loaded Kea credentials");
        }
        Ok(()) => {}
        Err(e) => {
            tracing::error!(error = %e, path = %credentials_path.display(),
                "Cannot read the credentials file");
            return Err(e.into());
        }
    }

    // ── App detection ──
    let monitor = Arc::new(AppMonitor::new());
    monitor.detect_once();
    tracing::info!(count = monitor.apps().len(), "Initial app detection complete");

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let detection_monitor = monitor.clone();
    let token = cancel.clone();
    tasks.push(tokio::spawn(async move {
        detection_monitor.run_detection_loop(token).await;
    }));

    // ── RPC service ──
    let service = Arc::new(RpcService {
        monitor: monitor.clone(),
        credentials: credentials.clone(),
        client: forward::http_client(cli.skip_tls_cert_verification),
    });
    let rpc_identity = identity.clone();
    let rpc_port = cli.rpc_port;
    let token = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = rpc::serve("0.0.0.0", rpc_port, &rpc_identity, service, token).await {
            tracing::error!(error = %e, "RPC service failed");
        }
    }));

    // ── Metrics endpoint ──
    let exporter_state = exporter::ExporterState::new(
        monitor.clone(),
        forward::http_client(cli.skip_tls_cert_verification),
        cli.scrape_targets.clone(),
    );
    let http_port = cli.http_port;
    let token = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = exporter::serve(http_port, exporter_state, token).await {
            tracing::error!(error = %e, "Metrics endpoint failed");
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
