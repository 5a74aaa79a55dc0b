//! Chatlink — WebSocket connection lifecycle manager
//!
//! Accepts authenticated WebSocket connections for the chat/agent platform,
//! keeps their tokens fresh, sends heartbeats and hands every message to the
//! platform's message manager and agent pipeline.
//!
//! Usage:
//!   chatlink --auth-url http://auth.internal/api/auth          # Port 8080, no database
//!   chatlink --auth-url … --database-url postgres://…          # Identity checks against Postgres
//!   chatlink --auth-url … --agent-url http://agents/intake     # Forward agent traffic over HTTP
//!   chatlink --auth-url … --tls-cert cert.pem --tls-key key.pem

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chatlink_protocol::{ConnectionLimits, FeatureFlags};
use chatlink_server::{
    Collaborators, ConnectionManager, ConnectionRegistry, Environment, ManagerConfig,
};
use chatlink_services::{
    AcceptAllDirectory, AgentProcessor, HttpAgentProcessor, HttpAuthService,
    LocalUnifiedManager, LoggingAgentProcessor, PostgresUserDirectory, UserDirectory,
};
use chatlink_transport::{TlsConfig, TransportConfig, TransportServer};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chatlink", about = "Chatlink — WebSocket connection lifecycle manager")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, env = "CHATLINK_PORT", default_value = "8080")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, env = "CHATLINK_HOST", default_value = "127.0.0.1")]
    hostname: String,

    /// Base URL of the auth service (`/validate` and `/refresh` are appended)
    #[arg(long, env = "CHATLINK_AUTH_URL")]
    auth_url: String,

    /// Postgres URL of the user directory (every user is accepted if omitted)
    #[arg(long, env = "CHATLINK_DATABASE_URL")]
    database_url: Option<String>,

    /// Agent pipeline intake URL (agent traffic is only logged if omitted)
    #[arg(long, env = "CHATLINK_AGENT_URL")]
    agent_url: Option<String>,

    /// development, test, staging or production
    #[arg(long, env = "CHATLINK_ENV", default_value = "development")]
    environment: Environment,

    /// Live connections per user before the oldest is evicted
    #[arg(long, env = "CHATLINK_MAX_CONNECTIONS_PER_USER", default_value = "5")]
    max_connections_per_user: usize,

    /// Seconds between heartbeat frames
    #[arg(long, env = "CHATLINK_HEARTBEAT_INTERVAL", default_value = "30")]
    heartbeat_interval: u64,

    /// Seconds of silence before a MESSAGE_TIMEOUT notice
    #[arg(long, env = "CHATLINK_RECEIVE_TIMEOUT", default_value = "60")]
    receive_timeout: u64,

    /// Largest accepted inbound message in bytes
    #[arg(long, env = "CHATLINK_MAX_MESSAGE_SIZE", default_value = "10240")]
    max_message_size: usize,

    /// Timeout in seconds for calls to the auth service and agent pipeline
    #[arg(long, env = "CHATLINK_SERVICE_TIMEOUT", default_value = "5")]
    service_timeout: u64,

    /// Allow cross-origin requests
    #[arg(long, env = "CHATLINK_CORS")]
    cors: bool,

    /// Path to TLS certificate (PEM)
    #[arg(long, env = "CHATLINK_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long, env = "CHATLINK_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "CHATLINK_LOG_JSON")]
    log_json: bool,

    /// Write logs to a file instead of stderr
    #[arg(long, env = "CHATLINK_LOG_FILE")]
    log_file: Option<PathBuf>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match &cli.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let builder = builder
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false);
            eprintln!("Logging to {}", path.display());
            if cli.log_json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None if cli.log_json => builder.json().try_init(),
        None => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

async fn build_collaborators(cli: &Cli) -> anyhow::Result<Collaborators> {
    let timeout = Duration::from_secs(cli.service_timeout);

    let auth = HttpAuthService::new(&cli.auth_url, timeout).context("failed to build auth client")?;

    let directory: Arc<dyn UserDirectory> = match &cli.database_url {
        Some(url) => Arc::new(
            PostgresUserDirectory::connect(url)
                .await
                .context("failed to connect to the user directory")?,
        ),
        None => {
            if cli.environment == Environment::Production {
                warn!("No database configured in production; identity checks accept every user");
            }
            Arc::new(AcceptAllDirectory)
        }
    };

    let agent: Arc<dyn AgentProcessor> = match &cli.agent_url {
        Some(url) => Arc::new(
            HttpAgentProcessor::new(url.as_str(), timeout)
                .context("failed to build agent client")?,
        ),
        None => Arc::new(LoggingAgentProcessor),
    };

    Ok(Collaborators {
        auth: Arc::new(auth),
        directory,
        unified: Arc::new(LocalUnifiedManager::new()),
        agent,
    })
}

fn manager_config(cli: &Cli) -> ManagerConfig {
    ManagerConfig {
        limits: ConnectionLimits {
            max_connections_per_user: cli.max_connections_per_user,
            max_message_size: cli.max_message_size,
            heartbeat_interval: cli.heartbeat_interval,
            ..ConnectionLimits::default()
        },
        features: FeatureFlags::default(),
        receive_timeout: Duration::from_secs(cli.receive_timeout),
        auth_call_timeout: Duration::from_secs(cli.service_timeout),
        environment: cli.environment,
        ..ManagerConfig::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let tls = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        }),
        (None, None) => None,
        _ => bail!("--tls-cert and --tls-key must be given together"),
    };

    let collaborators = build_collaborators(&cli).await?;
    let config = manager_config(&cli);
    let registry = Arc::new(ConnectionRegistry::new(
        config.limits.max_connections_per_user,
    ));
    let manager = Arc::new(ConnectionManager::new(config, registry, collaborators));

    let transport_config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        enable_cors: cli.cors,
        tls,
        ..TransportConfig::default()
    };
    let mut transport = TransportServer::start(transport_config, manager.clone())
        .await
        .context("failed to start transport")?;

    let scheme = if transport.is_tls() { "wss" } else { "ws" };
    println!();
    println!("  Chatlink connection manager");
    println!();
    println!("  Environment:  {}", cli.environment);
    println!("  WebSocket:    {scheme}://{}:{}/ws?token=…", cli.hostname, transport.port());
    println!("  Discovery:    http://{}:{}/ws/info", cli.hostname, transport.port());
    println!("  Auth service: {}", cli.auth_url);
    println!(
        "  Directory:    {}",
        if cli.database_url.is_some() { "postgres" } else { "accept-all" }
    );
    println!(
        "  Agents:       {}",
        cli.agent_url.as_deref().unwrap_or("logging only")
    );
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!(
        "Shutting down with {} live connections",
        manager.stats().total_connections
    );
    transport.stop().await;
    Ok(())
}
