use anyhow::Context;
use clap::Parser;
use punch_gateway::{api, logging, services, AppState, Config, Database};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;

/// Push-protocol gateway for biometric attendance terminals
#[derive(Parser, Debug)]
#[command(name = "punch-gateway")]
#[command(about = "Receives terminal pushes and dispatches queued commands on poll")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.punch-gateway/gateway.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Write the default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if cli.init_config {
        Config::default().save(&config_path)?;
        println!("Wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(port) = cli.port {
        let mut addr: SocketAddr = config.server.listen_addr.parse()?;
        addr.set_port(port);
        config.server.listen_addr = addr.to_string();
    }
    config.validate()?;

    let _log_guard = logging::init_logging(&config.logging)?;

    info!("Starting punch gateway");

    // Initialize database
    let db_path = config.database_path()?;
    info!(path = %db_path.display(), "Using database");

    let db_path_str = db_path.to_str().with_context(|| {
        format!("Invalid database path (contains invalid UTF-8): {}", db_path.display())
    })?;
    let db = Database::new(db_path_str)?;

    info!("Running database migrations");
    db.migrate()?;

    let state = AppState::new(db, &config);

    let seeded = state.time_windows.seed_defaults_if_empty()?;
    if seeded > 0 {
        info!(count = seeded, "Installed default time windows");
    }

    info!("Starting command sweeper");
    tokio::spawn(services::command_sweeper(
        state.queue.clone(),
        config.sweep_interval(),
        config.stale_timeout(),
    ));

    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    info!(address = %config.server.listen_addr, "Gateway listening");

    // Start server with graceful shutdown; peer addresses feed device registration
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Gateway shut down");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
