// carelink-proxy
// Local HTTP proxy for the latest CareLink reading, with tracing logging
use anyhow::Result;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    signal,
    sync::watch,
    time::{timeout, Duration},
};
use tracing::{error, info, level_filters::LevelFilter, warn};

use carelink_proxy::cli::{Args, Commands, LogLevel};
use carelink_proxy::client::HttpCarelinkClient;
use carelink_proxy::commands::{command_check, command_config};
use carelink_proxy::config::{
    resolve_config, show_config, token_from_env, validate_effective_config, Config,
};
use carelink_proxy::handlers;
use carelink_proxy::poller::Poller;
use carelink_proxy::state::AppState;
use carelink_proxy::store::SnapshotStore;

/// How long the poller gets to notice shutdown before it is aborted.
const POLLER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Initializes tracing logging subsystem with configured log level
fn setup_logging(config: &Config) {
    let level = config.log_level();
    let filter = match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return;
    }

    info!("Logging initialized with level: {:?}", level);
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// -------------------------------------------------------------------
/// MAIN APPLICATION ENTRY POINT
/// -------------------------------------------------------------------
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format);
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        return match command {
            Commands::Config {
                output,
                format,
                commented,
            } => command_config(output.clone(), *format, *commented),
            Commands::Check => {
                let config = resolve_config(&args)?;
                validate_effective_config(&config)?;
                if let Err(e) = command_check(&config).await {
                    eprintln!("❌ Check failed: {}", e);
                    std::process::exit(1);
                }
                Ok(())
            }
        };
    }

    // Load configuration for main server mode
    let config = resolve_config(&args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config);
    info!(
        "Starting Carelink Client Proxy (version {})",
        env!("CARGO_PKG_VERSION")
    );

    // The store is the only state shared between poller and HTTP handlers
    let store = Arc::new(SnapshotStore::new());

    // Start background poller
    let client = HttpCarelinkClient::new(config.api_base_url(), config.request_timeout())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = Poller::new(
        client,
        store.clone(),
        token_from_env(),
        config.poll_settings(),
        shutdown_rx,
    );
    let mut background_task = tokio::spawn(poller.run());

    // Configure HTTP server and start listening
    let addr = SocketAddr::new(config.bind().parse::<IpAddr>()?, config.port());
    let app = handlers::router(AppState::new(store));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server started at http://{}", addr);

    let server = axum::serve(listener, app);

    let server_result = tokio::select! {
        result = server => result,
        _ = shutdown_signal() => Ok(()),
    };

    // Wake the poller out of its sleep; abort it if a download is in flight
    let _ = shutdown_tx.send(true);
    if timeout(POLLER_STOP_TIMEOUT, &mut background_task).await.is_err() {
        warn!("Poller did not stop in time, aborting");
        background_task.abort();
    }

    if let Err(e) = server_result {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("carelink-proxy stopped");
    Ok(())
}
