//! LaneGate server binary.

use clap::{Parser, Subcommand};
use lanegate::backend::HttpBackend;
use lanegate::config::GatewayConfig;
use lanegate::gateway::Gateway;
use lanegate::logging::{self, LogFormat};
use lanegate::watermark::TrailerWatermarker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Two-lane admission and synthesis gateway
#[derive(Debug, Parser)]
#[command(name = "lanegate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve {
        /// YAML configuration file
        #[arg(short, long, env = "LANEGATE_CONFIG")]
        config: Option<PathBuf>,

        /// Override the listen address from the config file
        #[arg(long)]
        listen: Option<String>,

        /// Secret keying the free-lane watermark
        #[arg(long, env = "LANEGATE_WATERMARK_SECRET", hide_env_values = true)]
        watermark_secret: String,
    },
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// YAML configuration file
        #[arg(short, long, env = "LANEGATE_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            listen,
            watermark_secret,
        } => serve(config, listen, watermark_secret).await,
        Command::CheckConfig { config } => {
            let config = GatewayConfig::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    watermark_secret: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::load(config_path.as_deref())?;
    let listen_addr = listen.unwrap_or_else(|| config.listen_addr.clone());

    // The gateway enforces its own per-lane timeout; this only stops a dead
    // connection from living forever.
    let client_timeout = config
        .lanes
        .priority
        .backend_timeout
        .max(config.lanes.free.backend_timeout)
        + Duration::from_secs(30);
    let backend = HttpBackend::new(&config.backend_url, client_timeout)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %listen_addr,
        backend = %config.backend_url,
        "Starting LaneGate"
    );

    let gateway = Gateway::builder(config)
        .backend(Arc::new(backend))
        .watermarker(Arc::new(TrailerWatermarker::new(watermark_secret)))
        .build()?;

    let shutdown = CancellationToken::new();
    let maintenance = gateway.spawn_maintenance(shutdown.clone());

    let listener = TcpListener::bind(&listen_addr).await.map_err(|e| {
        error!(addr = %listen_addr, error = %e, "Failed to bind");
        e
    })?;

    let app = lanegate::http::router(gateway.clone());
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            gateway.shutdown();
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = maintenance.await;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
