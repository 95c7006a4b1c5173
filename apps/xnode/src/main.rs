use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod panel;
mod sync;
mod xray;

use config::{AppConfig, SyncMode, XrayConfig};
use panel::{LocalCatalog, build_adapter};
use sync::{FixedDelay, Orchestrator, Source};
use xray::XrayClient;
use xray::inbound::TlsFiles;
use xray::process::{XrayProcess, wait_for_port};

/// How long to wait for the engine's API port after startup.
const ENGINE_STARTUP: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "Sync panel nodes and users into Xray", long_about = None)]
struct Cli {
    /// Config file
    #[arg(short, long, env = "XNODE_CONFIG", default_value = "xnode.toml")]
    config: PathBuf,

    /// Overrides `[log].level`. RUST_LOG wins over both.
    #[arg(long, env = "XNODE_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the sync loop (default)
    Run,
    /// Load and validate the config, then exit
    CheckConfig,
    /// Write a starter config file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Init => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"));
            if config::write_template(&cli.config)? {
                info!("📝 Wrote {}", cli.config.display());
            } else {
                warn!("⚠️ {} already exists, left untouched", cli.config.display());
            }
            Ok(())
        }
        Command::CheckConfig => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"));
            let config = AppConfig::load(&cli.config)?;
            info!("✅ {} is valid ({:?} mode)", cli.config.display(), config.sync.mode);
            match config.sync.mode {
                SyncMode::Remote => {
                    if let Some(panel) = &config.panel {
                        info!("🔗 {:?} panel at {}, node {}", panel.kind, panel.endpoint, panel.node_id);
                    }
                }
                SyncMode::Local => {
                    let catalog = LocalCatalog::from_config(&config.local);
                    info!(
                        "📁 {} nodes, {} users, {} rejected",
                        catalog.nodes.len(),
                        catalog.users.len(),
                        catalog.rejected.len()
                    );
                }
            }
            Ok(())
        }
        Command::Run => {
            let config = AppConfig::load(&cli.config)?;
            init_tracing(cli.log_level.as_deref().unwrap_or(&config.log.level));
            run(config).await
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!("🚀 xnode v{} starting in {:?} mode", env!("CARGO_PKG_VERSION"), config.sync.mode);

    let source = match config.sync.mode {
        SyncMode::Remote => {
            let panel = config
                .panel
                .as_ref()
                .context("remote mode requires a [panel] section")?;
            let adapter = build_adapter(panel)?;
            info!("🔗 Panel: {:?} at {} (node {})", panel.kind, panel.endpoint, panel.node_id);
            Source::Remote(adapter)
        }
        SyncMode::Local => {
            let catalog = LocalCatalog::from_config(&config.local);
            info!(
                "📁 Local catalog: {} nodes, {} users",
                catalog.nodes.len(),
                catalog.users.len()
            );
            Source::Local(catalog)
        }
    };

    let engine = match (&config.xray.executable, &config.xray.config_dir) {
        (Some(executable), Some(dir)) => {
            Some(XrayProcess::start(executable, dir, config.xray.api_port).await?)
        }
        _ => None,
    };

    let api_ready = wait_for_port(&config.xray.api_host, config.xray.api_port, ENGINE_STARTUP).await;
    if let Err(e) = api_ready {
        if let Some(engine) = engine {
            engine.stop(config.sync.shutdown_grace()).await;
        }
        return Err(e);
    }

    let client = XrayClient::connect_lazy(
        &config.xray.api_host,
        config.xray.api_port,
        config.xray.call_timeout(),
        tls_files(&config.xray),
    )?;
    info!("✅ Xray API reachable at {}:{}", config.xray.api_host, config.xray.api_port);

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("🛑 Shutdown signal received");
        shutdown_signal.cancel();
    });

    let mut orchestrator = Orchestrator::new(
        source,
        Arc::new(client),
        Box::new(FixedDelay(config.sync.interval())),
    );
    let loop_token = shutdown.clone();
    let mut sync_task = tokio::spawn(async move { orchestrator.run(loop_token).await });

    let interrupted = tokio::select! {
        result = &mut sync_task => {
            if let Err(e) = result {
                error!("❌ Sync loop crashed: {e}");
            }
            false
        }
        _ = shutdown.cancelled() => true,
    };

    if interrupted {
        let grace = config.sync.shutdown_grace();
        match tokio::time::timeout(grace, &mut sync_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("❌ Sync loop crashed: {e}"),
            Err(_) => {
                warn!("⚠️ Sync cycle still running after {grace:?}, aborting");
                sync_task.abort();
            }
        }
    }

    if let Some(engine) = engine {
        engine.stop(config.sync.shutdown_grace()).await;
    }
    info!("👋 xnode stopped");
    Ok(())
}

fn tls_files(xray: &XrayConfig) -> Option<TlsFiles> {
    match (&xray.cert_path, &xray.key_path) {
        (Some(cert), Some(key)) => Some(TlsFiles {
            cert_path: cert.clone(),
            key_path: key.clone(),
        }),
        (None, None) => None,
        _ => {
            warn!("⚠️ xray.cert_path and xray.key_path must be set together, TLS inbounds disabled");
            None
        }
    }
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// `RUST_LOG` takes precedence over `level`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .init();
}
