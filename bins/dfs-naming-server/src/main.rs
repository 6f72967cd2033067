use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dfs_naming_service::{NamingServerConfig, NamingServiceImpl};

/// DFS Naming Server
#[derive(Parser, Debug)]
#[command(name = "dfs-naming-server", version, about)]
struct Args {
    /// Path to configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    dump_default_config: bool,
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for CTRL+C")?;
                tracing::info!("Received CTRL+C");
            }
            _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for CTRL+C")?;
        tracing::info!("Received CTRL+C");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        let text = NamingServerConfig::default()
            .to_toml_string()
            .context("failed to render default config")?;
        print!("{}", text);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => NamingServerConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NamingServerConfig::default(),
    };

    let _log_guard = dfs_logging::init_logging(&config.log).context("failed to set up logging")?;

    tracing::info!(
        config = ?args.config,
        read_threshold = config.naming.replication.read_threshold,
        lock_timeout = ?config.naming.lock_timeout,
        "Starting DFS naming server"
    );

    let service = NamingServiceImpl::new(config.naming);
    tracing::info!("Naming server initialization complete");

    wait_for_shutdown_signal().await?;

    tracing::info!("Naming server shutting down");
    service.shutdown().await;
    let stats = service.replication().stats();
    tracing::info!(
        scheduled = stats.scheduled,
        succeeded = stats.succeeded,
        failed = stats.failed,
        dropped = stats.dropped,
        "Replication summary"
    );

    Ok(())
}
