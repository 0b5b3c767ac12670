use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use netfs_client::{ClientConfig, StaticCredentials, VnodeTable, VolumeManager, ioctl};
use netfs_config::{Config, ConfigManager};
use netfs_net::tcp::TcpConnector;

/// netfs client mount daemon
#[derive(Parser, Debug)]
#[command(name = "netfs-mount", version, about)]
struct Args {
    /// Path to configuration file; defaults apply when it is absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server to add by name or address, besides the discovered ones
    #[arg(short, long = "server")]
    servers: Vec<String>,

    /// Print the default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => { tracing::info!("received CTRL+C"); }
        _ = sigterm.recv() => { tracing::info!("received SIGTERM"); }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", ClientConfig::default().to_toml_string()?);
        return Ok(());
    }

    let configs = match &args.config {
        Some(path) => ConfigManager::<ClientConfig>::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigManager::new(ClientConfig::default()),
    };
    let config = configs.snapshot();
    let _log_guard = netfs_logging::init_logging(&config.log)?;

    tracing::info!(
        config = ?args.config,
        mount_id = %config.mount.mount_id,
        discovery = config.discovery.enabled,
        "starting netfs mount"
    );

    let connector = TcpConnector::new(config.connection.upstream_channels, config.connection.downstream_channels);
    let credentials = StaticCredentials::from_config(&config.auth);
    let manager = VolumeManager::new(config, VnodeTable::new(), Arc::new(credentials), Arc::new(connector));

    let root_id = manager.mount_root_volume().await?;
    if let Some(root) = manager.root_volume() {
        for name in &args.servers {
            let arg = ioctl::server_name_arg(name)?;
            match root.ioctl(root_id, ioctl::ADD_SERVER, &arg).await {
                Ok(()) => tracing::info!(server = %name, "server added"),
                Err(status) => tracing::warn!(server = %name, %status, "cannot add server"),
            }
        }
    }

    wait_for_shutdown_signal().await?;
    tracing::info!("netfs mount shutting down");
    manager.unmount().await;
    Ok(())
}
