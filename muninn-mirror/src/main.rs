#![forbid(unsafe_code)]

use clap::Parser;
use muninn_mirror_lib::{load_from_path, Config, Registry, Role};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "muninn - network-replicated block device")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/muninn/muninn.toml")]
    config: PathBuf,

    /// Promote the device to Primary once configured
    #[arg(long)]
    primary: bool,

    /// With --primary: forced promotion, bumping the human-intervention
    /// counter
    #[arg(long)]
    force: bool,

    /// Log the device status line every N seconds (0 disables)
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    status_interval: u64,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            init_tracing(None);
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    init_tracing(Some(&cfg));

    info!(
        minor = cfg.minor,
        disk = %cfg.disk.path.display(),
        peer = %cfg.net.peer_addr,
        protocol = %cfg.net.protocol,
        "configuration loaded"
    );

    if let Err(err) = run(cfg, &cli).await {
        error!(%err, "mirror daemon exited with error");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, cli: &Cli) -> muninn_mirror_lib::Result<()> {
    let registry = Arc::new(Registry::new());
    let dev = registry.device(cfg.minor);

    dev.configure_disk(&cfg.disk, &cfg.meta.dir).await?;
    registry.configure_net(cfg.minor, cfg.net.clone()).await?;

    if cli.primary {
        dev.set_role(Role::Primary, cli.force).await?;
    }

    if cli.status_interval > 0 {
        let registry = Arc::clone(&registry);
        let period = std::time::Duration::from_secs(cli.status_interval);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                for line in registry.status().lines() {
                    info!("{line}");
                }
            }
        });
    }

    wait_for_shutdown().await?;

    info!("shutting down");
    dev.unconfigure_all().await?;
    Ok(())
}

async fn wait_for_shutdown() -> muninn_mirror_lib::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(muninn_mirror_lib::MirrorError::Io)?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(muninn_mirror_lib::MirrorError::Io)?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

fn init_tracing(cfg: Option<&Config>) {
    let (level, show_target) = cfg
        .map(|c| (c.logging.level.clone(), c.logging.show_target))
        .unwrap_or_else(|| ("info".to_string(), false));
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(show_target)
        .init();
}
