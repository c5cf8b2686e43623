//! db-proxy - SSH-tunneled PostgreSQL interception proxy
//!
//! This binary loads the YAML configuration, starts the SSH tunnel listener
//! and the event-drain endpoint, and optionally re-reads the rule set on a
//! timer so policy changes apply to connections already in flight.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use db_proxy::{abac::Abac, config, Notifier, NotifierServer, Result, Tunnel};

#[derive(Parser)]
#[command(name = "db-proxy")]
#[command(version)]
#[command(about = "SSH-tunneled PostgreSQL interception proxy")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(&cli.config)?;

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    info!("starting db-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("loaded configuration from {:?}", cli.config);

    let config = Arc::new(config);
    let abac = Arc::new(Abac::new(&config.abac_rules)?);

    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    let notifier = if config.notifier.enabled {
        let (notifier, queue) = Notifier::bounded(config.notifier.capacity);
        let server = NotifierServer::new(config.notifier.clone(), queue);
        let server_token = token.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = server.serve(server_token).await {
                error!("notifier server: {err}");
            }
        }));
        notifier
    } else {
        Notifier::disabled()
    };

    let tunnel = Tunnel::new(Arc::clone(&config), Arc::clone(&abac), notifier)?;
    let tunnel_token = token.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = tunnel.serve(tunnel_token).await {
            error!("tunnel: {err}");
        }
    }));

    if config.hot_reload.enabled {
        let reload_token = token.clone();
        let reload_abac = Arc::clone(&abac);
        let config_path = cli.config.clone();
        let period = Duration::from_secs(config.hot_reload.period_secs);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = reload_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match config::load_config(&config_path) {
                    Ok(fresh) => match reload_abac.update(&fresh.abac_rules) {
                        Ok(()) => info!("reloaded {} abac rules", fresh.abac_rules.len()),
                        Err(err) => error!("rule reload rejected: {err}"),
                    },
                    Err(err) => error!("config re-read failed: {err}"),
                }
            }
        }));
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("received SIGTERM, shutting down");
        }
    }

    token.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("shutdown complete");

    Ok(())
}
