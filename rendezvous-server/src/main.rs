// Rendezvous server: HTTP exchange endpoints plus the cross-instance bridge.

mod config;
mod http;
mod multicast;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use rendezvous_core::{LocalHub, PubSub, Rendezvous};

use crate::config::BridgeMode;

#[derive(Parser, Debug)]
#[command(name = "rendezvous-server")]
#[command(about = "Rendezvous service exchanging peer addresses for NAT traversal")]
#[command(version)]
struct Args {
    /// Config file (default: ~/.config/rendezvous/config.toml, then /etc/rendezvous/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let bus: Arc<dyn PubSub> = match cfg.bridge {
            BridgeMode::Local => {
                info!("bridge: in-process only");
                Arc::new(LocalHub::new())
            }
            BridgeMode::Multicast => {
                let hub = multicast::MulticastHub::bind(
                    cfg.multicast_group,
                    cfg.multicast_port,
                    cfg.multicast_ttl,
                )
                .with_context(|| {
                    format!(
                        "joining multicast group {}:{}",
                        cfg.multicast_group, cfg.multicast_port
                    )
                })?;
                info!(
                    "bridge: multicast {}:{} as instance {}",
                    cfg.multicast_group,
                    cfg.multicast_port,
                    hub.instance()
                );
                tokio::spawn({
                    let hub = hub.clone();
                    async move {
                        if let Err(e) = hub.run().await {
                            error!("bridge receive loop stopped: {}", e);
                        }
                    }
                });
                hub
            }
        };

        let state = Arc::new(http::AppState {
            service: Rendezvous::new(bus).with_exchange_timeout(cfg.exchange_timeout()),
            install_script: cfg.install_script.clone(),
        });
        let listener = tokio::net::TcpListener::bind(cfg.listen)
            .await
            .with_context(|| format!("binding {}", cfg.listen))?;
        tokio::spawn(http::run_server(listener, state));

        shutdown_signal().await?;
        info!("shutting down");
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix). Pending exchanges are dropped with the runtime.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
