// nearmsg Linux: chat with one nearby peer over an emulated LAN radio.

mod config;
mod host;
mod radio;
mod wire;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nearmsg_core::{Action, Messenger, Role};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::host::Host;
use crate::radio::Radio;

#[derive(Parser, Debug)]
#[command(name = "nearmsg-linux")]
#[command(about = "Find one nearby nearmsg peer and chat with it", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/nearmsg/config.toml, then /etc/nearmsg/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    discovery_port: Option<u16>,
    /// GATT server port, 0 picks any free port
    #[arg(long)]
    gatt_port: Option<u16>,
    /// Largest MTU accepted in the MTU exchange
    #[arg(long)]
    mtu: Option<u16>,
    /// Do not join the multicast group
    #[arg(long)]
    no_multicast: bool,
    /// Also advertise to this address (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    peers: Vec<SocketAddr>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut cfg = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    if let Some(p) = cli.discovery_port {
        cfg.discovery_port = p;
    }
    if let Some(p) = cli.gatt_port {
        cfg.gatt_port = p;
    }
    if let Some(mtu) = cli.mtu {
        cfg.max_mtu = mtu;
    }
    if cli.no_multicast {
        cfg.multicast = false;
    }
    if !cfg.multicast && cfg.peers.is_empty() && cli.peers.is_empty() {
        anyhow::bail!("multicast is off and no --peer given: nothing to advertise to");
    }

    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    rt.block_on(run(cfg, cli.peers))
}

async fn run(cfg: config::Config, extra_peers: Vec<SocketAddr>) -> Result<()> {
    let (signals_tx, mut signals) = mpsc::unbounded_channel();
    let mut radio = Radio::bind(&cfg, signals_tx)
        .await
        .with_context(|| {
            format!(
                "binding radio (discovery port {}, gatt port {})",
                cfg.discovery_port, cfg.gatt_port
            )
        })?;
    for peer in extra_peers {
        radio.add_destination(peer);
    }
    let messenger = Messenger::new(cfg.engine.clone());
    info!(
        local_name = messenger.engine().local_name(),
        gatt_port = radio.gatt_port(),
        discovery = ?radio.discovery_addr().ok(),
        "nearmsg starting"
    );
    let mut host = Host::new(messenger, radio);
    report(host.start());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(signal) = signals.recv() => report(host.on_signal(signal)),
            line = lines.next_line(), if stdin_open => match line.context("reading stdin")? {
                Some(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if host.send(&line) {
                        println!("> {}", line.trim());
                    } else {
                        println!("! not connected");
                    }
                }
                None => stdin_open = false,
            },
            res = &mut shutdown => {
                res?;
                break;
            }
        }
    }

    report(host.shutdown());
    info!(state = %host.messenger().engine().state(), "nearmsg stopped");
    Ok(())
}

/// Print consumer notifications on stdout.
fn report(notices: Vec<Action>) {
    for notice in notices {
        match notice {
            Action::StateChanged(state) => println!("* {}", state),
            Action::RoleAssigned(Some(Role::Central)) => println!("* connecting as central"),
            Action::RoleAssigned(Some(Role::Peripheral)) => println!("* waiting as peripheral"),
            Action::PeerNamed(name) => println!("* peer {}", name),
            Action::MessageReceived(text) => println!("< {}", text),
            Action::Error(e) => {
                warn!(error = %e, "engine error");
                println!("! {}", e);
            }
            _ => {}
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
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
