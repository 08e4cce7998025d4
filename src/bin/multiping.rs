use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use echowatch::cli::{self, Family};
use echowatch::tui::run_tui;
use echowatch::{Monitor, MonitorConfig};

/// Continuously ping several targets and show a live statistics table.
#[derive(Parser)]
#[command(name = "multiping", version)]
struct Args {
    /// Polling interval
    #[arg(long, default_value = "1s", value_parser = cli::parse_duration)]
    interval: Duration,

    /// Buffer size for statistics
    #[arg(long = "buf", default_value_t = 50)]
    buffer: usize,

    /// IPv4 bind address
    #[arg(long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind4: Ipv4Addr,

    /// IPv6 bind address
    #[arg(long, default_value_t = Ipv6Addr::UNSPECIFIED)]
    bind6: Ipv6Addr,

    /// Use raw sockets (needs CAP_NET_RAW)
    #[arg(long)]
    privileged: bool,

    /// Hosts to ping
    #[arg(required = true)]
    targets: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stderr noise corrupts the alternate screen; warnings only
    cli::init_tracing("warn");
    let args = Args::parse();

    if args.interval.is_zero() {
        bail!("interval must be positive");
    }

    let mut config = MonitorConfig::new(args.interval);
    config.history_size = args.buffer.max(1);
    config.privileged = args.privileged;

    let monitor = Arc::new(Monitor::new(config));

    let mut added = 0;
    for host in &args.targets {
        match cli::resolve_target(host, Family::Any).await {
            Ok(addr) => {
                monitor.add_target(host.clone(), addr);
                added += 1;
            }
            Err(err) => warn!(host = %host, error = %err, "invalid target"),
        }
    }
    if added == 0 {
        bail!("no valid targets");
    }

    monitor
        .start(Some(args.bind4), Some(args.bind6))
        .context("unable to bind ICMP sockets (running as root, or is ping_group_range set?)")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let result = run_tui(monitor.clone(), cancel).await;
    monitor.stop().await;
    result
}
