use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::warn;

use echowatch::cli::{self, Family};
use echowatch::export::{export_json_string, MetricsReport};
use echowatch::{Monitor, MonitorConfig};

/// Continuously probe targets and print periodic per-target reports.
#[derive(Parser)]
#[command(name = "ping-monitor", version)]
struct Args {
    /// Interval between echo requests per target
    #[arg(long, default_value = "5s", value_parser = cli::parse_duration)]
    ping_interval: Duration,

    /// Interval between reports
    #[arg(long, default_value = "60s", value_parser = cli::parse_duration)]
    report_interval: Duration,

    /// Size of additional payload data
    #[arg(long, default_value_t = 56)]
    size: u16,

    /// Use raw sockets (needs CAP_NET_RAW)
    #[arg(long)]
    privileged: bool,

    /// Print reports as JSON instead of one line per target
    #[arg(long)]
    json: bool,

    /// Hosts to monitor
    #[arg(required = true)]
    targets: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    cli::init_tracing("info");
    let args = Args::parse();

    if args.ping_interval.is_zero() {
        bail!("ping interval must be positive");
    }

    let mut config = MonitorConfig::new(args.ping_interval);
    config.payload_size = args.size;
    config.privileged = args.privileged;
    // hold a full report interval's worth of results
    let per_report =
        (args.report_interval.as_secs_f64() / args.ping_interval.as_secs_f64()).ceil() as usize;
    config.history_size = config.history_size.max(per_report + 1);

    let monitor = Monitor::new(config);

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
        .start(Some(Ipv4Addr::UNSPECIFIED), Some(Ipv6Addr::UNSPECIFIED))
        .context("unable to bind ICMP sockets (running as root, or is ping_group_range set?)")?;

    let mut ticker = tokio::time::interval(args.report_interval);
    // the first tick fires immediately; the first report should not
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => report(&monitor, args.json)?,
        }
    }

    monitor.stop().await;
    Ok(())
}

fn report(monitor: &Monitor, json: bool) -> Result<()> {
    let metrics = monitor.export_and_clear();

    if json {
        let report = MetricsReport::new(metrics);
        println!("{}", export_json_string(&report)?);
    } else {
        // stable ordering between reports
        let metrics: BTreeMap<_, _> = metrics.into_iter().collect();
        for (host, metrics) in metrics {
            println!("{host}: {metrics}");
        }
    }

    Ok(())
}
