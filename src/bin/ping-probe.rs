use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use echowatch::cli::{self, Family};
use echowatch::Pinger;

/// Send ICMP echo requests to a single target and report the round trip.
#[derive(Parser)]
#[command(name = "ping-probe", version)]
struct Args {
    /// Number of attempts before giving up
    #[arg(short, long, default_value_t = 3)]
    attempts: u32,

    /// Timeout per echo request (e.g. 500ms, 2s)
    #[arg(short, long, default_value = "1s", value_parser = cli::parse_duration)]
    timeout: Duration,

    /// Size of additional payload data
    #[arg(short = 's', long, default_value_t = 56)]
    size: u16,

    /// Force IPv4
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Force IPv6
    #[arg(short = '6')]
    ipv6: bool,

    /// Bind address (defaults to 0.0.0.0 or ::)
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Use raw sockets (needs CAP_NET_RAW)
    #[arg(long)]
    privileged: bool,

    /// Host to probe
    target: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    cli::init_tracing("warn");
    let args = Args::parse();

    let family = if args.ipv4 {
        Family::V4
    } else if args.ipv6 {
        Family::V6
    } else {
        Family::Any
    };
    let remote = cli::resolve_target(&args.target, family).await?;

    let (bind4, bind6) = match (args.bind, remote) {
        (Some(IpAddr::V4(bind)), IpAddr::V4(_)) => (Some(bind), None),
        (Some(IpAddr::V6(bind)), IpAddr::V6(_)) => (None, Some(bind)),
        (Some(bind), _) => bail!("bind address {bind} does not match target {remote}"),
        (None, IpAddr::V4(_)) => (Some(Ipv4Addr::UNSPECIFIED), None),
        (None, IpAddr::V6(_)) => (None, Some(Ipv6Addr::UNSPECIFIED)),
    };

    let pinger = Pinger::new(bind4, bind6, args.privileged)?;
    if pinger.payload_size() != args.size {
        pinger.set_payload_size(args.size);
    }

    let result = run(&args, &pinger, remote).await;
    pinger.close().await;
    result
}

async fn run(args: &Args, pinger: &Pinger, remote: IpAddr) -> Result<()> {
    if remote.is_multicast() {
        println!("multicast ping to {} ({})", args.target, remote);

        // collect replies until the timeout, then end the stream
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            let timeout = args.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            });
        }

        let mut responses = pinger.ping_multicast(remote, cancel).await?;
        let mut replies = 0;
        while let Some(reply) = responses.recv().await {
            println!("{} rtt={:?}", reply.source, reply.elapsed);
            replies += 1;
        }
        if replies == 0 {
            bail!("no replies");
        }
    } else {
        let rtt = pinger.ping_attempts(remote, args.timeout, args.attempts).await?;
        println!("ping {} ({}) rtt={:?}", args.target, remote, rtt);
    }

    Ok(())
}
