//! Helpers shared by the command-line front-ends. The library itself takes
//! resolved addresses only; resolution and flag plumbing live here.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::net::lookup_host;
use tracing_subscriber::EnvFilter;

/// Which address family a resolution may yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Any => write!(f, "IP"),
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Initializes stderr logging, honouring `RUST_LOG` when set.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Parses "250ms", "2s", "1m" or bare seconds ("5").
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();

    let (number, scale) = if let Some(number) = input.strip_suffix("ms") {
        (number, 0.001)
    } else if let Some(number) = input.strip_suffix('s') {
        (number, 1.0)
    } else if let Some(number) = input.strip_suffix('m') {
        (number, 60.0)
    } else {
        (input, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{input}'"))?;
    if !value.is_finite() || value < 0.0 {
        bail!("invalid duration '{input}'");
    }

    Ok(Duration::from_secs_f64(value * scale))
}

/// Resolves a target to a single address: IP literals pass through, names
/// go through the system resolver.
pub async fn resolve_target(host: &str, family: Family) -> Result<IpAddr> {
    fn matches(ip: IpAddr, family: Family) -> bool {
        match family {
            Family::Any => true,
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
        }
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if matches(ip, family) {
            return Ok(ip);
        }
        bail!("'{host}' is not an {family} address");
    }

    let addrs = lookup_host((host, 0u16))
        .await
        .with_context(|| format!("unable to resolve '{host}'"))?;
    addrs
        .map(|addr| addr.ip())
        .find(|ip| matches(*ip, family))
        .ok_or_else(|| anyhow!("no {family} address for '{host}'"))
}
