//! Asynchronous ICMP echo library with a continuous reachability monitor.
//!
//! [`Pinger`] sends ICMP Echo Requests (IPv4 and IPv6) and correlates the
//! replies back to callers via the 16-bit sequence number; [`Monitor`]
//! builds on the same connection layer to probe a set of targets on a fixed
//! interval, keeping a ring of per-target results and aggregate statistics.

// Public API - engine, monitor and their data types
pub mod error;
pub mod export;
pub mod monitor;
pub mod payload;
pub mod ping;
pub mod probe;

// Used by the binaries; not a stable API surface
pub mod cli;
pub mod tui;

pub use error::PingError;
pub use monitor::{History, Metrics, Monitor, MonitorConfig, ProbeResult, TargetSnapshot};
pub use payload::Payload;
pub use ping::{MulticastReply, Pinger};
pub use probe::Unreachable;
