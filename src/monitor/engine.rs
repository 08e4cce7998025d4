use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::history::{Metrics, ProbeResult};
use super::target::Target;
use crate::error::PingError;
use crate::probe::codec::{Echo, Unreachable};
use crate::probe::conn::{process_ident, Conn, PacketHandler};

const DEFAULT_HISTORY_SIZE: usize = 10;
const DEFAULT_PAYLOAD_SIZE: u16 = 8;

/// One slot per possible sequence number.
const IN_FLIGHT_SLOTS: usize = u16::MAX as usize + 1;

/// Tunables for a [`Monitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often every target is probed.
    pub interval: Duration,
    /// Results kept per target.
    pub history_size: usize,
    /// Random payload bytes per target.
    pub payload_size: u16,
    /// Raw sockets instead of datagram ICMP.
    pub privileged: bool,
}

impl MonitorConfig {
    pub fn new(interval: Duration) -> MonitorConfig {
        MonitorConfig {
            interval,
            history_size: DEFAULT_HISTORY_SIZE,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            privileged: false,
        }
    }
}

/// Per-target view for live displays: address, aggregates and the raw ring.
#[derive(Debug, Clone)]
pub struct TargetSnapshot {
    pub addr: IpAddr,
    pub metrics: Option<Metrics>,
    pub recent: Vec<ProbeResult>,
}

/// Continuously probes a set of targets and keeps per-target result rings.
///
/// Each interval, one probe goes out per target, spaced evenly across the
/// interval. A probe still unanswered when the next one is issued is
/// recorded as lost. Callers pull aggregates with [`export`](Self::export)
/// or [`export_and_clear`](Self::export_and_clear).
pub struct Monitor {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    interval: Duration,
    history_size: usize,
    payload_size: u16,
    privileged: bool,
    ident: u16,
    sequence: AtomicU32,
    targets: RwLock<HashMap<String, Arc<Target>>>,
    /// Reverse index from sequence to the target waiting on it.
    in_flight: Mutex<Vec<Option<Arc<Target>>>>,
    conn: OnceLock<Conn>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Monitor {
        Monitor {
            shared: Arc::new(Shared {
                interval: config.interval,
                history_size: config.history_size,
                payload_size: config.payload_size,
                privileged: config.privileged,
                ident: process_ident(),
                sequence: AtomicU32::new(1),
                targets: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(vec![None; IN_FLIGHT_SLOTS]),
                conn: OnceLock::new(),
            }),
            cancel: CancellationToken::new(),
            scheduler: Mutex::new(None),
        }
    }

    /// Opens the ICMP endpoints and starts the probe scheduler. Must be
    /// called within a tokio runtime, and at most once.
    pub fn start(
        &self,
        bind4: Option<Ipv4Addr>,
        bind6: Option<Ipv6Addr>,
    ) -> Result<(), PingError> {
        assert!(self.shared.conn.get().is_none(), "monitor already started");

        let conn = Conn::open(bind4, bind6, self.shared.privileged, self.shared.clone())?;
        let _ = self.shared.conn.set(conn);

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        *self.scheduler.lock() = Some(tokio::spawn(run_scheduler(shared, cancel)));
        Ok(())
    }

    /// Brings the monitoring to a halt: interrupts any in-progress interval
    /// wait, awaits the scheduler and closes the sockets.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let scheduler = self.scheduler.lock().take();
        if let Some(task) = scheduler {
            let _ = task.await;
        }
        if let Some(conn) = self.shared.conn.get() {
            conn.close().await;
        }
    }

    /// Adds a target under a caller-chosen key. A key that already exists
    /// is left untouched.
    pub fn add_target(&self, key: impl Into<String>, addr: IpAddr) {
        let key = key.into();
        let mut targets = self.shared.targets.write();
        if targets.contains_key(&key) {
            return;
        }
        targets.insert(
            key,
            Arc::new(Target::new(addr, self.shared.history_size, self.shared.payload_size)),
        );
    }

    /// Removes a target and forgets its in-flight probe.
    pub fn remove_target(&self, key: &str) {
        let removed = self.shared.targets.write().remove(key);
        if let Some(target) = removed {
            let seq = target.probe.lock().seq;
            if seq != 0 {
                self.shared.in_flight.lock()[seq as usize] = None;
            }
        }
    }

    /// Aggregates every target's history. Targets with no recorded results
    /// are omitted.
    pub fn export(&self) -> HashMap<String, Metrics> {
        self.shared
            .targets
            .read()
            .iter()
            .filter_map(|(key, target)| target.history.compute().map(|m| (key.clone(), m)))
            .collect()
    }

    /// Like [`export`](Self::export), but each history is reset after
    /// aggregation.
    pub fn export_and_clear(&self) -> HashMap<String, Metrics> {
        self.shared
            .targets
            .read()
            .iter()
            .filter_map(|(key, target)| {
                target.history.compute_and_clear().map(|m| (key.clone(), m))
            })
            .collect()
    }

    /// Per-target snapshots in key order, for live displays.
    pub fn snapshots(&self) -> BTreeMap<String, TargetSnapshot> {
        self.shared
            .targets
            .read()
            .iter()
            .map(|(key, target)| {
                (
                    key.clone(),
                    TargetSnapshot {
                        addr: target.addr,
                        metrics: target.history.compute(),
                        recent: target.history.snapshot(),
                    },
                )
            })
            .collect()
    }

    /// Resets every target's history without computing anything.
    pub fn clear(&self) {
        for target in self.shared.targets.read().values() {
            target.history.compute_and_clear();
        }
    }
}

async fn run_scheduler(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.ping_targets(&cancel).await,
        }
    }
}

impl Shared {
    /// Next 16-bit sequence; 0 is reserved for "nothing in flight".
    fn next_seq(&self) -> u16 {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed) as u16;
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Probes every current target, spread evenly across the interval.
    async fn ping_targets(&self, cancel: &CancellationToken) {
        let keys: Vec<String> = self.targets.read().keys().cloned().collect();
        if keys.is_empty() {
            return;
        }

        let spread = self.interval / keys.len() as u32;
        for key in keys {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(spread) => {}
            }
            self.ping_target(&key).await;
        }
    }

    async fn ping_target(&self, key: &str) {
        let Some(target) = self.targets.read().get(key).cloned() else {
            // removed in the meanwhile
            return;
        };

        let seq = self.next_seq();
        {
            let mut probe = target.probe.lock();
            if probe.seq != 0 {
                // the previous probe never got its reply
                self.in_flight.lock()[probe.seq as usize] = None;
                target.history.add_result(Duration::ZERO, true);
            }
            probe.seq = seq;
            probe.sent_at = Instant::now();
        }
        self.in_flight.lock()[seq as usize] = Some(target.clone());

        let Some(conn) = self.conn.get() else {
            // not started
            return;
        };
        if let Err(err) = conn.write_to(target.addr, seq, target.payload.as_bytes()).await {
            // folded into the loss counter on the next interval
            warn!(addr = %target.addr, error = %err, "unable to send probe");
        }
    }
}

impl PacketHandler for Shared {
    fn handle_packet(
        &self,
        echo: Echo,
        error: Option<Unreachable>,
        _source: IpAddr,
        received_at: Option<Instant>,
    ) {
        if self.privileged && echo.ident != self.ident {
            return;
        }

        let Some(target) = self.in_flight.lock()[echo.seq as usize].clone() else {
            return;
        };

        let result = {
            let mut probe = target.probe.lock();
            if probe.seq != echo.seq {
                // late or foreign reply
                return;
            }
            probe.seq = 0;

            match (error, received_at) {
                (None, Some(at)) => ProbeResult {
                    rtt: at.saturating_duration_since(probe.sent_at),
                    lost: false,
                },
                // Destination Unreachable counts as a lost probe
                _ => ProbeResult {
                    rtt: Duration::ZERO,
                    lost: true,
                },
            }
        };

        target.history.add_result(result.rtt, result.lost);
        self.in_flight.lock()[echo.seq as usize] = None;
    }
}
