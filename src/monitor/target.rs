use std::net::IpAddr;
use std::time::Instant;

use parking_lot::Mutex;

use super::history::History;
use crate::payload::Payload;

/// A monitored destination: its address, payload, result ring and the
/// probe currently in flight.
pub(crate) struct Target {
    pub(crate) addr: IpAddr,
    pub(crate) payload: Payload,
    pub(crate) history: History,
    pub(crate) probe: Mutex<ProbeState>,
}

pub(crate) struct ProbeState {
    /// Sequence of the in-flight probe; 0 means none.
    pub(crate) seq: u16,
    /// When the in-flight probe was sent.
    pub(crate) sent_at: Instant,
}

impl Target {
    pub(crate) fn new(addr: IpAddr, history_size: usize, payload_size: u16) -> Target {
        Target {
            addr,
            payload: Payload::new(payload_size),
            history: History::new(history_size),
            probe: Mutex::new(ProbeState {
                seq: 0,
                sent_at: Instant::now(),
            }),
        }
    }
}
