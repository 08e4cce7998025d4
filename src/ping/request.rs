use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::PingError;

/// How many undelivered multicast replies the engine buffers per request
/// before dropping. The receive task must never wait on a consumer.
pub(crate) const MULTICAST_BUFFER: usize = 16;

/// One reply to a multicast echo request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastReply {
    /// Address the reply came from.
    pub source: IpAddr,
    /// Time between the request leaving and this reply arriving.
    pub elapsed: Duration,
}

/// A single-reply request: completes exactly once with the receive timestamp
/// or a terminal error. The owner computes the round trip against the send
/// timestamp it holds.
pub(crate) struct UnicastRequest {
    tx: oneshot::Sender<Result<Instant, PingError>>,
}

impl UnicastRequest {
    pub(crate) fn new() -> (UnicastRequest, oneshot::Receiver<Result<Instant, PingError>>) {
        let (tx, rx) = oneshot::channel();
        (UnicastRequest { tx }, rx)
    }

    pub(crate) fn complete(self, result: Result<Instant, PingError>) {
        // the owner may already have given up; a dropped receiver is fine
        let _ = self.tx.send(result);
    }
}

/// A multi-reply request: streams every correlated response until closed.
pub(crate) struct MulticastRequest {
    started: OnceLock<Instant>,
    tx: Mutex<Option<mpsc::Sender<MulticastReply>>>,
}

impl MulticastRequest {
    pub(crate) fn new() -> (Arc<MulticastRequest>, mpsc::Receiver<MulticastReply>) {
        let (tx, rx) = mpsc::channel(MULTICAST_BUFFER);
        let request = Arc::new(MulticastRequest {
            started: OnceLock::new(),
            tx: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    /// Starts the clock. A reply arriving before this is set (a stale
    /// packet reusing our sequence) is dropped.
    pub(crate) fn mark_sent(&self, at: Instant) {
        let _ = self.started.set(at);
    }

    /// Pushes `{source, elapsed}` onto the stream unless closed. Never
    /// blocks: a full buffer drops the reply instead of stalling the
    /// receive task.
    pub(crate) fn handle_reply(&self, source: IpAddr) {
        let Some(started) = self.started.get() else {
            return;
        };
        let elapsed = started.elapsed();

        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(MulticastReply { source, elapsed });
        }
    }

    /// Ends the stream. Idempotent.
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }
}

pub(crate) enum Pending {
    Unicast(UnicastRequest),
    Multicast(Arc<MulticastRequest>),
}

impl Pending {
    /// Wakes the owner with "closed" (unicast) or ends the stream
    /// (multicast).
    pub(crate) fn close(self) {
        match self {
            Pending::Unicast(request) => request.complete(Err(PingError::Closed)),
            Pending::Multicast(request) => request.close(),
        }
    }
}

/// What the receive path got out of a sequence lookup.
pub(crate) enum Claimed {
    /// Removed from the registry before delivery; the claimer owns it.
    Unicast(UnicastRequest),
    /// Still registered; delivery goes to a shared handle.
    Multicast(Arc<MulticastRequest>),
}

/// In-flight requests keyed by 16-bit sequence.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<HashMap<u16, Pending>>,
}

impl Registry {
    /// Registers a request under `seq`. A sequence collision (counter
    /// wraparound with a request still pending) closes the previous occupant
    /// before the slot is reused, so its late replies find nothing.
    pub(crate) fn insert(&self, seq: u16, pending: Pending) {
        if let Some(displaced) = self.inner.lock().insert(seq, pending) {
            displaced.close();
        }
    }

    /// Looks up `seq` for delivery. Unicast entries are removed atomically
    /// with the lookup; multicast entries stay until cancelled.
    pub(crate) fn claim(&self, seq: u16) -> Option<Claimed> {
        let mut inner = self.inner.lock();
        match inner.get(&seq) {
            Some(Pending::Unicast(_)) => {}
            Some(Pending::Multicast(request)) => return Some(Claimed::Multicast(request.clone())),
            None => return None,
        }
        // unicast: removal and delivery are one step under the lock
        match inner.remove(&seq) {
            Some(Pending::Unicast(request)) => Some(Claimed::Unicast(request)),
            _ => None,
        }
    }

    pub(crate) fn remove(&self, seq: u16) -> Option<Pending> {
        self.inner.lock().remove(&seq)
    }

    /// Empties the registry, waking every pending request with "closed".
    pub(crate) fn close_all(&self) {
        let drained: Vec<Pending> = {
            let mut inner = self.inner.lock();
            inner.drain().map(|(_, pending)| pending).collect()
        };
        for pending in drained {
            pending.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
