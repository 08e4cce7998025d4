use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::request::{Claimed, MulticastReply, MulticastRequest, Pending, Registry, UnicastRequest};
use crate::error::PingError;
use crate::payload::{Payload, DEFAULT_PAYLOAD_SIZE};
use crate::probe::codec::{Echo, Unreachable};
use crate::probe::conn::{process_ident, Conn, PacketHandler};

/// Asynchronous ICMP echo engine.
///
/// Owns one or two ICMP endpoints and correlates Echo Replies (and
/// Destination Unreachable notifications) back to the requests that caused
/// them via the 16-bit sequence number.
///
/// ```no_run
/// # use std::net::Ipv4Addr;
/// # use std::time::Duration;
/// # async fn run() -> Result<(), echowatch::PingError> {
/// let pinger = echowatch::Pinger::new(Some(Ipv4Addr::UNSPECIFIED), None, false)?;
/// let rtt = pinger.ping("127.0.0.1".parse().unwrap(), Duration::from_secs(1)).await?;
/// println!("rtt={rtt:?}");
/// pinger.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Pinger {
    core: Arc<Core>,
    conn: Conn,
}

struct Core {
    registry: Registry,
    payload: RwLock<Payload>,
    // per-instance, so two engines never alias sequences on wraparound
    sequence: AtomicU32,
    ident: u16,
    privileged: bool,
}

impl Core {
    /// Next 16-bit sequence, skipping 0.
    fn next_seq(&self) -> u16 {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::Relaxed) as u16;
            if seq != 0 {
                return seq;
            }
        }
    }
}

impl PacketHandler for Core {
    fn handle_packet(
        &self,
        echo: Echo,
        error: Option<Unreachable>,
        source: IpAddr,
        received_at: Option<Instant>,
    ) {
        // On datagram sockets the kernel rewrites the identifier, so only
        // raw mode can insist on a match; correlation then rests on the
        // sequence alone.
        if self.privileged && echo.ident != self.ident {
            return;
        }

        match self.registry.claim(echo.seq) {
            Some(Claimed::Unicast(request)) => {
                let result = match (error, received_at) {
                    (Some(reason), _) => Err(PingError::Unreachable(reason)),
                    (None, Some(at)) => Ok(at),
                    // the conn never delivers a reply without its timestamp
                    (None, None) => return,
                };
                request.complete(result);
            }
            Some(Claimed::Multicast(request)) => request.handle_reply(source),
            // reply nobody is waiting for
            None => {}
        }
    }

    fn handle_closed(&self) {
        self.registry.close_all();
    }
}

/// Removes a sequence from the registry when the waiting future goes away,
/// whether through completion, timeout or cancellation.
struct DequeueGuard<'a> {
    registry: &'a Registry,
    seq: u16,
}

impl Drop for DequeueGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.registry.remove(self.seq) {
            pending.close();
        }
    }
}

impl Pinger {
    /// Opens the ICMP endpoints and starts the receive tasks. At least one
    /// bind address must be given. Must be called within a tokio runtime.
    ///
    /// Privileged mode uses raw sockets (CAP_NET_RAW); unprivileged mode
    /// uses datagram ICMP sockets, which on Linux require the process's
    /// group in `net.ipv4.ping_group_range`.
    pub fn new(
        bind4: Option<Ipv4Addr>,
        bind6: Option<Ipv6Addr>,
        privileged: bool,
    ) -> Result<Pinger, PingError> {
        let core = Arc::new(Core {
            registry: Registry::default(),
            payload: RwLock::new(Payload::new(DEFAULT_PAYLOAD_SIZE)),
            sequence: AtomicU32::new(1),
            ident: process_ident(),
            privileged,
        });
        let conn = Conn::open(bind4, bind6, privileged, core.clone())?;
        Ok(Pinger { core, conn })
    }

    /// Replaces the echo payload with `size` fresh random bytes.
    pub fn set_payload_size(&self, size: u16) {
        self.core.payload.write().resize(size);
    }

    /// Replaces the echo payload wholesale.
    pub fn set_payload(&self, data: Vec<u8>) {
        self.core.payload.write().set(data);
    }

    pub fn payload_size(&self) -> u16 {
        self.core.payload.read().len()
    }

    /// Sends a single Echo Request and waits for the matching reply,
    /// returning the round trip time. Fails with [`PingError::Timeout`]
    /// when the deadline elapses first.
    pub async fn ping(&self, remote: IpAddr, timeout: Duration) -> Result<Duration, PingError> {
        match tokio::time::timeout(timeout, self.ping_once(remote)).await {
            Ok(result) => result,
            Err(_) => Err(PingError::Timeout),
        }
    }

    /// Like [`ping`](Self::ping), but bounded by a cancellation token
    /// instead of a deadline. Cancellation yields [`PingError::Timeout`].
    pub async fn ping_cancellable(
        &self,
        remote: IpAddr,
        cancel: &CancellationToken,
    ) -> Result<Duration, PingError> {
        tokio::select! {
            result = self.ping_once(remote) => result,
            _ = cancel.cancelled() => Err(PingError::Timeout),
        }
    }

    /// Sequentially retries [`ping`](Self::ping) up to `attempts` times with
    /// the given per-attempt timeout; returns the first success or the last
    /// error.
    pub async fn ping_attempts(
        &self,
        remote: IpAddr,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Duration, PingError> {
        let mut result = Err(PingError::ZeroAttempts);
        for _ in 0..attempts {
            result = self.ping(remote, timeout).await;
            if result.is_ok() {
                break;
            }
        }
        result
    }

    /// Sends a single Echo Request and streams every reply that correlates
    /// to it — useful for multicast destinations where several hosts answer.
    /// The stream ends when `cancel` fires (callers must eventually cancel)
    /// or the pinger closes.
    pub async fn ping_multicast(
        &self,
        remote: IpAddr,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<MulticastReply>, PingError> {
        let seq = self.core.next_seq();
        let (request, rx) = MulticastRequest::new();

        let payload = self.core.payload.read().as_bytes().to_vec();
        self.core.registry.insert(seq, Pending::Multicast(request.clone()));

        // the clock starts before the packet can possibly leave, so no
        // reply ever finds the request unstarted
        request.mark_sent(Instant::now());
        if let Err(err) = self.conn.write_to(remote, seq, &payload).await {
            if let Some(pending) = self.core.registry.remove(seq) {
                pending.close();
            }
            return Err(err);
        }

        let core = self.core.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(pending) = core.registry.remove(seq) {
                pending.close();
            }
            request.close();
        });

        Ok(rx)
    }

    /// Applies SO_MARK to the underlying sockets (Linux only).
    pub fn set_mark(&self, mark: u32) -> Result<(), PingError> {
        self.conn.set_mark(mark)
    }

    /// Closes the sockets and waits for the receive tasks; every in-flight
    /// request wakes with [`PingError::Closed`].
    pub async fn close(&self) {
        self.conn.close().await;
    }

    async fn ping_once(&self, remote: IpAddr) -> Result<Duration, PingError> {
        let seq = self.core.next_seq();
        let (request, rx) = UnicastRequest::new();

        // payload snapshot before the registry is touched, registry before
        // the socket write: the lock chain never inverts
        let payload = self.core.payload.read().as_bytes().to_vec();
        self.core.registry.insert(seq, Pending::Unicast(request));
        let _dequeue = DequeueGuard {
            registry: &self.core.registry,
            seq,
        };

        // a send failure returns here; the guard dequeues the request, and
        // since its completion channel lives in the registry entry, close
        // and removal are one atomic step
        let sent_at = self.conn.write_to(remote, seq, &payload).await?;

        match rx.await {
            Ok(Ok(received_at)) => Ok(received_at.saturating_duration_since(sent_at)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(PingError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_core(privileged: bool) -> Core {
        Core {
            registry: Registry::default(),
            payload: RwLock::new(Payload::new(8)),
            sequence: AtomicU32::new(1),
            ident: 0x4242,
            privileged,
        }
    }

    fn echo(ident: u16, seq: u16) -> Echo {
        Echo {
            ident,
            seq,
            payload: Vec::new(),
        }
    }

    const SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn sequences_are_unique_and_skip_zero() {
        let core = test_core(false);
        core.sequence.store(u16::MAX as u32 - 10, Ordering::Relaxed);

        let mut seen = HashSet::new();
        for _ in 0..100 {
            let seq = core.next_seq();
            assert_ne!(seq, 0);
            assert!(seen.insert(seq), "duplicate sequence {seq}");
        }
    }

    #[test]
    fn privileged_mode_drops_foreign_identifiers() {
        let core = test_core(true);
        let (request, mut rx) = UnicastRequest::new();
        core.registry.insert(9, Pending::Unicast(request));

        core.handle_packet(echo(0x1111, 9), None, SOURCE, Some(Instant::now()));
        assert!(rx.try_recv().is_err());
        assert_eq!(core.registry.len(), 1);

        core.handle_packet(echo(0x4242, 9), None, SOURCE, Some(Instant::now()));
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(core.registry.len(), 0);
    }

    #[test]
    fn unprivileged_mode_matches_on_sequence_alone() {
        let core = test_core(false);
        let (request, mut rx) = UnicastRequest::new();
        core.registry.insert(9, Pending::Unicast(request));

        // identifier was rewritten by the kernel; must still correlate
        core.handle_packet(echo(0x9999, 9), None, SOURCE, Some(Instant::now()));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn unreachable_fails_the_matched_request() {
        let core = test_core(false);
        let (request, mut rx) = UnicastRequest::new();
        core.registry.insert(3, Pending::Unicast(request));

        core.handle_packet(echo(0, 3), Some(Unreachable::V4(1)), SOURCE, None);
        match rx.try_recv().unwrap() {
            Err(PingError::Unreachable(Unreachable::V4(1))) => {}
            other => panic!("expected host-unreachable, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_replies_are_ignored() {
        let core = test_core(false);
        core.handle_packet(echo(0, 12345), None, SOURCE, Some(Instant::now()));
        assert_eq!(core.registry.len(), 0);
    }

    // The tests below need a datagram ICMP socket; they skip themselves on
    // hosts where net.ipv4.ping_group_range does not cover us.

    fn open_v4() -> Option<Pinger> {
        match Pinger::new(Some(Ipv4Addr::UNSPECIFIED), None, false) {
            Ok(pinger) => Some(pinger),
            Err(err) => {
                eprintln!("skipping: unable to open ICMP socket: {err}");
                None
            }
        }
    }

    #[tokio::test]
    async fn self_ping_v4() {
        let Some(pinger) = open_v4() else { return };

        let rtt = pinger
            .ping_attempts(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::from_secs(1), 2)
            .await
            .expect("loopback ping");
        assert!(rtt > Duration::ZERO);

        pinger.close().await;
    }

    #[tokio::test]
    async fn self_ping_v6() {
        let pinger = match Pinger::new(None, Some(Ipv6Addr::UNSPECIFIED), false) {
            Ok(pinger) => pinger,
            Err(err) => {
                eprintln!("skipping: unable to open ICMPv6 socket: {err}");
                return;
            }
        };

        let rtt = pinger
            .ping_attempts(IpAddr::V6(Ipv6Addr::LOCALHOST), Duration::from_secs(1), 2)
            .await
            .expect("loopback ping");
        assert!(rtt > Duration::ZERO);

        pinger.close().await;
    }

    #[tokio::test]
    async fn deadline_is_honoured_against_a_black_hole() {
        let Some(pinger) = open_v4() else { return };

        // TEST-NET-1 never answers
        let blackhole: IpAddr = "192.0.2.1".parse().unwrap();
        let started = Instant::now();
        match pinger.ping(blackhole, Duration::from_millis(10)).await {
            Err(err) if err.is_timeout() => {
                assert!(started.elapsed() < Duration::from_millis(500));
            }
            // no route to TEST-NET in this environment
            Err(PingError::Io(err)) => eprintln!("skipping: {err}"),
            other => panic!("expected timeout, got {other:?}"),
        }

        pinger.close().await;
    }

    #[tokio::test]
    async fn close_wakes_in_flight_requests() {
        let Some(pinger) = open_v4() else { return };
        let pinger = Arc::new(pinger);

        let blackhole: IpAddr = "192.0.2.1".parse().unwrap();
        let task = {
            let pinger = pinger.clone();
            tokio::spawn(async move { pinger.ping(blackhole, Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pinger.close().await;

        match task.await.unwrap() {
            Err(PingError::Closed) => {}
            // send already failed (no route) before we closed
            Err(PingError::Io(err)) => eprintln!("skipping: {err}"),
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_attempts_is_an_error() {
        let Some(pinger) = open_v4() else { return };

        let result = pinger
            .ping_attempts(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::from_secs(1), 0)
            .await;
        assert!(matches!(result, Err(PingError::ZeroAttempts)));

        pinger.close().await;
    }
}
