use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::codec::{self, Echo, Incoming, Unreachable};
use super::socket::IcmpSocket;
use crate::error::PingError;

/// Receive buffer size, enough for any ethernet-sized reply
pub const RECV_BUFFER_SIZE: usize = 1500;

/// Process-local 16-bit echo identifier.
pub(crate) fn process_ident() -> u16 {
    std::process::id() as u16
}

/// Receives every successfully parsed Echo Reply or Destination Unreachable
/// from the connection's read loops.
pub trait PacketHandler: Send + Sync + 'static {
    /// `received_at` is the timestamp taken immediately after the read
    /// returned; it is `None` for Destination Unreachable deliveries.
    fn handle_packet(
        &self,
        echo: Echo,
        error: Option<Unreachable>,
        source: IpAddr,
        received_at: Option<Instant>,
    );

    /// Runs when a receive loop exits, either through `close` or because the
    /// socket is gone.
    fn handle_closed(&self) {}
}

struct Endpoint {
    socket: IcmpSocket,
    write_lock: Mutex<()>,
}

/// Owns up to two ICMP endpoints (one per address family) and their receive
/// tasks, dispatching parsed packets to a single registered handler.
pub struct Conn {
    sock4: Option<Arc<Endpoint>>,
    sock6: Option<Arc<Endpoint>>,
    ident: u16,
    privileged: bool,
    cancel: CancellationToken,
    receivers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Conn {
    /// Opens an endpoint per supplied bind address and starts one receive
    /// task per endpoint. At least one bind address is required.
    pub fn open(
        bind4: Option<Ipv4Addr>,
        bind6: Option<Ipv6Addr>,
        privileged: bool,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<Conn, PingError> {
        let sock4 = bind4
            .map(|addr| IcmpSocket::open(IpAddr::V4(addr), privileged))
            .transpose()?
            .map(|socket| {
                Arc::new(Endpoint {
                    socket,
                    write_lock: Mutex::new(()),
                })
            });
        let sock6 = bind6
            .map(|addr| IcmpSocket::open(IpAddr::V6(addr), privileged))
            .transpose()?
            .map(|socket| {
                Arc::new(Endpoint {
                    socket,
                    write_lock: Mutex::new(()),
                })
            });

        if sock4.is_none() && sock6.is_none() {
            return Err(PingError::NotBound);
        }

        let cancel = CancellationToken::new();
        let receivers = [&sock4, &sock6]
            .into_iter()
            .flatten()
            .map(|endpoint| {
                spawn_receiver(endpoint.clone(), privileged, handler.clone(), cancel.clone())
            })
            .collect();

        Ok(Conn {
            sock4,
            sock6,
            ident: process_ident(),
            privileged,
            cancel,
            receivers: SyncMutex::new(receivers),
        })
    }

    /// The echo Identifier stamped on outgoing requests. Only meaningful on
    /// the wire in privileged mode; datagram sockets get a kernel-assigned
    /// identifier.
    pub fn ident(&self) -> u16 {
        self.ident
    }

    pub fn privileged(&self) -> bool {
        self.privileged
    }

    /// Marshals and sends one Echo Request, serializing writes per socket.
    ///
    /// Returns the timestamp taken under the write lock immediately before
    /// the send syscall, which bounds the measured round trip from below.
    pub async fn write_to(&self, dst: IpAddr, seq: u16, payload: &[u8]) -> Result<Instant, PingError> {
        let endpoint = match dst {
            IpAddr::V4(_) => self.sock4.as_ref(),
            IpAddr::V6(_) => self.sock6.as_ref(),
        }
        .ok_or(PingError::SocketMissing)?;

        let packet = codec::build_echo_request(dst.is_ipv6(), self.ident, seq, payload);

        let _guard = endpoint.write_lock.lock().await;
        let sent_at = Instant::now();
        endpoint.socket.send_to(&packet, dst).await?;
        Ok(sent_at)
    }

    /// Stops both receive tasks and waits for them to finish. The sockets
    /// close when the last task drops its endpoint.
    pub async fn close(&self) {
        self.cancel.cancel();
        let receivers = std::mem::take(&mut *self.receivers.lock());
        for task in receivers {
            let _ = task.await;
        }
    }

    /// Applies SO_MARK to every open endpoint.
    #[cfg(target_os = "linux")]
    pub fn set_mark(&self, mark: u32) -> Result<(), PingError> {
        for endpoint in [&self.sock4, &self.sock6].into_iter().flatten() {
            endpoint.socket.set_mark(mark)?;
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_mark(&self, _mark: u32) -> Result<(), PingError> {
        Err(PingError::MarkUnsupported)
    }
}

fn spawn_receiver(
    endpoint: Arc<Endpoint>,
    privileged: bool,
    handler: Arc<dyn PacketHandler>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let v6 = endpoint.socket.is_v6();
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            let (n, source) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = endpoint.socket.recv_from(&mut buf) => match res {
                    Ok(read) => read,
                    Err(err) if is_temporary(&err) => continue,
                    Err(err) => {
                        // socket gone
                        warn!(v6, error = %err, "receive loop terminated");
                        break;
                    }
                },
            };
            let received_at = Instant::now();

            dispatch(&buf[..n], v6, privileged, handler.as_ref(), source, received_at);
        }

        handler.handle_closed();
    })
}

fn dispatch(
    data: &[u8],
    v6: bool,
    privileged: bool,
    handler: &dyn PacketHandler,
    source: IpAddr,
    received_at: Instant,
) {
    // raw IPv4 reads include the IP header; datagram and IPv6 reads do not
    let message = if privileged && !v6 {
        match codec::strip_ipv4_header(data) {
            Some(message) => message,
            None => return,
        }
    } else {
        data
    };

    match codec::parse_incoming(v6, message) {
        Some(Incoming::Reply(echo)) => handler.handle_packet(echo, None, source, Some(received_at)),
        Some(Incoming::Unreachable { echo, reason }) => {
            handler.handle_packet(echo, Some(reason), source, None)
        }
        // unparseable or not an echo response: dropped
        None => {}
    }
}

fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<(Echo, Option<Unreachable>, Option<Instant>)>>,
    }

    impl PacketHandler for Recorder {
        fn handle_packet(
            &self,
            echo: Echo,
            error: Option<Unreachable>,
            _source: IpAddr,
            received_at: Option<Instant>,
        ) {
            self.packets.lock().push((echo, error, received_at));
        }
    }

    fn echo_reply_v4(ident: u16, seq: u16) -> Vec<u8> {
        use pnet::packet::icmp::{checksum, IcmpPacket};

        let mut packet = codec::build_echo_request(false, ident, seq, b"data");
        packet[0] = 0;
        packet[2] = 0;
        packet[3] = 0;
        let sum = checksum(&IcmpPacket::new(&packet).unwrap());
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        packet
    }

    #[test]
    fn dispatch_delivers_replies_with_timestamp() {
        let recorder = Recorder::default();
        let source = IpAddr::V4(Ipv4Addr::LOCALHOST);

        dispatch(&echo_reply_v4(7, 42), false, false, &recorder, source, Instant::now());

        let packets = recorder.packets.lock();
        let (echo, error, received_at) = &packets[0];
        assert_eq!(echo.seq, 42);
        assert_eq!(echo.ident, 7);
        assert!(error.is_none());
        assert!(received_at.is_some());
    }

    #[test]
    fn dispatch_strips_ip_header_in_privileged_v4() {
        let recorder = Recorder::default();
        let source = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45;
        datagram.extend_from_slice(&echo_reply_v4(7, 43));

        dispatch(&datagram, false, true, &recorder, source, Instant::now());

        let packets = recorder.packets.lock();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.seq, 43);
    }

    #[test]
    fn dispatch_drops_noise() {
        let recorder = Recorder::default();
        let source = IpAddr::V4(Ipv4Addr::LOCALHOST);

        // router advertisement, truncated garbage
        dispatch(&[9, 0, 0, 0, 0, 0, 0, 0], false, false, &recorder, source, Instant::now());
        dispatch(&[0, 1], false, false, &recorder, source, Instant::now());

        assert!(recorder.packets.lock().is_empty());
    }
}
