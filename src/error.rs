use std::io;

use thiserror::Error;

use crate::probe::Unreachable;

/// Errors surfaced by the echo engine and monitor.
#[derive(Debug, Error)]
pub enum PingError {
    /// Neither a v4 nor a v6 bind address was supplied.
    #[error("need at least one bind address")]
    NotBound,

    /// The destination's address family has no open socket.
    #[error("socket missing")]
    SocketMissing,

    /// The pinger was shut down while the request was in flight.
    #[error("pinger closed")]
    Closed,

    /// `ping_attempts` was called with zero attempts.
    #[error("zero attempts")]
    ZeroAttempts,

    /// No matching reply arrived before the deadline.
    #[error("i/o timeout")]
    Timeout,

    /// The network returned a Destination Unreachable for this request.
    #[error("{0}")]
    Unreachable(Unreachable),

    /// SO_MARK is only available on Linux.
    #[error("setting SO_MARK socket option is not supported on this platform")]
    MarkUnsupported,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PingError {
    /// True for deadline/cancellation expiry, mirroring `net.Error`-style
    /// timeout tagging.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PingError::Timeout)
    }

    /// Timeouts are transient: retrying the request may succeed.
    pub fn is_temporary(&self) -> bool {
        match self {
            PingError::Timeout => true,
            PingError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_tagged_temporary() {
        let err = PingError::Timeout;
        assert!(err.is_timeout());
        assert!(err.is_temporary());
    }

    #[test]
    fn closed_is_terminal() {
        let err = PingError::Closed;
        assert!(!err.is_timeout());
        assert!(!err.is_temporary());
    }

    #[test]
    fn display_matches_wire_taxonomy() {
        assert_eq!(PingError::NotBound.to_string(), "need at least one bind address");
        assert_eq!(PingError::Timeout.to_string(), "i/o timeout");
        assert_eq!(PingError::ZeroAttempts.to_string(), "zero attempts");
    }
}
