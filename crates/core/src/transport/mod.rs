//! Stream transports and readiness waiting.
//!
//! The engine never creates, connects or configures sockets. It is handed
//! already-established point-to-point streams through the
//! [`StreamTransport`] trait and asks a [`ReadinessWait`] implementation
//! which of them have bytes pending:
//!
//! - **[`stream`]**: `StreamTransport` for `TcpStream` and `UnixStream`.
//! - **[`sys`]**: the Unix `poll(2)` / `FIONREAD` backend and the socket
//!   pair used by [`AbortChannel`](crate::AbortChannel).

pub mod stream;
pub mod sys;

use std::fmt;
use std::io;
use std::time::Duration;

pub use sys::RawHandle;

/// Identity of one registered connection.
///
/// For OS streams this is the raw descriptor, so two live streams never
/// share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<RawHandle> for ConnectionId {
    fn from(handle: RawHandle) -> Self {
        Self(handle as u64)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// One established point-to-point byte stream.
///
/// Implementations must never block in [`read`](Self::read) when asked for
/// at most [`bytes_available`](Self::bytes_available) bytes.
pub trait StreamTransport: Send {
    /// Identity used as registry key, filter key and packet source.
    fn id(&self) -> ConnectionId;

    /// Handle placed in readiness sets.
    fn ready_handle(&self) -> RawHandle;

    /// Bytes readable right now. Zero on a readable handle means the peer
    /// closed the stream.
    fn bytes_available(&mut self) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer, retrying partial writes.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Platform readiness primitive.
///
/// `wait_ready` blocks until at least one of `handles` is readable or the
/// timeout elapses, sets `ready[i]` for each readable handle and returns how
/// many are ready. A zero timeout is a pure non-blocking check.
pub trait ReadinessWait: Send + Sync {
    fn wait_ready(&self, handles: &[RawHandle], ready: &mut [bool], timeout: Duration) -> io::Result<usize>;
}

/// [`ReadinessWait`] backed by `poll(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPoller;

impl ReadinessWait for SystemPoller {
    fn wait_ready(&self, handles: &[RawHandle], ready: &mut [bool], timeout: Duration) -> io::Result<usize> {
        sys::poll_readable(handles, ready, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn#7");
        assert_eq!(ConnectionId::from(12 as RawHandle).get(), 12);
    }

    #[test]
    fn system_poller_zero_timeout_on_empty_set() {
        let mut ready: [bool; 0] = [];
        assert_eq!(SystemPoller.wait_ready(&[], &mut ready, Duration::ZERO).unwrap(), 0);
    }
}
