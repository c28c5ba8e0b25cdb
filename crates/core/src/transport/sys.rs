//! Unix backend: `poll(2)` readiness, `FIONREAD` byte counts and the
//! socket pair behind the abort channel.

use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Handle type placed in readiness sets.
pub type RawHandle = RawFd;

/// Wait until at least one handle is readable or `timeout` elapses.
///
/// `ready[i]` is set for every readable `handles[i]`. Hang-up, error and
/// invalid-descriptor conditions count as readable so the following read
/// surfaces the failure. An interrupted wait reports nothing ready.
pub fn poll_readable(handles: &[RawHandle], ready: &mut [bool], timeout: Duration) -> io::Result<usize> {
    debug_assert_eq!(handles.len(), ready.len());

    let mut fds: Vec<libc::pollfd> = handles
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    // SAFETY: `fds` is a live, exclusively borrowed array of `fds.len()` pollfd entries
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            ready.fill(false);
            return Ok(0);
        }
        return Err(err);
    }

    let mask = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    let mut count = 0;
    for (flag, pfd) in ready.iter_mut().zip(&fds) {
        *flag = pfd.revents & mask != 0;
        if *flag {
            count += 1;
        }
    }
    Ok(count)
}

/// Round up to whole milliseconds so short timeouts don't turn into spins.
fn timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_micros().div_ceil(1000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

/// Number of bytes that can be read from `fd` without blocking.
pub fn bytes_available(fd: RawHandle) -> io::Result<usize> {
    let mut pending: libc::c_int = 0;
    // SAFETY: FIONREAD writes one c_int through the pointer, which points at `pending`
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut pending) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pending.max(0) as usize)
}

/// Connected, non-blocking Unix stream pair used as a wake-up doorbell.
#[derive(Debug)]
pub struct SignalPair {
    reader: UnixStream,
    writer: UnixStream,
}

impl SignalPair {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    pub fn ready_handle(&self) -> RawHandle {
        self.reader.as_raw_fd()
    }

    /// Write one signalling byte.
    ///
    /// Returns `Ok(false)` when the socket buffer is full: the reader is
    /// already signalled, so nothing is lost.
    pub fn send_byte(&self) -> io::Result<bool> {
        match (&self.writer).write(b"*") {
            Ok(n) => Ok(n == 1),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Consume at most one signalling byte.
    pub fn read_byte(&self) -> io::Result<()> {
        let mut buf = [0u8; 1];
        match (&self.reader).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
