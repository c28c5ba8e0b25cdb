use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use super::{ConnectionId, RawHandle, StreamTransport, sys};

/// Blocking or non-blocking OS streams both work: reads are sized from
/// `FIONREAD`, so they never wait for more than is already buffered.
macro_rules! impl_stream_transport {
    ($($ty:ty),*) => {$(
        impl StreamTransport for $ty {
            fn id(&self) -> ConnectionId {
                ConnectionId::from(self.as_raw_fd())
            }

            fn ready_handle(&self) -> RawHandle {
                self.as_raw_fd()
            }

            fn bytes_available(&mut self) -> io::Result<usize> {
                sys::bytes_available(self.as_raw_fd())
            }

            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                Read::read(self, buf)
            }

            fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
                Write::write_all(self, buf)
            }
        }
    )*};
}

impl_stream_transport!(TcpStream, UnixStream);
