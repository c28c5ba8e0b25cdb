//! RTP/RTCP transmission over stream connections (RFC 4571).
//!
//! The crate takes already-established TCP or Unix stream connections and
//! moves length-prefixed RTP/RTCP packets over them:
//!
//! - [`StreamTransmitter`] keeps the set of connections, fans outgoing
//!   packets out to all of them and queues incoming packets.
//! - [`FrameAssembler`] reassembles frames from arbitrarily split reads.
//! - [`ReceiveFilter`] decides which sources are accepted.
//! - [`AbortChannel`] wakes a thread blocked in
//!   [`StreamTransmitter::wait_for_incoming_data`].
//!
//! Connection setup, RTP packet semantics and RTCP scheduling belong to
//! the caller.

#[cfg(not(unix))]
compile_error!("rtptcp currently supports Unix platforms only");

pub mod abort;
pub mod error;
pub mod filter;
pub mod framing;
pub mod packet;
pub mod registry;
pub mod transmitter;
pub mod transport;

pub use abort::AbortChannel;
pub use error::{AssemblyError, RegistryError, Result, TransmitError};
pub use filter::{ReceiveFilter, ReceiveMode, Verdict};
pub use framing::{FrameAssembler, encode_frame};
pub use packet::{PacketKind, RawPacket};
pub use registry::{BucketIndex, KeyedRegistry};
pub use transmitter::{
    ConnectionError, ConnectionErrorHook, DEFAULT_MAX_PACKET_SIZE, StreamTransmitter, TransmissionParams,
};
pub use transport::{ConnectionId, ReadinessWait, StreamTransport, SystemPoller};
