//! Stream transmission engine.
//!
//! [`StreamTransmitter`] carries RTP/RTCP packets over a set of
//! point-to-point stream connections:
//!
//! - **Inbound**: [`poll`](StreamTransmitter::poll) reads whatever bytes are
//!   pending on each readable connection, reassembles RFC 4571 frames,
//!   applies the receive filter and queues the accepted packets.
//!   [`wait_for_incoming_data`](StreamTransmitter::wait_for_incoming_data)
//!   blocks until some connection becomes readable and can be cancelled from
//!   another thread with [`abort_wait`](StreamTransmitter::abort_wait).
//! - **Outbound**: [`send_rtp_data`](StreamTransmitter::send_rtp_data) and
//!   [`send_rtcp_data`](StreamTransmitter::send_rtcp_data) frame a payload
//!   once and write it to every connection.
//!
//! A connection that fails (read/write error, peer close, malformed frame)
//! is reported to the [`ConnectionErrorHook`] and removed; the others keep
//! running.
//!
//! ## Lifecycle
//!
//! ```text
//! new()  -> Uninitialized
//! init   -> Initialized
//! create -> Created
//! destroy -> Uninitialized
//! ```
//!
//! ## Threading
//!
//! There is no internal thread. All state sits behind the main lock; a
//! second lock serializes blocking waiters when the engine was initialized
//! with `thread_safe = true`. In that mode one thread may sit in
//! `wait_for_incoming_data` while another polls, sends and manages
//! destinations. The abort channel is reached without the main lock.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};

use crate::abort::AbortChannel;
use crate::error::{AssemblyError, RegistryError, Result, TransmitError};
use crate::filter::{ReceiveFilter, ReceiveMode, Verdict};
use crate::framing::{self, FrameAssembler, MAX_FRAME_PAYLOAD};
use crate::packet::RawPacket;
use crate::registry::{BucketIndex, KeyedRegistry};
use crate::transport::{ConnectionId, RawHandle, ReadinessWait, StreamTransport, SystemPoller};

/// Default maximum RTP/RTCP packet size in bytes.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;

/// Per-packet overhead on the wire: IPv4 (20) + TCP (20) + length prefix (2).
pub const HEADER_OVERHEAD: usize = 20 + 20 + framing::LENGTH_PREFIX_LEN;

/// Hash buckets in the destination registry.
pub const DESTINATION_BUCKETS: usize = 1024;

/// Bucket index for connection ids.
pub struct DestinationBuckets;

impl BucketIndex<ConnectionId> for DestinationBuckets {
    fn bucket_index(id: &ConnectionId) -> usize {
        (id.get() % DESTINATION_BUCKETS as u64) as usize
    }
}

/// Why a connection was dropped.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("closed by peer")]
    Closed,

    #[error("{0}")]
    Assembly(#[from] AssemblyError),
}

/// Notified once for every connection the engine drops on its own.
///
/// Called with the engine's main lock held, so implementations must not
/// call back into the transmitter.
pub trait ConnectionErrorHook: Send + Sync {
    fn on_connection_error(&self, id: ConnectionId, reason: &ConnectionError);
}

/// Parameters for [`StreamTransmitter::create`].
#[derive(Clone)]
pub struct TransmissionParams {
    /// Abort channel shared with other engines driven by the same poll
    /// thread. Must already be initialized. When `None` the engine uses its
    /// own channel.
    pub abort_channel: Option<Arc<AbortChannel>>,
    /// Readiness primitive used by `poll` and `wait_for_incoming_data`.
    pub poller: Arc<dyn ReadinessWait>,
    pub error_hook: Option<Arc<dyn ConnectionErrorHook>>,
    /// Initial receive mode. Both filter lists start empty.
    pub receive_mode: ReceiveMode,
}

impl Default for TransmissionParams {
    fn default() -> Self {
        Self {
            abort_channel: None,
            poller: Arc::new(SystemPoller),
            error_hook: None,
            receive_mode: ReceiveMode::AcceptAll,
        }
    }
}

impl fmt::Debug for TransmissionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmissionParams")
            .field("abort_channel", &self.abort_channel)
            .field("error_hook", &self.error_hook.is_some())
            .field("receive_mode", &self.receive_mode)
            .finish_non_exhaustive()
    }
}

/// A registered stream and its reassembly state.
struct Connection<T> {
    transport: T,
    assembler: FrameAssembler,
}

impl<T: StreamTransport> Connection<T> {
    /// Read what is pending and reassemble it.
    ///
    /// Frames completed before a failure are returned with it.
    fn receive(&mut self, buf: &mut Vec<u8>) -> (Vec<Vec<u8>>, Option<ConnectionError>) {
        let available = match self.transport.bytes_available() {
            Ok(0) => return (Vec::new(), Some(ConnectionError::Closed)),
            Ok(n) => n,
            Err(e) => return (Vec::new(), Some(ConnectionError::Receive(e))),
        };

        buf.resize(available, 0);
        let read = match self.transport.read(&mut buf[..available]) {
            Ok(0) => return (Vec::new(), Some(ConnectionError::Closed)),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return (Vec::new(), None);
            }
            Err(e) => return (Vec::new(), Some(ConnectionError::Receive(e))),
        };

        let (frames, err) = self.assembler.push(&buf[..read]);
        (frames, err.map(ConnectionError::Assembly))
    }
}

type Destinations<T> = KeyedRegistry<ConnectionId, Connection<T>, DestinationBuckets, DESTINATION_BUCKETS>;

/// State that exists between `create` and `destroy`.
struct Core<T> {
    destinations: Destinations<T>,
    queue: VecDeque<RawPacket>,
    filter: ReceiveFilter<ConnectionId>,
    max_packet_size: usize,
    abort: Arc<AbortChannel>,
    poller: Arc<dyn ReadinessWait>,
    error_hook: Option<Arc<dyn ConnectionErrorHook>>,
    dropped: u64,
    handles: Vec<RawHandle>,
    ready: Vec<bool>,
    read_buf: Vec<u8>,
}

impl<T: StreamTransport> Core<T> {
    fn new(max_packet_size: usize, abort: Arc<AbortChannel>, params: TransmissionParams) -> Self {
        Self {
            destinations: KeyedRegistry::new(),
            queue: VecDeque::new(),
            filter: ReceiveFilter::new(params.receive_mode),
            max_packet_size,
            abort,
            poller: params.poller,
            error_hook: params.error_hook,
            dropped: 0,
            handles: Vec::new(),
            ready: Vec::new(),
            read_buf: Vec::new(),
        }
    }

    fn add_destination(&mut self, mut transport: T) -> Result<ConnectionId> {
        let id = transport.id();
        if self.destinations.contains(&id) {
            return Err(TransmitError::DuplicateDestination(id));
        }
        if let Err(source) = transport.bytes_available() {
            return Err(TransmitError::InvalidTransport { id, source });
        }

        let assembler = FrameAssembler::new(self.max_packet_size);
        self.destinations.add(id, Connection { transport, assembler })?;
        tracing::debug!(%id, total = self.destinations.len(), "destination added");
        Ok(id)
    }

    fn delete_destination(&mut self, id: ConnectionId) -> Result<T> {
        match self.destinations.remove(&id) {
            Ok(conn) => {
                tracing::debug!(%id, total = self.destinations.len(), "destination removed");
                Ok(conn.transport)
            }
            Err(RegistryError::KeyNotFound) => Err(TransmitError::DestinationNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn poll(&mut self) -> Result<()> {
        if self.destinations.is_empty() {
            return Ok(());
        }

        self.handles.clear();
        self.handles
            .extend(self.destinations.iter().map(|(_, conn)| conn.transport.ready_handle()));
        self.ready.clear();
        self.ready.resize(self.handles.len(), false);

        let readable = self.poller.wait_ready(&self.handles, &mut self.ready, Duration::ZERO)?;
        if readable == 0 {
            return Ok(());
        }

        let now = SystemTime::now();
        let mut slot = 0;
        self.destinations.goto_first();
        while self.destinations.has_current() {
            let is_ready = self.ready[slot];
            slot += 1;
            if !is_ready {
                self.destinations.goto_next();
                continue;
            }

            let Some((&id, conn)) = self.destinations.current_mut() else {
                break;
            };
            let (frames, failure) = conn.receive(&mut self.read_buf);

            for frame in frames {
                self.deliver(id, frame, now);
            }
            match failure {
                None => self.destinations.goto_next(),
                Some(reason) => self.drop_current(id, &reason),
            }
        }
        Ok(())
    }

    fn deliver(&mut self, id: ConnectionId, frame: Vec<u8>, now: SystemTime) {
        match self.filter.decision(&id) {
            Verdict::Accept => {
                tracing::trace!(%id, len = frame.len(), "frame queued");
                self.queue.push_back(RawPacket::new(frame, id, now));
            }
            Verdict::Reject => {
                self.dropped += 1;
                tracing::trace!(%id, len = frame.len(), "frame rejected by receive filter");
            }
        }
    }

    /// Report and remove the connection under the registry cursor; the
    /// cursor moves on to the next connection.
    fn drop_current(&mut self, id: ConnectionId, reason: &ConnectionError) {
        tracing::warn!(%id, error = %reason, "dropping connection");
        if let Some(hook) = &self.error_hook {
            hook.on_connection_error(id, reason);
        }
        let removed = self.destinations.remove_current();
        debug_assert!(removed.is_ok(), "cursor must point at the failed connection");
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        let max = self.max_packet_size.min(MAX_FRAME_PAYLOAD);
        if payload.len() > max {
            return Err(TransmitError::PacketTooBig {
                len: payload.len(),
                max,
            });
        }
        let frame = framing::encode_frame(payload)?;

        let mut first_error = None;
        self.destinations.goto_first();
        while let Some((&id, conn)) = self.destinations.current_mut() {
            match conn.transport.write_all(&frame) {
                Ok(()) => self.destinations.goto_next(),
                Err(source) => {
                    let reason = ConnectionError::Send(same_io_error(&source));
                    if first_error.is_none() {
                        first_error = Some(TransmitError::Send { id, source });
                    }
                    self.drop_current(id, &reason);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
        self.destinations.goto_first();
        while let Some((_, conn)) = self.destinations.current_mut() {
            conn.assembler.set_max_payload(size);
            self.destinations.goto_next();
        }
    }
}

/// Copy of an I/O error for the hook, keeping the OS error code when there is one.
fn same_io_error(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(e.kind(), e.to_string()),
    }
}

enum Lifecycle<T> {
    Uninitialized,
    Initialized,
    Created(Box<Core<T>>),
}

/// Resets the "a thread is waiting" flag when the wait ends.
struct WaitingGuard<'a>(&'a AtomicBool);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// RTP/RTCP transmitter over stream connections (RFC 4571).
pub struct StreamTransmitter<T> {
    state: Mutex<Lifecycle<T>>,
    wait_lock: Mutex<()>,
    thread_safe: AtomicBool,
    waiting: AtomicBool,
    own_abort: Arc<AbortChannel>,
    /// Channel the current waiter listens on; readable without the main lock.
    active_abort: RwLock<Option<Arc<AbortChannel>>>,
}

impl<T: StreamTransport> StreamTransmitter<T> {
    /// An engine in the `Uninitialized` state. Nothing is allocated yet.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Lifecycle::Uninitialized),
            wait_lock: Mutex::new(()),
            thread_safe: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            own_abort: Arc::new(AbortChannel::new()),
            active_abort: RwLock::new(None),
        }
    }

    /// Allocate the abort channel. With `thread_safe`, concurrent waiters
    /// are serialized instead of rejected.
    pub fn init(&self, thread_safe: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, Lifecycle::Uninitialized) {
            return Err(TransmitError::AlreadyInitialized);
        }

        self.own_abort.init()?;
        self.thread_safe.store(thread_safe, Ordering::SeqCst);
        *state = Lifecycle::Initialized;
        tracing::debug!(thread_safe, "transmitter initialized");
        Ok(())
    }

    /// Allocate the destination registry, packet queue and receive filter.
    pub fn create(&self, max_packet_size: usize, params: TransmissionParams) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            Lifecycle::Uninitialized => return Err(TransmitError::NotInitialized),
            Lifecycle::Created(_) => return Err(TransmitError::AlreadyCreated),
            Lifecycle::Initialized => {}
        }

        let external = params.abort_channel.is_some();
        let abort = match &params.abort_channel {
            Some(channel) if !channel.is_initialized() => {
                return Err(TransmitError::AbortNotInitialized);
            }
            Some(channel) => channel.clone(),
            None => self.own_abort.clone(),
        };

        *self.active_abort.write() = Some(abort.clone());
        *state = Lifecycle::Created(Box::new(Core::new(max_packet_size, abort, params)));
        tracing::debug!(max_packet_size, external_abort = external, "transmitter created");
        Ok(())
    }

    /// Drop every connection and queued packet and release the abort
    /// channel. A thread blocked in `wait_for_incoming_data` is woken first.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut *state, Lifecycle::Uninitialized);

        let waiting = self.waiting.load(Ordering::SeqCst);
        if waiting {
            if let Some(abort) = self.active_abort.read().as_ref() {
                let _ = abort.signal();
            }
        }
        *self.active_abort.write() = None;
        drop(state);

        if waiting && self.thread_safe.load(Ordering::SeqCst) {
            drop(self.wait_lock.lock());
        }

        match previous {
            Lifecycle::Uninitialized => return,
            Lifecycle::Initialized => {}
            Lifecycle::Created(core) => {
                tracing::debug!(
                    destinations = core.destinations.len(),
                    queued = core.queue.len(),
                    "releasing transmitter state"
                );
            }
        }
        self.own_abort.destroy();
        tracing::debug!("transmitter destroyed");
    }

    /// Whether `init` enabled waiter serialization.
    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe.load(Ordering::SeqCst)
    }

    /// Register an established stream. Its [`StreamTransport::id`] becomes
    /// the destination key.
    pub fn add_destination(&self, transport: T) -> Result<ConnectionId> {
        self.with_core(|core| core.add_destination(transport))
    }

    /// Unregister a stream and hand it back to the caller.
    pub fn delete_destination(&self, id: ConnectionId) -> Result<T> {
        self.with_core(|core| core.delete_destination(id))
    }

    /// Drop every connection along with its partial frame. Queued packets
    /// stay. Does nothing before `create`.
    pub fn clear_destinations(&self) {
        if let Lifecycle::Created(core) = &mut *self.state.lock() {
            core.destinations.clear();
            tracing::debug!("destinations cleared");
        }
    }

    /// Registered destinations in registration order.
    pub fn destinations(&self) -> Result<Vec<ConnectionId>> {
        self.with_core(|core| Ok(core.destinations.keys()))
    }

    /// Non-blocking receive pass over every readable connection.
    pub fn poll(&self) -> Result<()> {
        self.with_core(|core| core.poll())
    }

    /// Block until a connection has bytes to read, `timeout` elapses, or
    /// [`abort_wait`](Self::abort_wait) is called.
    ///
    /// Returns `true` immediately if packets are already queued. Otherwise
    /// the result says whether some connection became readable; the bytes
    /// are only read by the next [`poll`](Self::poll), and a readable
    /// connection does not guarantee a complete frame.
    pub fn wait_for_incoming_data(&self, timeout: Duration) -> Result<bool> {
        let _serial = self.is_thread_safe().then(|| self.wait_lock.lock());
        if self.waiting.swap(true, Ordering::SeqCst) {
            return Err(TransmitError::AlreadyWaiting);
        }
        let _waiting = WaitingGuard(&self.waiting);

        let (handles, poller, abort) = {
            let mut state = self.state.lock();
            let core = Self::created(&mut state)?;
            if !core.queue.is_empty() {
                return Ok(true);
            }

            let mut handles: Vec<RawHandle> = core
                .destinations
                .iter()
                .map(|(_, conn)| conn.transport.ready_handle())
                .collect();
            handles.push(core.abort.ready_handle()?);
            (handles, core.poller.clone(), core.abort.clone())
        };

        let mut ready = vec![false; handles.len()];
        let count = poller.wait_ready(&handles, &mut ready, timeout)?;

        let (connections, aborted) = ready.split_at(handles.len() - 1);
        let aborted = aborted[0];
        if aborted {
            abort.clear_pending_signals()?;
        }

        let available = connections.iter().any(|&r| r);
        tracing::trace!(ready = count, aborted, available, "wait finished");
        Ok(available)
    }

    /// Wake a thread blocked in `wait_for_incoming_data`. Coalesces when
    /// nobody is waiting; the next wait then returns at once.
    pub fn abort_wait(&self) -> Result<()> {
        let abort = self.active_abort.read().clone().ok_or(TransmitError::NotCreated)?;
        abort.signal()
    }

    /// Frame `payload` once and write it to every destination.
    ///
    /// Fails with [`TransmitError::PacketTooBig`] before any write when the
    /// payload exceeds the maximum packet size or 65535 bytes. A destination
    /// whose write fails is reported to the hook and removed; the others are
    /// still written, and the first failure is returned as
    /// [`TransmitError::Send`].
    pub fn send_rtp_data(&self, payload: &[u8]) -> Result<()> {
        self.with_core(|core| core.send(payload))
    }

    /// Same as [`send_rtp_data`](Self::send_rtp_data); RTCP shares the
    /// connection and the framing.
    pub fn send_rtcp_data(&self, payload: &[u8]) -> Result<()> {
        self.with_core(|core| core.send(payload))
    }

    /// Whether `get_next_packet` would return a packet. `false` before
    /// `create`.
    pub fn new_data_available(&self) -> bool {
        match &*self.state.lock() {
            Lifecycle::Created(core) => !core.queue.is_empty(),
            _ => false,
        }
    }

    /// Take the oldest queued packet.
    pub fn get_next_packet(&self) -> Result<RawPacket> {
        self.with_core(|core| core.queue.pop_front().ok_or(TransmitError::QueueEmpty))
    }

    /// Stream connections are point-to-point.
    pub fn supports_multicasting(&self) -> bool {
        false
    }

    /// Always [`TransmitError::NotSupported`]; nothing changes.
    pub fn join_multicast_group(&self, _group: std::net::IpAddr) -> Result<()> {
        Err(TransmitError::NotSupported("multicast"))
    }

    /// Always [`TransmitError::NotSupported`]; nothing changes.
    pub fn leave_multicast_group(&self, _group: std::net::IpAddr) -> Result<()> {
        Err(TransmitError::NotSupported("multicast"))
    }

    /// No-op: no group is ever joined.
    pub fn leave_all_multicast_groups(&self) {}

    /// Select which filter list decides acceptance. The lists themselves
    /// are kept.
    pub fn set_receive_mode(&self, mode: ReceiveMode) -> Result<()> {
        self.with_core(|core| {
            core.filter.set_mode(mode);
            tracing::debug!(?mode, "receive mode changed");
            Ok(())
        })
    }

    /// Ignore packets from `id` while the mode is
    /// [`ReceiveMode::RejectIgnoreListed`]. Adding twice is a no-op.
    pub fn add_to_ignore_list(&self, id: ConnectionId) -> Result<()> {
        self.with_core(|core| {
            core.filter.add_to_ignore_list(id);
            Ok(())
        })
    }

    /// Fails with [`TransmitError::NoSuchFilterEntry`] if `id` is not listed.
    pub fn delete_from_ignore_list(&self, id: ConnectionId) -> Result<()> {
        self.with_core(|core| {
            if core.filter.delete_from_ignore_list(&id) {
                Ok(())
            } else {
                Err(TransmitError::NoSuchFilterEntry(id))
            }
        })
    }

    /// Empty the ignore list.
    pub fn clear_ignore_list(&self) -> Result<()> {
        self.with_core(|core| {
            core.filter.clear_ignore_list();
            Ok(())
        })
    }

    /// Accept packets from `id` while the mode is
    /// [`ReceiveMode::AcceptListedOnly`]. Adding twice is a no-op.
    pub fn add_to_accept_list(&self, id: ConnectionId) -> Result<()> {
        self.with_core(|core| {
            core.filter.add_to_accept_list(id);
            Ok(())
        })
    }

    /// Fails with [`TransmitError::NoSuchFilterEntry`] if `id` is not listed.
    pub fn delete_from_accept_list(&self, id: ConnectionId) -> Result<()> {
        self.with_core(|core| {
            if core.filter.delete_from_accept_list(&id) {
                Ok(())
            } else {
                Err(TransmitError::NoSuchFilterEntry(id))
            }
        })
    }

    /// Empty the accept list.
    pub fn clear_accept_list(&self) -> Result<()> {
        self.with_core(|core| {
            core.filter.clear_accept_list();
            Ok(())
        })
    }

    /// Change the size limit for outgoing payloads and for incoming frames
    /// whose length prefix has not been parsed yet.
    pub fn set_maximum_packet_size(&self, size: usize) -> Result<()> {
        self.with_core(|core| {
            core.set_max_packet_size(size);
            tracing::debug!(size, "maximum packet size changed");
            Ok(())
        })
    }

    /// Current maximum packet size.
    pub fn max_packet_size(&self) -> Result<usize> {
        self.with_core(|core| Ok(core.max_packet_size))
    }

    /// Frames discarded by the receive filter since `create`.
    pub fn dropped_packets(&self) -> Result<u64> {
        self.with_core(|core| Ok(core.dropped))
    }

    /// Bytes added per packet on the wire, see [`HEADER_OVERHEAD`].
    pub fn header_overhead(&self) -> usize {
        HEADER_OVERHEAD
    }

    fn created<'a>(state: &'a mut Lifecycle<T>) -> Result<&'a mut Core<T>> {
        match state {
            Lifecycle::Uninitialized => Err(TransmitError::NotInitialized),
            Lifecycle::Initialized => Err(TransmitError::NotCreated),
            Lifecycle::Created(core) => Ok(&mut **core),
        }
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut Core<T>) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        f(Self::created(&mut state)?)
    }
}

impl<T: StreamTransport> Default for StreamTransmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}
