//! Error types for the stream transmission engine.

use std::fmt;

use crate::transport::ConnectionId;

/// Errors returned by the transmission engine and its components.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Lifecycle**: [`AlreadyInitialized`](Self::AlreadyInitialized),
///   [`NotInitialized`](Self::NotInitialized),
///   [`AlreadyCreated`](Self::AlreadyCreated),
///   [`NotCreated`](Self::NotCreated),
///   [`Initialization`](Self::Initialization).
/// - **Abort channel**: [`AbortNotInitialized`](Self::AbortNotInitialized).
/// - **Destinations**: [`DuplicateDestination`](Self::DuplicateDestination),
///   [`DestinationNotFound`](Self::DestinationNotFound),
///   [`InvalidTransport`](Self::InvalidTransport).
/// - **Data path**: [`PacketTooBig`](Self::PacketTooBig),
///   [`Assembly`](Self::Assembly), [`QueueEmpty`](Self::QueueEmpty),
///   [`Send`](Self::Send).
#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    /// Underlying I/O failure outside of a single connection (e.g. the
    /// readiness wait itself failed).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A resource needed by `init`/`create` could not be allocated.
    #[error("initialization failed: {0}")]
    Initialization(#[source] std::io::Error),

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("not initialized")]
    NotInitialized,

    #[error("already created")]
    AlreadyCreated,

    #[error("not created")]
    NotCreated,

    /// The abort channel was used before [`AbortChannel::init`](crate::AbortChannel::init).
    #[error("abort channel not initialized")]
    AbortNotInitialized,

    /// Another thread is already blocked in `wait_for_incoming_data` on an
    /// engine that was initialized without thread safety.
    #[error("already waiting for incoming data")]
    AlreadyWaiting,

    #[error("destination already registered: {0}")]
    DuplicateDestination(ConnectionId),

    #[error("destination not found: {0}")]
    DestinationNotFound(ConnectionId),

    /// The transport failed validation when it was registered.
    #[error("invalid transport for {id}: {source}")]
    InvalidTransport {
        id: ConnectionId,
        #[source]
        source: std::io::Error,
    },

    /// Outgoing payload does not fit in one frame.
    #[error("packet too big: {len} bytes (max {max})")]
    PacketTooBig { len: usize, max: usize },

    /// An incoming frame could not be assembled.
    ///
    /// Produced by `?` on [`FrameAssembler::feed`](crate::FrameAssembler::feed)
    /// in code that returns [`Result`]. The engine reports assembly failures
    /// per connection through
    /// [`ConnectionError::Assembly`](crate::ConnectionError::Assembly) instead.
    #[error("frame assembly failed: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("no packet queued")]
    QueueEmpty,

    /// The operation has no meaning for point-to-point stream connections.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("no such filter entry: {0}")]
    NoSuchFilterEntry(ConnectionId),

    /// First write failure of a fan-out send.
    #[error("send to {id} failed: {source}")]
    Send {
        id: ConnectionId,
        #[source]
        source: std::io::Error,
    },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Failures of the generic keyed registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("key already present")]
    DuplicateKey,

    #[error("key not found")]
    KeyNotFound,

    #[error("cursor does not point at an element")]
    NoCurrentElement,

    /// The bucket index function returned a value outside the table.
    #[error("bucket index {index} out of range (table has {buckets} buckets)")]
    InvalidBucketIndex { index: usize, buckets: usize },
}

/// Reason an incoming byte stream could not be turned into a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// The length prefix announced more bytes than the configured maximum.
    FrameTooLarge { declared: usize, max: usize },
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge { declared, max } => {
                write!(f, "declared frame length {declared} exceeds maximum {max}")
            }
        }
    }
}

impl std::error::Error for AssemblyError {}

/// Convenience alias for `Result<T, TransmitError>`.
pub type Result<T> = std::result::Result<T, TransmitError>;
