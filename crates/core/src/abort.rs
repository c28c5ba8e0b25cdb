//! Cross-thread wake-up for threads parked in a readiness wait.
//!
//! An [`AbortChannel`] owns a connected socket pair. Its read end is added
//! to the readiness set of a blocking wait; [`signal`](AbortChannel::signal)
//! writes a byte to the other end, which makes the wait return. The waiter
//! then calls [`clear_pending_signals`](AbortChannel::clear_pending_signals)
//! so the next wait blocks normally again.
//!
//! ```text
//! thread A                          thread B
//! wait_ready([conns.., abort]) ──┐
//!                                │   signal()
//!        <── abort readable ─────┘
//! clear_pending_signals()
//! ```
//!
//! The channel has its own lock, so signalling never needs a lock held by
//! the thread being woken.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{Result, TransmitError};
use crate::transport::RawHandle;
use crate::transport::sys::{self, SignalPair};

/// Reusable cancellation point for readiness waits.
///
/// One channel may be shared by several engines driven from the same poll
/// thread (see [`TransmissionParams::abort_channel`](crate::TransmissionParams::abort_channel)).
#[derive(Debug, Default)]
pub struct AbortChannel {
    pair: RwLock<Option<SignalPair>>,
    /// Set while a signalling byte is outstanding; further signals coalesce.
    pending: AtomicBool,
}

impl AbortChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the underlying socket pair.
    pub fn init(&self) -> Result<()> {
        let mut pair = self.pair.write();
        if pair.is_some() {
            return Err(TransmitError::AlreadyInitialized);
        }
        *pair = Some(SignalPair::new().map_err(TransmitError::Initialization)?);
        self.pending.store(false, Ordering::SeqCst);
        tracing::debug!("abort channel initialized");
        Ok(())
    }

    /// Release the socket pair. Safe to call repeatedly or before `init`.
    pub fn destroy(&self) {
        if self.pair.write().take().is_some() {
            self.pending.store(false, Ordering::SeqCst);
            tracing::debug!("abort channel destroyed");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.pair.read().is_some()
    }

    /// Mark the channel pending. Never blocks.
    ///
    /// Signals issued before the next drain collapse into one pending
    /// observation.
    pub fn signal(&self) -> Result<()> {
        let pair = self.pair.read();
        let pair = pair.as_ref().ok_or(TransmitError::AbortNotInitialized)?;

        if self.pending.swap(true, Ordering::SeqCst) {
            tracing::trace!("abort signal coalesced");
            return Ok(());
        }
        match pair.send_byte() {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::trace!("abort channel buffer full, already signalled");
                Ok(())
            }
            Err(e) => {
                self.pending.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Drain every buffered signal without blocking.
    ///
    /// Each iteration performs one zero-timeout readiness check and consumes
    /// at most one byte, so the loop is bounded by what is buffered.
    pub fn clear_pending_signals(&self) -> Result<()> {
        let pair = self.pair.read();
        let pair = pair.as_ref().ok_or(TransmitError::AbortNotInitialized)?;

        // Cleared before draining: a signal racing with the drain writes a
        // fresh byte instead of being swallowed by the flag.
        self.pending.store(false, Ordering::SeqCst);

        let handles = [pair.ready_handle()];
        let mut ready = [false];
        let mut drained = 0usize;
        loop {
            sys::poll_readable(&handles, &mut ready, Duration::ZERO)?;
            if !ready[0] {
                break;
            }
            pair.read_byte()?;
            drained += 1;
        }

        if drained > 0 {
            tracing::trace!(drained, "abort signals cleared");
        }
        Ok(())
    }

    /// Whether a signal is waiting to be drained (zero-timeout readiness check).
    pub fn is_pending(&self) -> Result<bool> {
        let pair = self.pair.read();
        let pair = pair.as_ref().ok_or(TransmitError::AbortNotInitialized)?;
        let mut ready = [false];
        sys::poll_readable(&[pair.ready_handle()], &mut ready, Duration::ZERO)?;
        Ok(ready[0])
    }

    /// Handle to include in a readiness set.
    pub fn ready_handle(&self) -> Result<RawHandle> {
        self.pair
            .read()
            .as_ref()
            .map(SignalPair::ready_handle)
            .ok_or(TransmitError::AbortNotInitialized)
    }
}

impl Drop for AbortChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}
