//! RFC 4571 framing of RTP/RTCP packets on a byte stream.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             LENGTH            |  RTP or RTCP packet ...       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `LENGTH` is a 16-bit big-endian count of the payload bytes that follow.
//! Stream reads are not frame-aligned, so a [`FrameAssembler`] keeps partial
//! state between reads and hands out each payload once it is complete.

use crate::error::{AssemblyError, Result, TransmitError};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Largest payload a 16-bit length prefix can describe.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Build the on-wire frame for `payload`: length prefix followed by the bytes.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| TransmitError::PacketTooBig {
        len: payload.len(),
        max: MAX_FRAME_PAYLOAD,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[derive(Debug)]
enum State {
    /// Collecting the 2-byte prefix.
    AwaitingLength { prefix: [u8; LENGTH_PREFIX_LEN], filled: usize },
    /// Prefix parsed; `payload` grows until it holds `expected` bytes.
    AwaitingPayload { payload: Vec<u8>, expected: usize },
}

impl State {
    fn start() -> Self {
        State::AwaitingLength {
            prefix: [0; LENGTH_PREFIX_LEN],
            filled: 0,
        }
    }
}

/// Per-connection frame reassembly state machine.
#[derive(Debug)]
pub struct FrameAssembler {
    state: State,
    max_payload: usize,
}

impl FrameAssembler {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: State::start(),
            max_payload,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Change the limit applied to length prefixes parsed from now on.
    ///
    /// A frame whose prefix was already accepted completes under the old limit.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::AwaitingLength { filled: 0, .. })
    }

    /// Consume bytes until one frame completes or `bytes` runs out.
    ///
    /// Returns how many bytes were consumed and the completed payload, if
    /// any. Bytes after a completed frame are left for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> std::result::Result<(usize, Option<Vec<u8>>), AssemblyError> {
        let mut consumed = 0;

        loop {
            let rest = &bytes[consumed..];
            match &mut self.state {
                State::AwaitingLength { prefix, filled } => {
                    let take = (LENGTH_PREFIX_LEN - *filled).min(rest.len());
                    prefix[*filled..*filled + take].copy_from_slice(&rest[..take]);
                    *filled += take;
                    consumed += take;

                    if *filled < LENGTH_PREFIX_LEN {
                        return Ok((consumed, None));
                    }

                    let declared = u16::from_be_bytes(*prefix) as usize;
                    if declared > self.max_payload {
                        tracing::trace!(declared, max = self.max_payload, "oversized frame announced");
                        return Err(AssemblyError::FrameTooLarge {
                            declared,
                            max: self.max_payload,
                        });
                    }
                    if declared == 0 {
                        self.state = State::start();
                        return Ok((consumed, Some(Vec::new())));
                    }
                    self.state = State::AwaitingPayload {
                        payload: Vec::with_capacity(declared),
                        expected: declared,
                    };
                }
                State::AwaitingPayload { payload, expected } => {
                    let take = (*expected - payload.len()).min(rest.len());
                    payload.extend_from_slice(&rest[..take]);
                    consumed += take;

                    if payload.len() < *expected {
                        return Ok((consumed, None));
                    }

                    let payload = std::mem::take(payload);
                    self.state = State::start();
                    return Ok((consumed, Some(payload)));
                }
            }
        }
    }

    /// Feed a whole chunk, collecting every frame it completes.
    ///
    /// On an assembly error the frames completed before it are still
    /// returned alongside the error.
    pub fn push(&mut self, mut bytes: &[u8]) -> (Vec<Vec<u8>>, Option<AssemblyError>) {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            match self.feed(bytes) {
                Ok((consumed, frame)) => {
                    frames.extend(frame);
                    bytes = &bytes[consumed..];
                }
                Err(e) => return (frames, Some(e)),
            }
        }
        (frames, None)
    }
}
