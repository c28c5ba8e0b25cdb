//! Received packets and RTP/RTCP classification.

use std::time::SystemTime;

use crate::transport::ConnectionId;

/// Size of the RTCP common header (V/P/RC, PT, length).
const RTCP_COMMON_HEADER_LEN: usize = 4;

/// RTCP packet types SR, RR, SDES, BYE and APP (RFC 3550 §12.1).
const RTCP_PACKET_TYPES: std::ops::RangeInclusive<u8> = 200..=204;

/// Whether a frame carried RTP media or RTCP control data.
///
/// Both share one stream under RFC 4571, so the kind is inferred from the
/// second octet, which holds the RTCP packet type (RFC 5761 §4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

impl PacketKind {
    pub fn classify(data: &[u8]) -> Self {
        if data.len() > RTCP_COMMON_HEADER_LEN && RTCP_PACKET_TYPES.contains(&data[1]) {
            PacketKind::Rtcp
        } else {
            PacketKind::Rtp
        }
    }
}

/// One received frame payload with its arrival metadata.
///
/// Owned by the engine's queue until handed out by
/// [`StreamTransmitter::get_next_packet`](crate::StreamTransmitter::get_next_packet).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    data: Vec<u8>,
    source: ConnectionId,
    received_at: SystemTime,
    kind: PacketKind,
}

impl RawPacket {
    pub fn new(data: Vec<u8>, source: ConnectionId, received_at: SystemTime) -> Self {
        let kind = PacketKind::classify(&data);
        Self {
            data,
            source,
            received_at,
            kind,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn source(&self) -> ConnectionId {
        self.source
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn is_rtp(&self) -> bool {
        self.kind == PacketKind::Rtp
    }
}
