//! On-wire packet format.
//!
//! Every datagram starts with a fixed 24-byte header; all multi-byte fields
//! are transmitted in network byte order. The acknowledgement fields are
//! stamped at the moment a buffered packet actually hits the wire, so a
//! retransmit always carries the receiver's current view.

use crate::status::{Result, Status};

/// Wire header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Mask for the version bit reserved in the type byte.
pub const TYPE_VERSION_MASK: u8 = 0x80;

/// NACK reason: receiver is out of receive buffers.
pub const NACK_RNR: u8 = 0;
/// NACK reason: the RMA token is unknown or lacks the required protection.
pub const NACK_RMA_HANDLE: u8 = 1;

/// Packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktType {
    /// Connection request (first leg of the handshake).
    Request = 1,
    /// Connection reply carrying the accept status and the target's ID.
    Reply = 2,
    /// Final leg of the handshake, from initiator to target.
    HandshakeAck = 3,
    /// Connection rejection.
    Reject = 4,
    /// Application message.
    Msg = 5,
    /// Standalone acknowledgement.
    Ack = 6,
    /// Negative acknowledgement; the attr byte carries the reason.
    Nack = 7,
    /// RMA write fragment.
    RmaWrite = 8,
    /// RMA read request descriptor.
    RmaReadRequest = 9,
    /// RMA read reply carrying the requested window.
    RmaReadReply = 10,
    /// Keepalive probe.
    Keepalive = 11,
}

impl PktType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PktType::Request),
            2 => Some(PktType::Reply),
            3 => Some(PktType::HandshakeAck),
            4 => Some(PktType::Reject),
            5 => Some(PktType::Msg),
            6 => Some(PktType::Ack),
            7 => Some(PktType::Nack),
            8 => Some(PktType::RmaWrite),
            9 => Some(PktType::RmaReadRequest),
            10 => Some(PktType::RmaReadReply),
            11 => Some(PktType::Keepalive),
            _ => None,
        }
    }
}

/// Fixed wire header prepended to every datagram.
///
/// ```text
/// [0]      type: u8 (top bit reserved for versioning)
/// [1]      attr: u8 (connection attribute, or NACK reason)
/// [2..6]   src_id: u32 BE (sender's connection ID)
/// [6..10]  dst_id: u32 BE (receiver's connection ID, 0 if unknown)
/// [10..14] seq: u32 BE
/// [14..18] ack: u32 BE (cumulative)
/// [18..22] sack: u32 BE (selective bitmap above the cumulative)
/// [22..24] len: u16 BE (payload bytes)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: PktType,
    pub attr: u8,
    pub src_id: u32,
    pub dst_id: u32,
    pub seq: u32,
    pub ack: u32,
    pub sack: u32,
    pub len: u16,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.kind as u8;
        buf[1] = self.attr;
        buf[2..6].copy_from_slice(&self.src_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.dst_id.to_be_bytes());
        buf[10..14].copy_from_slice(&self.seq.to_be_bytes());
        buf[14..18].copy_from_slice(&self.ack.to_be_bytes());
        buf[18..22].copy_from_slice(&self.sack.to_be_bytes());
        buf[22..24].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Decode a header from the front of a datagram.
    ///
    /// Returns `None` for short datagrams, unknown type tags, or packets
    /// from a future protocol version.
    pub fn decode(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        if buf[0] & TYPE_VERSION_MASK != 0 {
            return None;
        }
        let kind = PktType::from_u8(buf[0])?;
        Some(Header {
            kind,
            attr: buf[1],
            src_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            dst_id: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            seq: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
            ack: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
            sack: u32::from_be_bytes([buf[18], buf[19], buf[20], buf[21]]),
            len: u16::from_be_bytes([buf[22], buf[23]]),
        })
    }

    /// Re-stamp the acknowledgement fields of an already-encoded packet.
    pub fn patch_ack(buf: &mut [u8], ack: u32, sack: u32) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[14..18].copy_from_slice(&ack.to_be_bytes());
        buf[18..22].copy_from_slice(&sack.to_be_bytes());
    }
}

/// RMA write sub-header size (follows the wire header, precedes the data).
pub const RMA_WRITE_HDR_SIZE: usize = 16;

/// Sub-header of an [`PktType::RmaWrite`] fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaWriteHdr {
    /// Token of the target region at the receiver.
    pub token: u64,
    /// Byte offset into the target region.
    pub offset: u64,
}

impl RmaWriteHdr {
    pub fn encode(&self) -> [u8; RMA_WRITE_HDR_SIZE] {
        let mut buf = [0u8; RMA_WRITE_HDR_SIZE];
        buf[0..8].copy_from_slice(&self.token.to_be_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RMA_WRITE_HDR_SIZE {
            return Err(Status::Invalid);
        }
        Ok(Self {
            token: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// RMA read-request sub-header size.
pub const RMA_READ_REQ_HDR_SIZE: usize = 36;

/// Sub-header of an [`PktType::RmaReadRequest`].
///
/// Carries both sides of the transfer so the reply can be routed without
/// the responder keeping any per-request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaReadReqHdr {
    /// Token of the requester's local region (echoed in the reply).
    pub req_token: u64,
    /// Destination offset in the requester's region.
    pub req_offset: u64,
    /// Token of the region to read at the responder.
    pub token: u64,
    /// Source offset in the responder's region.
    pub offset: u64,
    /// Bytes requested.
    pub length: u32,
}

impl RmaReadReqHdr {
    pub fn encode(&self) -> [u8; RMA_READ_REQ_HDR_SIZE] {
        let mut buf = [0u8; RMA_READ_REQ_HDR_SIZE];
        buf[0..8].copy_from_slice(&self.req_token.to_be_bytes());
        buf[8..16].copy_from_slice(&self.req_offset.to_be_bytes());
        buf[16..24].copy_from_slice(&self.token.to_be_bytes());
        buf[24..32].copy_from_slice(&self.offset.to_be_bytes());
        buf[32..36].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RMA_READ_REQ_HDR_SIZE {
            return Err(Status::Invalid);
        }
        Ok(Self {
            req_token: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            req_offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            token: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
            length: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
        })
    }
}

/// RMA read-reply sub-header size (followed by the window data).
pub const RMA_READ_REPLY_HDR_SIZE: usize = 16;

/// Sub-header of an [`PktType::RmaReadReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaReadReplyHdr {
    /// Token of the requester's local region.
    pub req_token: u64,
    /// Destination offset in the requester's region.
    pub req_offset: u64,
}

impl RmaReadReplyHdr {
    pub fn encode(&self) -> [u8; RMA_READ_REPLY_HDR_SIZE] {
        let mut buf = [0u8; RMA_READ_REPLY_HDR_SIZE];
        buf[0..8].copy_from_slice(&self.req_token.to_be_bytes());
        buf[8..16].copy_from_slice(&self.req_offset.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RMA_READ_REPLY_HDR_SIZE {
            return Err(Status::Invalid);
        }
        Ok(Self {
            req_token: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            req_offset: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}
