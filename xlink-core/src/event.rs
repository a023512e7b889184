//! Link events: the unit of exchange between host and device.
//!
//! ## Wire format
//!
//! **Event header** (88 bytes, little-endian):
//! ```text
//! magic:        u32      (4)   "XLNK"
//! id:           i32      (4)
//! event_type:   u32      (4)
//! flags:        u32      (4)
//! stream_id:    u32      (4)   link-local part only
//! size:         u32      (4)   payload length before padding
//! stream_name:  [u8; 64] (64)  NUL-padded
//! ```
//!
//! A `WriteReq` header is followed by `align_up(size)` payload bytes,
//! zero-padded. Every other event is header-only.

use std::fmt;

use bytes::Bytes;

use crate::error::XLinkError;
use crate::flags::EventFlags;
use crate::types::{MAX_STREAM_NAME_LENGTH, bounded};

/// Magic at the start of every event header.
pub const EVENT_MAGIC: [u8; 4] = *b"XLNK";

/// Encoded size of an [`EventHeader`].
pub const EVENT_HEADER_SIZE: usize = 24 + MAX_STREAM_NAME_LENGTH;

/// Identifier correlating a request with its response.
pub type EventId = i32;

// ── EventType ────────────────────────────────────────────────────

int_enum!(
    /// Request and response kinds. Values match the device firmware.
    EventType: u32 {
        WriteReq = 0,
        ReadReq = 1,
        ReadRelReq = 2,
        CreateStreamReq = 3,
        CloseStreamReq = 4,
        PingReq = 5,
        ResetReq = 6,
        WriteResp = 8,
        ReadResp = 9,
        ReadRelResp = 10,
        CreateStreamResp = 11,
        CloseStreamResp = 12,
        PingResp = 13,
        ResetResp = 14,
        ReadRelSpecReq = 24,
        ReadRelSpecResp = 25,
    }
);

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl EventType {
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            EventType::WriteReq
                | EventType::ReadReq
                | EventType::ReadRelReq
                | EventType::CreateStreamReq
                | EventType::CloseStreamReq
                | EventType::PingReq
                | EventType::ResetReq
                | EventType::ReadRelSpecReq
        )
    }

    /// The response kind answering this request.
    pub fn response(&self) -> Option<EventType> {
        match self {
            EventType::WriteReq => Some(EventType::WriteResp),
            EventType::ReadReq => Some(EventType::ReadResp),
            EventType::ReadRelReq => Some(EventType::ReadRelResp),
            EventType::CreateStreamReq => Some(EventType::CreateStreamResp),
            EventType::CloseStreamReq => Some(EventType::CloseStreamResp),
            EventType::PingReq => Some(EventType::PingResp),
            EventType::ResetReq => Some(EventType::ResetResp),
            EventType::ReadRelSpecReq => Some(EventType::ReadRelSpecResp),
            _ => None,
        }
    }

    /// Returns `true` if the sender waits for the matching response.
    ///
    /// Read releases are notifications; their responses are sent but never
    /// awaited.
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            EventType::WriteReq
                | EventType::CreateStreamReq
                | EventType::CloseStreamReq
                | EventType::PingReq
                | EventType::ResetReq
        )
    }
}

// ── EventHeader ──────────────────────────────────────────────────

/// Fixed-size header of every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub id: EventId,
    pub event_type: EventType,
    pub flags: EventFlags,
    pub stream_id: u32,
    pub size: u32,
    pub stream_name: String,
}

impl EventHeader {
    pub fn new(id: EventId, event_type: EventType, stream_id: u32, size: u32) -> Self {
        Self {
            id,
            event_type,
            flags: EventFlags::empty(),
            stream_id,
            size,
            stream_name: String::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.stream_name = bounded(name, MAX_STREAM_NAME_LENGTH);
        self
    }

    pub fn with_flags(mut self, flags: EventFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Build the response header answering `self`.
    pub fn respond(&self, flags: EventFlags) -> Result<Self, XLinkError> {
        let event_type = self
            .event_type
            .response()
            .ok_or(XLinkError::ProtocolViolation("responding to a response"))?;
        Ok(Self {
            id: self.id,
            event_type,
            flags,
            stream_id: self.stream_id,
            size: self.size,
            stream_name: self.stream_name.clone(),
        })
    }

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; EVENT_HEADER_SIZE] {
        let mut buf = [0u8; EVENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&EVENT_MAGIC);
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.event_type as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[16..20].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.size.to_le_bytes());
        let name = self.stream_name.as_bytes();
        let n = name.len().min(MAX_STREAM_NAME_LENGTH - 1);
        buf[24..24 + n].copy_from_slice(&name[..n]);
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, XLinkError> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(XLinkError::Truncated {
                what: "event header",
                expected: EVENT_HEADER_SIZE,
                actual: data.len(),
            });
        }
        if data[0..4] != EVENT_MAGIC {
            return Err(XLinkError::InvalidMagic);
        }
        let event_type = EventType::try_from(read_u32(data, 8))?;
        let name_field = &data[24..EVENT_HEADER_SIZE];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_field.len());
        let stream_name = String::from_utf8_lossy(&name_field[..name_len]).into_owned();

        Ok(Self {
            id: read_u32(data, 4) as i32,
            event_type,
            flags: EventFlags::from_bits_truncate(read_u32(data, 12)),
            stream_id: read_u32(data, 16),
            size: read_u32(data, 20),
            stream_name,
        })
    }

    /// Number of payload bytes following this header on the wire.
    pub fn wire_payload_len(&self) -> usize {
        match self.event_type {
            EventType::WriteReq => crate::types::align_up(self.size as usize),
            _ => 0,
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

// ── Event ────────────────────────────────────────────────────────

/// A header plus its payload (write requests only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: EventHeader,
    /// Unpadded payload; exactly `header.size` bytes for write requests.
    pub payload: Bytes,
}

impl Event {
    pub fn control(header: EventHeader) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn write(id: EventId, stream_id: u32, payload: Bytes) -> Self {
        Self {
            header: EventHeader::new(id, EventType::WriteReq, stream_id, payload.len() as u32),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_keeps_name_and_flags() {
        let h = EventHeader::new(42, EventType::CreateStreamReq, 7, 128)
            .with_name("detections")
            .with_flags(EventFlags::ACK | EventFlags::MOVE_SEMANTIC);
        let bytes = h.encode();
        assert_eq!(&bytes[0..4], b"XLNK");
        assert_eq!(EventHeader::decode(&bytes).unwrap(), h);
    }

    #[test]
    fn decode_rejects_bad_magic_and_short_input() {
        let mut bytes = EventHeader::new(1, EventType::PingReq, 0, 0).encode();
        assert!(matches!(
            EventHeader::decode(&bytes[..10]),
            Err(XLinkError::Truncated { .. })
        ));
        bytes[0] = b'Z';
        assert!(matches!(
            EventHeader::decode(&bytes),
            Err(XLinkError::InvalidMagic)
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut bytes = EventHeader::new(1, EventType::PingReq, 0, 0).encode();
        bytes[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            EventHeader::decode(&bytes),
            Err(XLinkError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn long_names_are_truncated() {
        let h = EventHeader::new(1, EventType::CreateStreamReq, 0, 0).with_name(&"n".repeat(80));
        assert_eq!(h.stream_name.len(), MAX_STREAM_NAME_LENGTH - 1);
        let back = EventHeader::decode(&h.encode()).unwrap();
        assert_eq!(back.stream_name, h.stream_name);
    }

    #[test]
    fn responses_pair_with_requests() {
        let req = EventHeader::new(9, EventType::WriteReq, 3, 10);
        let resp = req.respond(EventFlags::acked()).unwrap();
        assert_eq!(resp.event_type, EventType::WriteResp);
        assert_eq!(resp.id, 9);
        assert!(resp.respond(EventFlags::acked()).is_err());
        assert!(!EventType::ReadRelReq.expects_response());
        assert_eq!(req.wire_payload_len(), 64);
    }
}
