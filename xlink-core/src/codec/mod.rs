//! Framing of link events for `tokio_util` framed I/O.
//!
//! The decoder waits for a full header, then for the padded payload of write
//! requests, and strips the padding before handing the event up. The encoder
//! writes the header and zero-pads write payloads to the alignment unit.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::XLinkError;
use crate::event::{EVENT_HEADER_SIZE, Event, EventHeader, EventType};
use crate::types::{PACKET_LENGTH, align_up};

#[derive(Debug, Clone)]
pub struct LinkCodec {
    max_packet_size: usize,
    /// Header of a frame whose payload has not fully arrived yet.
    pending: Option<EventHeader>,
}

impl LinkCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            pending: None,
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Default for LinkCodec {
    fn default() -> Self {
        Self::new(PACKET_LENGTH * 64)
    }
}

impl Decoder for LinkCodec {
    type Item = Event;
    type Error = XLinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => {
                if src.len() < EVENT_HEADER_SIZE {
                    return Ok(None);
                }
                let header = EventHeader::decode(&src[..EVENT_HEADER_SIZE])?;
                src.advance(EVENT_HEADER_SIZE);
                header
            }
        };

        let wire_len = header.wire_payload_len();
        if wire_len > self.max_packet_size {
            return Err(XLinkError::FrameTooLarge {
                size: wire_len,
                max: self.max_packet_size,
            });
        }
        if src.len() < wire_len {
            src.reserve(wire_len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let mut payload = src.split_to(wire_len);
        if header.event_type == EventType::WriteReq {
            payload.truncate(header.size as usize);
        }
        Ok(Some(Event {
            header,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Event> for LinkCodec {
    type Error = XLinkError;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = &item.header;
        if header.event_type != EventType::WriteReq {
            dst.extend_from_slice(&header.encode());
            return Ok(());
        }
        if item.payload.len() != header.size as usize {
            return Err(XLinkError::ProtocolViolation(
                "write payload length differs from header size",
            ));
        }
        let wire_len = align_up(item.payload.len());
        if wire_len > self.max_packet_size {
            return Err(XLinkError::FrameTooLarge {
                size: wire_len,
                max: self.max_packet_size,
            });
        }
        dst.reserve(EVENT_HEADER_SIZE + wire_len);
        dst.extend_from_slice(&header.encode());
        dst.extend_from_slice(&item.payload);
        dst.put_bytes(0, wire_len - item.payload.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn write_is_padded_on_the_wire_and_stripped_on_decode() {
        let mut codec = LinkCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Event::write(1, 5, Bytes::from_static(&[0xAA])), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), EVENT_HEADER_SIZE + 64);
        assert!(buf[EVENT_HEADER_SIZE + 1..].iter().all(|&b| b == 0));

        let ev = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ev.payload.as_ref(), &[0xAA]);
        assert_eq!(ev.header.stream_id, 5);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_payload_waits_for_more_bytes() {
        let mut codec = LinkCodec::default();
        let mut full = BytesMut::new();
        codec
            .encode(Event::write(2, 1, Bytes::from(vec![7u8; 100])), &mut full)
            .unwrap();

        let mut buf = full.split_to(EVENT_HEADER_SIZE + 10);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full);
        let ev = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ev.payload.len(), 100);
    }

    #[test]
    fn control_events_carry_no_payload() {
        let mut codec = LinkCodec::default();
        let mut buf = BytesMut::new();
        let ping = EventHeader::new(3, EventType::PingReq, 0, 0);
        codec.encode(Event::control(ping.clone()), &mut buf).unwrap();
        codec
            .encode(Event::control(EventHeader::new(4, EventType::PingResp, 0, 0)), &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().header, ping);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().header.event_type,
            EventType::PingResp
        );
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = LinkCodec::new(128);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Event::write(1, 1, Bytes::from(vec![0u8; 200])), &mut buf)
            .unwrap_err();
        assert!(matches!(err, XLinkError::FrameTooLarge { .. }));

        let header = EventHeader::new(1, EventType::WriteReq, 1, 4096);
        buf.extend_from_slice(&header.encode());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(XLinkError::FrameTooLarge { .. })
        ));
    }
}
