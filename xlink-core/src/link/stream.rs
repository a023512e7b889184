//! Per-link stream table.
//!
//! Pure bookkeeping with no I/O: the link and its dispatcher lock the table,
//! apply one of these operations and act on the outcome. Every state change
//! that could unblock a reader or writer wakes the stream's [`Notify`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::error::{Result, XLinkError};
use crate::flags::EventFlags;
use crate::types::{LinkId, MAX_PACKETS_PER_STREAM, MAX_STREAMS, PacketId, StreamId, align_up};

const LOCAL_ID_MASK: u32 = 0x00FF_FFFF;

// ── Packets ──────────────────────────────────────────────────────

/// A packet delivered by `read_data`. It stays resident in the stream pool
/// until released with `release_data` or `release_specific_data`; a packet
/// that is never released keeps its share of the buffer budget forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: PacketId,
    pub stream: StreamId,
    pub data: Bytes,
}

/// A packet taken with move semantics. Its pool slot is already free; the
/// buffer belongs to the caller and is deallocated when dropped.
#[derive(Debug, PartialEq, Eq)]
pub struct MovedPacket {
    pub stream: StreamId,
    data: BytesMut,
}

impl MovedPacket {
    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    /// Free the buffer.
    pub fn deallocate(self) {}
}

impl std::ops::Deref for MovedPacket {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// Read-only view of a stream, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub name: String,
    pub write_size: usize,
    pub read_size: usize,
    pub queued: usize,
    pub delivered: usize,
    pub closing: bool,
}

// ── Stream ───────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct Stream {
    pub id: StreamId,
    pub name: String,
    /// Capacity of the peer's receive buffer, as declared by our open.
    pub write_size: usize,
    /// Capacity of our receive buffer, as declared by the peer's open.
    pub read_size: usize,
    pub local_open: bool,
    pub remote_closed: bool,
    pub closing: bool,
    queue: VecDeque<Bytes>,
    delivered: VecDeque<(PacketId, usize)>,
    resident: usize,
    remote_fill_bytes: usize,
    remote_fill_packets: usize,
    next_packet: u32,
    pub notify: Arc<Notify>,
}

impl Stream {
    fn new(id: StreamId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            write_size: 0,
            read_size: 0,
            local_open: false,
            remote_closed: false,
            closing: false,
            queue: VecDeque::new(),
            delivered: VecDeque::new(),
            resident: 0,
            remote_fill_bytes: 0,
            remote_fill_packets: 0,
            next_packet: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.delivered.is_empty()
    }

    /// Try to reserve write credit for `aligned` bytes.
    ///
    /// `Ok(false)` means the caller must wait for the peer to release data.
    pub fn try_reserve(&mut self, aligned: usize) -> Result<bool> {
        if self.closing || self.remote_closed || !self.local_open {
            return Err(XLinkError::CommunicationNotOpen);
        }
        if aligned > self.write_size {
            return Err(XLinkError::SizeTooBig {
                size: aligned,
                capacity: self.write_size,
            });
        }
        if self.remote_fill_packets >= MAX_PACKETS_PER_STREAM
            || self.remote_fill_bytes + aligned > self.write_size
        {
            return Ok(false);
        }
        self.remote_fill_packets += 1;
        self.remote_fill_bytes += aligned;
        Ok(true)
    }

    /// Give back credit for `aligned` bytes released (or refused) by the peer.
    pub fn return_credit(&mut self, aligned: usize) {
        self.remote_fill_packets = self.remote_fill_packets.saturating_sub(1);
        self.remote_fill_bytes = self.remote_fill_bytes.saturating_sub(aligned);
        self.notify.notify_waiters();
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id,
            name: self.name.clone(),
            write_size: self.write_size,
            read_size: self.read_size,
            queued: self.queue.len(),
            delivered: self.delivered.len(),
            closing: self.closing,
        }
    }
}

// ── StreamTable ──────────────────────────────────────────────────

/// What a successful take returns to the link.
#[derive(Debug)]
pub(crate) enum Taken {
    Packet(Packet),
    /// Moved out; the link must notify the peer that `size` bytes were freed.
    Moved { packet: MovedPacket, size: usize },
}

#[derive(Debug)]
pub(crate) struct StreamTable {
    link: LinkId,
    streams: HashMap<u32, Stream>,
    next_id: u32,
    pool_used: usize,
    pool_limit: usize,
}

impl StreamTable {
    pub fn new(link: LinkId, pool_limit: usize) -> Self {
        Self {
            link,
            streams: HashMap::new(),
            next_id: 0,
            pool_used: 0,
            pool_limit,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_full(&self) -> bool {
        self.streams.len() >= MAX_STREAMS
    }

    pub fn pool_used(&self) -> usize {
        self.pool_used
    }

    pub fn by_name(&self, name: &str) -> Option<StreamId> {
        self.streams.values().find(|s| s.name == name).map(|s| s.id)
    }

    pub fn get(&self, id: StreamId) -> Result<&Stream> {
        self.streams
            .get(&id.local())
            .ok_or(XLinkError::CommunicationNotOpen)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Result<&mut Stream> {
        self.streams
            .get_mut(&id.local())
            .ok_or(XLinkError::CommunicationNotOpen)
    }

    /// Look up by the link-local id carried on the wire.
    pub fn get_local_mut(&mut self, local: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&(local & LOCAL_ID_MASK))
    }

    /// Allocate a never-before-used id (host role).
    pub fn allocate_id(&mut self) -> Result<StreamId> {
        if self.is_full() {
            return Err(XLinkError::OutOfMemory("stream table"));
        }
        let local = self.next_id & LOCAL_ID_MASK;
        self.next_id = self.next_id.wrapping_add(1);
        Ok(StreamId::combine(local, self.link))
    }

    /// Insert a stream under `local`, or return the existing one.
    pub fn insert(&mut self, local: u32, name: &str) -> Result<&mut Stream> {
        let local = local & LOCAL_ID_MASK;
        if !self.streams.contains_key(&local) && self.is_full() {
            return Err(XLinkError::OutOfMemory("stream table"));
        }
        let id = StreamId::combine(local, self.link);
        Ok(self
            .streams
            .entry(local)
            .or_insert_with(|| Stream::new(id, name)))
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        let stream = self.streams.remove(&id.local())?;
        self.pool_used = self.pool_used.saturating_sub(stream.resident);
        stream.notify.notify_waiters();
        Some(stream)
    }

    /// Deallocate `id` if it is closing (or abandoned by both sides) and
    /// nothing is resident any more.
    pub fn reap(&mut self, id: StreamId) -> bool {
        let done = match self.streams.get(&id.local()) {
            Some(s) => s.is_drained() && (s.closing || (s.remote_closed && !s.local_open)),
            None => false,
        };
        if done {
            self.remove(id);
        }
        done
    }

    /// Queue an incoming write. On refusal returns the NACK reason bits.
    pub fn accept_write(&mut self, local: u32, payload: Bytes) -> Result<(), EventFlags> {
        let pool_room = self.pool_limit.saturating_sub(self.pool_used);
        let stream = self
            .streams
            .get_mut(&(local & LOCAL_ID_MASK))
            .filter(|s| !s.closing)
            .ok_or(EventFlags::NO_SUCH_STREAM)?;

        let aligned = align_up(payload.len());
        if aligned > stream.read_size {
            return Err(EventFlags::SIZE_TOO_BIG);
        }
        if stream.queue.len() + stream.delivered.len() >= MAX_PACKETS_PER_STREAM
            || stream.resident + aligned > stream.read_size
            || aligned > pool_room
        {
            return Err(EventFlags::BUFFER_FULL);
        }

        stream.queue.push_back(payload);
        stream.resident += aligned;
        stream.notify.notify_waiters();
        self.pool_used += aligned;
        Ok(())
    }

    /// Take the oldest queued packet.
    ///
    /// `Ok(None)` means the caller must wait. A closing or remotely closed
    /// stream keeps serving queued packets until it runs dry.
    pub fn take(&mut self, id: StreamId, moved: bool) -> Result<Option<Taken>> {
        let stream = self.get_mut(id)?;
        let Some(data) = stream.queue.pop_front() else {
            if stream.closing || stream.remote_closed {
                return Err(XLinkError::CommunicationNotOpen);
            }
            return Ok(None);
        };
        let aligned = align_up(data.len());

        if moved {
            stream.resident -= aligned;
            self.pool_used = self.pool_used.saturating_sub(aligned);
            let packet = MovedPacket {
                stream: id,
                data: BytesMut::from(&data[..]),
            };
            self.reap(id);
            return Ok(Some(Taken::Moved {
                packet,
                size: aligned,
            }));
        }

        let packet_id = PacketId(stream.next_packet);
        stream.next_packet = stream.next_packet.wrapping_add(1);
        stream.delivered.push_back((packet_id, aligned));
        Ok(Some(Taken::Packet(Packet {
            id: packet_id,
            stream: id,
            data,
        })))
    }

    /// Release a delivered packet: the oldest, or the one named by `packet`.
    /// Returns the number of bytes freed.
    pub fn release(&mut self, id: StreamId, packet: Option<PacketId>) -> Result<usize> {
        let stream = self.get_mut(id)?;
        let idx = match packet {
            None if stream.delivered.is_empty() => None,
            None => Some(0),
            Some(pid) => stream.delivered.iter().position(|(p, _)| *p == pid),
        }
        .ok_or_else(|| XLinkError::Error(format!("no delivered packet to release on {id}")))?;

        let (_, aligned) = stream
            .delivered
            .remove(idx)
            .ok_or(XLinkError::ProtocolViolation("delivered packet index out of range"))?;
        stream.resident -= aligned;
        stream.notify.notify_waiters();
        self.pool_used = self.pool_used.saturating_sub(aligned);
        self.reap(id);
        Ok(aligned)
    }

    pub fn info(&self, id: StreamId) -> Option<StreamInfo> {
        self.get(id).ok().map(Stream::info)
    }

    /// Wake every waiter, e.g. when the link goes down.
    pub fn wake_all(&self) {
        for s in self.streams.values() {
            s.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_stream(read_size: usize) -> (StreamTable, StreamId) {
        let mut t = StreamTable::new(LinkId(1), 1 << 20);
        let id = t.allocate_id().unwrap();
        let s = t.insert(id.local(), "detections").unwrap();
        s.read_size = read_size;
        s.write_size = read_size;
        s.local_open = true;
        (t, id)
    }

    #[test]
    fn ids_carry_link_and_are_never_reused() {
        let mut t = StreamTable::new(LinkId(3), 1024);
        let a = t.allocate_id().unwrap();
        t.insert(a.local(), "a").unwrap();
        t.remove(a);
        let b = t.allocate_id().unwrap();
        assert_eq!(a.link_id(), LinkId(3));
        assert_ne!(a, b);
    }

    #[test]
    fn table_full_leaves_existing_streams() {
        let mut t = StreamTable::new(LinkId(0), 1024);
        for i in 0..MAX_STREAMS {
            let id = t.allocate_id().unwrap();
            t.insert(id.local(), &format!("s{i}")).unwrap();
        }
        assert!(matches!(t.allocate_id(), Err(XLinkError::OutOfMemory(_))));
        assert!(matches!(
            t.insert(999, "extra"),
            Err(XLinkError::OutOfMemory(_))
        ));
        assert_eq!(t.len(), MAX_STREAMS);
        assert!(t.by_name("s0").is_some());
    }

    #[test]
    fn fifo_delivery_and_release() {
        let (mut t, id) = table_with_stream(4096);
        for b in 0u8..3 {
            t.accept_write(id.local(), Bytes::from(vec![b])).unwrap();
        }
        for b in 0u8..3 {
            match t.take(id, false).unwrap() {
                Some(Taken::Packet(p)) => assert_eq!(p.data.as_ref(), &[b]),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(t.take(id, false).unwrap().is_none());
        assert_eq!(t.pool_used(), 3 * 64);
        assert_eq!(t.release(id, Some(PacketId(1))).unwrap(), 64);
        assert_eq!(t.release(id, None).unwrap(), 64);
        assert_eq!(t.release(id, None).unwrap(), 64);
        assert!(t.release(id, None).is_err());
        assert_eq!(t.pool_used(), 0);
    }

    #[test]
    fn overrun_is_refused_with_reason() {
        let (mut t, id) = table_with_stream(128);
        assert_eq!(
            t.accept_write(id.local(), Bytes::from(vec![0; 200])),
            Err(EventFlags::SIZE_TOO_BIG)
        );
        t.accept_write(id.local(), Bytes::from(vec![0; 100])).unwrap();
        assert_eq!(
            t.accept_write(id.local(), Bytes::from(vec![0; 10])),
            Err(EventFlags::BUFFER_FULL)
        );
        assert_eq!(
            t.accept_write(77, Bytes::from_static(b"x")),
            Err(EventFlags::NO_SUCH_STREAM)
        );
    }

    #[test]
    fn pool_limit_spans_streams() {
        let mut t = StreamTable::new(LinkId(0), 128);
        for name in ["a", "b", "c"] {
            let id = t.allocate_id().unwrap();
            t.insert(id.local(), name).unwrap().read_size = 1024;
        }
        t.accept_write(0, Bytes::from(vec![0; 64])).unwrap();
        t.accept_write(1, Bytes::from(vec![0; 64])).unwrap();
        assert_eq!(
            t.accept_write(2, Bytes::from(vec![0; 1])),
            Err(EventFlags::BUFFER_FULL)
        );
    }

    #[test]
    fn closing_stream_is_deallocated_only_when_drained() {
        let (mut t, id) = table_with_stream(4096);
        t.accept_write(id.local(), Bytes::from_static(&[1])).unwrap();
        t.get_mut(id).unwrap().closing = true;
        assert!(!t.reap(id));

        let taken = t.take(id, false).unwrap();
        assert!(matches!(taken, Some(Taken::Packet(_))));
        assert!(t.info(id).is_some());
        assert!(matches!(
            t.take(id, false),
            Err(XLinkError::CommunicationNotOpen)
        ));

        t.release(id, None).unwrap();
        assert!(t.info(id).is_none());
    }

    #[test]
    fn moved_packets_free_their_slot() {
        let (mut t, id) = table_with_stream(4096);
        t.accept_write(id.local(), Bytes::from_static(&[9, 9])).unwrap();
        match t.take(id, true).unwrap() {
            Some(Taken::Moved { packet, size }) => {
                assert_eq!(&packet[..], &[9, 9]);
                assert_eq!(size, 64);
                packet.deallocate();
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.pool_used(), 0);
        assert!(t.release(id, None).is_err());
    }

    #[test]
    fn credit_bounds_writer() {
        let (mut t, id) = table_with_stream(128);
        let s = t.get_mut(id).unwrap();
        assert!(s.try_reserve(64).unwrap());
        assert!(s.try_reserve(64).unwrap());
        assert!(!s.try_reserve(64).unwrap());
        s.return_credit(64);
        assert!(s.try_reserve(64).unwrap());
        assert!(matches!(
            s.try_reserve(192),
            Err(XLinkError::SizeTooBig { .. })
        ));
    }
}
