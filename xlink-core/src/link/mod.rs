//! A live link: stream multiplexing and request/response dispatch over one
//! physical connection.
//!
//! [`Link::start`] splits a [`DeviceHandle`] between two background tasks:
//!
//! - the **writer** owns the write half and serialises every outgoing event,
//! - the **dispatcher** owns the read half, decodes events, mutates the
//!   stream table and routes responses to the request that awaits them.
//!
//! Callers are async tasks. Blocking operations suspend the calling task on
//! the stream's `Notify` until data or credit arrives, the timeout elapses,
//! or the stream or link closes. Once the transport fails every waiter and
//! every pending request fails with `CommunicationFailure`; a link never
//! recovers and must be reconnected.

mod dispatcher;
pub mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{Result, XLinkError};
use crate::event::{Event, EventHeader, EventId, EventType};
use crate::flags::EventFlags;
use crate::platform::DeviceHandle;
use crate::types::{
    DeviceDesc, LinkId, MAX_STREAM_NAME_LENGTH, PacketId, StreamId, UsbSpeed, align_up,
};

pub use stream::{MovedPacket, Packet, StreamInfo};
use stream::{StreamTable, Taken};

/// Which side of the link this end plays. The host assigns stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Host,
    Device,
}

/// Transport statistics of one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkProfile {
    pub total_read_bytes: u64,
    pub total_write_bytes: u64,
    pub total_read_time: Duration,
    pub total_write_time: Duration,
}

#[derive(Debug, Default)]
struct ProfileCounters {
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    read_nanos: AtomicU64,
    write_nanos: AtomicU64,
}

impl ProfileCounters {
    fn record_read(&self, bytes: usize, took: Duration) {
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.read_nanos
            .fetch_add(took.as_nanos() as u64, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize, took: Duration) {
        self.write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.write_nanos
            .fetch_add(took.as_nanos() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LinkProfile {
        LinkProfile {
            total_read_bytes: self.read_bytes.load(Ordering::Relaxed),
            total_write_bytes: self.write_bytes.load(Ordering::Relaxed),
            total_read_time: Duration::from_nanos(self.read_nanos.load(Ordering::Relaxed)),
            total_write_time: Duration::from_nanos(self.write_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Messages for the writer task.
pub(crate) enum Outbound {
    Event(Event),
    /// Flush what is queued, close the transport and stop.
    Shutdown,
}

pub(crate) struct LinkInner {
    id: LinkId,
    role: LinkRole,
    desc: DeviceDesc,
    usb_speed: UsbSpeed,
    config: LinkConfig,
    streams: Mutex<StreamTable>,
    /// Requests awaiting a response. The writer fails an entry whose event
    /// cannot be encoded.
    pending: Mutex<HashMap<EventId, oneshot::Sender<Result<EventHeader>>>>,
    outbound: mpsc::Sender<Outbound>,
    next_event_id: AtomicI32,
    down: OnceLock<String>,
    shutdown: CancellationToken,
    /// Cancelled once the dispatcher has failed every waiter.
    finished: CancellationToken,
    profile: ProfileCounters,
}

impl LinkInner {
    fn next_event_id(&self) -> EventId {
        self.next_event_id.fetch_add(1, Ordering::Relaxed)
    }

    fn failure(&self) -> XLinkError {
        let reason = self.down.get().map(String::as_str).unwrap_or("link down");
        XLinkError::CommunicationFailure(reason.to_string())
    }

    fn ensure_up(&self) -> Result<()> {
        match self.down.get() {
            Some(_) => Err(self.failure()),
            None => Ok(()),
        }
    }

    /// Mark the link down. The first reason wins.
    fn mark_down(&self, reason: String) {
        if self.down.set(reason).is_ok() {
            info!(link = %self.id, reason = ?self.down.get(), "link down");
        }
        self.shutdown.cancel();
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.ensure_up()?;
        self.outbound
            .send(Outbound::Event(event))
            .await
            .map_err(|_| self.failure())
    }
}

/// Handle to a live link. Cheap to clone; all clones share the link.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("device", &self.inner.desc.name)
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Take ownership of `handle` and start the writer and dispatcher tasks.
    pub fn start(handle: DeviceHandle, id: LinkId, role: LinkRole, config: LinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let DeviceHandle {
            desc,
            usb_speed,
            reader,
            writer,
        } = handle;

        let inner = Arc::new(LinkInner {
            id,
            role,
            desc,
            usb_speed,
            streams: Mutex::new(StreamTable::new(id, config.pool_limit)),
            pending: Mutex::new(HashMap::new()),
            outbound: tx,
            next_event_id: AtomicI32::new(1),
            down: OnceLock::new(),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            profile: ProfileCounters::default(),
            config,
        });

        info!(link = %id, device = %inner.desc, ?role, "link up");
        tokio::spawn(dispatcher::write_loop(inner.clone(), writer, rx));
        tokio::spawn(dispatcher::run(inner.clone(), reader));
        Self { inner }
    }

    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    pub fn role(&self) -> LinkRole {
        self.inner.role
    }

    pub fn desc(&self) -> &DeviceDesc {
        &self.inner.desc
    }

    pub fn usb_speed(&self) -> UsbSpeed {
        self.inner.usb_speed
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn is_up(&self) -> bool {
        self.inner.down.get().is_none()
    }

    pub fn profile(&self) -> LinkProfile {
        self.inner.profile.snapshot()
    }

    /// Tear the link down locally. Pending operations fail.
    pub fn close(&self) {
        self.inner.mark_down("closed locally".into());
    }

    /// Wait until the link is down and every waiter has been failed.
    pub async fn closed(&self) {
        self.inner.finished.cancelled().await;
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Send a request and wait for its response header.
    async fn request(&self, event: Event, timeout: Option<Duration>) -> Result<EventHeader> {
        let id = event.header.id;
        let (tx, rx) = oneshot::channel();
        self.inner.ensure_up()?;
        self.inner.pending.lock().await.insert(id, tx);

        if let Err(e) = self.inner.send(event).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        let resp = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(r) => r,
                Err(_) => {
                    self.inner.pending.lock().await.remove(&id);
                    return Err(XLinkError::Timeout(t));
                }
            },
            None => rx.await,
        };
        resp.map_err(|_| self.inner.failure())?
    }

    fn header(&self, event_type: EventType, stream_id: u32, size: u32) -> EventHeader {
        EventHeader::new(self.inner.next_event_id(), event_type, stream_id, size)
    }

    /// Round-trip a ping through the peer's dispatcher.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let header = self.header(EventType::PingReq, 0, 0);
        self.request(Event::control(header), Some(self.inner.config.ping_timeout()))
            .await?;
        Ok(started.elapsed())
    }

    /// Ask the peer to reset, then tear the link down.
    pub async fn reset_remote(&self) -> Result<()> {
        self.reset_remote_timeout(self.inner.config.reset_timeout())
            .await
    }

    pub async fn reset_remote_timeout(&self, timeout: Duration) -> Result<()> {
        let header = self.header(EventType::ResetReq, 0, 0);
        let result = self.request(Event::control(header), Some(timeout)).await;
        self.inner.mark_down("remote reset".into());
        match result {
            Ok(_) => Ok(()),
            // The peer may drop the transport before its response is read.
            Err(XLinkError::CommunicationFailure(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Streams ──────────────────────────────────────────────────

    /// Open (or update) the stream `name`, declaring that this side writes
    /// at most `write_size` bytes per packet. The size is rounded up to the
    /// alignment unit.
    pub async fn open_stream(&self, name: &str, write_size: usize) -> Result<StreamId> {
        if name.is_empty() || name.len() >= MAX_STREAM_NAME_LENGTH {
            return Err(XLinkError::InvalidStreamName {
                name: name.to_string(),
                max: MAX_STREAM_NAME_LENGTH - 1,
            });
        }
        self.inner.ensure_up()?;
        let max = self.inner.config.max_packet_size;
        if write_size > max || u32::try_from(write_size).is_err() {
            return Err(XLinkError::SizeTooBig {
                size: write_size,
                capacity: max,
            });
        }
        let write_size = align_up(write_size);

        // Host: pick the id now; device: ask the host for one.
        let (wire_id, created) = {
            let mut table = self.inner.streams.lock().await;
            match (table.by_name(name), self.inner.role) {
                (Some(id), _) => (id.local(), false),
                (None, LinkRole::Host) => {
                    let id = table.allocate_id()?;
                    table.insert(id.local(), name)?;
                    (id.local(), true)
                }
                (None, LinkRole::Device) => {
                    if table.is_full() {
                        return Err(XLinkError::OutOfMemory("stream table"));
                    }
                    (StreamId::INVALID.0, false)
                }
            }
        };

        let header = self
            .header(EventType::CreateStreamReq, wire_id, write_size as u32)
            .with_name(name);
        let result = self
            .request(
                Event::control(header),
                Some(self.inner.config.request_timeout()),
            )
            .await;

        let mut table = self.inner.streams.lock().await;
        let resp = match result {
            Ok(resp) if resp.flags.is_ack() => resp,
            other => {
                if created {
                    table.remove(StreamId::combine(wire_id, self.inner.id));
                }
                return Err(match other {
                    Err(e) => e,
                    Ok(resp) if resp.stream_id == StreamId::INVALID_OUT_OF_MEMORY.0 => {
                        XLinkError::OutOfMemory("remote stream table")
                    }
                    Ok(_) => XLinkError::Error(format!("peer refused stream {name:?}")),
                });
            }
        };

        let stream = table.insert(resp.stream_id, name)?;
        stream.write_size = write_size;
        stream.local_open = true;
        stream.closing = false;
        let id = stream.id;
        debug!(link = %self.inner.id, stream = %id, name, write_size, "stream open");
        Ok(id)
    }

    /// Id of an open stream by name.
    pub async fn stream_id(&self, name: &str) -> Option<StreamId> {
        self.inner.streams.lock().await.by_name(name)
    }

    pub async fn stream_info(&self, id: StreamId) -> Option<StreamInfo> {
        self.inner.streams.lock().await.info(id)
    }

    /// Close a stream for new writes. Its buffers are deallocated once every
    /// queued and delivered packet is released; reads keep draining it.
    pub async fn close_stream(&self, id: StreamId) -> Result<()> {
        let name = {
            let mut table = self.inner.streams.lock().await;
            let stream = table.get_mut(id)?;
            if stream.closing {
                return Ok(());
            }
            stream.closing = true;
            stream.local_open = false;
            stream.notify.notify_waiters();
            let name = stream.name.clone();
            table.reap(id);
            name
        };

        let header = self
            .header(EventType::CloseStreamReq, id.local(), 0)
            .with_name(&name);
        let resp = self
            .request(
                Event::control(header),
                Some(self.inner.config.request_timeout()),
            )
            .await?;
        if !resp.flags.is_ack() {
            debug!(stream = %id, "peer had no matching stream to close");
        }
        Ok(())
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Write one packet, waiting as long as needed for buffer credit.
    pub async fn write_data(&self, id: StreamId, data: &[u8]) -> Result<()> {
        self.write_inner(id, data, None).await
    }

    /// Write one packet. The timeout bounds only the wait for credit; a
    /// timed-out write sends nothing.
    pub async fn write_data_timeout(&self, id: StreamId, data: &[u8], timeout: Duration) -> Result<()> {
        self.write_inner(id, data, Some(timeout)).await
    }

    async fn write_inner(&self, id: StreamId, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        let max = self.inner.config.max_packet_size;
        let size = u32::try_from(data.len()).map_err(|_| XLinkError::FrameTooLarge {
            size: data.len(),
            max,
        })?;
        let aligned = align_up(data.len());
        if aligned > max {
            return Err(XLinkError::FrameTooLarge { size: aligned, max });
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.inner.ensure_up()?;
            let mut table = self.inner.streams.lock().await;
            let stream = table.get_mut(id)?;
            if stream.try_reserve(aligned)? {
                break;
            }
            let notify = stream.notify.clone();
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(table);

            let woke = match deadline {
                Some(d) => tokio::time::timeout_at(d, notified).await.is_ok(),
                None => {
                    notified.await;
                    true
                }
            };
            if !woke {
                return Err(XLinkError::Timeout(timeout.unwrap_or_default()));
            }
        }

        let header = self.header(EventType::WriteReq, id.local(), size);
        let event = Event {
            header,
            payload: Bytes::copy_from_slice(data),
        };
        let result = self.request(event, None).await;
        if matches!(&result, Ok(resp) if resp.flags.is_ack()) {
            return Ok(());
        }

        let capacity = match self.inner.streams.lock().await.get_mut(id) {
            Ok(stream) => {
                stream.return_credit(aligned);
                stream.write_size
            }
            Err(_) => 0,
        };
        let resp = result?;
        warn!(stream = %id, flags = ?resp.flags, "write refused by peer");
        Err(if resp.flags.contains(EventFlags::SIZE_TOO_BIG) {
            XLinkError::SizeTooBig {
                size: aligned,
                capacity,
            }
        } else if resp.flags.contains(EventFlags::BUFFER_FULL) {
            XLinkError::OutOfMemory("remote stream buffer")
        } else {
            XLinkError::CommunicationNotOpen
        })
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Wait for the next packet. It stays resident until released.
    pub async fn read_data(&self, id: StreamId) -> Result<Packet> {
        match self.read_inner(id, false, None).await? {
            Taken::Packet(p) => Ok(p),
            Taken::Moved { .. } => Err(XLinkError::ProtocolViolation("unexpected moved packet")),
        }
    }

    /// As [`Link::read_data`], failing with `Timeout` when nothing arrives.
    pub async fn read_data_timeout(&self, id: StreamId, timeout: Duration) -> Result<Packet> {
        match self.read_inner(id, false, Some(timeout)).await? {
            Taken::Packet(p) => Ok(p),
            Taken::Moved { .. } => Err(XLinkError::ProtocolViolation("unexpected moved packet")),
        }
    }

    /// Take the next packet with move semantics: the slot is freed at once
    /// and the buffer belongs to the caller.
    pub async fn read_move_data(&self, id: StreamId) -> Result<MovedPacket> {
        self.read_moved(id, None).await
    }

    pub async fn read_move_data_timeout(&self, id: StreamId, timeout: Duration) -> Result<MovedPacket> {
        self.read_moved(id, Some(timeout)).await
    }

    async fn read_moved(&self, id: StreamId, timeout: Option<Duration>) -> Result<MovedPacket> {
        match self.read_inner(id, true, timeout).await? {
            Taken::Moved { packet, size } => {
                let header = self
                    .header(EventType::ReadRelReq, id.local(), size as u32)
                    .with_flags(EventFlags::MOVE_SEMANTIC);
                self.inner.send(Event::control(header)).await?;
                Ok(packet)
            }
            Taken::Packet(_) => Err(XLinkError::ProtocolViolation("expected moved packet")),
        }
    }

    /// A read whose deadline fires re-checks the queue once under the stream
    /// lock, so a packet arriving at the same instant is returned instead of
    /// a timeout.
    async fn read_inner(&self, id: StreamId, moved: bool, timeout: Option<Duration>) -> Result<Taken> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.inner.ensure_up()?;
            let mut table = self.inner.streams.lock().await;
            if let Some(taken) = table.take(id, moved)? {
                return Ok(taken);
            }
            let notify = table.get(id)?.notify.clone();
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(table);

            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d, notified).await.is_err() {
                        let mut table = self.inner.streams.lock().await;
                        return match table.take(id, moved)? {
                            Some(taken) => Ok(taken),
                            None => Err(XLinkError::Timeout(timeout.unwrap_or_default())),
                        };
                    }
                }
                None => notified.await,
            }
        }
    }

    // ── Releases ─────────────────────────────────────────────────

    /// Release the oldest delivered packet of `id`.
    pub async fn release_data(&self, id: StreamId) -> Result<()> {
        let size = self.inner.streams.lock().await.release(id, None)?;
        let header = self.header(EventType::ReadRelReq, id.local(), size as u32);
        self.notify_release(header).await
    }

    /// Release a specific delivered packet of `id`.
    pub async fn release_specific_data(&self, id: StreamId, packet: PacketId) -> Result<()> {
        let size = self.inner.streams.lock().await.release(id, Some(packet))?;
        let header = self.header(EventType::ReadRelSpecReq, id.local(), size as u32);
        self.notify_release(header).await
    }

    async fn notify_release(&self, header: EventHeader) -> Result<()> {
        // The slot is free locally even when the peer cannot be told.
        match self.inner.send(Event::control(header)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(error = %e, "release not forwarded");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChipPlatform, DeviceState, Protocol};
    use tokio_test::{assert_err, assert_ok};

    fn pair() -> (Link, Link) {
        pair_with(LinkConfig::default())
    }

    fn pair_with(config: LinkConfig) -> (Link, Link) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let desc = DeviceDesc::new(Protocol::Ipc, ChipPlatform::MyriadX, "pair", DeviceState::Booted, "mx");
        let host = Link::start(
            DeviceHandle::from_stream(desc.clone(), a),
            LinkId(0),
            LinkRole::Host,
            config.clone(),
        );
        let device = Link::start(
            DeviceHandle::from_stream(desc, b),
            LinkId(0),
            LinkRole::Device,
            config,
        );
        (host, device)
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let (host, device) = pair();
        assert_ok!(host.ping().await);
        assert_ok!(device.ping().await);
    }

    #[tokio::test]
    async fn device_adopts_host_stream_id() {
        let (host, device) = pair();
        let h = host.open_stream("rgb", 1000).await.unwrap();
        let d = device.open_stream("rgb", 64).await.unwrap();
        assert_eq!(h, d);

        let d2 = device.open_stream("depth", 64).await.unwrap();
        assert_eq!(host.stream_id("depth").await, Some(d2));
        assert_eq!(host.stream_info(h).await.unwrap().write_size, 1024);
    }

    #[tokio::test]
    async fn reopen_updates_write_size() {
        let (host, _device) = pair();
        let a = host.open_stream("cfg", 64).await.unwrap();
        let b = host.open_stream("cfg", 4096).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(host.stream_info(a).await.unwrap().write_size, 4096);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let (host, _device) = pair();
        assert!(matches!(
            host.open_stream("", 64).await,
            Err(XLinkError::InvalidStreamName { .. })
        ));
        assert_err!(host.open_stream(&"x".repeat(64), 64).await);
    }

    #[tokio::test]
    async fn write_larger_than_stream_is_refused() {
        let (host, device) = pair();
        let id = host.open_stream("small", 64).await.unwrap();
        device.open_stream("small", 0).await.unwrap();
        assert!(matches!(
            host.write_data(id, &[0u8; 65]).await,
            Err(XLinkError::SizeTooBig { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_stream_is_refused() {
        let (host, _device) = pair();
        assert!(matches!(
            host.open_stream("big", 8 << 20).await,
            Err(XLinkError::SizeTooBig { .. })
        ));
        assert!(matches!(
            host.open_stream("huge", usize::MAX).await,
            Err(XLinkError::SizeTooBig { .. })
        ));
        assert!(host.is_up());
    }

    #[tokio::test]
    async fn write_above_frame_limit_fails_fast() {
        let config = LinkConfig {
            max_packet_size: 4096,
            ..LinkConfig::default()
        };
        let (host, device) = pair_with(config);
        let id = host.open_stream("big", 4096).await.unwrap();
        device.open_stream("big", 0).await.unwrap();

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            host.write_data_timeout(id, &[0u8; 5000], Duration::from_secs(1)),
        )
        .await
        .expect("timeout");
        assert!(matches!(res, Err(XLinkError::FrameTooLarge { .. })));

        // Nothing was reserved: a full-size write still goes through.
        assert_ok!(host.write_data(id, &[7u8; 4096]).await);
        assert!(host.is_up());
    }

    #[tokio::test]
    async fn unencodable_request_fails_its_caller() {
        let config = LinkConfig {
            max_packet_size: 128,
            ..LinkConfig::default()
        };
        let (host, _device) = pair_with(config);
        let header = host.header(EventType::WriteReq, 1, 4096);
        let event = Event {
            header,
            payload: Bytes::from(vec![0u8; 4096]),
        };

        let res = tokio::time::timeout(Duration::from_secs(5), host.request(event, None))
            .await
            .expect("timeout");
        assert!(matches!(res, Err(XLinkError::FrameTooLarge { .. })));
        assert!(host.inner.pending.lock().await.is_empty());
        assert_ok!(host.ping().await);
    }

    #[tokio::test]
    async fn move_read_returns_credit() {
        let (host, device) = pair();
        let id = host.open_stream("mv", 64).await.unwrap();
        device.open_stream("mv", 0).await.unwrap();

        host.write_data(id, b"one").await.unwrap();
        // Credit for a single 64-byte packet is exhausted until the reader moves it out.
        assert!(matches!(
            host.write_data_timeout(id, b"two", Duration::from_millis(50)).await,
            Err(XLinkError::Timeout(_))
        ));
        let p = device.read_move_data(id).await.unwrap();
        assert_eq!(&p[..], b"one");
        assert_ok!(
            host.write_data_timeout(id, b"two", Duration::from_secs(2))
                .await
        );
    }

    #[tokio::test]
    async fn peer_drop_fails_waiters() {
        let (host, device) = pair();
        let id = host.open_stream("gone", 64).await.unwrap();
        device.open_stream("gone", 64).await.unwrap();

        let reader = {
            let host = host.clone();
            tokio::spawn(async move { host.read_data(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        device.close();

        let res = reader.await.unwrap();
        assert!(matches!(res, Err(XLinkError::CommunicationFailure(_))));
        host.closed().await;
        assert!(!host.is_up());
    }

    #[tokio::test]
    async fn reset_tears_down_both_ends() {
        let (host, device) = pair();
        assert_ok!(host.reset_remote().await);
        assert!(!host.is_up());
        device.closed().await;
        assert!(!device.is_up());
    }

    #[tokio::test]
    async fn profile_counts_bytes() {
        let (host, _device) = pair();
        host.ping().await.unwrap();
        let p = host.profile();
        assert!(p.total_write_bytes >= 88);
        assert!(p.total_read_bytes >= 88);
    }
}
