//! Background tasks of a link: the writer loop and the inbound dispatcher.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};

use super::{LinkInner, LinkRole, Outbound};
use crate::codec::LinkCodec;
use crate::error::{Result, XLinkError};
use crate::event::{Event, EventHeader, EventType};
use crate::flags::EventFlags;
use crate::platform::{LinkReader, LinkWriter};
use crate::types::{PACKET_LENGTH, StreamId, align_up};

// ── Writer ───────────────────────────────────────────────────────

/// Serialise outgoing events onto the transport until shutdown.
pub(crate) async fn write_loop(
    inner: Arc<LinkInner>,
    mut writer: Box<dyn LinkWriter>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let mut codec = LinkCodec::new(inner.config.max_packet_size);
    let mut buf = BytesMut::with_capacity(PACKET_LENGTH);

    loop {
        // Queued events go out before a cancellation is honoured.
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = inner.shutdown.cancelled() => None,
        };
        let Some(Outbound::Event(event)) = msg else {
            break;
        };

        trace!(link = %inner.id, kind = %event.header.event_type, id = event.header.id, "send");
        buf.clear();
        let id = event.header.id;
        let is_request = event.header.event_type.is_request();
        if let Err(e) = codec.encode(event, &mut buf) {
            warn!(link = %inner.id, error = %e, "dropping unencodable event");
            if is_request {
                if let Some(tx) = inner.pending.lock().await.remove(&id) {
                    let _ = tx.send(Err(e));
                }
            }
            continue;
        }

        let started = Instant::now();
        if let Err(e) = writer.write_all(&buf).await {
            inner.mark_down(format!("transport write failed: {e}"));
            break;
        }
        inner.profile.record_write(buf.len(), started.elapsed());
    }

    if let Err(e) = writer.close().await {
        debug!(link = %inner.id, error = %e, "transport close failed");
    }
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Drain the transport until it fails, then fail every waiter.
pub(crate) async fn run(inner: Arc<LinkInner>, mut reader: Box<dyn LinkReader>) {
    let reason = match pump(&inner, reader.as_mut()).await {
        Ok(()) => "link closed".to_string(),
        Err(e) => e.to_string(),
    };
    inner.mark_down(reason);

    // Dropping the senders fails every awaited request.
    inner.pending.lock().await.clear();
    inner.streams.lock().await.wake_all();
    inner.finished.cancel();
}

async fn pump(inner: &Arc<LinkInner>, reader: &mut dyn LinkReader) -> Result<()> {
    let mut codec = LinkCodec::new(inner.config.max_packet_size);
    let mut buf = BytesMut::with_capacity(PACKET_LENGTH);
    let mut scratch = vec![0u8; PACKET_LENGTH];

    loop {
        while let Some(event) = codec.decode(&mut buf)? {
            dispatch(inner, event).await?;
        }

        let started = Instant::now();
        let n = tokio::select! {
            _ = inner.shutdown.cancelled() => return Ok(()),
            r = reader.read(&mut scratch) => r?,
        };
        if n == 0 {
            return Err(XLinkError::CommunicationFailure(
                "peer closed the link".into(),
            ));
        }
        inner.profile.record_read(n, started.elapsed());
        buf.extend_from_slice(&scratch[..n]);
    }
}

/// Handle one inbound event. An error stops the link.
async fn dispatch(inner: &Arc<LinkInner>, event: Event) -> Result<()> {
    trace!(
        link = %inner.id,
        kind = %event.header.event_type,
        id = event.header.id,
        stream = event.header.stream_id,
        "recv"
    );

    if !event.header.event_type.is_request() {
        route_response(inner, event.header).await;
        return Ok(());
    }
    let header = &event.header;

    match header.event_type {
        EventType::WriteReq => {
            let verdict = inner
                .streams
                .lock()
                .await
                .accept_write(header.stream_id, event.payload.clone());
            let flags = match verdict {
                Ok(()) => EventFlags::acked(),
                Err(reason) => {
                    warn!(
                        link = %inner.id,
                        stream = header.stream_id,
                        size = header.size,
                        ?reason,
                        "refusing write"
                    );
                    EventFlags::nacked(reason)
                }
            };
            respond(inner, header, flags).await?;
        }
        EventType::CreateStreamReq => {
            let (flags, stream_id) = create_stream(inner, header).await;
            let mut resp = header.respond(flags)?;
            resp.stream_id = stream_id;
            inner.send(Event::control(resp)).await?;
        }
        EventType::CloseStreamReq => {
            let found = {
                let mut table = inner.streams.lock().await;
                match table.get_local_mut(header.stream_id) {
                    Some(stream) => {
                        stream.remote_closed = true;
                        stream.notify.notify_waiters();
                        let id = stream.id;
                        table.reap(id);
                        true
                    }
                    None => false,
                }
            };
            let flags = if found {
                EventFlags::acked()
            } else {
                EventFlags::nacked(EventFlags::NO_SUCH_STREAM)
            };
            respond(inner, header, flags).await?;
        }
        EventType::ReadRelReq | EventType::ReadRelSpecReq => {
            let found = match inner
                .streams
                .lock()
                .await
                .get_local_mut(header.stream_id)
            {
                Some(stream) => {
                    stream.return_credit(align_up(header.size as usize));
                    true
                }
                None => false,
            };
            let flags = if found {
                EventFlags::acked()
            } else {
                EventFlags::nacked(EventFlags::NO_SUCH_STREAM)
            };
            respond(inner, header, flags).await?;
        }
        EventType::PingReq => respond(inner, header, EventFlags::acked()).await?,
        EventType::ResetReq => {
            debug!(link = %inner.id, "reset requested by peer");
            respond(inner, header, EventFlags::acked()).await?;
            let _ = inner.outbound.send(Outbound::Shutdown).await;
            return Err(XLinkError::CommunicationFailure("reset by peer".into()));
        }
        EventType::ReadReq => {
            // Reads are served locally on each side.
            warn!(link = %inner.id, "ignoring remote read request");
        }
        _ => {}
    }
    Ok(())
}

async fn respond(inner: &LinkInner, header: &EventHeader, flags: EventFlags) -> Result<()> {
    inner.send(Event::control(header.respond(flags)?)).await
}

async fn route_response(inner: &LinkInner, header: EventHeader) {
    match inner.pending.lock().await.remove(&header.id) {
        Some(tx) => {
            let _ = tx.send(Ok(header));
        }
        None => trace!(id = header.id, kind = %header.event_type, "unawaited response"),
    }
}

/// Apply a peer's create request. Returns the response flags and the id to
/// report back.
async fn create_stream(inner: &LinkInner, header: &EventHeader) -> (EventFlags, u32) {
    let mut table = inner.streams.lock().await;
    let name = header.stream_name.as_str();

    let local = match (table.by_name(name), inner.role) {
        (Some(id), _) => id.local(),
        (None, LinkRole::Host) => match table.allocate_id() {
            Ok(id) => id.local(),
            Err(_) => {
                return (
                    EventFlags::nacked(EventFlags::BUFFER_FULL),
                    StreamId::INVALID_OUT_OF_MEMORY.0,
                );
            }
        },
        (None, LinkRole::Device) => header.stream_id,
    };

    match table.insert(local, name) {
        Ok(stream) => {
            stream.read_size = align_up(header.size as usize);
            stream.remote_closed = false;
            stream.notify.notify_waiters();
            debug!(link = %inner.id, stream = %stream.id, name, read_size = stream.read_size, "peer opened stream");
            (EventFlags::acked(), stream.id.local())
        }
        Err(_) => (
            EventFlags::nacked(EventFlags::BUFFER_FULL),
            StreamId::INVALID_OUT_OF_MEMORY.0,
        ),
    }
}
