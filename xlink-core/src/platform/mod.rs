//! Transport platform contract.
//!
//! A platform enumerates devices of one protocol, boots them and opens
//! [`DeviceHandle`]s. A handle is split into a [`LinkReader`] and a
//! [`LinkWriter`]; the link layer owns each half from exactly one task, so
//! adapters never see concurrent calls on the same half.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PlatformError;
use crate::types::{DeviceDesc, DeviceRequirements, Protocol, UsbSpeed};

pub mod ipc;
pub mod tcp;
#[cfg(feature = "usb")]
pub mod usb;

pub use ipc::{IpcPlatform, VirtualDevice};
pub use tcp::{TcpDeviceListener, TcpPlatform};
#[cfg(feature = "usb")]
pub use usb::UsbPlatform;

// ── Raw I/O halves ───────────────────────────────────────────────

/// Read half of a physical link.
#[async_trait]
pub trait LinkReader: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed the link.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, PlatformError>;
}

/// Write half of a physical link.
#[async_trait]
pub trait LinkWriter: Send {
    /// Write some prefix of `buf`, returning how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, PlatformError>;

    /// Close the link. Further writes fail.
    async fn close(&mut self) -> Result<(), PlatformError>;

    /// Write the whole buffer.
    async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), PlatformError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(PlatformError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// Adapter for any tokio byte stream read half.
pub struct StreamReader<R>(pub R);

#[async_trait]
impl<R: AsyncRead + Unpin + Send> LinkReader for StreamReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, PlatformError> {
        Ok(self.0.read(buf).await?)
    }
}

/// Adapter for any tokio byte stream write half.
pub struct StreamWriter<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LinkWriter for StreamWriter<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, PlatformError> {
        let n = self.0.write(buf).await?;
        self.0.flush().await?;
        Ok(n)
    }

    async fn close(&mut self) -> Result<(), PlatformError> {
        Ok(self.0.shutdown().await?)
    }
}

// ── DeviceHandle ─────────────────────────────────────────────────

/// One open physical connection to a device.
pub struct DeviceHandle {
    pub desc: DeviceDesc,
    pub usb_speed: UsbSpeed,
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
}

impl DeviceHandle {
    pub fn new(desc: DeviceDesc, reader: Box<dyn LinkReader>, writer: Box<dyn LinkWriter>) -> Self {
        Self {
            desc,
            usb_speed: UsbSpeed::Unknown,
            reader,
            writer,
        }
    }

    /// Wrap a bidirectional tokio stream.
    pub fn from_stream<S>(desc: DeviceDesc, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::new(desc, Box::new(StreamReader(r)), Box::new(StreamWriter(w)))
    }

    pub fn with_usb_speed(mut self, speed: UsbSpeed) -> Self {
        self.usb_speed = speed;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.desc.protocol
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("desc", &self.desc)
            .field("usb_speed", &self.usb_speed)
            .finish_non_exhaustive()
    }
}

// ── Platform ─────────────────────────────────────────────────────

/// A transport backend: discovery, boot and connection for one protocol.
#[async_trait]
pub trait Platform: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Enumerate devices matching `req`. An empty list is not an error.
    async fn find_devices(&self, req: &DeviceRequirements)
    -> Result<Vec<DeviceDesc>, PlatformError>;

    /// Open the transport to `desc`. The device name is the platform path.
    async fn connect(&self, desc: &DeviceDesc) -> Result<DeviceHandle, PlatformError>;

    /// Transfer a firmware image to an unbooted device.
    async fn boot_firmware(&self, desc: &DeviceDesc, image: &[u8]) -> Result<(), PlatformError>;

    /// Move a device into bootloader mode.
    async fn boot_bootloader(&self, desc: &DeviceDesc) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChipPlatform, DeviceState};

    #[tokio::test]
    async fn stream_halves_carry_bytes() {
        let (a, b) = tokio::io::duplex(64);
        let desc = DeviceDesc::new(Protocol::Ipc, ChipPlatform::MyriadX, "t", DeviceState::Booted, "m");
        let mut left = DeviceHandle::from_stream(desc.clone(), a);
        let mut right = DeviceHandle::from_stream(desc, b);

        left.writer.write_all(b"hello link").await.unwrap();
        let mut buf = [0u8; 32];
        let n = right.reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello link");

        left.writer.close().await.unwrap();
        assert_eq!(right.reader.read(&mut buf).await.unwrap(), 0);
    }
}
