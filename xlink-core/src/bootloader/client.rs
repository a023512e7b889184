//! Host side of the bootloader protocol.

use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, info};

use super::{
    BOOTLOADER_STREAM, BOOTLOADER_STREAM_SIZE, BootloaderConfig, BootloaderType, Memory, Request,
    Response, Section, Storage, Version,
};
use crate::error::{Result, XLinkError};
use crate::link::Link;
use crate::types::{BOOT_CHUNK_SIZE, StreamId};

/// Talks to a device running its bootloader.
///
/// Requests the device is too old for are refused locally with
/// [`XLinkError::UnsupportedVersion`] instead of being sent.
#[derive(Debug)]
pub struct BootloaderClient {
    link: Link,
    stream: StreamId,
    version: Version,
}

impl BootloaderClient {
    /// Open the bootloader stream and query the bootloader version.
    /// Reached through [`crate::Device::bootloader`], which checks the phase.
    pub(crate) async fn open(link: Link) -> Result<Self> {
        let stream = link
            .open_stream(BOOTLOADER_STREAM, BOOTLOADER_STREAM_SIZE)
            .await?;
        let mut client = Self {
            link,
            stream,
            // Every bootloader answers the version query.
            version: Version::new(0, 0, 2),
        };
        client.send(&Request::GetBootloaderVersion).await?;
        match client.receive(client.query_timeout()).await? {
            Response::BootloaderVersion(v) => client.version = v,
            other => return Err(unexpected(&other)),
        }
        info!(version = %client.version, device = %client.link.desc().name, "bootloader session");
        Ok(client)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    fn query_timeout(&self) -> Duration {
        self.link.config().request_timeout()
    }

    async fn send(&self, req: &Request) -> Result<()> {
        let required = req.min_version();
        if required > self.version {
            return Err(XLinkError::UnsupportedVersion {
                request: req.name(),
                required: required.to_string(),
                actual: self.version.to_string(),
            });
        }
        debug!(request = req.name(), "bootloader request");
        self.link.write_data(self.stream, &req.encode()).await
    }

    async fn receive(&self, timeout: Duration) -> Result<Response> {
        let packet = self.link.read_move_data_timeout(self.stream, timeout).await?;
        Response::decode(&packet)
    }

    /// Stream `data` as `BOOT_CHUNK_SIZE` packets.
    async fn send_chunks(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(BOOT_CHUNK_SIZE) {
            self.link.write_data(self.stream, chunk).await?;
        }
        Ok(())
    }

    /// Consume progress updates until the closing `FlashComplete`. Each
    /// response must arrive within the request timeout.
    async fn await_completion(&self, progress: &mut dyn FnMut(f32)) -> Result<()> {
        loop {
            match self.receive(self.query_timeout()).await? {
                Response::FlashStatusUpdate { progress: p } => progress(p),
                Response::FlashComplete { success: true, .. } => return Ok(()),
                Response::FlashComplete { error_msg, .. } => {
                    return Err(XLinkError::Error(format!("flashing failed: {error_msg}")));
                }
                other => return Err(unexpected(&other)),
            }
        }
    }

    pub async fn bootloader_type(&self) -> Result<BootloaderType> {
        self.send(&Request::GetBootloaderType).await?;
        match self.receive(self.query_timeout()).await? {
            Response::BootloaderType(t) => Ok(t),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn memory(&self) -> Result<Memory> {
        self.send(&Request::BootloaderMemory).await?;
        match self.receive(self.query_timeout()).await? {
            Response::BootloaderMemory(m) => Ok(m),
            other => Err(unexpected(&other)),
        }
    }

    /// Flash an application or bootloader image.
    pub async fn flash(
        &self,
        storage: Storage,
        image: &[u8],
        mut progress: impl FnMut(f32),
    ) -> Result<()> {
        let (total_size, num_packets) = transfer_shape(image)?;
        self.send(&Request::UpdateFlash {
            storage,
            total_size,
            num_packets,
        })
        .await?;
        self.send_chunks(image).await?;
        self.await_completion(&mut progress).await
    }

    /// Flash `image` into a section of the given memory.
    pub async fn flash_ex(
        &self,
        memory: Memory,
        section: Section,
        image: &[u8],
        mut progress: impl FnMut(f32),
    ) -> Result<()> {
        let (total_size, num_packets) = transfer_shape(image)?;
        self.send(&Request::UpdateFlashEx {
            memory,
            section,
            total_size,
            num_packets,
        })
        .await?;
        self.send_chunks(image).await?;
        self.await_completion(&mut progress).await
    }

    /// Flash `image` at a raw byte offset.
    pub async fn flash_ex2(
        &self,
        memory: Memory,
        offset: u32,
        image: &[u8],
        mut progress: impl FnMut(f32),
    ) -> Result<()> {
        let (total_size, num_packets) = transfer_shape(image)?;
        self.send(&Request::UpdateFlashEx2 {
            memory,
            offset,
            total_size,
            num_packets,
        })
        .await?;
        self.send_chunks(image).await?;
        self.await_completion(&mut progress).await
    }

    pub async fn read_config(&self, memory: Memory) -> Result<BootloaderConfig> {
        self.send(&Request::GetBootloaderConfig {
            memory,
            offset: -1,
            max_size: 0,
        })
        .await?;

        let (total_size, num_packets) = match self.receive(self.query_timeout()).await? {
            Response::GetBootloaderConfig {
                success: true,
                total_size,
                num_packets,
                ..
            } => (total_size as usize, num_packets),
            Response::GetBootloaderConfig { error_msg, .. } => {
                return Err(XLinkError::Error(format!("reading config failed: {error_msg}")));
            }
            other => return Err(unexpected(&other)),
        };

        let mut blob = BytesMut::with_capacity(total_size);
        for _ in 0..num_packets {
            let packet = self
                .link
                .read_move_data_timeout(self.stream, self.link.config().request_timeout())
                .await?;
            blob.extend_from_slice(&packet);
        }
        if blob.len() != total_size {
            return Err(XLinkError::Truncated {
                what: "bootloader config",
                expected: total_size,
                actual: blob.len(),
            });
        }
        BootloaderConfig::from_json(&blob)
    }

    pub async fn write_config(&self, memory: Memory, config: &BootloaderConfig) -> Result<()> {
        let blob = config.to_json()?;
        let (total_size, num_packets) = transfer_shape(&blob)?;
        self.send(&Request::SetBootloaderConfig {
            memory,
            offset: -1,
            clear_config: false,
            total_size,
            num_packets,
        })
        .await?;
        self.send_chunks(&blob).await?;
        self.await_completion(&mut |_| {}).await
    }

    /// Boot `image` straight from RAM. The device leaves the bootloader, so
    /// this link ends once the transfer is done.
    pub async fn boot_memory(&self, image: &[u8]) -> Result<()> {
        let (total_size, num_packets) = transfer_shape(image)?;
        self.send(&Request::BootMemory {
            total_size,
            num_packets,
        })
        .await?;
        self.send_chunks(image).await
    }

    /// Boot the application stored in flash.
    pub async fn boot_application(&self) -> Result<()> {
        self.send(&Request::BootApplication).await?;
        if self.version < Version::new(0, 0, 14) {
            return Ok(());
        }
        match self.receive(self.query_timeout()).await? {
            Response::BootApplication { success: true, .. } => Ok(()),
            Response::BootApplication { error_msg, .. } => Err(XLinkError::Error(format!(
                "booting application failed: {error_msg}"
            ))),
            other => Err(unexpected(&other)),
        }
    }
}

fn transfer_shape(data: &[u8]) -> Result<(u32, u32)> {
    if data.is_empty() {
        return Err(XLinkError::Error("refusing to transfer an empty image".into()));
    }
    let total = u32::try_from(data.len())
        .map_err(|_| XLinkError::Error(format!("image of {} bytes is too large", data.len())))?;
    Ok((total, data.len().div_ceil(BOOT_CHUNK_SIZE) as u32))
}

fn unexpected(resp: &Response) -> XLinkError {
    XLinkError::Error(format!("unexpected bootloader response {}", resp.name()))
}
