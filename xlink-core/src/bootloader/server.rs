//! Device side of the bootloader protocol.
//!
//! The server reads requests from the bootloader stream, applies them to an
//! in-memory [`FlashStore`] and answers. It runs until a request hands
//! control elsewhere (boot, ROM reboot) or the link goes away, and reports
//! which of those happened as a [`ServerOutcome`].

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::{
    BOOTLOADER_STREAM, BOOTLOADER_STREAM_SIZE, BootloaderConfig, BootloaderType, Memory, Request,
    Response, Section, Storage, Version,
};
use crate::error::{Result, XLinkError};
use crate::link::Link;
use crate::types::{BOOT_CHUNK_SIZE, StreamId};

/// Persistent contents of the emulated boot memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashStore {
    pub application: Option<Bytes>,
    pub bootloader: Option<Bytes>,
    pub config: Option<BootloaderConfig>,
    /// Raw writes by byte offset.
    pub raw: BTreeMap<u32, Bytes>,
}

/// Why the server stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOutcome {
    /// Boot the application stored in flash.
    BootApplication(Bytes),
    /// Boot an image received over the link.
    BootMemory(Bytes),
    /// Reboot into ROM boot mode.
    UsbRomBoot,
    /// The host went away.
    Disconnected,
}

pub struct BootloaderServer {
    link: Link,
    stream: StreamId,
    version: Version,
    kind: BootloaderType,
    memory: Memory,
    flash: FlashStore,
}

impl BootloaderServer {
    /// Version reported unless overridden with [`BootloaderServer::with_version`].
    pub const DEFAULT_VERSION: Version = Version::new(0, 0, 15);

    pub async fn open(link: Link, flash: FlashStore) -> Result<Self> {
        let stream = link
            .open_stream(BOOTLOADER_STREAM, BOOTLOADER_STREAM_SIZE)
            .await?;
        Ok(Self {
            link,
            stream,
            version: Self::DEFAULT_VERSION,
            kind: BootloaderType::Usb,
            memory: Memory::Flash,
            flash,
        })
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_kind(mut self, kind: BootloaderType) -> Self {
        self.kind = kind;
        self
    }

    pub fn flash(&self) -> &FlashStore {
        &self.flash
    }

    pub fn into_flash(self) -> FlashStore {
        self.flash
    }

    async fn reply(&self, resp: Response) -> Result<()> {
        debug!(response = resp.name(), "bootloader reply");
        self.link.write_data(self.stream, &resp.encode()).await
    }

    /// Serve requests until one ends the session.
    pub async fn run(&mut self) -> Result<ServerOutcome> {
        loop {
            let packet = match self.link.read_move_data(self.stream).await {
                Ok(p) => p,
                Err(XLinkError::CommunicationFailure(_) | XLinkError::CommunicationNotOpen) => {
                    return Ok(ServerOutcome::Disconnected);
                }
                Err(e) => return Err(e),
            };
            let request = match Request::decode(&packet) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "malformed bootloader request");
                    continue;
                }
            };
            if request.min_version() > self.version {
                warn!(request = request.name(), version = %self.version, "request newer than this bootloader");
                continue;
            }
            if let Some(outcome) = self.handle(request).await? {
                info!(?outcome, "bootloader handing over");
                return Ok(outcome);
            }
        }
    }

    async fn handle(&mut self, request: Request) -> Result<Option<ServerOutcome>> {
        match request {
            Request::GetBootloaderVersion => {
                self.reply(Response::BootloaderVersion(self.version)).await?
            }
            Request::GetBootloaderType => self.reply(Response::BootloaderType(self.kind)).await?,
            Request::BootloaderMemory => self.reply(Response::BootloaderMemory(self.memory)).await?,
            Request::NoOp => {}
            Request::UsbRomBoot => return Ok(Some(ServerOutcome::UsbRomBoot)),
            Request::BootApplication => {
                let Some(app) = self.flash.application.clone() else {
                    if self.version >= Version::new(0, 0, 14) {
                        self.reply(Response::BootApplication {
                            success: false,
                            error_msg: "no application in flash".into(),
                        })
                        .await?;
                    }
                    return Ok(None);
                };
                if self.version >= Version::new(0, 0, 14) {
                    self.reply(Response::BootApplication {
                        success: true,
                        error_msg: String::new(),
                    })
                    .await?;
                }
                return Ok(Some(ServerOutcome::BootApplication(app)));
            }
            Request::BootMemory {
                total_size,
                num_packets,
            } => {
                return Ok(match self.receive_blob(total_size, num_packets, false).await? {
                    Ok(image) => Some(ServerOutcome::BootMemory(image)),
                    Err(msg) => {
                        warn!(%msg, "boot image rejected");
                        None
                    }
                });
            }
            Request::UpdateFlash {
                storage,
                total_size,
                num_packets,
            } => {
                let outcome = self.receive_blob(total_size, num_packets, true).await?;
                let resp = self.store(outcome, |flash, image| match storage {
                    Storage::Sbr => flash.application = Some(image),
                    Storage::Bootloader => flash.bootloader = Some(image),
                });
                self.reply(resp).await?;
            }
            Request::UpdateFlashEx {
                memory,
                section,
                total_size,
                num_packets,
            } => {
                let outcome = self.receive_blob(total_size, num_packets, true).await?;
                let resp = if !self.memory_matches(memory) {
                    Response::flash_failed(format!("memory {memory} not present"))
                } else {
                    self.store(outcome, |flash, image| match section {
                        Section::Bootloader => flash.bootloader = Some(image),
                        Section::BootloaderConfig => {
                            flash.config = BootloaderConfig::from_json(&image).ok();
                        }
                        Section::Auto | Section::Application | Section::Header => {
                            flash.application = Some(image)
                        }
                    })
                };
                self.reply(resp).await?;
            }
            Request::UpdateFlashEx2 {
                memory,
                offset,
                total_size,
                num_packets,
            } => {
                let outcome = self.receive_blob(total_size, num_packets, true).await?;
                let resp = if !self.memory_matches(memory) {
                    Response::flash_failed(format!("memory {memory} not present"))
                } else {
                    self.store(outcome, |flash, image| {
                        flash.raw.insert(offset, image);
                    })
                };
                self.reply(resp).await?;
            }
            Request::SetBootloaderConfig {
                memory,
                clear_config,
                total_size,
                num_packets,
                ..
            } => {
                let resp = if clear_config {
                    self.flash.config = None;
                    Response::flash_ok()
                } else {
                    match self.receive_blob(total_size, num_packets, false).await? {
                        Err(msg) => Response::flash_failed(msg),
                        Ok(_) if !self.memory_matches(memory) => {
                            Response::flash_failed(format!("memory {memory} not present"))
                        }
                        Ok(blob) => match BootloaderConfig::from_json(&blob) {
                            Ok(cfg) => {
                                self.flash.config = Some(cfg);
                                Response::flash_ok()
                            }
                            Err(e) => Response::flash_failed(e.to_string()),
                        },
                    }
                };
                self.reply(resp).await?;
            }
            Request::GetBootloaderConfig {
                memory, max_size, ..
            } => {
                let blob = match &self.flash.config {
                    Some(cfg) if self.memory_matches(memory) => Some(cfg.to_json()?),
                    _ => None,
                };
                match blob {
                    Some(blob) if max_size == 0 || blob.len() <= max_size as usize => {
                        self.reply(Response::GetBootloaderConfig {
                            success: true,
                            error_msg: String::new(),
                            total_size: blob.len() as u32,
                            num_packets: blob.len().div_ceil(BOOT_CHUNK_SIZE) as u32,
                        })
                        .await?;
                        for chunk in blob.chunks(BOOT_CHUNK_SIZE) {
                            self.link.write_data(self.stream, chunk).await?;
                        }
                    }
                    Some(_) => {
                        self.reply(Response::GetBootloaderConfig {
                            success: false,
                            error_msg: "config larger than max size".into(),
                            total_size: 0,
                            num_packets: 0,
                        })
                        .await?
                    }
                    None => {
                        self.reply(Response::GetBootloaderConfig {
                            success: false,
                            error_msg: "no config stored".into(),
                            total_size: 0,
                            num_packets: 0,
                        })
                        .await?
                    }
                }
            }
            Request::Unknown { command } => {
                warn!(command, "ignoring unknown bootloader command");
            }
        }
        Ok(None)
    }

    fn memory_matches(&self, memory: Memory) -> bool {
        memory == Memory::Auto || memory == self.memory
    }

    fn store(
        &mut self,
        outcome: std::result::Result<Bytes, String>,
        apply: impl FnOnce(&mut FlashStore, Bytes),
    ) -> Response {
        match outcome {
            Ok(image) => {
                apply(&mut self.flash, image);
                Response::flash_ok()
            }
            Err(msg) => Response::flash_failed(msg),
        }
    }

    /// Send a progress update if the host has room for it. The host only
    /// drains updates after its last chunk, so a full stream drops them.
    async fn report(&self, progress: f32) -> Result<()> {
        let update = Response::FlashStatusUpdate { progress }.encode();
        match self
            .link
            .write_data_timeout(self.stream, &update, Duration::ZERO)
            .await
        {
            Ok(()) | Err(XLinkError::Timeout(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Receive `num_packets` packets and check they add up to `total_size`.
    ///
    /// A mismatch or a stalled transfer is reported as `Ok(Err(message))`;
    /// the outer error is reserved for link failures. Each packet must
    /// arrive within the link's request timeout, and the blob never grows
    /// past the announced size.
    async fn receive_blob(
        &self,
        total_size: u32,
        num_packets: u32,
        report_progress: bool,
    ) -> Result<std::result::Result<Bytes, String>> {
        let total = total_size as usize;
        if num_packets == 0 {
            return Ok(Err("transfer announces no packets".into()));
        }
        let wait = self.link.config().request_timeout();
        let mut blob = BytesMut::with_capacity(total.min(BOOT_CHUNK_SIZE));
        let mut received = 0usize;
        for count in 0..num_packets {
            let packet = match self.link.read_move_data_timeout(self.stream, wait).await {
                Ok(p) => p,
                Err(XLinkError::Timeout(_)) => {
                    warn!(count, num_packets, "transfer stalled");
                    return Ok(Err(format!(
                        "transfer timed out after {count} of {num_packets} packets"
                    )));
                }
                Err(e) => return Err(e),
            };
            received += packet.len();
            if received <= total {
                blob.extend_from_slice(&packet);
            }
            if report_progress && total > 0 {
                let progress = (received as f32 / total as f32).min(1.0);
                self.report(progress).await?;
            }
        }
        if received != total {
            return Ok(Err(format!("received {received} bytes, expected {total}")));
        }
        Ok(Ok(blob.freeze()))
    }
}

impl std::fmt::Debug for BootloaderServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootloaderServer")
            .field("version", &self.version)
            .field("kind", &self.kind)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}
