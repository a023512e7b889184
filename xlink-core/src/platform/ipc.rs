//! In-process platform backed by virtual devices.
//!
//! Each [`VirtualDevice`] emulates the three faces of real hardware:
//!
//! - **ROM boot** (`Unbooted`): accepts a firmware image through
//!   [`Platform::boot_firmware`] and refuses connections,
//! - **bootloader** (`Bootloader`, `FlashBooted`): every connection is served
//!   by a [`BootloaderServer`] over the device end of the pipe,
//! - **firmware** (`Booted`): the device end of every connection is handed
//!   to the owner of the `VirtualDevice` through [`VirtualDevice::accept`].
//!
//! Flash contents survive across connections and state changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeviceHandle, Platform};
use crate::bootloader::server::FlashStore;
use crate::bootloader::{BootloaderServer, ServerOutcome, Version};
use crate::config::LinkConfig;
use crate::error::{PlatformError, Result, XLinkError};
use crate::link::{Link, LinkRole};
use crate::types::{
    ChipPlatform, DeviceDesc, DeviceRequirements, DeviceState, LinkId, MAX_LINKS, PACKET_LENGTH,
    Protocol,
};

struct Slot {
    desc: DeviceDesc,
    firmware: Option<blake3::Hash>,
    flash: FlashStore,
    bootloader_version: Version,
    incoming: mpsc::Sender<Link>,
    /// Bootloader session still holding the flash.
    bootloader: Option<JoinHandle<()>>,
}

type Registry = Arc<Mutex<HashMap<String, Slot>>>;

/// Platform serving the virtual devices registered with it.
#[derive(Clone, Default)]
pub struct IpcPlatform {
    registry: Registry,
    link_config: LinkConfig,
}

impl IpcPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration of the device end of every link.
    pub fn with_link_config(mut self, config: LinkConfig) -> Self {
        self.link_config = config;
        self
    }

    /// Register a device under `name`, starting in `state`.
    pub async fn add_device(&self, name: &str, mxid: &str, state: DeviceState) -> VirtualDevice {
        let desc = DeviceDesc::new(Protocol::Ipc, ChipPlatform::MyriadX, name, state, mxid);
        let (tx, rx) = mpsc::channel(MAX_LINKS);
        info!(device = %desc, "virtual device registered");
        self.registry.lock().await.insert(
            desc.name.clone(),
            Slot {
                desc: desc.clone(),
                firmware: None,
                flash: FlashStore::default(),
                bootloader_version: BootloaderServer::DEFAULT_VERSION,
                incoming: tx,
                bootloader: None,
            },
        );
        VirtualDevice {
            name: desc.name,
            registry: self.registry.clone(),
            incoming: rx,
        }
    }

    async fn serve_bootloader(
        registry: Registry,
        name: String,
        link: Link,
        flash: FlashStore,
        version: Version,
    ) {
        let mut server = match BootloaderServer::open(link.clone(), flash).await {
            Ok(s) => s.with_version(version),
            Err(e) => {
                warn!(device = %name, error = %e, "bootloader server failed to start");
                link.close();
                return;
            }
        };
        let outcome = server.run().await;
        link.close();

        let mut registry = registry.lock().await;
        let Some(slot) = registry.get_mut(&name) else {
            return;
        };
        slot.flash = server.into_flash();
        match outcome {
            Ok(ServerOutcome::BootApplication(image) | ServerOutcome::BootMemory(image)) => {
                let digest = blake3::hash(&image);
                info!(device = %name, firmware = %digest.to_hex(), "virtual device booted");
                slot.firmware = Some(digest);
                slot.desc.state = DeviceState::Booted;
            }
            Ok(ServerOutcome::UsbRomBoot) => {
                info!(device = %name, "virtual device rebooted into ROM");
                slot.firmware = None;
                slot.desc.state = DeviceState::Unbooted;
            }
            Ok(ServerOutcome::Disconnected) => debug!(device = %name, "bootloader session ended"),
            Err(e) => warn!(device = %name, error = %e, "bootloader session failed"),
        }
    }
}

#[async_trait]
impl Platform for IpcPlatform {
    fn protocol(&self) -> Protocol {
        Protocol::Ipc
    }

    async fn find_devices(
        &self,
        req: &DeviceRequirements,
    ) -> Result<Vec<DeviceDesc>, PlatformError> {
        let registry = self.registry.lock().await;
        let mut found: Vec<DeviceDesc> = registry
            .values()
            .map(|slot| slot.desc.clone())
            .filter(|desc| desc.matches(req))
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn connect(&self, desc: &DeviceDesc) -> Result<DeviceHandle, PlatformError> {
        // The next session starts from the flash the previous one persisted.
        let previous = self
            .registry
            .lock()
            .await
            .get_mut(&desc.name)
            .and_then(|slot| slot.bootloader.take());
        if let Some(mut previous) = previous {
            let wait = self.link_config.request_timeout();
            if tokio::time::timeout(wait, &mut previous).await.is_err() {
                if let Some(slot) = self.registry.lock().await.get_mut(&desc.name) {
                    slot.bootloader = Some(previous);
                }
                return Err(PlatformError::Timeout);
            }
        }

        let mut registry = self.registry.lock().await;
        let slot = registry
            .get_mut(&desc.name)
            .ok_or(PlatformError::DeviceNotFound)?;
        if slot.desc.state == DeviceState::Unbooted {
            return Err(PlatformError::InvalidParameters(format!(
                "{} is waiting for a firmware image",
                slot.desc.name
            )));
        }

        let (host_end, device_end) = tokio::io::duplex(PACKET_LENGTH);
        let device_link = Link::start(
            DeviceHandle::from_stream(slot.desc.clone(), device_end),
            LinkId(0),
            LinkRole::Device,
            self.link_config.clone(),
        );
        let host = DeviceHandle::from_stream(slot.desc.clone(), host_end);
        debug!(device = %slot.desc, "virtual connection opened");

        let state = slot.desc.state;
        match state {
            DeviceState::Booted => {
                let incoming = slot.incoming.clone();
                drop(registry);
                if let Err(refused) = incoming.try_send(device_link) {
                    let link = match refused {
                        mpsc::error::TrySendError::Full(l) | mpsc::error::TrySendError::Closed(l) => l,
                    };
                    link.close();
                    return Err(PlatformError::InvalidParameters(
                        "firmware is not accepting connections".into(),
                    ));
                }
            }
            _ => {
                // The session locks the registry only after this guard is gone.
                slot.bootloader = Some(tokio::spawn(Self::serve_bootloader(
                    self.registry.clone(),
                    slot.desc.name.clone(),
                    device_link,
                    slot.flash.clone(),
                    slot.bootloader_version,
                )));
            }
        }
        Ok(host)
    }

    async fn boot_firmware(&self, desc: &DeviceDesc, image: &[u8]) -> Result<(), PlatformError> {
        if image.is_empty() {
            return Err(PlatformError::InvalidParameters("empty firmware image".into()));
        }
        let mut registry = self.registry.lock().await;
        let slot = registry
            .get_mut(&desc.name)
            .ok_or(PlatformError::DeviceNotFound)?;
        if slot.desc.state != DeviceState::Unbooted {
            return Err(PlatformError::InvalidParameters(format!(
                "{} is not in ROM boot ({})",
                slot.desc.name, slot.desc.state
            )));
        }
        let digest = blake3::hash(image);
        info!(device = %slot.desc.name, firmware = %digest.to_hex(), size = image.len(), "firmware booted");
        slot.firmware = Some(digest);
        slot.desc.state = DeviceState::Booted;
        Ok(())
    }

    async fn boot_bootloader(&self, desc: &DeviceDesc) -> Result<(), PlatformError> {
        let mut registry = self.registry.lock().await;
        let slot = registry
            .get_mut(&desc.name)
            .ok_or(PlatformError::DeviceNotFound)?;
        match slot.desc.state {
            DeviceState::Bootloader => {}
            DeviceState::Unbooted | DeviceState::FlashBooted => {
                info!(device = %slot.desc.name, "entering bootloader");
                slot.firmware = None;
                slot.desc.state = DeviceState::Bootloader;
            }
            other => {
                return Err(PlatformError::InvalidParameters(format!(
                    "cannot enter bootloader from {other}"
                )));
            }
        }
        Ok(())
    }
}

// ── VirtualDevice ────────────────────────────────────────────────

/// Device-side handle of a registered virtual device.
pub struct VirtualDevice {
    name: String,
    registry: Registry,
    incoming: mpsc::Receiver<Link>,
}

impl VirtualDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next host connection to the booted firmware.
    pub async fn accept(&mut self) -> Result<Link> {
        self.incoming
            .recv()
            .await
            .ok_or(XLinkError::CommunicationNotOpen)
    }

    async fn with_slot<T>(&self, f: impl FnOnce(&mut Slot) -> T) -> Result<T> {
        let mut registry = self.registry.lock().await;
        let slot = registry.get_mut(&self.name).ok_or(XLinkError::NotFound)?;
        Ok(f(slot))
    }

    pub async fn state(&self) -> Result<DeviceState> {
        self.with_slot(|s| s.desc.state).await
    }

    /// Digest of the running firmware image, if booted.
    pub async fn firmware(&self) -> Result<Option<blake3::Hash>> {
        self.with_slot(|s| s.firmware).await
    }

    pub async fn flash(&self) -> Result<FlashStore> {
        self.with_slot(|s| s.flash.clone()).await
    }

    /// Replace the flash contents seen by the next bootloader session.
    pub async fn load_flash(&self, flash: FlashStore) -> Result<()> {
        self.with_slot(|s| s.flash = flash).await
    }

    /// Version the bootloader reports from the next session on.
    pub async fn set_bootloader_version(&self, version: Version) -> Result<()> {
        self.with_slot(|s| s.bootloader_version = version).await
    }

    /// Wait for the running bootloader session, if any, to store its flash
    /// and hand over.
    pub async fn settle(&self) -> Result<()> {
        let running = self.with_slot(|s| s.bootloader.take()).await?;
        if let Some(handle) = running {
            handle
                .await
                .map_err(|e| XLinkError::Error(format!("bootloader session panicked: {e}")))?;
        }
        Ok(())
    }

    /// Drop back into ROM boot, or into the bootloader when one is flashed.
    pub async fn power_cycle(&self) -> Result<DeviceState> {
        self.with_slot(|s| {
            s.firmware = None;
            s.desc.state = if s.flash.bootloader.is_some() {
                DeviceState::FlashBooted
            } else {
                DeviceState::Unbooted
            };
            s.desc.state
        })
        .await
    }
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rom_boot_then_connect() {
        let platform = IpcPlatform::new();
        let mut dev = platform.add_device("ipc-0", "MXID0", DeviceState::Unbooted).await;
        let desc = platform
            .find_devices(&DeviceRequirements::default())
            .await
            .unwrap()
            .remove(0);

        assert!(matches!(
            platform.connect(&desc).await,
            Err(PlatformError::InvalidParameters(_))
        ));

        platform.boot_firmware(&desc, b"firmware").await.unwrap();
        assert_eq!(dev.state().await.unwrap(), DeviceState::Booted);
        assert_eq!(dev.firmware().await.unwrap(), Some(blake3::hash(b"firmware")));
        assert!(platform.boot_firmware(&desc, b"again").await.is_err());

        let host = Link::start(
            platform.connect(&desc).await.unwrap(),
            LinkId(1),
            LinkRole::Host,
            LinkConfig::default(),
        );
        let device = dev.accept().await.unwrap();
        host.ping().await.unwrap();
        assert_eq!(device.desc().mxid, "MXID0");
    }

    #[tokio::test]
    async fn discovery_filters_by_state() {
        let platform = IpcPlatform::new();
        let _a = platform.add_device("a", "A", DeviceState::Unbooted).await;
        let _b = platform.add_device("b", "B", DeviceState::Bootloader).await;

        let req = DeviceRequirements::default().with_state(DeviceState::Bootloader);
        let found = platform.find_devices(&req).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mxid, "B");

        let none = DeviceRequirements::default().with_protocol(Protocol::TcpIp);
        assert!(platform.find_devices(&none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bootloader_entry_and_power_cycle() {
        let platform = IpcPlatform::new();
        let dev = platform.add_device("a", "A", DeviceState::Unbooted).await;
        let desc = platform
            .find_devices(&DeviceRequirements::default())
            .await
            .unwrap()
            .remove(0);

        platform.boot_bootloader(&desc).await.unwrap();
        assert_eq!(dev.state().await.unwrap(), DeviceState::Bootloader);
        assert_eq!(dev.power_cycle().await.unwrap(), DeviceState::Unbooted);

        let missing = DeviceDesc::new(Protocol::Ipc, ChipPlatform::MyriadX, "nope", DeviceState::Any, "");
        assert!(matches!(
            platform.boot_bootloader(&missing).await,
            Err(PlatformError::DeviceNotFound)
        ));
    }
}
