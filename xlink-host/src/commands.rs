//! Host tool commands.
//!
//! Each command takes a ready [`Session`] and a device filter, so the same
//! code drives real hardware and the in-process IPC platform.

use std::time::Duration;

use tracing::info;

use xlink_core::bootloader::{Memory, Storage};
use xlink_core::{
    BootloaderClient, BootloaderConfig, Device, DeviceDesc, DeviceRequirements, DeviceState,
    Result, Session, Version, XLinkError,
};

/// Every device matching `req`. An empty result is not an error here.
pub async fn list(session: &Session, req: &DeviceRequirements) -> Result<Vec<DeviceDesc>> {
    match session.find_all_devices(req).await {
        Ok(found) => Ok(found),
        Err(XLinkError::NotFound) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Boot `firmware` on the first matching device. Running devices are left
/// alone.
pub async fn boot(session: &Session, req: &DeviceRequirements, firmware: &[u8]) -> Result<DeviceDesc> {
    let desc = session.find_device(req).await?;
    if desc.state == DeviceState::Booted {
        info!(device = %desc, "already booted");
        return Ok(desc);
    }
    session.boot_firmware(&desc, firmware).await
}

/// Connect to a booted device and measure one round trip.
pub async fn ping(session: &Session, req: &DeviceRequirements) -> Result<Duration> {
    let desc = session.find_device(req).await?;
    let device = session.connect(&desc).await?;
    device.link().ping().await
}

/// Connect to the bootloader of the first matching device, moving it into
/// its bootloader first when it sits in ROM boot.
async fn open_bootloader(session: &Session, req: &DeviceRequirements) -> Result<(Device, BootloaderClient)> {
    let mut desc = session.find_device(req).await?;
    match desc.state {
        DeviceState::Bootloader | DeviceState::FlashBooted => {}
        DeviceState::Unbooted => desc = session.boot_bootloader(&desc).await?,
        state => {
            return Err(XLinkError::Error(format!(
                "{} is {state}, not in its bootloader",
                desc.name
            )));
        }
    }
    let device = session.connect(&desc).await?;
    let client = device.bootloader().await?;
    Ok((device, client))
}

pub async fn bootloader_version(session: &Session, req: &DeviceRequirements) -> Result<Version> {
    let (_device, client) = open_bootloader(session, req).await?;
    Ok(client.version())
}

/// Flash `image` into `storage`, reporting progress as a fraction.
pub async fn flash(
    session: &Session,
    req: &DeviceRequirements,
    storage: Storage,
    image: &[u8],
    progress: impl FnMut(f32),
) -> Result<()> {
    let (_device, client) = open_bootloader(session, req).await?;
    info!(?storage, size = image.len(), digest = %short_digest(image), "flashing");
    client.flash(storage, image, progress).await
}

pub async fn config_get(session: &Session, req: &DeviceRequirements, memory: Memory) -> Result<BootloaderConfig> {
    let (_device, client) = open_bootloader(session, req).await?;
    client.read_config(memory).await
}

pub async fn config_set(
    session: &Session,
    req: &DeviceRequirements,
    memory: Memory,
    config: &BootloaderConfig,
) -> Result<()> {
    let (_device, client) = open_bootloader(session, req).await?;
    client.write_config(memory, config).await
}

/// One line per device, for `list`.
pub fn format_device(desc: &DeviceDesc) -> String {
    format!(
        "{:<24} {:<20} {:<8} {}",
        desc.name,
        desc.mxid,
        desc.protocol.to_string(),
        desc.state
    )
}

fn short_digest(image: &[u8]) -> String {
    let hex = blake3::hash(image).to_hex();
    hex[..16].to_string()
}

// ── Tests ────────────────────────────────────────────────────────
