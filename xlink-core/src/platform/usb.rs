//! USB bulk platform on top of `nusb`.
//!
//! Devices are told apart by product id, one per boot state. Link traffic
//! and ROM boot images travel over the bulk endpoints of interface 0.

use async_trait::async_trait;
use nusb::transfer::{Direction, EndpointType, RequestBuffer, TransferError};
use tracing::{debug, info, warn};

use super::{DeviceHandle, LinkReader, LinkWriter, Platform};
use crate::error::PlatformError;
use crate::types::{
    BOOT_CHUNK_SIZE, ChipPlatform, DeviceDesc, DeviceRequirements, DeviceState, PACKET_LENGTH,
    Protocol, UsbSpeed,
};

pub const VENDOR_ID: u16 = 0x03E7;
pub const PID_UNBOOTED: u16 = 0x2485;
pub const PID_BOOTED: u16 = 0xF63B;
pub const PID_BOOTLOADER: u16 = 0xF63C;
pub const PID_FLASH_BOOTED: u16 = 0xF63D;

const INTERFACE: u8 = 0;

fn state_for_pid(pid: u16) -> Option<DeviceState> {
    match pid {
        PID_UNBOOTED => Some(DeviceState::Unbooted),
        PID_BOOTED => Some(DeviceState::Booted),
        PID_BOOTLOADER => Some(DeviceState::Bootloader),
        PID_FLASH_BOOTED => Some(DeviceState::FlashBooted),
        _ => None,
    }
}

fn map_speed(speed: Option<nusb::Speed>) -> UsbSpeed {
    match speed {
        Some(nusb::Speed::Low) => UsbSpeed::Low,
        Some(nusb::Speed::Full) => UsbSpeed::Full,
        Some(nusb::Speed::High) => UsbSpeed::High,
        Some(nusb::Speed::Super) => UsbSpeed::Super,
        Some(nusb::Speed::SuperPlus) => UsbSpeed::SuperPlus,
        _ => UsbSpeed::Unknown,
    }
}

fn map_open_error(e: std::io::Error) -> PlatformError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => PlatformError::InsufficientPermissions,
        std::io::ErrorKind::NotFound => PlatformError::DeviceNotFound,
        _ => PlatformError::Io(e),
    }
}

fn map_transfer_error(e: TransferError) -> PlatformError {
    match e {
        TransferError::Disconnected => PlatformError::DeviceNotFound,
        other => PlatformError::Io(std::io::Error::other(other)),
    }
}

/// Path-like name of a USB device: `bus-address`.
fn device_name(info: &nusb::DeviceInfo) -> String {
    format!("{}-{}", info.bus_number(), info.device_address())
}

fn describe(info: &nusb::DeviceInfo) -> Option<DeviceDesc> {
    if info.vendor_id() != VENDOR_ID {
        return None;
    }
    let state = state_for_pid(info.product_id())?;
    Some(DeviceDesc::new(
        Protocol::UsbVsc,
        ChipPlatform::MyriadX,
        &device_name(info),
        state,
        info.serial_number().unwrap_or_default(),
    ))
}

struct Endpoints {
    interface: nusb::Interface,
    ep_in: u8,
    ep_out: u8,
}

fn open_endpoints(info: &nusb::DeviceInfo) -> Result<Endpoints, PlatformError> {
    let device = info.open().map_err(map_open_error)?;
    let interface = device.claim_interface(INTERFACE).map_err(map_open_error)?;

    let mut ep_in = None;
    let mut ep_out = None;
    for alt in interface.descriptors() {
        for ep in alt
            .endpoints()
            .filter(|e| e.transfer_type() == EndpointType::Bulk)
        {
            match ep.direction() {
                Direction::In => ep_in = ep_in.or(Some(ep.address())),
                Direction::Out => ep_out = ep_out.or(Some(ep.address())),
            }
        }
    }
    match (ep_in, ep_out) {
        (Some(ep_in), Some(ep_out)) => Ok(Endpoints {
            interface,
            ep_in,
            ep_out,
        }),
        _ => Err(PlatformError::InvalidParameters(
            "device has no bulk endpoint pair".into(),
        )),
    }
}

// ── Link halves ──────────────────────────────────────────────────

struct UsbReader {
    interface: nusb::Interface,
    ep: u8,
    pending: Vec<u8>,
    offset: usize,
}

#[async_trait]
impl LinkReader for UsbReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, PlatformError> {
        if self.offset >= self.pending.len() {
            let completion = self
                .interface
                .bulk_in(self.ep, RequestBuffer::new(PACKET_LENGTH))
                .await;
            self.pending = completion.into_result().map_err(map_transfer_error)?;
            self.offset = 0;
        }
        let n = buf.len().min(self.pending.len() - self.offset);
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

struct UsbWriter {
    interface: nusb::Interface,
    ep: u8,
}

#[async_trait]
impl LinkWriter for UsbWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, PlatformError> {
        let chunk = &buf[..buf.len().min(PACKET_LENGTH)];
        let completion = self.interface.bulk_out(self.ep, chunk.to_vec()).await;
        let sent = completion.into_result().map_err(map_transfer_error)?;
        Ok(sent.actual_length())
    }

    async fn close(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }
}

// ── Platform ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct UsbPlatform;

impl UsbPlatform {
    fn lookup(desc: &DeviceDesc) -> Result<nusb::DeviceInfo, PlatformError> {
        nusb::list_devices()
            .map_err(map_open_error)?
            .find(|info| {
                info.vendor_id() == VENDOR_ID
                    && device_name(info) == desc.name
                    && state_for_pid(info.product_id()).is_some()
            })
            .ok_or(PlatformError::DeviceNotFound)
    }
}

#[async_trait]
impl Platform for UsbPlatform {
    fn protocol(&self) -> Protocol {
        Protocol::UsbVsc
    }

    async fn find_devices(
        &self,
        req: &DeviceRequirements,
    ) -> Result<Vec<DeviceDesc>, PlatformError> {
        if !matches!(req.protocol, Protocol::Any | Protocol::UsbVsc) {
            return Ok(Vec::new());
        }
        let devices = nusb::list_devices().map_err(map_open_error)?;
        Ok(devices
            .filter_map(|info| describe(&info))
            .filter(|desc| desc.matches(req))
            .collect())
    }

    async fn connect(&self, desc: &DeviceDesc) -> Result<DeviceHandle, PlatformError> {
        let info = Self::lookup(desc)?;
        if info.product_id() == PID_UNBOOTED {
            return Err(PlatformError::InvalidParameters(format!(
                "{} is waiting for a firmware image",
                desc.name
            )));
        }
        let speed = map_speed(info.speed());
        let eps = open_endpoints(&info)?;
        debug!(device = %desc.name, ep_in = eps.ep_in, ep_out = eps.ep_out, ?speed, "usb link opened");

        let reader = UsbReader {
            interface: eps.interface.clone(),
            ep: eps.ep_in,
            pending: Vec::new(),
            offset: 0,
        };
        let writer = UsbWriter {
            interface: eps.interface,
            ep: eps.ep_out,
        };
        Ok(DeviceHandle::new(desc.clone(), Box::new(reader), Box::new(writer)).with_usb_speed(speed))
    }

    async fn boot_firmware(&self, desc: &DeviceDesc, image: &[u8]) -> Result<(), PlatformError> {
        let info = Self::lookup(desc)?;
        if info.product_id() != PID_UNBOOTED {
            return Err(PlatformError::InvalidParameters(format!(
                "{} is not in ROM boot",
                desc.name
            )));
        }
        let eps = open_endpoints(&info)?;
        for chunk in image.chunks(BOOT_CHUNK_SIZE) {
            let completion = eps.interface.bulk_out(eps.ep_out, chunk.to_vec()).await;
            let sent = completion.into_result().map_err(map_transfer_error)?;
            if sent.actual_length() != chunk.len() {
                warn!(device = %desc.name, sent = sent.actual_length(), "short boot transfer");
                return Err(PlatformError::Io(std::io::ErrorKind::WriteZero.into()));
            }
        }
        info!(device = %desc.name, size = image.len(), firmware = %blake3::hash(image).to_hex(), "firmware sent");
        Ok(())
    }

    async fn boot_bootloader(&self, _desc: &DeviceDesc) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported(
            "USB devices enter the bootloader by booting its image as firmware",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_ids_map_to_states() {
        assert_eq!(state_for_pid(0x2485), Some(DeviceState::Unbooted));
        assert_eq!(state_for_pid(0xF63B), Some(DeviceState::Booted));
        assert_eq!(state_for_pid(0xF63C), Some(DeviceState::Bootloader));
        assert_eq!(state_for_pid(0xF63D), Some(DeviceState::FlashBooted));
        assert_eq!(state_for_pid(0x1234), None);
    }

    #[test]
    fn speeds() {
        assert_eq!(map_speed(Some(nusb::Speed::High)), UsbSpeed::High);
        assert_eq!(map_speed(None), UsbSpeed::Unknown);
    }
}
