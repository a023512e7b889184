//! # xlink-core
//!
//! Host/device link layer for vision processor boards.
//!
//! This crate contains:
//! - **Platform**: `Platform` trait with USB, TCP/IP and in-process IPC transports
//! - **Framing**: `EventHeader`, `Event` and `LinkCodec` for the wire format
//! - **Link**: `Link`, a multiplexed connection with bounded per-stream buffers
//! - **Device**: `Session` and `Device` for discovery, boot and connection
//! - **Bootloader**: request/response records, `BootloaderClient` and `BootloaderServer`
//! - **Datatypes**: `StreamMessage` framing and the stereo, frame and detection messages
//! - **Device config**: board, preboot and EEPROM calibration structures
//! - **Error**: `XLinkError`, a typed `thiserror` hierarchy with status codes

#[macro_use]
mod macros;

pub mod bootloader;
pub mod codec;
pub mod config;
pub mod datatype;
pub mod device;
pub mod device_config;
pub mod error;
pub mod event;
pub mod flags;
pub mod link;
pub mod platform;
pub mod types;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bootloader::{BootloaderClient, BootloaderConfig, BootloaderServer, Version};
pub use codec::LinkCodec;
pub use config::{LinkConfig, SessionConfig, TcpConfig};
pub use datatype::{DatatypeEnum, RawMessage, RawStereoDepthConfig, StreamMessage};
pub use device::{Device, DevicePhase, Session};
pub use error::{PlatformError, Result, XLinkError, XLinkStatus};
pub use event::{EVENT_HEADER_SIZE, Event, EventHeader, EventType};
pub use flags::EventFlags;
pub use link::{Link, LinkProfile, LinkRole, MovedPacket, Packet, StreamInfo};
pub use platform::{DeviceHandle, IpcPlatform, Platform, TcpDeviceListener, TcpPlatform, VirtualDevice};
pub use types::{
    ChipPlatform, DeviceDesc, DeviceRequirements, DeviceState, LinkId, PacketId, Protocol,
    StreamId, UsbSpeed,
};
