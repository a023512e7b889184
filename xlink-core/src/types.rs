//! Device, protocol and stream identifiers shared by every layer.
//!
//! Enums use `TryFrom` on their wire representation; unknown values
//! surface as [`XLinkError::UnknownVariant`](crate::error::XLinkError::UnknownVariant)
//! instead of panicking.

use std::fmt;

use serde::{Deserialize, Serialize};


// ── Limits ───────────────────────────────────────────────────────

/// Maximum number of simultaneously open streams per link.
pub const MAX_STREAMS: usize = 32;
/// Maximum number of resident packets per stream.
pub const MAX_PACKETS_PER_STREAM: usize = 64;
/// Size of the stream name field on the wire, terminating NUL included.
pub const MAX_STREAM_NAME_LENGTH: usize = 64;
/// Size of the device name field, terminating NUL included.
pub const MAX_NAME_SIZE: usize = 64;
/// Size of the MX serial field, terminating NUL included.
pub const MAX_MX_ID_SIZE: usize = 32;
/// Maximum number of live links per session.
pub const MAX_LINKS: usize = 32;
/// Byte boundary every transmitted payload is padded to.
pub const ALIGNMENT: usize = 64;
/// Largest single transfer handed to a platform adapter.
pub const PACKET_LENGTH: usize = 64 * 1024;
/// Chunk size used when streaming boot images over a raw transport.
pub const BOOT_CHUNK_SIZE: usize = 64 * 1024;

/// Round `size` up to the next multiple of [`ALIGNMENT`].
pub const fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Copy `s` into a string of at most `max - 1` bytes, cutting on a char
/// boundary. Mirrors what fits into a NUL-terminated field of `max` bytes.
pub fn bounded(s: &str, max: usize) -> String {
    let limit = max.saturating_sub(1);
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ── Protocol ─────────────────────────────────────────────────────

int_enum!(
    /// Physical or virtual link kind.
    #[derive(Serialize, Deserialize)]
    Protocol: u32 {
        UsbVsc = 0,
        UsbCdc = 1,
        Pcie = 2,
        Ipc = 3,
        TcpIp = 4,
        Any = 6,
    }
);

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::UsbVsc => "USB_VSC",
            Protocol::UsbCdc => "USB_CDC",
            Protocol::Pcie => "PCIE",
            Protocol::Ipc => "IPC",
            Protocol::TcpIp => "TCP_IP",
            Protocol::Any => "ANY_PROTOCOL",
        };
        f.write_str(s)
    }
}

// ── ChipPlatform ─────────────────────────────────────────────────

int_enum!(
    /// Vision processor family on the far end of the link.
    #[derive(Serialize, Deserialize)]
    ChipPlatform: u32 {
        Any = 0,
        Myriad2 = 2450,
        MyriadX = 2480,
    }
);

impl fmt::Display for ChipPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChipPlatform::Any => "ANY_PLATFORM",
            ChipPlatform::Myriad2 => "MYRIAD_2",
            ChipPlatform::MyriadX => "MYRIAD_X",
        };
        f.write_str(s)
    }
}

// ── DeviceState ──────────────────────────────────────────────────

int_enum!(
    /// Boot state reported by discovery.
    #[derive(Serialize, Deserialize)]
    DeviceState: u32 {
        Any = 0,
        Booted = 1,
        Unbooted = 2,
        Bootloader = 3,
        FlashBooted = 4,
    }
);

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Any => "ANY_STATE",
            DeviceState::Booted => "BOOTED",
            DeviceState::Unbooted => "UNBOOTED",
            DeviceState::Bootloader => "BOOTLOADER",
            DeviceState::FlashBooted => "FLASH_BOOTED",
        };
        f.write_str(s)
    }
}

impl DeviceState {
    /// Returns `true` if the device runs application firmware.
    pub fn is_booted(&self) -> bool {
        matches!(self, DeviceState::Booted | DeviceState::FlashBooted)
    }
}

// ── UsbSpeed ─────────────────────────────────────────────────────

int_enum!(
    /// Negotiated USB bus speed.
    #[derive(Default, Serialize, Deserialize)]
    UsbSpeed: u32 {
        #[default]
        Unknown = 0,
        Low = 1,
        Full = 2,
        High = 3,
        Super = 4,
        SuperPlus = 5,
    }
);

// ── DeviceDesc ───────────────────────────────────────────────────

/// Description of one device as returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDesc {
    pub protocol: Protocol,
    pub platform: ChipPlatform,
    /// Platform path of the device (USB port path, `ip:port`, IPC name).
    pub name: String,
    pub state: DeviceState,
    pub mxid: String,
}

impl DeviceDesc {
    pub fn new(
        protocol: Protocol,
        platform: ChipPlatform,
        name: &str,
        state: DeviceState,
        mxid: &str,
    ) -> Self {
        Self {
            protocol,
            platform,
            name: bounded(name, MAX_NAME_SIZE),
            state,
            mxid: bounded(mxid, MAX_MX_ID_SIZE),
        }
    }

    /// Returns `true` if this device satisfies every set requirement.
    pub fn matches(&self, req: &DeviceRequirements) -> bool {
        let protocol_ok = match req.protocol {
            Protocol::Any => true,
            p => p == self.protocol,
        };
        let platform_ok = match req.platform {
            ChipPlatform::Any => true,
            p => p == self.platform,
        };
        let state_ok = match req.state {
            DeviceState::Any => true,
            s => s == self.state,
        };
        let name_ok = req.name.as_deref().is_none_or(|n| n == self.name);
        let mxid_ok = req.mxid.as_deref().is_none_or(|m| m == self.mxid);

        protocol_ok && platform_ok && state_ok && name_ok && mxid_ok
    }
}

impl fmt::Display for DeviceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} {} ({})",
            self.name, self.mxid, self.protocol, self.platform, self.state
        )
    }
}

/// Filter used by discovery. Wildcards are `Any` / `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequirements {
    pub protocol: Protocol,
    pub platform: ChipPlatform,
    pub state: DeviceState,
    pub name: Option<String>,
    pub mxid: Option<String>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            protocol: Protocol::Any,
            platform: ChipPlatform::Any,
            state: DeviceState::Any,
            name: None,
            mxid: None,
        }
    }
}

impl DeviceRequirements {
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_state(mut self, state: DeviceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mxid(mut self, mxid: impl Into<String>) -> Self {
        self.mxid = Some(mxid.into());
        self
    }

    /// Requirements that identify exactly `desc`, in any state.
    pub fn same_device(desc: &DeviceDesc) -> Self {
        Self {
            protocol: desc.protocol,
            mxid: Some(desc.mxid.clone()),
            ..Default::default()
        }
    }
}

// ── Identifiers ──────────────────────────────────────────────────

/// Index of a link inside its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u8);

impl LinkId {
    pub const INVALID: LinkId = LinkId(0xFF);
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

const LINK_ID_SHIFT: u32 = 24;
const STREAM_ID_MASK: u32 = 0x00FF_FFFF;

/// Stream identifier: link id in the top byte, link-local number below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Returned on the wire when a stream cannot be created.
    pub const INVALID: StreamId = StreamId(0xDEAD_DEAD);
    /// Returned on the wire when the peer's stream table is full.
    pub const INVALID_OUT_OF_MEMORY: StreamId = StreamId(0xDEAD_FFFF);

    /// Combine a link-local stream number with its link id.
    pub fn combine(local: u32, link: LinkId) -> Self {
        StreamId((local & STREAM_ID_MASK) | ((link.0 as u32) << LINK_ID_SHIFT))
    }

    pub fn link_id(&self) -> LinkId {
        LinkId((self.0 >> LINK_ID_SHIFT) as u8)
    }

    /// The link-local part, as carried on the wire.
    pub fn local(&self) -> u32 {
        self.0 & STREAM_ID_MASK
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID && *self != Self::INVALID_OUT_OF_MEMORY
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Identifier of a delivered packet inside its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XLinkError;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 64);
        assert_eq!(align_up(64), 64);
        assert_eq!(align_up(65), 128);
    }

    #[test]
    fn bounded_truncates_on_char_boundary() {
        assert_eq!(bounded("abc", 64), "abc");
        assert_eq!(bounded(&"x".repeat(100), 32).len(), 31);
        // 'é' is two bytes; a cut in the middle must back off.
        let s = format!("{}é", "a".repeat(30));
        assert_eq!(bounded(&s, 32), "a".repeat(30));
    }

    #[test]
    fn stream_id_packs_link_id() {
        let id = StreamId::combine(7, LinkId(3));
        assert_eq!(id.link_id(), LinkId(3));
        assert_eq!(id.local(), 7);
        assert!(id.is_valid());
        assert!(!StreamId::INVALID.is_valid());
        assert!(!StreamId::INVALID_OUT_OF_MEMORY.is_valid());
    }

    #[test]
    fn requirements_filter() {
        let dev = DeviceDesc::new(
            Protocol::UsbVsc,
            ChipPlatform::MyriadX,
            "1.2",
            DeviceState::Unbooted,
            "14442C10D13EABCE00",
        );
        assert!(dev.matches(&DeviceRequirements::default()));
        assert!(dev.matches(&DeviceRequirements::default().with_state(DeviceState::Unbooted)));
        assert!(!dev.matches(&DeviceRequirements::default().with_state(DeviceState::Booted)));
        assert!(!dev.matches(&DeviceRequirements::default().with_protocol(Protocol::TcpIp)));
        assert!(dev.matches(&DeviceRequirements::same_device(&dev)));
        assert!(!dev.matches(&DeviceRequirements::default().with_name("1.3")));
    }

    #[test]
    fn enum_roundtrip_and_invalid() {
        for s in [
            DeviceState::Any,
            DeviceState::Booted,
            DeviceState::Unbooted,
            DeviceState::Bootloader,
            DeviceState::FlashBooted,
        ] {
            assert_eq!(DeviceState::try_from(s as u32).unwrap(), s);
        }
        assert!(Protocol::try_from(5).is_err());
        assert!(ChipPlatform::try_from(1).is_err());
        assert_eq!(UsbSpeed::default(), UsbSpeed::Unknown);
        assert_eq!(u32::from(UsbSpeed::SuperPlus), 5);
        assert!(matches!(
            UsbSpeed::try_from(9),
            Err(XLinkError::UnknownVariant {
                type_name: "UsbSpeed",
                value: 9
            })
        ));
    }

    #[test]
    fn descriptors_serialize_by_name() {
        let json = serde_json::to_string(&DeviceState::FlashBooted).unwrap();
        assert_eq!(json, "\"FlashBooted\"");
        assert_eq!(Protocol::TcpIp.to_string(), "TCP_IP");
    }
}
