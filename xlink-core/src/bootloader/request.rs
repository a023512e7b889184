//! Host → bootloader request records.
//!
//! ## Wire format
//!
//! Every record starts with a little-endian `u32` command followed by the
//! command's fixed fields in declaration order, all little-endian. Records
//! may carry trailing bytes from newer peers; decoders ignore them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::version::Version;
use super::wire::{ensure_len, get_bool};
use super::{Memory, Section};
use crate::error::XLinkError;

int_enum!(
    /// Request discriminants as sent on the wire.
    Command: u32 {
        UsbRomBoot = 0,
        BootApplication = 1,
        UpdateFlash = 2,
        GetBootloaderVersion = 3,
        BootMemory = 4,
        UpdateFlashEx = 5,
        UpdateFlashEx2 = 6,
        NoOp = 7,
        GetBootloaderType = 8,
        SetBootloaderConfig = 9,
        GetBootloaderConfig = 10,
        BootloaderMemory = 11,
    }
);

int_enum!(
    /// Flash target of the legacy [`Request::UpdateFlash`].
    Storage: u32 = Sbr {
        /// Application image (SBR).
        Sbr = 0,
        Bootloader = 1,
    }
);

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    UsbRomBoot,
    BootApplication,
    UpdateFlash {
        storage: Storage,
        total_size: u32,
        num_packets: u32,
    },
    GetBootloaderVersion,
    BootMemory {
        total_size: u32,
        num_packets: u32,
    },
    UpdateFlashEx {
        memory: Memory,
        section: Section,
        total_size: u32,
        num_packets: u32,
    },
    UpdateFlashEx2 {
        memory: Memory,
        offset: u32,
        total_size: u32,
        num_packets: u32,
    },
    NoOp,
    GetBootloaderType,
    SetBootloaderConfig {
        memory: Memory,
        /// `-1` selects the default location.
        offset: i64,
        clear_config: bool,
        total_size: u32,
        num_packets: u32,
    },
    GetBootloaderConfig {
        memory: Memory,
        offset: i64,
        max_size: u32,
    },
    BootloaderMemory,
    /// A command this build does not know. Kept so newer hosts can be logged.
    Unknown { command: u32 },
}

impl Request {
    pub fn command(&self) -> Option<Command> {
        Some(match self {
            Request::UsbRomBoot => Command::UsbRomBoot,
            Request::BootApplication => Command::BootApplication,
            Request::UpdateFlash { .. } => Command::UpdateFlash,
            Request::GetBootloaderVersion => Command::GetBootloaderVersion,
            Request::BootMemory { .. } => Command::BootMemory,
            Request::UpdateFlashEx { .. } => Command::UpdateFlashEx,
            Request::UpdateFlashEx2 { .. } => Command::UpdateFlashEx2,
            Request::NoOp => Command::NoOp,
            Request::GetBootloaderType => Command::GetBootloaderType,
            Request::SetBootloaderConfig { .. } => Command::SetBootloaderConfig,
            Request::GetBootloaderConfig { .. } => Command::GetBootloaderConfig,
            Request::BootloaderMemory => Command::BootloaderMemory,
            Request::Unknown { .. } => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::UsbRomBoot => "UsbRomBoot",
            Request::BootApplication => "BootApplication",
            Request::UpdateFlash { .. } => "UpdateFlash",
            Request::GetBootloaderVersion => "GetBootloaderVersion",
            Request::BootMemory { .. } => "BootMemory",
            Request::UpdateFlashEx { .. } => "UpdateFlashEx",
            Request::UpdateFlashEx2 { .. } => "UpdateFlashEx2",
            Request::NoOp => "NoOp",
            Request::GetBootloaderType => "GetBootloaderType",
            Request::SetBootloaderConfig { .. } => "SetBootloaderConfig",
            Request::GetBootloaderConfig { .. } => "GetBootloaderConfig",
            Request::BootloaderMemory => "BootloaderMemory",
            Request::Unknown { .. } => "Unknown",
        }
    }

    /// Oldest bootloader that understands this request.
    pub fn min_version(&self) -> Version {
        match self {
            Request::UsbRomBoot
            | Request::BootApplication
            | Request::UpdateFlash { .. }
            | Request::GetBootloaderVersion
            | Request::NoOp => Version::new(0, 0, 2),
            Request::BootMemory { .. }
            | Request::UpdateFlashEx { .. }
            | Request::UpdateFlashEx2 { .. }
            | Request::GetBootloaderType => Version::new(0, 0, 12),
            Request::SetBootloaderConfig { .. }
            | Request::GetBootloaderConfig { .. }
            | Request::BootloaderMemory
            | Request::Unknown { .. } => Version::new(0, 0, 14),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        let command = match self {
            Request::Unknown { command } => *command,
            known => known.command().map_or(0, |c| c as u32),
        };
        buf.put_u32_le(command);

        match self {
            Request::UpdateFlash {
                storage,
                total_size,
                num_packets,
            } => {
                buf.put_u32_le(*storage as u32);
                buf.put_u32_le(*total_size);
                buf.put_u32_le(*num_packets);
            }
            Request::BootMemory {
                total_size,
                num_packets,
            } => {
                buf.put_u32_le(*total_size);
                buf.put_u32_le(*num_packets);
            }
            Request::UpdateFlashEx {
                memory,
                section,
                total_size,
                num_packets,
            } => {
                buf.put_i32_le(*memory as i32);
                buf.put_i32_le(*section as i32);
                buf.put_u32_le(*total_size);
                buf.put_u32_le(*num_packets);
            }
            Request::UpdateFlashEx2 {
                memory,
                offset,
                total_size,
                num_packets,
            } => {
                buf.put_i32_le(*memory as i32);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*total_size);
                buf.put_u32_le(*num_packets);
            }
            Request::SetBootloaderConfig {
                memory,
                offset,
                clear_config,
                total_size,
                num_packets,
            } => {
                buf.put_i32_le(*memory as i32);
                buf.put_i64_le(*offset);
                buf.put_u32_le(*clear_config as u32);
                buf.put_u32_le(*total_size);
                buf.put_u32_le(*num_packets);
            }
            Request::GetBootloaderConfig {
                memory,
                offset,
                max_size,
            } => {
                buf.put_i32_le(*memory as i32);
                buf.put_i64_le(*offset);
                buf.put_u32_le(*max_size);
            }
            _ => {}
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, XLinkError> {
        ensure_len(data, 4, "bootloader request")?;
        let mut src = data;
        let raw = src.get_u32_le();
        let Ok(command) = Command::try_from(raw) else {
            return Ok(Request::Unknown { command: raw });
        };

        let body = match command {
            Command::UpdateFlash => 12,
            Command::BootMemory => 8,
            Command::UpdateFlashEx | Command::UpdateFlashEx2 => 16,
            Command::SetBootloaderConfig => 24,
            Command::GetBootloaderConfig => 16,
            _ => 0,
        };
        ensure_len(data, 4 + body, "bootloader request")?;

        Ok(match command {
            Command::UsbRomBoot => Request::UsbRomBoot,
            Command::BootApplication => Request::BootApplication,
            Command::UpdateFlash => Request::UpdateFlash {
                storage: Storage::try_from(src.get_u32_le())?,
                total_size: src.get_u32_le(),
                num_packets: src.get_u32_le(),
            },
            Command::GetBootloaderVersion => Request::GetBootloaderVersion,
            Command::BootMemory => Request::BootMemory {
                total_size: src.get_u32_le(),
                num_packets: src.get_u32_le(),
            },
            Command::UpdateFlashEx => Request::UpdateFlashEx {
                memory: Memory::try_from(src.get_i32_le())?,
                section: Section::try_from(src.get_i32_le())?,
                total_size: src.get_u32_le(),
                num_packets: src.get_u32_le(),
            },
            Command::UpdateFlashEx2 => Request::UpdateFlashEx2 {
                memory: Memory::try_from(src.get_i32_le())?,
                offset: src.get_u32_le(),
                total_size: src.get_u32_le(),
                num_packets: src.get_u32_le(),
            },
            Command::NoOp => Request::NoOp,
            Command::GetBootloaderType => Request::GetBootloaderType,
            Command::SetBootloaderConfig => Request::SetBootloaderConfig {
                memory: Memory::try_from(src.get_i32_le())?,
                offset: src.get_i64_le(),
                clear_config: get_bool(&mut src),
                total_size: src.get_u32_le(),
                num_packets: src.get_u32_le(),
            },
            Command::GetBootloaderConfig => Request::GetBootloaderConfig {
                memory: Memory::try_from(src.get_i32_le())?,
                offset: src.get_i64_le(),
                max_size: src.get_u32_le(),
            },
            Command::BootloaderMemory => Request::BootloaderMemory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_flash_layout() {
        let req = Request::UpdateFlash {
            storage: Storage::Bootloader,
            total_size: 1024,
            num_packets: 16,
        };
        let bytes = req.encode();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn set_config_defaults_encode_negative_offset() {
        let req = Request::SetBootloaderConfig {
            memory: Memory::Auto,
            offset: -1,
            clear_config: false,
            total_size: 10,
            num_packets: 1,
        };
        let bytes = req.encode();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[4..8], &(-1i32).to_le_bytes());
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn unknown_command_is_preserved() {
        let req = Request::decode(&99u32.to_le_bytes()).unwrap();
        assert_eq!(req, Request::Unknown { command: 99 });
        assert_eq!(req.command(), None);
        assert_eq!(&req.encode()[..], &99u32.to_le_bytes());
    }

    #[test]
    fn discriminants_map_both_ways() {
        assert_eq!(Command::try_from(9).unwrap(), Command::SetBootloaderConfig);
        assert_eq!(u32::from(Command::BootloaderMemory), 11);
        assert!(matches!(
            Command::try_from(12),
            Err(XLinkError::UnknownVariant { type_name: "Command", .. })
        ));
        assert_eq!(Storage::default(), Storage::Sbr);
        assert!(Storage::try_from(2).is_err());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let bytes = Request::BootMemory {
            total_size: 1,
            num_packets: 1,
        }
        .encode();
        assert!(matches!(
            Request::decode(&bytes[..8]),
            Err(XLinkError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = Request::GetBootloaderVersion.encode().to_vec();
        bytes.extend_from_slice(&[0xFF; 12]);
        assert_eq!(
            Request::decode(&bytes).unwrap(),
            Request::GetBootloaderVersion
        );
    }

    #[test]
    fn versions_follow_command_age() {
        assert_eq!(Request::UsbRomBoot.min_version(), Version::new(0, 0, 2));
        assert_eq!(Request::GetBootloaderType.min_version(), Version::new(0, 0, 12));
        assert_eq!(Request::BootloaderMemory.min_version(), Version::new(0, 0, 14));
        assert_eq!(Request::BootloaderMemory.name(), "BootloaderMemory");
    }
}
