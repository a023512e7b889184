//! Bootloader → host response records. Same framing as requests.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::version::Version;
use super::wire::{ERROR_MSG_SIZE, ensure_len, get_bool, get_fixed_str, put_fixed_str};
use super::{BootloaderType, Memory};
use crate::error::XLinkError;

int_enum!(
    /// Response discriminants as sent on the wire.
    Command: u32 {
        FlashComplete = 0,
        FlashStatusUpdate = 1,
        BootloaderVersion = 2,
        BootloaderType = 3,
        GetBootloaderConfig = 4,
        BootloaderMemory = 5,
        BootApplication = 6,
    }
);

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    FlashComplete {
        success: bool,
        error_msg: String,
    },
    FlashStatusUpdate {
        /// Fraction done, `0.0..=1.0`.
        progress: f32,
    },
    BootloaderVersion(Version),
    BootloaderType(BootloaderType),
    GetBootloaderConfig {
        success: bool,
        error_msg: String,
        total_size: u32,
        num_packets: u32,
    },
    BootloaderMemory(Memory),
    BootApplication {
        success: bool,
        error_msg: String,
    },
    Unknown {
        command: u32,
    },
}

impl Response {
    pub fn flash_ok() -> Self {
        Response::FlashComplete {
            success: true,
            error_msg: String::new(),
        }
    }

    pub fn flash_failed(msg: impl Into<String>) -> Self {
        Response::FlashComplete {
            success: false,
            error_msg: msg.into(),
        }
    }

    pub fn command(&self) -> Option<Command> {
        Some(match self {
            Response::FlashComplete { .. } => Command::FlashComplete,
            Response::FlashStatusUpdate { .. } => Command::FlashStatusUpdate,
            Response::BootloaderVersion(_) => Command::BootloaderVersion,
            Response::BootloaderType(_) => Command::BootloaderType,
            Response::GetBootloaderConfig { .. } => Command::GetBootloaderConfig,
            Response::BootloaderMemory(_) => Command::BootloaderMemory,
            Response::BootApplication { .. } => Command::BootApplication,
            Response::Unknown { .. } => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Response::FlashComplete { .. } => "FlashComplete",
            Response::FlashStatusUpdate { .. } => "FlashStatusUpdate",
            Response::BootloaderVersion(_) => "BootloaderVersion",
            Response::BootloaderType(_) => "BootloaderType",
            Response::GetBootloaderConfig { .. } => "GetBootloaderConfig",
            Response::BootloaderMemory(_) => "BootloaderMemory",
            Response::BootApplication { .. } => "BootApplication",
            Response::Unknown { .. } => "Unknown",
        }
    }

    /// Oldest bootloader that sends this response.
    pub fn min_version(&self) -> Version {
        match self {
            Response::FlashComplete { .. }
            | Response::FlashStatusUpdate { .. }
            | Response::BootloaderVersion(_) => Version::new(0, 0, 2),
            Response::BootloaderType(_) => Version::new(0, 0, 12),
            _ => Version::new(0, 0, 14),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + ERROR_MSG_SIZE + 8);
        let command = match self {
            Response::Unknown { command } => *command,
            known => known.command().map_or(0, |c| c as u32),
        };
        buf.put_u32_le(command);

        match self {
            Response::FlashComplete { success, error_msg }
            | Response::BootApplication { success, error_msg } => {
                buf.put_u32_le(*success as u32);
                put_fixed_str(&mut buf, error_msg);
            }
            Response::FlashStatusUpdate { progress } => buf.put_f32_le(*progress),
            Response::BootloaderVersion(v) => {
                buf.put_u32_le(v.major);
                buf.put_u32_le(v.minor);
                buf.put_u32_le(v.patch);
            }
            Response::BootloaderType(t) => buf.put_i32_le(*t as i32),
            Response::GetBootloaderConfig {
                success,
                error_msg,
                total_size,
                num_packets,
            } => {
                buf.put_u32_le(*success as u32);
                put_fixed_str(&mut buf, error_msg);
                buf.put_u32_le(*total_size);
                buf.put_u32_le(*num_packets);
            }
            Response::BootloaderMemory(m) => buf.put_i32_le(*m as i32),
            Response::Unknown { .. } => {}
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, XLinkError> {
        ensure_len(data, 4, "bootloader response")?;
        let mut src = data;
        let raw = src.get_u32_le();
        let Ok(command) = Command::try_from(raw) else {
            return Ok(Response::Unknown { command: raw });
        };

        let body = match command {
            Command::FlashComplete | Command::BootApplication => 4 + ERROR_MSG_SIZE,
            Command::FlashStatusUpdate | Command::BootloaderType | Command::BootloaderMemory => 4,
            Command::BootloaderVersion => 12,
            Command::GetBootloaderConfig => 12 + ERROR_MSG_SIZE,
        };
        ensure_len(data, 4 + body, "bootloader response")?;

        Ok(match command {
            Command::FlashComplete => Response::FlashComplete {
                success: get_bool(&mut src),
                error_msg: get_fixed_str(&mut src),
            },
            Command::BootApplication => Response::BootApplication {
                success: get_bool(&mut src),
                error_msg: get_fixed_str(&mut src),
            },
            Command::FlashStatusUpdate => Response::FlashStatusUpdate {
                progress: src.get_f32_le(),
            },
            Command::BootloaderVersion => Response::BootloaderVersion(Version::new(
                src.get_u32_le(),
                src.get_u32_le(),
                src.get_u32_le(),
            )),
            Command::BootloaderType => {
                Response::BootloaderType(BootloaderType::try_from(src.get_i32_le())?)
            }
            Command::GetBootloaderConfig => Response::GetBootloaderConfig {
                success: get_bool(&mut src),
                error_msg: get_fixed_str(&mut src),
                total_size: src.get_u32_le(),
                num_packets: src.get_u32_le(),
            },
            Command::BootloaderMemory => Response::BootloaderMemory(Memory::try_from(src.get_i32_le())?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_complete_layout() {
        let bytes = Response::flash_ok().encode();
        assert_eq!(bytes.len(), 72);
        match Response::decode(&bytes).unwrap() {
            Response::FlashComplete { success, error_msg } => {
                assert!(success);
                assert!(error_msg.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn long_error_messages_are_truncated() {
        let bytes = Response::flash_failed("x".repeat(200)).encode();
        assert_eq!(bytes.len(), 72);
        let Response::FlashComplete { error_msg, .. } = Response::decode(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(error_msg.len(), 63);
    }

    #[test]
    fn config_and_version_roundtrip() {
        let r = Response::GetBootloaderConfig {
            success: true,
            error_msg: String::new(),
            total_size: 300,
            num_packets: 1,
        };
        assert_eq!(r.encode().len(), 80);
        assert_eq!(Response::decode(&r.encode()).unwrap(), r);

        let v = Response::BootloaderVersion(Version::new(0, 0, 15));
        assert_eq!(Response::decode(&v.encode()).unwrap(), v);
    }

    #[test]
    fn unknown_and_truncated() {
        assert_eq!(
            Response::decode(&42u32.to_le_bytes()).unwrap(),
            Response::Unknown { command: 42 }
        );
        assert!(matches!(
            Response::decode(&1u32.to_le_bytes()),
            Err(XLinkError::Truncated { .. })
        ));
    }
}
