//! Bootloader request/response protocol.
//!
//! Requests and responses travel as single packets on the
//! [`BOOTLOADER_STREAM`] stream. Bulk data (flash images, config blobs)
//! follows its announcing request as `num_packets` packets adding up to
//! `total_size` bytes.

pub mod client;
pub mod config;
pub mod request;
pub mod response;
pub mod server;
pub mod version;
mod wire;

pub use client::BootloaderClient;
pub use config::BootloaderConfig;
pub use request::{Request, Storage};
pub use response::Response;
pub use server::{BootloaderServer, ServerOutcome};
pub use version::Version;

/// Stream carrying bootloader traffic.
pub const BOOTLOADER_STREAM: &str = "__bootloader";
/// Write size both ends declare for [`BOOTLOADER_STREAM`].
pub const BOOTLOADER_STREAM_SIZE: usize = crate::types::BOOT_CHUNK_SIZE;

int_enum!(
    /// Boot memory of the device.
    Memory: i32 = Auto {
        Auto = -1,
        Flash = 0,
        Emmc = 1,
    }
);

int_enum!(
    /// Flash section addressed by `UpdateFlashEx`.
    Section: i32 = Auto {
        Auto = -1,
        Header = 0,
        Bootloader = 1,
        BootloaderConfig = 2,
        Application = 3,
    }
);

int_enum!(
    /// Transport the bootloader serves.
    BootloaderType: i32 = Auto {
        Auto = -1,
        Usb = 0,
        Network = 1,
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_travel_as_integers() {
        assert_eq!(serde_json::to_string(&Memory::Emmc).unwrap(), "1");
        assert_eq!(serde_json::from_str::<Section>("3").unwrap(), Section::Application);
        assert!(serde_json::from_str::<BootloaderType>("7").is_err());
        assert_eq!(Memory::default(), Memory::Auto);
    }
}
