//! Persistent bootloader configuration, exchanged as JSON.

use serde::{Deserialize, Serialize};

use super::Memory;
use crate::error::XLinkError;
use crate::types::UsbSpeed;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UsbBootConfig {
    /// How long the bootloader waits for a host before booting from flash.
    pub timeout_ms: i32,
    pub max_usb_speed: UsbSpeed,
    pub vid: u16,
    pub pid: u16,
}

impl Default for UsbBootConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            max_usb_speed: UsbSpeed::Super,
            vid: 0x03E7,
            pid: 0xF63C,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkBootConfig {
    pub timeout_ms: i32,
    pub static_ipv4: bool,
    pub ipv4: u32,
    pub ipv4_mask: u32,
    pub ipv4_gateway: u32,
    pub ipv4_dns: u32,
    pub ipv4_dns_alt: u32,
    pub mac: [u8; 6],
}

impl Default for NetworkBootConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            static_ipv4: false,
            ipv4: 0,
            ipv4_mask: 0,
            ipv4_gateway: 0,
            ipv4_dns: 0,
            ipv4_dns_alt: 0,
            mac: [0; 6],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BootloaderConfig {
    pub app_mem: Memory,
    pub usb: UsbBootConfig,
    pub network: NetworkBootConfig,
}

impl BootloaderConfig {
    pub fn to_json(&self) -> Result<Vec<u8>, XLinkError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, XLinkError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Assign a static IPv4 setup. Addresses are stored in network order.
    pub fn set_static_ipv4(&mut self, ip: std::net::Ipv4Addr, mask: std::net::Ipv4Addr, gateway: std::net::Ipv4Addr) {
        self.network.static_ipv4 = true;
        self.network.ipv4 = u32::from_be_bytes(ip.octets());
        self.network.ipv4_mask = u32::from_be_bytes(mask.octets());
        self.network.ipv4_gateway = u32::from_be_bytes(gateway.octets());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_blobs_take_defaults() {
        let cfg = BootloaderConfig::from_json(br#"{"usb": {"timeoutMs": 500}, "futureField": 1}"#).unwrap();
        assert_eq!(cfg.usb.timeout_ms, 500);
        assert_eq!(cfg.usb.pid, 0xF63C);
        assert_eq!(cfg.app_mem, Memory::Auto);
        assert_eq!(cfg.network.timeout_ms, 30_000);
    }

    #[test]
    fn json_roundtrip() {
        let mut cfg = BootloaderConfig::default();
        cfg.set_static_ipv4(
            "192.168.1.50".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
            "192.168.1.1".parse().unwrap(),
        );
        let back = BootloaderConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
        assert!(back.network.static_ipv4);
    }
}
