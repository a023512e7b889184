//! TCP/IP platform.
//!
//! Discovery is a UDP exchange: the host sends a 4-byte `DEVICE_DISCOVER`
//! command to the discovery port of each target (or broadcasts it) and every
//! device answers with
//!
//! ```text
//! ┌─────────┬───────────────┬─────────┐
//! │ cmd u32 │ mxid [32]     │ state   │
//! │ LE      │ NUL-padded    │ u32 LE  │
//! └─────────┴───────────────┴─────────┘
//! ```
//!
//! Link traffic runs over a plain TCP connection to the link port. The
//! device name of a TCP device is its `ip:port` link address.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeviceHandle, Platform};
use crate::config::{LinkConfig, TcpConfig};
use crate::error::{PlatformError, Result};
use crate::link::{Link, LinkRole};
use crate::types::{
    ChipPlatform, DeviceDesc, DeviceRequirements, DeviceState, LinkId, MAX_MX_ID_SIZE, Protocol,
};

/// Discovery request command.
pub const DEVICE_DISCOVER: u32 = 1;
/// Size of a discovery reply.
pub const DISCOVERY_REPLY_SIZE: usize = 4 + MAX_MX_ID_SIZE + 4;

fn encode_reply(mxid: &str, state: DeviceState) -> BytesMut {
    let mut buf = BytesMut::with_capacity(DISCOVERY_REPLY_SIZE);
    buf.put_u32_le(DEVICE_DISCOVER);
    let mut field = [0u8; MAX_MX_ID_SIZE];
    let n = mxid.len().min(MAX_MX_ID_SIZE - 1);
    field[..n].copy_from_slice(&mxid.as_bytes()[..n]);
    buf.put_slice(&field);
    buf.put_u32_le(state as u32);
    buf
}

/// Parse a discovery reply into `(mxid, state)`. Malformed replies are `None`.
fn decode_reply(mut buf: &[u8]) -> Option<(String, DeviceState)> {
    if buf.len() < DISCOVERY_REPLY_SIZE || buf.get_u32_le() != DEVICE_DISCOVER {
        return None;
    }
    let field = &buf[..MAX_MX_ID_SIZE];
    let end = field.iter().position(|&b| b == 0).unwrap_or(MAX_MX_ID_SIZE);
    let mxid = String::from_utf8_lossy(&field[..end]).into_owned();
    buf.advance(MAX_MX_ID_SIZE);
    let state = DeviceState::try_from(buf.get_u32_le()).ok()?;
    Some((mxid, state))
}

// ── Host side ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TcpPlatform {
    config: TcpConfig,
}

impl TcpPlatform {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    async fn probe_addresses(&self) -> Vec<SocketAddr> {
        if self.config.targets.is_empty() {
            return vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                self.config.discovery_port,
            )];
        }
        let mut addrs = Vec::new();
        for target in &self.config.targets {
            match tokio::net::lookup_host((target.as_str(), self.config.discovery_port)).await {
                Ok(resolved) => addrs.extend(resolved.filter(SocketAddr::is_ipv4)),
                Err(e) => warn!(%target, error = %e, "cannot resolve discovery target"),
            }
        }
        addrs
    }
}

#[async_trait]
impl Platform for TcpPlatform {
    fn protocol(&self) -> Protocol {
        Protocol::TcpIp
    }

    async fn find_devices(
        &self,
        req: &DeviceRequirements,
    ) -> Result<Vec<DeviceDesc>, PlatformError> {
        if !matches!(req.protocol, Protocol::Any | Protocol::TcpIp) {
            return Ok(Vec::new());
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let probe = DEVICE_DISCOVER.to_le_bytes();
        for addr in self.probe_addresses().await {
            if let Err(e) = socket.send_to(&probe, addr).await {
                debug!(%addr, error = %e, "discovery probe failed");
            }
        }

        // Keyed by name so a device answering twice is listed once.
        let mut found = BTreeMap::new();
        let deadline = tokio::time::Instant::now() + self.config.discovery_timeout();
        let mut buf = [0u8; 512];
        loop {
            let (n, peer) =
                match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Ok(r) => r?,
                    Err(_) => break,
                };
            let Some((mxid, state)) = decode_reply(&buf[..n]) else {
                debug!(%peer, len = n, "ignoring malformed discovery reply");
                continue;
            };
            let name = SocketAddr::new(peer.ip(), self.config.link_port).to_string();
            let desc = DeviceDesc::new(Protocol::TcpIp, ChipPlatform::MyriadX, &name, state, &mxid);
            if desc.matches(req) {
                found.insert(name, desc);
            }
        }
        Ok(found.into_values().collect())
    }

    async fn connect(&self, desc: &DeviceDesc) -> Result<DeviceHandle, PlatformError> {
        let addr: SocketAddr = desc
            .name
            .parse()
            .map_err(|_| PlatformError::InvalidParameters(format!("bad address {}", desc.name)))?;
        let stream = match TcpStream::connect(addr).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(PlatformError::DeviceNotFound);
            }
            Err(e) => return Err(e.into()),
        };
        stream.set_nodelay(true)?;
        debug!(%addr, "tcp link connected");
        Ok(DeviceHandle::from_stream(desc.clone(), stream))
    }

    async fn boot_firmware(&self, _desc: &DeviceDesc, _image: &[u8]) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("firmware boot over TCP/IP"))
    }

    async fn boot_bootloader(&self, _desc: &DeviceDesc) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("bootloader entry over TCP/IP"))
    }
}

// ── Device side ──────────────────────────────────────────────────

/// Device end of the TCP/IP platform: answers discovery and accepts links.
pub struct TcpDeviceListener {
    listener: TcpListener,
    discovery_addr: SocketAddr,
    responder: JoinHandle<()>,
    link_config: LinkConfig,
    mxid: String,
}

impl TcpDeviceListener {
    /// Bind the link and discovery ports on `ip`. Port 0 picks a free port.
    pub async fn bind(
        ip: IpAddr,
        link_port: u16,
        discovery_port: u16,
        mxid: &str,
        state: DeviceState,
    ) -> Result<Self> {
        let listener = TcpListener::bind((ip, link_port)).await?;
        let udp = UdpSocket::bind((ip, discovery_port)).await?;
        let discovery_addr = udp.local_addr()?;
        let reply = encode_reply(mxid, state).freeze();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (n, peer) = match udp.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "discovery socket failed");
                        return;
                    }
                };
                if n >= 4 && buf[..4] == DEVICE_DISCOVER.to_le_bytes() {
                    if let Err(e) = udp.send_to(&reply, peer).await {
                        debug!(%peer, error = %e, "discovery reply failed");
                    }
                }
            }
        });

        info!(link = %listener.local_addr()?, discovery = %discovery_addr, %mxid, "tcp device listening");
        Ok(Self {
            listener,
            discovery_addr,
            responder,
            link_config: LinkConfig::default(),
            mxid: mxid.to_string(),
        })
    }

    pub fn with_link_config(mut self, config: LinkConfig) -> Self {
        self.link_config = config;
        self
    }

    pub fn link_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    /// Accept the next host connection as a device-role link.
    pub async fn accept(&self) -> Result<Link> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let desc = DeviceDesc::new(
            Protocol::TcpIp,
            ChipPlatform::MyriadX,
            &peer.to_string(),
            DeviceState::Booted,
            &self.mxid,
        );
        info!(%peer, "host connected");
        Ok(Link::start(
            DeviceHandle::from_stream(desc, stream),
            LinkId(0),
            LinkRole::Device,
            self.link_config.clone(),
        ))
    }
}

impl Drop for TcpDeviceListener {
    fn drop(&mut self) {
        self.responder.abort();
    }
}

impl std::fmt::Debug for TcpDeviceListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpDeviceListener")
            .field("discovery_addr", &self.discovery_addr)
            .field("mxid", &self.mxid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_layout() {
        let reply = encode_reply("18443010C1A5C31200", DeviceState::Bootloader);
        assert_eq!(reply.len(), DISCOVERY_REPLY_SIZE);
        assert_eq!(&reply[..4], &1u32.to_le_bytes());
        assert_eq!(&reply[36..], &3u32.to_le_bytes());

        let (mxid, state) = decode_reply(&reply).unwrap();
        assert_eq!(mxid, "18443010C1A5C31200");
        assert_eq!(state, DeviceState::Bootloader);
    }

    #[test]
    fn malformed_replies_are_dropped() {
        assert!(decode_reply(&[1, 0, 0, 0]).is_none());

        let mut wrong_cmd = encode_reply("X", DeviceState::Booted);
        wrong_cmd[0] = 9;
        assert!(decode_reply(&wrong_cmd).is_none());

        let mut bad_state = encode_reply("X", DeviceState::Booted);
        bad_state[36] = 0x7F;
        assert!(decode_reply(&bad_state).is_none());
    }

    #[tokio::test]
    async fn other_protocols_skip_discovery() {
        let platform = TcpPlatform::default();
        let req = DeviceRequirements::default().with_protocol(Protocol::Ipc);
        assert!(platform.find_devices(&req).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn boot_is_unsupported() {
        let platform = TcpPlatform::default();
        let desc = DeviceDesc::new(
            Protocol::TcpIp,
            ChipPlatform::MyriadX,
            "127.0.0.1:11490",
            DeviceState::Unbooted,
            "",
        );
        assert!(matches!(
            platform.boot_firmware(&desc, b"fw").await,
            Err(PlatformError::Unsupported(_))
        ));
    }
}
