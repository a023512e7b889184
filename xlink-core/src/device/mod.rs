//! Device discovery, boot and connection.
//!
//! A [`Session`] owns the transport platforms and the link id space. It
//! finds devices, boots them and connects, handing out [`Device`]s whose
//! [`DevicePhase`] decides which operations are allowed.

pub mod phase;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::bootloader::BootloaderClient;
use crate::config::SessionConfig;
use crate::error::{PlatformError, Result, XLinkError};
use crate::link::{Link, LinkProfile, LinkRole};
use crate::platform::Platform;
use crate::types::{DeviceDesc, DeviceRequirements, DeviceState, LinkId, MAX_LINKS, Protocol, UsbSpeed};

pub use phase::DevicePhase;

// ── Link id allocation ───────────────────────────────────────────

/// A claimed link id, returned to the session on drop.
#[derive(Debug)]
struct LinkSlot {
    id: LinkId,
    used: Arc<AtomicU32>,
}

impl Drop for LinkSlot {
    fn drop(&mut self) {
        self.used.fetch_and(!(1u32 << self.id.0), Ordering::AcqRel);
    }
}

fn claim_link_id(used: &Arc<AtomicU32>) -> Result<LinkSlot> {
    let prev = used
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |mask| {
            let free = (!mask).trailing_zeros();
            (free < MAX_LINKS as u32).then(|| mask | (1 << free))
        })
        .map_err(|_| XLinkError::OutOfMemory("link table"))?;
    Ok(LinkSlot {
        id: LinkId((!prev).trailing_zeros() as u8),
        used: used.clone(),
    })
}

fn retryable(e: &XLinkError) -> bool {
    match e {
        XLinkError::Platform(PlatformError::InvalidParameters(_)) => false,
        XLinkError::CommunicationFailure(_)
        | XLinkError::Timeout(_)
        | XLinkError::Io(_)
        | XLinkError::Platform(_) => true,
        _ => false,
    }
}

// ── Session ──────────────────────────────────────────────────────

pub struct Session {
    platforms: Vec<Arc<dyn Platform>>,
    config: SessionConfig,
    links: Arc<AtomicU32>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            platforms: Vec::new(),
            config,
            links: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platforms.push(platform);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of links currently held by [`Device`]s of this session.
    pub fn live_links(&self) -> usize {
        self.links.load(Ordering::Acquire).count_ones() as usize
    }

    fn platform_for(&self, protocol: Protocol) -> Result<&Arc<dyn Platform>> {
        self.platforms
            .iter()
            .find(|p| p.protocol() == protocol)
            .ok_or_else(|| XLinkError::NotImplemented(format!("no {protocol} platform")))
    }

    /// One discovery round across every platform the filter admits.
    async fn discover(&self, req: &DeviceRequirements) -> (Vec<DeviceDesc>, Option<PlatformError>) {
        let queries = self
            .platforms
            .iter()
            .filter(|p| req.protocol == Protocol::Any || p.protocol() == req.protocol)
            .map(|p| async move { (p.protocol(), p.find_devices(req).await) });

        let mut found = Vec::new();
        let mut last_err = None;
        for (protocol, result) in join_all(queries).await {
            match result {
                Ok(devices) => found.extend(devices),
                Err(e) => {
                    warn!(%protocol, error = %e, "discovery failed");
                    last_err = Some(e);
                }
            }
        }
        (found, last_err)
    }

    /// Every device matching `req`, retrying with backoff while none shows up.
    pub async fn find_all_devices(&self, req: &DeviceRequirements) -> Result<Vec<DeviceDesc>> {
        let attempts = self.config.discovery_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }
            let (found, err) = self.discover(req).await;
            if !found.is_empty() {
                debug!(count = found.len(), attempt, "devices found");
                return Ok(found);
            }
            last_err = err;
        }
        Err(last_err.map_or(XLinkError::NotFound, Into::into))
    }

    pub async fn find_device(&self, req: &DeviceRequirements) -> Result<DeviceDesc> {
        let mut found = self.find_all_devices(req).await?;
        Ok(found.remove(0))
    }

    /// Poll `desc`'s platform until the device reappears in `state`,
    /// giving up with `Timeout` after the boot timeout.
    pub async fn await_state(&self, desc: &DeviceDesc, state: DeviceState) -> Result<DeviceDesc> {
        let platform = self.platform_for(desc.protocol)?;
        let req = DeviceRequirements::same_device(desc).with_state(state);
        let timeout = self.config.boot_timeout();
        let deadline = tokio::time::Instant::now() + timeout;

        let mut attempt = 0;
        loop {
            match platform.find_devices(&req).await {
                Ok(mut found) if !found.is_empty() => return Ok(found.remove(0)),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "rediscovery failed"),
            }
            let wait = self.config.backoff(attempt);
            if tokio::time::Instant::now() + wait > deadline {
                return Err(XLinkError::Timeout(timeout));
            }
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Boot `image` on `desc` and return the device as it reappears booted.
    ///
    /// Unbooted devices are booted by their platform; bootloader devices
    /// receive the image through `BootMemory`.
    pub async fn boot_firmware(&self, desc: &DeviceDesc, image: &[u8]) -> Result<DeviceDesc> {
        let platform = self.platform_for(desc.protocol)?;
        let digest = blake3::hash(image);
        info!(device = %desc, firmware = %digest.to_hex(), size = image.len(), "booting firmware");

        let attempts = self.config.boot_attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = match desc.state {
                DeviceState::Bootloader | DeviceState::FlashBooted => {
                    self.boot_through_bootloader(desc, image).await
                }
                _ => platform.boot_firmware(desc, image).await.map_err(Into::into),
            };
            match result {
                Ok(()) => break,
                Err(e) if retryable(&e) && attempt + 1 < attempts => {
                    warn!(device = %desc.name, attempt, error = %e, "boot failed, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        self.await_state(desc, DeviceState::Booted).await
    }

    async fn boot_through_bootloader(&self, desc: &DeviceDesc, image: &[u8]) -> Result<()> {
        let device = self.connect(desc).await?;
        let client = device.bootloader().await?;
        client.boot_memory(image).await?;
        // The device closes the link once it has taken the whole image.
        tokio::time::timeout(self.config.boot_timeout(), device.link().closed())
            .await
            .map_err(|_| XLinkError::Timeout(self.config.boot_timeout()))
    }

    /// Move `desc` into its bootloader and return it as it reappears.
    pub async fn boot_bootloader(&self, desc: &DeviceDesc) -> Result<DeviceDesc> {
        if desc.state == DeviceState::Bootloader {
            return Ok(desc.clone());
        }
        self.platform_for(desc.protocol)?
            .boot_bootloader(desc)
            .await?;
        self.await_state(desc, DeviceState::Bootloader).await
    }

    /// Open a link to `desc` and verify it with a ping.
    pub async fn connect(&self, desc: &DeviceDesc) -> Result<Device> {
        let platform = self.platform_for(desc.protocol)?;
        let slot = claim_link_id(&self.links)?;
        let mut phase = DevicePhase::default();
        phase.begin_connect()?;

        let handle = match platform.connect(desc).await {
            Ok(h) => h,
            Err(e) => {
                phase.fail(e.to_string());
                warn!(device = %desc.name, %phase, "connect failed");
                return Err(e.into());
            }
        };
        let link = Link::start(handle, slot.id, LinkRole::Host, self.config.link.clone());
        match link.ping().await {
            Ok(rtt) => debug!(device = %desc.name, ?rtt, "link verified"),
            Err(e) => {
                link.close();
                phase.fail(e.to_string());
                warn!(device = %desc.name, %phase, "connect failed");
                return Err(e);
            }
        }

        match desc.state {
            DeviceState::Bootloader | DeviceState::FlashBooted => phase.enter_bootloader()?,
            _ => {
                phase.enter_booted()?;
                phase.activate()?;
            }
        }
        info!(device = %desc, link = %slot.id, %phase, "device connected");
        Ok(Device {
            link,
            phase,
            _slot: slot,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocols: Vec<Protocol> = self.platforms.iter().map(|p| p.protocol()).collect();
        f.debug_struct("Session")
            .field("platforms", &protocols)
            .field("live_links", &self.live_links())
            .finish_non_exhaustive()
    }
}

// ── Device ───────────────────────────────────────────────────────

/// A connected device. Dropping it closes its link.
#[derive(Debug)]
pub struct Device {
    link: Link,
    phase: DevicePhase,
    _slot: LinkSlot,
}

impl Device {
    pub fn phase(&self) -> &DevicePhase {
        &self.phase
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn desc(&self) -> &DeviceDesc {
        self.link.desc()
    }

    pub fn mx_serial(&self) -> &str {
        &self.link.desc().mxid
    }

    pub fn usb_speed(&self) -> UsbSpeed {
        self.link.usb_speed()
    }

    pub fn profile(&self) -> LinkProfile {
        self.link.profile()
    }

    /// Start a bootloader session. Only valid in the `Bootloader` phase.
    pub async fn bootloader(&self) -> Result<BootloaderClient> {
        self.phase.require_bootloader()?;
        BootloaderClient::open(self.link.clone()).await
    }

    /// Reset the remote end and tear the link down.
    pub async fn reset(&mut self) -> Result<()> {
        let result = self.link.reset_remote().await;
        self.phase.force_disconnect();
        info!(device = %self.link.desc().name, "device reset");
        result
    }

    /// Close the link without resetting the device.
    pub fn close(&mut self) {
        self.link.close();
        if self.phase.disconnect().is_err() {
            self.phase.force_disconnect();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::IpcPlatform;
    use tokio_test::{assert_err, assert_ok};

    fn quick_config() -> SessionConfig {
        SessionConfig {
            discovery_attempts: 2,
            retry_backoff_ms: 5,
            max_backoff_ms: 20,
            boot_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    #[test]
    fn link_ids_are_reused_after_release() {
        let used = Arc::new(AtomicU32::new(0));
        let a = claim_link_id(&used).unwrap();
        let b = claim_link_id(&used).unwrap();
        assert_eq!((a.id, b.id), (LinkId(0), LinkId(1)));
        drop(a);
        assert_eq!(claim_link_id(&used).unwrap().id, LinkId(0));
    }

    #[test]
    fn link_table_is_bounded() {
        let used = Arc::new(AtomicU32::new(0));
        let slots: Vec<_> = (0..MAX_LINKS).map(|_| claim_link_id(&used).unwrap()).collect();
        assert!(matches!(claim_link_id(&used), Err(XLinkError::OutOfMemory(_))));
        drop(slots);
        assert_eq!(used.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn discovery_gives_up_with_not_found() {
        let ipc = IpcPlatform::new();
        let session = Session::new(quick_config()).with_platform(Arc::new(ipc));
        let err = session
            .find_device(&DeviceRequirements::default())
            .await
            .unwrap_err();
        assert!(matches!(err, XLinkError::NotFound));
    }

    #[tokio::test]
    async fn missing_platform_is_not_implemented() {
        let session = Session::new(quick_config());
        let desc = DeviceDesc::new(
            Protocol::TcpIp,
            crate::types::ChipPlatform::MyriadX,
            "127.0.0.1:1",
            DeviceState::Booted,
            "",
        );
        assert!(matches!(
            session.connect(&desc).await,
            Err(XLinkError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn boot_then_connect_active() {
        let ipc = IpcPlatform::new();
        let mut fw = ipc.add_device("cam", "MX1", DeviceState::Unbooted).await;
        let session = Session::new(quick_config()).with_platform(Arc::new(ipc));

        let unbooted = session
            .find_device(&DeviceRequirements::default().with_state(DeviceState::Unbooted))
            .await
            .unwrap();
        assert_err!(session.connect(&unbooted).await);
        assert_eq!(session.live_links(), 0);

        let booted = session.boot_firmware(&unbooted, b"firmware image").await.unwrap();
        assert_eq!(booted.state, DeviceState::Booted);

        let device = session.connect(&booted).await.unwrap();
        let _firmware_end = fw.accept().await.unwrap();
        assert!(device.phase().is_active());
        assert_eq!(device.mx_serial(), "MX1");
        assert_eq!(session.live_links(), 1);
        assert!(matches!(
            device.bootloader().await,
            Err(XLinkError::ProtocolViolation(_))
        ));

        drop(device);
        assert_eq!(session.live_links(), 0);
    }

    #[tokio::test]
    async fn failed_connect_leaves_nothing_behind() {
        let ipc = IpcPlatform::new();
        let mut fw = ipc.add_device("cam", "MX4", DeviceState::Unbooted).await;
        let session = Session::new(quick_config()).with_platform(Arc::new(ipc));

        let desc = session.find_device(&DeviceRequirements::default()).await.unwrap();
        assert!(matches!(
            session.connect(&desc).await,
            Err(XLinkError::Platform(PlatformError::InvalidParameters(_)))
        ));
        assert_eq!(session.live_links(), 0);

        // A retry builds a fresh phase instead of inheriting the failure.
        let booted = session.boot_firmware(&desc, b"fw").await.unwrap();
        let device = session.connect(&booted).await.unwrap();
        let _firmware_end = fw.accept().await.unwrap();
        assert!(device.phase().is_active());
        assert_eq!(session.live_links(), 1);
    }

    #[tokio::test]
    async fn bootloader_device_boots_from_memory() {
        let ipc = IpcPlatform::new();
        let fw = ipc.add_device("cam", "MX2", DeviceState::Bootloader).await;
        let session = Session::new(quick_config()).with_platform(Arc::new(ipc));

        let desc = session
            .find_device(&DeviceRequirements::default().with_mxid("MX2"))
            .await
            .unwrap();
        let device = session.connect(&desc).await.unwrap();
        assert!(device.phase().is_bootloader());
        let client = assert_ok!(device.bootloader().await);
        assert!(client.version() >= crate::bootloader::Version::new(0, 0, 14));
        drop(client);
        drop(device);

        let booted = session.boot_firmware(&desc, &[7u8; 3000]).await.unwrap();
        assert_eq!(booted.state, DeviceState::Booted);
        assert_eq!(fw.firmware().await.unwrap(), Some(blake3::hash(&[7u8; 3000])));
    }

    #[tokio::test]
    async fn reset_disconnects() {
        let ipc = IpcPlatform::new();
        let mut fw = ipc.add_device("cam", "MX3", DeviceState::Booted).await;
        let session = Session::new(quick_config()).with_platform(Arc::new(ipc));

        let desc = session.find_device(&DeviceRequirements::default()).await.unwrap();
        let mut device = session.connect(&desc).await.unwrap();
        let remote = fw.accept().await.unwrap();

        assert_ok!(device.reset().await);
        assert_eq!(*device.phase(), DevicePhase::Disconnected);
        remote.closed().await;
        assert!(!remote.is_up());
    }
}
