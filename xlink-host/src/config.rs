//! Configuration for the host tool.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use xlink_core::{Session, SessionConfig, TcpConfig, TcpPlatform};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Transports to search.
    pub platforms: PlatformsConfig,
    /// Discovery, boot and link tunables.
    pub session: SessionConfig,
    /// TCP/IP discovery settings.
    pub tcp: TcpConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Which transports the session registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    /// USB bulk transport. Needs the `usb` feature.
    pub usb: bool,
    pub tcp: bool,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            usb: true,
            tcp: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = Self::default().to_toml().map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Build a session with every enabled platform registered.
    pub fn session(&self) -> Session {
        let mut session = Session::new(self.session.clone());
        if self.platforms.tcp {
            session = session.with_platform(Arc::new(TcpPlatform::new(self.tcp.clone())));
        }
        #[cfg(feature = "usb")]
        if self.platforms.usb {
            session = session.with_platform(Arc::new(xlink_core::platform::UsbPlatform));
        }
        #[cfg(not(feature = "usb"))]
        if self.platforms.usb {
            tracing::debug!("usb platform requested but not compiled in");
        }
        session
    }
}

// ── Tests ────────────────────────────────────────────────────────
