//! Device lifecycle state machine.
//!
//! Transitions are validated and return `Result` instead of panicking, so a
//! command issued in the wrong phase is rejected at the protocol layer.

use std::time::Instant;

use crate::error::XLinkError;

// ── DevicePhase ──────────────────────────────────────────────────

/// The current phase of a device handle.
///
/// ```text
///  Unbooted ──► Connecting ──► Bootloader ──┐
///                   │                       ├──► Disconnected
///                   └────────► Booted ──► Active
///
///  any ──► Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DevicePhase {
    /// Found but not yet connected. Initial state.
    #[default]
    Unbooted,

    /// Transport being opened.
    Connecting,

    /// Connected to the bootloader; bootloader requests are allowed.
    Bootloader,

    /// Connected to booted firmware, link not yet verified.
    Booted,

    /// Link verified; streams may be opened.
    Active {
        /// When the device entered `Active`.
        since: Instant,
    },

    /// Torn down. Terminal.
    Disconnected,

    /// Connect failed. Terminal: the handle is dropped and a retry starts
    /// from a fresh `Unbooted` phase.
    Failed { reason: String },
}

impl std::fmt::Display for DevicePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unbooted => write!(f, "Unbooted"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Bootloader => write!(f, "Bootloader"),
            Self::Booted => write!(f, "Booted"),
            Self::Active { .. } => write!(f, "Active"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed { reason } => write!(f, "Failed ({reason})"),
        }
    }
}

impl DevicePhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_bootloader(&self) -> bool {
        matches!(self, Self::Bootloader)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed { .. })
    }

    /// How long the device has been `Active`.
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Active { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Unbooted`.
    pub fn begin_connect(&mut self) -> Result<(), XLinkError> {
        match self {
            Self::Unbooted => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(XLinkError::ProtocolViolation(
                "cannot connect: device not in Unbooted phase",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn enter_bootloader(&mut self) -> Result<(), XLinkError> {
        match self {
            Self::Connecting => {
                *self = Self::Bootloader;
                Ok(())
            }
            _ => Err(XLinkError::ProtocolViolation(
                "cannot enter bootloader: not connecting",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn enter_booted(&mut self) -> Result<(), XLinkError> {
        match self {
            Self::Connecting => {
                *self = Self::Booted;
                Ok(())
            }
            _ => Err(XLinkError::ProtocolViolation(
                "cannot enter booted: not connecting",
            )),
        }
    }

    /// Valid from: `Booted`.
    pub fn activate(&mut self) -> Result<(), XLinkError> {
        match self {
            Self::Booted => {
                *self = Self::Active {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(XLinkError::ProtocolViolation(
                "cannot activate: device not booted",
            )),
        }
    }

    /// Valid from: `Bootloader`, `Active`, `Booted`.
    pub fn disconnect(&mut self) -> Result<(), XLinkError> {
        match self {
            Self::Bootloader | Self::Booted | Self::Active { .. } => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(XLinkError::ProtocolViolation(
                "cannot disconnect: device not connected",
            )),
        }
    }

    /// Record an unrecoverable failure, whatever the current phase.
    pub fn fail(&mut self, reason: impl Into<String>) {
        *self = Self::Failed {
            reason: reason.into(),
        };
    }

    /// Force the phase to `Disconnected` after a full teardown.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }

    /// Reject anything but the bootloader phase.
    pub fn require_bootloader(&self) -> Result<(), XLinkError> {
        match self {
            Self::Bootloader => Ok(()),
            _ => Err(XLinkError::ProtocolViolation(
                "bootloader requests need a device in Bootloader phase",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_path() {
        let mut p = DevicePhase::default();
        p.begin_connect().unwrap();
        p.enter_booted().unwrap();
        p.activate().unwrap();
        assert!(p.is_active());
        assert!(p.active_duration().is_some());
        p.disconnect().unwrap();
        assert!(p.is_terminal());
    }

    #[test]
    fn bootloader_path_rejects_activation() {
        let mut p = DevicePhase::default();
        p.begin_connect().unwrap();
        p.enter_bootloader().unwrap();
        assert!(p.require_bootloader().is_ok());
        assert!(p.activate().is_err());
        assert_eq!(p, DevicePhase::Bootloader);
    }

    #[test]
    fn invalid_transitions_leave_phase_untouched() {
        let mut p = DevicePhase::default();
        assert!(p.enter_booted().is_err());
        assert!(p.disconnect().is_err());
        assert!(p.require_bootloader().is_err());
        assert_eq!(p, DevicePhase::Unbooted);
    }

    #[test]
    fn failure_is_terminal_until_forced() {
        let mut p = DevicePhase::Connecting;
        p.fail("ping timeout");
        assert!(p.is_terminal());
        assert!(p.begin_connect().is_err());
        assert_eq!(p.to_string(), "Failed (ping timeout)");
        p.force_disconnect();
        assert_eq!(p, DevicePhase::Disconnected);
    }
}
