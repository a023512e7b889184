//! Error types for the link layer.
//!
//! Every fallible operation returns `Result<T, XLinkError>`. Transport
//! adapters report the narrower [`PlatformError`], which converts into the
//! link taxonomy without losing its category.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type of the link layer.
#[derive(Debug, Error)]
pub enum XLinkError {
    // ── Link taxonomy ────────────────────────────────────────────
    /// No device matched the requested filter.
    #[error("no matching device found")]
    NotFound,

    /// The stream or device is already open in a conflicting way.
    #[error("already open: {0}")]
    AlreadyOpen(String),

    /// The link or stream is not open (never opened, closed or deallocated).
    #[error("communication not open")]
    CommunicationNotOpen,

    /// The transport failed mid-session. The link must be reconnected.
    #[error("communication failure: {0}")]
    CommunicationFailure(String),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A bounded resource (stream table, packet pool) is exhausted.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    /// The OS refused access to the device.
    #[error("insufficient permissions")]
    InsufficientPermissions,

    /// The operation is not supported by this platform or peer.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Generic failure with a human-readable message.
    #[error("{0}")]
    Error(String),

    // ── Protocol errors ──────────────────────────────────────────
    /// Received bytes that do not start with the link magic.
    #[error("invalid magic bytes: expected XLNK")]
    InvalidMagic,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A message or state transition violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The stream name is empty or does not fit the wire field.
    #[error("invalid stream name {name:?} (max {max} bytes)")]
    InvalidStreamName { name: String, max: usize },

    /// A write does not fit the remote stream buffer.
    #[error("write of {size} bytes exceeds stream buffer of {capacity} bytes")]
    SizeTooBig { size: usize, capacity: usize },

    /// A frame on the wire exceeds the configured limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A record was shorter than its fixed layout.
    #[error("truncated {what}: expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The peer speaks an older bootloader protocol than required.
    #[error("{request} requires bootloader {required}, device runs {actual}")]
    UnsupportedVersion {
        request: &'static str,
        required: String,
        actual: String,
    },

    /// Encoding or decoding of a metadata blob failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Error reported by the transport platform.
    #[error("platform error: {0}")]
    Platform(#[source] PlatformError),

    /// Raw I/O error outside of a platform adapter.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ── PlatformError ────────────────────────────────────────────────

/// Errors reported by a transport platform adapter.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("device not found")]
    DeviceNotFound,

    #[error("driver not loaded")]
    DriverNotLoaded,

    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("platform timeout")]
    Timeout,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("unsupported by this platform: {0}")]
    Unsupported(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PlatformError> for XLinkError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::DeviceNotFound => XLinkError::NotFound,
            PlatformError::InsufficientPermissions => XLinkError::InsufficientPermissions,
            PlatformError::Unsupported(what) => XLinkError::NotImplemented(what.to_string()),
            other => XLinkError::Platform(other),
        }
    }
}

// ── Status codes ─────────────────────────────────────────────────

/// Numeric status codes of the link API.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XLinkStatus {
    Success = 0,
    AlreadyOpen,
    CommunicationNotOpen,
    CommunicationFail,
    CommunicationUnknownError,
    DeviceNotFound,
    Timeout,
    Error,
    OutOfMemory,
    InsufficientPermissions,
    NotImplemented,
}

impl XLinkError {
    /// Collapse this error into the status code enumeration.
    pub fn status(&self) -> XLinkStatus {
        match self {
            XLinkError::NotFound => XLinkStatus::DeviceNotFound,
            XLinkError::AlreadyOpen(_) => XLinkStatus::AlreadyOpen,
            XLinkError::CommunicationNotOpen => XLinkStatus::CommunicationNotOpen,
            XLinkError::CommunicationFailure(_) | XLinkError::Io(_) => {
                XLinkStatus::CommunicationFail
            }
            XLinkError::Timeout(_) => XLinkStatus::Timeout,
            XLinkError::OutOfMemory(_) => XLinkStatus::OutOfMemory,
            XLinkError::InsufficientPermissions => XLinkStatus::InsufficientPermissions,
            XLinkError::NotImplemented(_) | XLinkError::UnsupportedVersion { .. } => {
                XLinkStatus::NotImplemented
            }
            XLinkError::Platform(p) => match p {
                PlatformError::DeviceNotFound => XLinkStatus::DeviceNotFound,
                PlatformError::InsufficientPermissions => XLinkStatus::InsufficientPermissions,
                PlatformError::Timeout => XLinkStatus::Timeout,
                PlatformError::Io(_) => XLinkStatus::CommunicationFail,
                PlatformError::DriverNotLoaded => XLinkStatus::CommunicationUnknownError,
                _ => XLinkStatus::Error,
            },
            _ => XLinkStatus::Error,
        }
    }

    /// Returns `true` for errors that leave the link unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XLinkError::CommunicationFailure(_) | XLinkError::Io(_) | XLinkError::Platform(_)
        )
    }
}

impl From<String> for XLinkError {
    fn from(s: String) -> Self {
        XLinkError::Error(s)
    }
}

impl From<&str> for XLinkError {
    fn from(s: &str) -> Self {
        XLinkError::Error(s.to_string())
    }
}

impl From<serde_json::Error> for XLinkError {
    fn from(e: serde_json::Error) -> Self {
        XLinkError::Encoding(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for XLinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        XLinkError::CommunicationFailure("link writer closed".into())
    }
}

pub type Result<T, E = XLinkError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = XLinkError::InvalidMagic;
        assert!(e.to_string().contains("magic"));

        let e = XLinkError::SizeTooBig {
            size: 1000,
            capacity: 512,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("512"));
    }

    #[test]
    fn platform_errors_keep_their_category() {
        let e: XLinkError = PlatformError::DeviceNotFound.into();
        assert!(matches!(e, XLinkError::NotFound));

        let e: XLinkError = PlatformError::InsufficientPermissions.into();
        assert_eq!(e.status(), XLinkStatus::InsufficientPermissions);

        let e: XLinkError = PlatformError::Timeout.into();
        assert_eq!(e.status(), XLinkStatus::Timeout);

        let e: XLinkError = PlatformError::Unsupported("rom boot").into();
        assert_eq!(e.status(), XLinkStatus::NotImplemented);
    }

    #[test]
    fn exhaustion_is_not_fatal() {
        assert!(!XLinkError::OutOfMemory("stream table").is_fatal());
        assert!(XLinkError::CommunicationFailure("eof".into()).is_fatal());
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: XLinkError = io_err.into();
        assert_eq!(e.status(), XLinkStatus::CommunicationFail);
    }
}
