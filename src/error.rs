//! Error Model
//!
//! A single closed set of error kinds shared by every subsystem. RPC
//! responses carry the numeric code of the kind plus the human-readable
//! message, so the set is part of the wire contract and must stay stable.
//!
//! | Kind | Meaning |
//! |------|---------|
//! | `InvalidValue` | property value or container name fails validation |
//! | `InvalidProperty` / `InvalidData` | unknown key |
//! | `InvalidState` | operation not allowed in the current state |
//! | `InvalidCommand` / `InvalidPath` | exec target is unusable |
//! | `ContainerDoesNotExist` / `ContainerAlreadyExists` | registry lookups |
//! | `Permission` | caller lacks rights for the target |
//! | `ResourceNotAvailable` | id pool full, guarantees over-subscribed |
//! | `NotSupported` | kernel lacks the required feature |
//! | `VolumeNotFound` / `VolumeAlreadyExists` | volume subsystem passthrough |
//! | `Unknown` | bugs and unmapped kernel errors |

use std::fmt;
use std::io;

use thiserror::Error;

/// Closed enum of error categories.
///
/// The discriminants are the on-wire error codes; `Success` is what a
/// response carries when there is nothing to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum ErrorKind {
    Success = 0,
    Unknown = 1,
    InvalidValue = 2,
    InvalidProperty = 3,
    InvalidData = 4,
    InvalidState = 5,
    InvalidCommand = 6,
    InvalidPath = 7,
    ContainerDoesNotExist = 8,
    ContainerAlreadyExists = 9,
    Permission = 10,
    ResourceNotAvailable = 11,
    NotSupported = 12,
    VolumeNotFound = 13,
    VolumeAlreadyExists = 14,
}

impl ErrorKind {
    /// Numeric wire code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Reverse of [`code`](Self::code); unmapped codes collapse to `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ErrorKind::Success,
            2 => ErrorKind::InvalidValue,
            3 => ErrorKind::InvalidProperty,
            4 => ErrorKind::InvalidData,
            5 => ErrorKind::InvalidState,
            6 => ErrorKind::InvalidCommand,
            7 => ErrorKind::InvalidPath,
            8 => ErrorKind::ContainerDoesNotExist,
            9 => ErrorKind::ContainerAlreadyExists,
            10 => ErrorKind::Permission,
            11 => ErrorKind::ResourceNotAvailable,
            12 => ErrorKind::NotSupported,
            13 => ErrorKind::VolumeNotFound,
            14 => ErrorKind::VolumeAlreadyExists,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Success => "Success",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidValue => "InvalidValue",
            ErrorKind::InvalidProperty => "InvalidProperty",
            ErrorKind::InvalidData => "InvalidData",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::InvalidCommand => "InvalidCommand",
            ErrorKind::InvalidPath => "InvalidPath",
            ErrorKind::ContainerDoesNotExist => "ContainerDoesNotExist",
            ErrorKind::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorKind::Permission => "Permission",
            ErrorKind::ResourceNotAvailable => "ResourceNotAvailable",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::VolumeNotFound => "VolumeNotFound",
            ErrorKind::VolumeAlreadyExists => "VolumeAlreadyExists",
        };
        f.write_str(name)
    }
}

/// An error kind with context.
///
/// `errno` is kept when the error originates from a syscall so that
/// `start_errno` and log lines can surface the raw value.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub errno: Option<i32>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: None,
        }
    }

    pub fn with_errno(kind: ErrorKind, errno: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            errno: Some(errno),
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn no_container(name: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::ContainerDoesNotExist,
            format!("container {} does not exist", name),
        )
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            io::ErrorKind::NotFound => ErrorKind::InvalidPath,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            message: e.to_string(),
            errno: e.raw_os_error(),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        let kind = match e {
            nix::Error::EPERM | nix::Error::EACCES => ErrorKind::Permission,
            nix::Error::ENOENT => ErrorKind::InvalidPath,
            nix::Error::ENOSYS | nix::Error::EOPNOTSUPP => ErrorKind::NotSupported,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            message: e.desc().to_string(),
            errno: Some(e as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for kind in [
            ErrorKind::Success,
            ErrorKind::Unknown,
            ErrorKind::InvalidValue,
            ErrorKind::InvalidProperty,
            ErrorKind::InvalidData,
            ErrorKind::InvalidState,
            ErrorKind::InvalidCommand,
            ErrorKind::InvalidPath,
            ErrorKind::ContainerDoesNotExist,
            ErrorKind::ContainerAlreadyExists,
            ErrorKind::Permission,
            ErrorKind::ResourceNotAvailable,
            ErrorKind::NotSupported,
            ErrorKind::VolumeNotFound,
            ErrorKind::VolumeAlreadyExists,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn test_unmapped_code_is_unknown() {
        assert_eq!(ErrorKind::from_code(999), ErrorKind::Unknown);
    }

    #[test]
    fn test_io_error_mapping() {
        let e: Error = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(e.kind(), ErrorKind::Permission);

        let e: Error = io::Error::from(io::ErrorKind::NotFound).into();
        assert_eq!(e.kind(), ErrorKind::InvalidPath);
    }

    #[test]
    fn test_display_carries_message() {
        let e = Error::invalid_value("memory_limit too small");
        assert!(e.to_string().contains("InvalidValue"));
        assert!(e.to_string().contains("memory_limit too small"));
    }
}
