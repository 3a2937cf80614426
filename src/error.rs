//! Error types for auricle

use thiserror::Error;

/// Error codes latched on a device (or process-wide when no device is
/// involved) and read back with [`crate::Device::get_error`] /
/// [`crate::null_device_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0,
    InvalidDevice = 0xA001,
    InvalidContext = 0xA002,
    InvalidEnum = 0xA003,
    InvalidValue = 0xA004,
    OutOfMemory = 0xA005,
}

impl ErrorCode {
    pub fn raw(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_raw(raw: u32) -> ErrorCode {
        match raw {
            0xA001 => ErrorCode::InvalidDevice,
            0xA002 => ErrorCode::InvalidContext,
            0xA003 => ErrorCode::InvalidEnum,
            0xA004 => ErrorCode::InvalidValue,
            0xA005 => ErrorCode::OutOfMemory,
            _ => ErrorCode::NoError,
        }
    }
}

#[derive(Error, Debug)]
pub enum AuricleError {
    #[error("invalid device handle")]
    InvalidDevice,

    #[error("invalid context handle")]
    InvalidContext,

    #[error("invalid enum {0:#06x}")]
    InvalidEnum(i32),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuricleError {
    /// The code latched on the device for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuricleError::InvalidDevice => ErrorCode::InvalidDevice,
            AuricleError::InvalidContext => ErrorCode::InvalidContext,
            AuricleError::InvalidEnum(_) => ErrorCode::InvalidEnum,
            AuricleError::InvalidValue(_) => ErrorCode::InvalidValue,
            AuricleError::OutOfMemory => ErrorCode::OutOfMemory,
            AuricleError::Backend(_) => ErrorCode::InvalidDevice,
            AuricleError::Configuration(_) => ErrorCode::InvalidValue,
            AuricleError::Io(_) => ErrorCode::InvalidDevice,
        }
    }
}

pub type Result<T> = std::result::Result<T, AuricleError>;
