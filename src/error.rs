//! Error kinds surfaced by the core transport stack.

use thiserror::Error;

/// Looks up the human-readable meaning of a device error code in `[0x8000, 0x9000)`.
///
/// Returns `None` for a code in range that this driver does not recognize;
/// callers should fall back to [`TseError::UnknownDeviceError`] in that case.
pub fn device_error_message(code: u16) -> Option<&'static str> {
    Some(match code {
        0x8000 => "SE communication failed",
        0x8001 => "command data invalid",
        0x8002 => "response data invalid",
        0x8003 => "signing of operation data failed",
        0x8004 => "retrieve log message failed",
        0x8005 => "storage failure",
        0x8006 => "secure element disabled",
        0x8007 => "user not authorized",
        0x8008 => "user not authenticated",
        0x8009 => "API not initialized",
        0x800A => "update time failed",
        0x800B => "user id not managed",
        0x800C => "start transaction failed",
        0x800D => "certificate expired",
        0x800E => "no transaction",
        0x800F => "update transaction failed",
        0x8010 => "finish transaction failed",
        0x8011 => "time not set",
        0x8012 => "no ERS",
        0x8013 => "no key",
        0x8014 => "API not deactivated",
        0x8015 => "no data available",
        0x8016 => "too many records",
        0x8017 => "unexported stored data",
        0x8018 => "parameter mismatch",
        0x8019 => "id not found",
        0x801A => "transaction number not found",
        0x801B => "API deactivated",
        0x801C => "transport",
        0x801D => "no startup",
        0x801E => "no storage",
        _ => return None,
    })
}

/// Errors produced by the block adapter, MSC transport, and command transport.
#[derive(Debug, Error)]
pub enum TseError {
    /// The readiness-poll deadline was reached before the device produced a reply.
    #[error("timed out waiting for the device to respond")]
    Timeout,

    /// A framing invariant was violated: header mismatch, bad token, inconsistent
    /// length, unknown typed-parameter tag, or a misaligned LONG_ARRAY body.
    #[error("framing error: {0}")]
    Framing(String),

    /// The block adapter's underlying read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device returned an inner response in `[0x8000, 0x9000)` that this
    /// driver recognizes.
    #[error("device error 0x{code:04X}: {message}")]
    DeviceError { code: u16, message: &'static str },

    /// The device returned an inner response in `[0x8000, 0x9000)` with a code
    /// this driver does not recognize.
    #[error("unknown device error 0x{code:04X}")]
    UnknownDeviceError { code: u16 },
}

impl TseError {
    /// Builds a [`TseError::DeviceError`] or [`TseError::UnknownDeviceError`]
    /// from a raw inner-response error code.
    pub fn from_device_code(code: u16) -> TseError {
        match device_error_message(code) {
            Some(message) => TseError::DeviceError { code, message },
            None => TseError::UnknownDeviceError { code },
        }
    }
}

pub type Result<T> = std::result::Result<T, TseError>;
