//! GATT status codes
//!
//! Statuses reported by the peripheral service in completion events, using the host
//! stack's numeric codes.

use std::fmt;

pub const GATT_SUCCESS: u16 = 0x0000;
pub const GATT_READ_NOT_PERMITTED: u16 = 0x0002;
pub const GATT_WRITE_NOT_PERMITTED: u16 = 0x0003;
pub const GATT_INSUFFICIENT_AUTHENTICATION: u16 = 0x0005;
pub const GATT_INVALID_OFFSET: u16 = 0x0007;
pub const GATT_INSUFFICIENT_AUTHORIZATION: u16 = 0x0008;
pub const GATT_INVALID_ATTRIBUTE_LENGTH: u16 = 0x000D;
pub const GATT_INSUFFICIENT_ENCRYPTION: u16 = 0x000F;
pub const GATT_CONNECTION_CONGESTED: u16 = 0x008F;
pub const GATT_CONNECTION_TIMEOUT: u16 = 0x0093;
pub const GATT_WRITE_REQUEST_BUSY: u16 = 0x00C9;
pub const GATT_FAILURE: u16 = 0x0101;

/// Outcome of a remote attribute operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    InsufficientAuthentication,
    InsufficientEncryption,
    InsufficientAuthorization,
    InvalidOffset,
    InvalidAttributeLength,
    ConnectionCongested,
    ConnectionTimeout,
    /// Kept so the host-stack code round-trips through `u16`; a busy write submission
    /// surfaces as `GattError::WriteRequestBusy` instead
    WriteRequestBusy,
    /// Generic failure
    Failure,
    /// Any other code, passed through untouched
    Other(u16),
}

impl GattStatus {
    pub fn is_success(&self) -> bool {
        *self == GattStatus::Success
    }

    /// Whether the failure can be cured by resubmitting with a stronger security
    /// requirement.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            GattStatus::InsufficientAuthentication | GattStatus::InsufficientEncryption
        )
    }
}

impl From<u16> for GattStatus {
    fn from(code: u16) -> Self {
        match code {
            GATT_SUCCESS => GattStatus::Success,
            GATT_READ_NOT_PERMITTED => GattStatus::ReadNotPermitted,
            GATT_WRITE_NOT_PERMITTED => GattStatus::WriteNotPermitted,
            GATT_INSUFFICIENT_AUTHENTICATION => GattStatus::InsufficientAuthentication,
            GATT_INVALID_OFFSET => GattStatus::InvalidOffset,
            GATT_INSUFFICIENT_AUTHORIZATION => GattStatus::InsufficientAuthorization,
            GATT_INVALID_ATTRIBUTE_LENGTH => GattStatus::InvalidAttributeLength,
            GATT_INSUFFICIENT_ENCRYPTION => GattStatus::InsufficientEncryption,
            GATT_CONNECTION_CONGESTED => GattStatus::ConnectionCongested,
            GATT_CONNECTION_TIMEOUT => GattStatus::ConnectionTimeout,
            GATT_WRITE_REQUEST_BUSY => GattStatus::WriteRequestBusy,
            GATT_FAILURE => GattStatus::Failure,
            other => GattStatus::Other(other),
        }
    }
}

impl From<GattStatus> for u16 {
    fn from(status: GattStatus) -> Self {
        match status {
            GattStatus::Success => GATT_SUCCESS,
            GattStatus::ReadNotPermitted => GATT_READ_NOT_PERMITTED,
            GattStatus::WriteNotPermitted => GATT_WRITE_NOT_PERMITTED,
            GattStatus::InsufficientAuthentication => GATT_INSUFFICIENT_AUTHENTICATION,
            GattStatus::InvalidOffset => GATT_INVALID_OFFSET,
            GattStatus::InsufficientAuthorization => GATT_INSUFFICIENT_AUTHORIZATION,
            GattStatus::InvalidAttributeLength => GATT_INVALID_ATTRIBUTE_LENGTH,
            GattStatus::InsufficientEncryption => GATT_INSUFFICIENT_ENCRYPTION,
            GattStatus::ConnectionCongested => GATT_CONNECTION_CONGESTED,
            GattStatus::ConnectionTimeout => GATT_CONNECTION_TIMEOUT,
            GattStatus::WriteRequestBusy => GATT_WRITE_REQUEST_BUSY,
            GattStatus::Failure => GATT_FAILURE,
            GattStatus::Other(code) => code,
        }
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattStatus::Other(code) => write!(f, "status 0x{:04X}", code),
            named => write!(f, "{:?} (0x{:04X})", named, u16::from(*named)),
        }
    }
}
