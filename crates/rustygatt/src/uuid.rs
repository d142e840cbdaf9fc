//! Bluetooth UUIDs
//!
//! Attributes are identified by 128-bit UUIDs. SIG-assigned 16-bit and 32-bit values are
//! expanded against the Bluetooth base UUID, so every UUID compares in its 128-bit form.

use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 128-bit Bluetooth UUID, stored big-endian (display order).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uuid {
    bytes: [u8; 16],
}

/// "00000000-0000-1000-8000-00805F9B34FB"
const BASE_UUID: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

impl Uuid {
    /// Creates a UUID from 16 bytes in big-endian order.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid { bytes }
    }

    /// Expands a SIG-assigned 16-bit value against the base UUID.
    pub const fn from_u16(uuid16: u16) -> Self {
        Self::from_u32(uuid16 as u32)
    }

    /// Expands a SIG-assigned 32-bit value against the base UUID.
    pub const fn from_u32(uuid32: u32) -> Self {
        let mut bytes = BASE_UUID;
        let short = uuid32.to_be_bytes();
        bytes[0] = short[0];
        bytes[1] = short[1];
        bytes[2] = short[2];
        bytes[3] = short[3];
        Uuid { bytes }
    }

    /// Generates a random (version 4) UUID.
    ///
    /// Used as the application identity when registering a client with the peripheral
    /// service.
    pub fn new_random_v4() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Uuid { bytes }
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    fn is_sig_assigned(&self) -> bool {
        self.bytes[4..] == BASE_UUID[4..]
    }

    /// Returns the 16-bit short form if this is a SIG-assigned 16-bit UUID.
    pub fn as_u16(&self) -> Option<u16> {
        self.as_u32().and_then(|value| u16::try_from(value).ok())
    }

    /// Returns the 32-bit short form if this UUID derives from the base UUID.
    pub fn as_u32(&self) -> Option<u32> {
        if self.is_sig_assigned() {
            Some(u32::from_be_bytes([
                self.bytes[0],
                self.bytes[1],
                self.bytes[2],
                self.bytes[3],
            ]))
        } else {
            None
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid16: u16) -> Self {
        Uuid::from_u16(uuid16)
    }
}

impl From<u32> for Uuid {
    fn from(uuid32: u32) -> Self {
        Uuid::from_u32(uuid32)
    }
}

impl From<u128> for Uuid {
    fn from(value: u128) -> Self {
        Uuid::from_bytes(value.to_be_bytes())
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u32() {
            Some(short) if short <= u16::MAX as u32 => write!(f, "Uuid(0x{:04X})", short),
            Some(short) => write!(f, "Uuid(0x{:08X})", short),
            None => write!(f, "Uuid({})", self),
        }
    }
}

/// Errors from parsing a UUID string
#[derive(Debug, Error, PartialEq)]
pub enum UuidParseError {
    #[error("UUID must have 4, 8 or 32 hex digits, got {0}")]
    InvalidLength(usize),

    #[error("Invalid hex in UUID: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Accepts "180A", "0000180A" and the 128-bit form with or without hyphens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.trim().chars().filter(|c| *c != '-').collect();

        match cleaned.len() {
            4 => {
                let mut short = [0u8; 2];
                hex::decode_to_slice(&cleaned, &mut short)?;
                Ok(Uuid::from_u16(u16::from_be_bytes(short)))
            }
            8 => {
                let mut short = [0u8; 4];
                hex::decode_to_slice(&cleaned, &mut short)?;
                Ok(Uuid::from_u32(u32::from_be_bytes(short)))
            }
            32 => {
                let mut bytes = [0u8; 16];
                hex::decode_to_slice(&cleaned, &mut bytes)?;
                Ok(Uuid::from_bytes(bytes))
            }
            other => Err(UuidParseError::InvalidLength(other)),
        }
    }
}
