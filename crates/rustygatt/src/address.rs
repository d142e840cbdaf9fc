//! Bluetooth device addresses

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 48-bit device address, stored little-endian as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("Invalid device address: {0}")]
pub struct AddrParseError(String);

impl FromStr for BdAddr {
    type Err = AddrParseError;

    /// Parses the colon-separated display form, most significant octet first.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.trim().split(':').collect();
        if octets.len() != 6 {
            return Err(AddrParseError(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, octet) in octets.iter().enumerate() {
            if octet.len() != 2 {
                return Err(AddrParseError(s.to_string()));
            }
            bytes[5 - i] =
                u8::from_str_radix(octet, 16).map_err(|_| AddrParseError(s.to_string()))?;
        }

        Ok(BdAddr { bytes })
    }
}
