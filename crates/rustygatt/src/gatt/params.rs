//! Link parameters passed through to the peripheral service

use bitflags::bitflags;

// ATT MTU limits
pub const MIN_MTU: u16 = 23;
pub const MAX_MTU: u16 = 517;

/// Transport preference for the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Let the stack decide
    #[default]
    Auto,
    BrEdr,
    Le,
}

bitflags! {
    /// Set of LE PHYs a side is willing to use
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PhyMask: u8 {
        const LE_1M = 0x01;
        const LE_2M = 0x02;
        const LE_CODED = 0x04;
    }
}

impl Default for PhyMask {
    fn default() -> Self {
        PhyMask::LE_1M
    }
}

/// Coding preference when the coded PHY is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhyOptions {
    #[default]
    NoPreferred,
    S2,
    S8,
}

/// The PHY actually in use on one direction of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phy {
    Le1m,
    Le2m,
    LeCoded,
}

/// Requested connection interval profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPriority {
    #[default]
    Balanced,
    High,
    LowPower,
}

/// Parameters for a connect submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    /// `false` requests a background (auto) connection
    pub direct: bool,
    pub transport: Transport,
    pub opportunistic: bool,
    pub phy: PhyMask,
}
