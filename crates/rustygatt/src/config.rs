//! Session configuration

use crate::gatt::params::{PhyMask, Transport};
use crate::gatt::tree::DiscoveryPolicy;
use std::time::Duration;

/// Default number of write submissions made while the service reports busy
pub const WRITE_BUSY_ATTEMPTS: u32 = 5;

/// Default pause between busy write submissions
pub const WRITE_BUSY_DELAY: Duration = Duration::from_millis(10);

/// Per-session preferences, fixed at creation
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: Transport,
    pub opportunistic: bool,
    /// PHYs offered when connecting
    pub phy: PhyMask,
    /// Ask the service for enhanced ATT bearers
    pub eatt_support: bool,
    pub discovery_policy: DiscoveryPolicy,
    /// Total write submissions made while the service answers busy
    pub write_busy_attempts: u32,
    pub write_busy_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Auto,
            opportunistic: false,
            phy: PhyMask::LE_1M,
            eatt_support: false,
            discovery_policy: DiscoveryPolicy::Replace,
            write_busy_attempts: WRITE_BUSY_ATTEMPTS,
            write_busy_delay: WRITE_BUSY_DELAY,
        }
    }
}

impl SessionConfig {
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_opportunistic(mut self, opportunistic: bool) -> Self {
        self.opportunistic = opportunistic;
        self
    }

    pub fn with_phy(mut self, phy: PhyMask) -> Self {
        self.phy = phy;
        self
    }

    pub fn with_eatt_support(mut self, eatt_support: bool) -> Self {
        self.eatt_support = eatt_support;
        self
    }

    pub fn with_discovery_policy(mut self, policy: DiscoveryPolicy) -> Self {
        self.discovery_policy = policy;
        self
    }

    /// At least one attempt is always made.
    pub fn with_write_busy_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.write_busy_attempts = attempts.max(1);
        self.write_busy_delay = delay;
        self
    }
}
