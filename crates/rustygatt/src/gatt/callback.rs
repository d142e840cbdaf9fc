//! Session listener
//!
//! Every method has an empty default, so a listener implements only what it cares about
//! and unhandled events are dropped silently.

use super::connection::ConnectionState;
use super::params::Phy;
use super::status::GattStatus;
use super::types::AttributeKey;

#[allow(unused_variables)]
pub trait GattCallback: Send + Sync {
    /// Connection state after a registration, connection or disconnection event.
    fn on_connection_state_change(&self, status: GattStatus, state: ConnectionState) {}

    fn on_services_discovered(&self, status: GattStatus) {}

    fn on_characteristic_read(&self, characteristic: AttributeKey, status: GattStatus, value: &[u8]) {}

    fn on_characteristic_write(&self, characteristic: AttributeKey, status: GattStatus) {}

    /// Notification or indication from the peripheral.
    fn on_characteristic_changed(&self, characteristic: AttributeKey, value: &[u8]) {}

    fn on_descriptor_read(&self, descriptor: AttributeKey, status: GattStatus, value: &[u8]) {}

    fn on_descriptor_write(&self, descriptor: AttributeKey, status: GattStatus) {}

    fn on_reliable_write_completed(&self, status: GattStatus) {}

    fn on_mtu_changed(&self, mtu: u16, status: GattStatus) {}

    fn on_phy_update(&self, tx: Phy, rx: Phy, status: GattStatus) {}

    fn on_phy_read(&self, tx: Phy, rx: Phy, status: GattStatus) {}

    fn on_read_remote_rssi(&self, rssi: i8, status: GattStatus) {}

    fn on_connection_updated(&self, interval: u16, latency: u16, timeout: u16, status: GattStatus) {}

    fn on_service_changed(&self) {}
}
