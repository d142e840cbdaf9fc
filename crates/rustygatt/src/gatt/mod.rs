//! GATT client session management
//!
//! This module keeps one client session per remote peripheral: connection lifecycle,
//! the cached attribute tree, single-flight attribute operations and listener delivery.

pub mod auth;
pub mod busy;
pub mod callback;
pub mod connection;
pub mod params;
pub mod service;
pub mod session;
pub mod status;
pub mod tree;
pub mod types;

#[cfg(test)]
mod tests;

pub use auth::{AuthRequirement, AuthRetryState};
pub use callback::GattCallback;
pub use connection::{ClientId, ConnectionState};
pub use params::{ConnectParams, ConnectionPriority, Phy, PhyMask, PhyOptions, Transport};
pub use service::{EventSink, PeripheralEvent, PeripheralService, SubmitResult};
pub use session::GattSession;
pub use status::GattStatus;
pub use tree::{AttributeTree, DiscoveryPolicy, IntegrityWarning};
pub use types::{
    AttributeKey, Characteristic, CharacteristicProperties, Descriptor, DiscoveredCharacteristic,
    DiscoveredDescriptor, DiscoveredService, Service, ServiceType, WriteType, MAX_ATTRIBUTE_LEN,
};
