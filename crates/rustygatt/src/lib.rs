//! RustyGatt - A Rust library for managing GATT client sessions
//!
//! This library keeps the client side of a Bluetooth LE GATT conversation with one remote
//! peripheral: registration and connection lifecycle, a cached attribute tree built from
//! service discovery, single-flight reads and writes with authentication escalation and
//! busy backoff, reliable write transactions and delivery of results to a listener.
//!
//! Radio work is delegated to a [`PeripheralService`] implementation, which reports results
//! back as [`PeripheralEvent`]s.

pub mod address;
pub mod config;
pub mod error;
pub mod gatt;
pub mod uuid;

// Re-export common types for convenience
pub use address::BdAddr;
pub use config::SessionConfig;
pub use error::{GattError, SubmitError};
pub use gatt::{
    AttributeKey, Characteristic, CharacteristicProperties, ConnectionState, GattCallback,
    GattSession, GattStatus, PeripheralEvent, PeripheralService, Service, WriteType,
};
pub use uuid::Uuid;
