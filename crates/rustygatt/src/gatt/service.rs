//! Peripheral service interface
//!
//! The session never talks to the radio itself. Requests go to a [`PeripheralService`]
//! which answers immediately with a submission result and later pushes the outcome as a
//! [`PeripheralEvent`] into the sink it was given at registration.

use super::auth::AuthRequirement;
use super::connection::ClientId;
use super::params::{ConnectParams, ConnectionPriority, Phy, PhyMask, PhyOptions};
use super::status::GattStatus;
use super::types::{DiscoveredService, WriteType};
use crate::address::BdAddr;
use crate::error::SubmitError;
use crate::uuid::Uuid;
use std::sync::mpsc::Sender;

/// Result of handing a request to the peripheral service
pub type SubmitResult = Result<(), SubmitError>;

/// Channel end the service pushes completion events into
pub type EventSink = Sender<PeripheralEvent>;

/// Completion and unsolicited events delivered by the peripheral service
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    ClientRegistered {
        status: GattStatus,
        client_id: ClientId,
    },
    ConnectionStateChanged {
        status: GattStatus,
        connected: bool,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<DiscoveredService>,
    },
    CharacteristicRead {
        handle: u16,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        handle: u16,
        status: GattStatus,
        value: Vec<u8>,
    },
    DescriptorRead {
        handle: u16,
        status: GattStatus,
        value: Vec<u8>,
    },
    DescriptorWrite {
        handle: u16,
        status: GattStatus,
        value: Vec<u8>,
    },
    Notification {
        handle: u16,
        value: Vec<u8>,
    },
    ReliableWriteCompleted {
        status: GattStatus,
    },
    PhyUpdated {
        tx: Phy,
        rx: Phy,
        status: GattStatus,
    },
    PhyRead {
        tx: Phy,
        rx: Phy,
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    ConnectionUpdated {
        interval: u16,
        latency: u16,
        timeout: u16,
        status: GattStatus,
    },
    RemoteRssiRead {
        rssi: i8,
        status: GattStatus,
    },
    /// The peripheral's attribute database changed; cached nodes are stale
    ServiceChanged,
}

/// The transport-side collaborator performing radio operations.
///
/// Every method is fire-and-forget: it returns once the request is accepted (or
/// refused) and the authoritative result arrives through the [`EventSink`].
pub trait PeripheralService: Send + Sync {
    fn register_client(&self, app_uuid: Uuid, events: EventSink, eatt_support: bool)
        -> SubmitResult;

    fn unregister_client(&self, client_id: ClientId) -> SubmitResult;

    fn connect(&self, client_id: ClientId, address: BdAddr, params: ConnectParams) -> SubmitResult;

    fn disconnect(&self, client_id: ClientId, address: BdAddr) -> SubmitResult;

    /// Drops any attribute cache the service keeps for the device.
    fn refresh(&self, client_id: ClientId, address: BdAddr) -> SubmitResult;

    /// Discovers all services, or only those matching `filter`.
    fn discover_services(
        &self,
        client_id: ClientId,
        address: BdAddr,
        filter: Option<Uuid>,
    ) -> SubmitResult;

    fn read_characteristic(
        &self,
        client_id: ClientId,
        address: BdAddr,
        handle: u16,
        auth: AuthRequirement,
    ) -> SubmitResult;

    /// May answer [`SubmitError::Busy`] while the stack's write queue is full.
    fn write_characteristic(
        &self,
        client_id: ClientId,
        address: BdAddr,
        handle: u16,
        write_type: WriteType,
        auth: AuthRequirement,
        value: &[u8],
    ) -> SubmitResult;

    fn read_descriptor(
        &self,
        client_id: ClientId,
        address: BdAddr,
        handle: u16,
        auth: AuthRequirement,
    ) -> SubmitResult;

    /// May answer [`SubmitError::Busy`] while the stack's write queue is full.
    fn write_descriptor(
        &self,
        client_id: ClientId,
        address: BdAddr,
        handle: u16,
        auth: AuthRequirement,
        value: &[u8],
    ) -> SubmitResult;

    fn begin_reliable_write(&self, client_id: ClientId, address: BdAddr) -> SubmitResult;

    fn end_reliable_write(&self, client_id: ClientId, address: BdAddr, commit: bool)
        -> SubmitResult;

    fn register_for_notification(
        &self,
        client_id: ClientId,
        address: BdAddr,
        handle: u16,
        enable: bool,
    ) -> SubmitResult;

    fn request_mtu(&self, client_id: ClientId, address: BdAddr, mtu: u16) -> SubmitResult;

    fn set_preferred_phy(
        &self,
        client_id: ClientId,
        address: BdAddr,
        tx: PhyMask,
        rx: PhyMask,
        options: PhyOptions,
    ) -> SubmitResult;

    fn read_phy(&self, client_id: ClientId, address: BdAddr) -> SubmitResult;

    fn connection_parameter_update(
        &self,
        client_id: ClientId,
        address: BdAddr,
        priority: ConnectionPriority,
    ) -> SubmitResult;

    fn read_remote_rssi(&self, client_id: ClientId, address: BdAddr) -> SubmitResult;
}
