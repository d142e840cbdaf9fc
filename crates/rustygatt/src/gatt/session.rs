//! GATT client session
//!
//! One session per (application, peripheral) pair. It owns the connection state machine,
//! the attribute cache and the busy gate, forwards requests to the peripheral service and
//! turns the service's events into listener callbacks.
//!
//! Locks, one per concern: `connection`, `pending`, `auth_retry`, `reliable_write`,
//! `tree` and `callback`. When two are held at once they are taken in the order
//! connection -> pending -> auth_retry. The listener is cloned out of its lock and never
//! called while any lock is held.

use super::auth::{AuthDecision, AuthRequirement, AuthRetryLadder, AuthRetryState};
use super::busy::DeviceBusyGate;
use super::callback::GattCallback;
use super::connection::{
    ClientId, ConnectAction, ConnectionState, ConnectionStateMachine, Registration,
};
use super::params::{ConnectParams, ConnectionPriority, PhyMask, PhyOptions, MAX_MTU, MIN_MTU};
use super::service::{EventSink, PeripheralEvent, PeripheralService, SubmitResult};
use super::status::GattStatus;
use super::tree::AttributeTree;
use super::types::{
    AttributeKey, Characteristic, DiscoveredService, Service, WriteType, MAX_ATTRIBUTE_LEN,
};
use crate::address::BdAddr;
use crate::config::SessionConfig;
use crate::error::{GattError, SubmitError};
use crate::uuid::Uuid;
use log::{debug, info, trace, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often a dispatcher thread checks whether its session was closed
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Attribute operation waiting for its completion event
#[derive(Debug, Clone, PartialEq)]
struct PendingOperation {
    target: AttributeKey,
    kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq)]
enum OperationKind {
    ReadCharacteristic,
    WriteCharacteristic { write_type: WriteType, value: Vec<u8> },
    ReadDescriptor,
    WriteDescriptor { value: Vec<u8> },
}

/// Which completion event arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    CharacteristicRead,
    CharacteristicWrite,
    DescriptorRead,
    DescriptorWrite,
}

impl PendingOperation {
    fn handle(&self) -> u16 {
        self.target.instance_id
    }

    fn completed_by(&self, completion: Completion, handle: u16) -> bool {
        let kind_matches = matches!(
            (&self.kind, completion),
            (OperationKind::ReadCharacteristic, Completion::CharacteristicRead)
                | (OperationKind::WriteCharacteristic { .. }, Completion::CharacteristicWrite)
                | (OperationKind::ReadDescriptor, Completion::DescriptorRead)
                | (OperationKind::WriteDescriptor { .. }, Completion::DescriptorWrite)
        );
        kind_matches && self.handle() == handle
    }
}

/// Reliable write transaction progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ReliableWrite {
    #[default]
    Inactive,
    /// Begun; writes are being queued on the peripheral
    Active,
    /// Commit submitted, holding the busy gate
    Executing,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A client session with one remote peripheral
pub struct GattSession {
    service: Arc<dyn PeripheralService>,
    device: BdAddr,
    config: SessionConfig,
    connection: Mutex<ConnectionStateMachine>,
    busy: DeviceBusyGate,
    pending: Mutex<Option<PendingOperation>>,
    auth_retry: Mutex<AuthRetryLadder>,
    reliable_write: Mutex<ReliableWrite>,
    tree: RwLock<AttributeTree>,
    callback: RwLock<Option<Arc<dyn GattCallback>>>,
    event_tx: EventSink,
    events: Mutex<Receiver<PeripheralEvent>>,
}

impl std::fmt::Debug for GattSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattSession")
            .field("device", &self.device)
            .field("connection", &*lock(&self.connection))
            .field("busy", &self.busy.is_busy())
            .field("pending", &*lock(&self.pending))
            .field("reliable_write", &*lock(&self.reliable_write))
            .field("services", &read(&self.tree).services().len())
            .field("has_callback", &read(&self.callback).is_some())
            .finish()
    }
}

impl GattSession {
    /// Create an idle session for `device`. Nothing is submitted until `connect`.
    pub fn new(
        service: Arc<dyn PeripheralService>,
        device: BdAddr,
        config: SessionConfig,
        callback: Arc<dyn GattCallback>,
    ) -> Self {
        let (event_tx, events) = mpsc::channel();
        GattSession {
            service,
            device,
            config,
            connection: Mutex::new(ConnectionStateMachine::new()),
            busy: DeviceBusyGate::new(),
            pending: Mutex::new(None),
            auth_retry: Mutex::new(AuthRetryLadder::new()),
            reliable_write: Mutex::new(ReliableWrite::Inactive),
            tree: RwLock::new(AttributeTree::new(device)),
            callback: RwLock::new(Some(callback)),
            event_tx,
            events: Mutex::new(events),
        }
    }

    pub fn device(&self) -> BdAddr {
        self.device
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.connection).state()
    }

    /// Client id from the peripheral service, 0 while unregistered.
    pub fn client_id(&self) -> ClientId {
        lock(&self.connection).client_id()
    }

    /// Whether an attribute operation is outstanding.
    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    pub fn auth_retry_state(&self) -> AuthRetryState {
        lock(&self.auth_retry).state()
    }

    /// Read access to the attribute cache.
    pub fn attribute_tree(&self) -> RwLockReadGuard<'_, AttributeTree> {
        read(&self.tree)
    }

    pub fn services(&self) -> Vec<Service> {
        read(&self.tree).services().to_vec()
    }

    pub fn service(&self, uuid: &Uuid) -> Option<Service> {
        read(&self.tree).service(uuid).cloned()
    }

    pub fn characteristic(&self, key: &AttributeKey) -> Option<Characteristic> {
        read(&self.tree).characteristic(key).cloned()
    }

    fn connect_params(&self, direct: bool) -> ConnectParams {
        ConnectParams {
            direct,
            transport: self.config.transport,
            opportunistic: self.config.opportunistic,
            phy: self.config.phy,
        }
    }

    fn require_registered(&self) -> Result<ClientId, GattError> {
        lock(&self.connection).require_registered()
    }

    // --- Connection lifecycle ---

    /// Start connecting. Registers a client first if the session holds no registration.
    ///
    /// `auto_connect` asks for a background connection that completes whenever the
    /// peripheral becomes available instead of a direct connection attempt.
    pub fn connect(&self, auto_connect: bool) -> Result<(), GattError> {
        let mut connection = lock(&self.connection);
        let action = connection.begin_connect(auto_connect)?;

        let result = match action {
            ConnectAction::Register => self.service.register_client(
                Uuid::new_random_v4(),
                self.event_tx.clone(),
                self.config.eatt_support,
            ),
            ConnectAction::Connect { client_id, direct } => {
                self.service
                    .connect(client_id, self.device, self.connect_params(direct))
            }
        };

        if let Err(err) = result {
            warn!("Connect to {} could not be submitted: {}", self.device, err);
            connection.abort_connect();
            return Err(err.into());
        }
        Ok(())
    }

    /// Disconnect from the peripheral. The session stays usable for a later `connect`.
    ///
    /// Anything in flight on the link is dropped right away, whatever state it was in.
    pub fn disconnect(&self) -> Result<(), GattError> {
        let change = {
            let mut connection = lock(&self.connection);
            let client_id = connection.require_registered()?;
            self.service.disconnect(client_id, self.device)?;
            connection.on_disconnect_requested()?
        };
        info!(
            "Disconnect requested for {} ({:?} -> {:?})",
            self.device, change.previous, change.current
        );
        self.settle_link_change();
        Ok(())
    }

    /// Close the session for good: release the registration and drop the listener.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let Some(registration) = lock(&self.connection).close() else {
            return;
        };

        if let Some(client_id) = registration {
            if let Err(err) = self.service.unregister_client(client_id) {
                warn!("Unregistering client {} failed: {}", client_id, err);
            }
        }

        *write(&self.callback) = None;
        self.settle_link_change();
        info!("Session with {} closed", self.device);
    }

    /// Forget whatever was in flight on the old link.
    fn settle_link_change(&self) {
        if let Some(op) = lock(&self.pending).take() {
            debug!("Dropping pending {:?} on {}", op.kind, op.target);
        }
        lock(&self.auth_retry).reset();
        *lock(&self.reliable_write) = ReliableWrite::Inactive;
        self.busy.release();
    }

    // --- Discovery ---

    /// Discover every service on the peripheral.
    pub fn discover_services(&self) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        self.service.discover_services(client_id, self.device, None)?;
        Ok(())
    }

    /// Discover only the services with the given UUID.
    pub fn discover_service_by_uuid(&self, uuid: Uuid) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        self.service
            .discover_services(client_id, self.device, Some(uuid))?;
        Ok(())
    }

    /// Drop the local attribute cache and ask the service to drop its own.
    pub fn refresh(&self) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        self.service.refresh(client_id, self.device)?;
        write(&self.tree).clear();
        Ok(())
    }

    // --- Attribute operations ---

    pub fn read_characteristic(&self, key: &AttributeKey) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        {
            let tree = read(&self.tree);
            let characteristic = tree
                .characteristic(key)
                .ok_or(GattError::AttributeNotFound(*key))?;
            if !characteristic.properties.can_read() {
                return Err(GattError::NotPermitted(*key));
            }
        }

        self.start_operation(
            client_id,
            PendingOperation {
                target: *key,
                kind: OperationKind::ReadCharacteristic,
            },
        )
    }

    pub fn read_descriptor(&self, key: &AttributeKey) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        if read(&self.tree).descriptor(key).is_none() {
            return Err(GattError::AttributeNotFound(*key));
        }

        self.start_operation(
            client_id,
            PendingOperation {
                target: *key,
                kind: OperationKind::ReadDescriptor,
            },
        )
    }

    pub fn write_characteristic(
        &self,
        key: &AttributeKey,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        check_value_len(value)?;
        {
            let tree = read(&self.tree);
            let characteristic = tree
                .characteristic(key)
                .ok_or(GattError::AttributeNotFound(*key))?;
            if !characteristic.properties.can_write() {
                return Err(GattError::NotPermitted(*key));
            }
        }

        self.start_operation(
            client_id,
            PendingOperation {
                target: *key,
                kind: OperationKind::WriteCharacteristic {
                    write_type,
                    value: value.to_vec(),
                },
            },
        )
    }

    pub fn write_descriptor(&self, key: &AttributeKey, value: &[u8]) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        check_value_len(value)?;
        if read(&self.tree).descriptor(key).is_none() {
            return Err(GattError::AttributeNotFound(*key));
        }

        self.start_operation(
            client_id,
            PendingOperation {
                target: *key,
                kind: OperationKind::WriteDescriptor {
                    value: value.to_vec(),
                },
            },
        )
    }

    /// Take the busy gate, record the operation and submit it.
    ///
    /// `pending` is held from before the gate is taken until the operation is recorded, so
    /// a concurrent link change settles either before the gate is taken or after.
    fn start_operation(&self, client_id: ClientId, op: PendingOperation) -> Result<(), GattError> {
        let mut pending = lock(&self.pending);
        if !self.busy.try_acquire() {
            debug!("{:?} on {} refused: device busy", op.kind, op.target);
            return Err(GattError::DeviceBusy);
        }

        let attempts = self.config.write_busy_attempts;
        lock(&self.auth_retry).reset();

        match self.submit(client_id, &op, AuthRequirement::None, attempts) {
            Ok(()) => {
                trace!("Submitted {:?} on {}", op.kind, op.target);
                *pending = Some(op);
                Ok(())
            }
            Err(err) => {
                debug!("{:?} on {} not submitted: {}", op.kind, op.target, err);
                drop(pending);
                self.busy.release();
                Err(err)
            }
        }
    }

    /// Hand one operation to the service. Writes are retried while the service answers
    /// busy, up to `attempts` submissions in total.
    fn submit(
        &self,
        client_id: ClientId,
        op: &PendingOperation,
        auth: AuthRequirement,
        attempts: u32,
    ) -> Result<(), GattError> {
        let handle = op.handle();
        match &op.kind {
            OperationKind::ReadCharacteristic => Ok(self
                .service
                .read_characteristic(client_id, self.device, handle, auth)?),
            OperationKind::ReadDescriptor => Ok(self
                .service
                .read_descriptor(client_id, self.device, handle, auth)?),
            OperationKind::WriteCharacteristic { write_type, value } => {
                self.retry_while_busy(attempts, || {
                    self.service.write_characteristic(
                        client_id,
                        self.device,
                        handle,
                        *write_type,
                        auth,
                        value,
                    )
                })
            }
            OperationKind::WriteDescriptor { value } => self.retry_while_busy(attempts, || {
                self.service
                    .write_descriptor(client_id, self.device, handle, auth, value)
            }),
        }
    }

    fn retry_while_busy(
        &self,
        attempts: u32,
        mut submit: impl FnMut() -> SubmitResult,
    ) -> Result<(), GattError> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match submit() {
                Err(SubmitError::Busy) => {
                    debug!("Write request busy ({}/{})", attempt, attempts);
                    if attempt < attempts {
                        thread::sleep(self.config.write_busy_delay);
                    }
                }
                other => return Ok(other?),
            }
        }
        Err(GattError::WriteRequestBusy { attempts })
    }

    // --- Reliable writes ---

    pub fn begin_reliable_write(&self) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        let mut reliable_write = lock(&self.reliable_write);
        if *reliable_write != ReliableWrite::Inactive {
            return Err(GattError::ReliableWriteInProgress);
        }

        self.service.begin_reliable_write(client_id, self.device)?;
        *reliable_write = ReliableWrite::Active;
        Ok(())
    }

    /// Commit the queued writes. The commit holds the busy gate until it completes.
    pub fn execute_reliable_write(&self) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        let mut reliable_write = lock(&self.reliable_write);
        match *reliable_write {
            ReliableWrite::Active => {}
            ReliableWrite::Inactive => return Err(GattError::NoReliableWrite),
            ReliableWrite::Executing => return Err(GattError::ReliableWriteInProgress),
        }

        if !self.busy.try_acquire() {
            return Err(GattError::DeviceBusy);
        }
        if let Err(err) = self.service.end_reliable_write(client_id, self.device, true) {
            self.busy.release();
            return Err(err.into());
        }
        *reliable_write = ReliableWrite::Executing;
        Ok(())
    }

    /// Cancel the queued writes. Not gated.
    pub fn abort_reliable_write(&self) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        let mut reliable_write = lock(&self.reliable_write);
        match *reliable_write {
            ReliableWrite::Active => {}
            ReliableWrite::Inactive => return Err(GattError::NoReliableWrite),
            ReliableWrite::Executing => return Err(GattError::ReliableWriteInProgress),
        }

        self.service
            .end_reliable_write(client_id, self.device, false)?;
        *reliable_write = ReliableWrite::Inactive;
        Ok(())
    }

    // --- Pass-through requests ---

    /// Enable or disable notifications/indications for a characteristic.
    ///
    /// Only registers locally with the service; writing the client configuration
    /// descriptor on the peripheral is up to the caller.
    pub fn set_notification(&self, key: &AttributeKey, enable: bool) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        if read(&self.tree).characteristic(key).is_none() {
            return Err(GattError::AttributeNotFound(*key));
        }
        self.service
            .register_for_notification(client_id, self.device, key.instance_id, enable)?;
        Ok(())
    }

    pub fn request_mtu(&self, mtu: u16) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(GattError::InvalidArgument(format!(
                "MTU {} outside {}..={}",
                mtu, MIN_MTU, MAX_MTU
            )));
        }
        self.service.request_mtu(client_id, self.device, mtu)?;
        Ok(())
    }

    pub fn set_preferred_phy(
        &self,
        tx: PhyMask,
        rx: PhyMask,
        options: PhyOptions,
    ) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        if tx.is_empty() || rx.is_empty() {
            return Err(GattError::InvalidArgument("empty PHY mask".into()));
        }
        self.service
            .set_preferred_phy(client_id, self.device, tx, rx, options)?;
        Ok(())
    }

    pub fn read_phy(&self) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        self.service.read_phy(client_id, self.device)?;
        Ok(())
    }

    pub fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        self.service
            .connection_parameter_update(client_id, self.device, priority)?;
        Ok(())
    }

    pub fn read_remote_rssi(&self) -> Result<(), GattError> {
        let client_id = self.require_registered()?;
        self.service.read_remote_rssi(client_id, self.device)?;
        Ok(())
    }

    // --- Event dispatch ---

    /// Handle queued peripheral events on the calling thread.
    ///
    /// With `Some(timeout)` waits up to `timeout` for the first event; with `None` only
    /// drains what is already queued. Returns the number of events handled.
    pub fn process_events(&self, timeout: Option<Duration>) -> usize {
        let mut handled = 0;
        let mut wait = timeout;

        loop {
            // Released before handling so a listener may call back into the session
            let next = {
                let events = lock(&self.events);
                match wait.take() {
                    Some(timeout) => match events.recv_timeout(timeout) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                            None
                        }
                    },
                    None => events.try_recv().ok(),
                }
            };

            match next {
                Some(event) => {
                    self.handle_event(event);
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    /// Run event dispatch on a dedicated thread until the session is closed.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let session = Arc::clone(self);
        thread::Builder::new()
            .name(format!("gatt-{}", self.device))
            .spawn(move || {
                while session.state() != ConnectionState::Closed {
                    session.process_events(Some(DISPATCH_POLL_INTERVAL));
                }
                debug!("Dispatcher for {} stopped", session.device);
            })
    }

    /// Apply one event from the peripheral service.
    pub fn handle_event(&self, event: PeripheralEvent) {
        trace!("{}: {:?}", self.device, event);
        match event {
            PeripheralEvent::ClientRegistered { status, client_id } => {
                self.on_client_registered(status, client_id)
            }
            PeripheralEvent::ConnectionStateChanged { status, connected } => {
                self.on_connection_state_changed(status, connected)
            }
            PeripheralEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services)
            }
            PeripheralEvent::CharacteristicRead {
                handle,
                status,
                value,
            } => self.on_attribute_completion(Completion::CharacteristicRead, handle, status, value),
            PeripheralEvent::CharacteristicWrite {
                handle,
                status,
                value,
            } => self.on_attribute_completion(Completion::CharacteristicWrite, handle, status, value),
            PeripheralEvent::DescriptorRead {
                handle,
                status,
                value,
            } => self.on_attribute_completion(Completion::DescriptorRead, handle, status, value),
            PeripheralEvent::DescriptorWrite {
                handle,
                status,
                value,
            } => self.on_attribute_completion(Completion::DescriptorWrite, handle, status, value),
            PeripheralEvent::Notification { handle, value } => self.on_notification(handle, value),
            PeripheralEvent::ReliableWriteCompleted { status } => {
                self.on_reliable_write_completed(status)
            }
            PeripheralEvent::PhyUpdated { tx, rx, status } => {
                self.notify(|cb| cb.on_phy_update(tx, rx, status))
            }
            PeripheralEvent::PhyRead { tx, rx, status } => {
                self.notify(|cb| cb.on_phy_read(tx, rx, status))
            }
            PeripheralEvent::MtuChanged { mtu, status } => {
                self.notify(|cb| cb.on_mtu_changed(mtu, status))
            }
            PeripheralEvent::ConnectionUpdated {
                interval,
                latency,
                timeout,
                status,
            } => self.notify(|cb| cb.on_connection_updated(interval, latency, timeout, status)),
            PeripheralEvent::RemoteRssiRead { rssi, status } => {
                self.notify(|cb| cb.on_read_remote_rssi(rssi, status))
            }
            PeripheralEvent::ServiceChanged => self.notify(|cb| cb.on_service_changed()),
        }
    }

    fn notify(&self, deliver: impl FnOnce(&dyn GattCallback)) {
        let callback = read(&self.callback).clone();
        if let Some(callback) = callback {
            deliver(callback.as_ref());
        }
    }

    fn on_client_registered(&self, status: GattStatus, client_id: ClientId) {
        let mut connection = lock(&self.connection);
        match connection.on_registered(status.is_success(), client_id) {
            Registration::Connect { client_id, direct } => {
                info!("Registered client {} for {}", client_id, self.device);
                let params = self.connect_params(direct);
                if let Err(err) = self.service.connect(client_id, self.device, params) {
                    warn!("Connect to {} could not be submitted: {}", self.device, err);
                    connection.abort_connect();
                    drop(connection);
                    self.notify(|cb| {
                        cb.on_connection_state_change(GattStatus::Failure, ConnectionState::Idle)
                    });
                }
            }
            Registration::Failed => {
                let state = connection.state();
                drop(connection);
                warn!("Client registration for {} failed: {}", self.device, status);
                self.notify(|cb| cb.on_connection_state_change(GattStatus::Failure, state));
            }
            Registration::Stale { client_id } => {
                drop(connection);
                debug!("Releasing unneeded client {}", client_id);
                if let Err(err) = self.service.unregister_client(client_id) {
                    warn!("Unregistering client {} failed: {}", client_id, err);
                }
            }
            Registration::Kept => debug!("Registered client {} while idle", client_id),
        }
    }

    fn on_connection_state_changed(&self, status: GattStatus, connected: bool) {
        let change = lock(&self.connection).on_connection_changed(connected);
        let Some(change) = change else {
            debug!(
                "Ignoring connection event (connected={}) for {}",
                connected, self.device
            );
            return;
        };

        if let Some(client_id) = change.unregister {
            if let Err(err) = self.service.unregister_client(client_id) {
                warn!("Unregistering client {} failed: {}", client_id, err);
            }
        }
        if change.crosses_connected() || change.current == ConnectionState::Idle {
            self.settle_link_change();
        }

        self.notify(|cb| cb.on_connection_state_change(status, change.current));
    }

    fn on_services_discovered(&self, status: GattStatus, services: Vec<DiscoveredService>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        if status.is_success() {
            write(&self.tree).reconcile(services, self.config.discovery_policy);
        } else {
            warn!("Service discovery on {} failed: {}", self.device, status);
        }
        self.notify(|cb| cb.on_services_discovered(status));
    }

    fn on_attribute_completion(
        &self,
        completion: Completion,
        handle: u16,
        status: GattStatus,
        value: Vec<u8>,
    ) {
        let client_id = self.require_registered();
        let mut pending = lock(&self.pending);
        let op = match pending.as_ref() {
            Some(op) if op.completed_by(completion, handle) => op.clone(),
            _ => {
                debug!(
                    "Ignoring late {:?} completion for handle {} on {}",
                    completion, handle, self.device
                );
                return;
            }
        };

        let decision = lock(&self.auth_retry).on_completion(status);
        if let AuthDecision::Retry(requirement) = decision {
            let resubmitted =
                client_id.and_then(|client_id| self.submit(client_id, &op, requirement, 1));
            match resubmitted {
                Ok(()) => {
                    debug!("Retrying {:?} on {} with {:?}", op.kind, op.target, requirement);
                    return;
                }
                Err(err) => {
                    warn!("Auth retry for {} could not be submitted: {}", op.target, err);
                    lock(&self.auth_retry).reset();
                }
            }
        }

        *pending = None;
        drop(pending);
        self.busy.release();

        if status.is_success() {
            let mut tree = write(&self.tree);
            let cached = match &op.kind {
                OperationKind::ReadCharacteristic => tree.set_characteristic_value(handle, &value),
                OperationKind::WriteCharacteristic { value: written, .. } => {
                    tree.set_characteristic_value(handle, written)
                }
                OperationKind::ReadDescriptor => tree.set_descriptor_value(handle, &value),
                OperationKind::WriteDescriptor { value: written } => {
                    tree.set_descriptor_value(handle, written)
                }
            };
            if cached.is_none() {
                debug!("{} no longer cached; value not stored", op.target);
            }
        }

        let target = op.target;
        match completion {
            Completion::CharacteristicRead => {
                self.notify(|cb| cb.on_characteristic_read(target, status, &value))
            }
            Completion::CharacteristicWrite => {
                self.notify(|cb| cb.on_characteristic_write(target, status))
            }
            Completion::DescriptorRead => {
                self.notify(|cb| cb.on_descriptor_read(target, status, &value))
            }
            Completion::DescriptorWrite => self.notify(|cb| cb.on_descriptor_write(target, status)),
        }
    }

    fn on_notification(&self, handle: u16, value: Vec<u8>) {
        let key = write(&self.tree).set_characteristic_value(handle, &value);
        match key {
            Some(key) => self.notify(|cb| cb.on_characteristic_changed(key, &value)),
            None => debug!("Notification for unknown handle {} on {}", handle, self.device),
        }
    }

    fn on_reliable_write_completed(&self, status: GattStatus) {
        let previous = std::mem::take(&mut *lock(&self.reliable_write));
        match previous {
            ReliableWrite::Inactive => {
                debug!("Ignoring late reliable write completion on {}", self.device);
                return;
            }
            ReliableWrite::Executing => self.busy.release(),
            ReliableWrite::Active => {}
        }
        self.notify(|cb| cb.on_reliable_write_completed(status));
    }
}

fn check_value_len(value: &[u8]) -> Result<(), GattError> {
    if value.len() > MAX_ATTRIBUTE_LEN {
        return Err(GattError::ValueTooLong {
            len: value.len(),
            max: MAX_ATTRIBUTE_LEN,
        });
    }
    Ok(())
}
