//! Unit tests for GATT session functionality

use crate::address::BdAddr;
use crate::config::SessionConfig;
use crate::error::{GattError, SubmitError};
use crate::gatt::auth::{AuthRequirement, AuthRetryState};
use crate::gatt::callback::GattCallback;
use crate::gatt::connection::{ClientId, ConnectionState, UNREGISTERED};
use crate::gatt::params::{ConnectParams, ConnectionPriority, PhyMask, PhyOptions};
use crate::gatt::service::{EventSink, PeripheralEvent, PeripheralService, SubmitResult};
use crate::gatt::session::GattSession;
use crate::gatt::status::GattStatus;
use crate::gatt::tree::DiscoveryPolicy;
use crate::gatt::types::{
    AttributeKey, CharacteristicProperties, DiscoveredCharacteristic, DiscoveredDescriptor,
    DiscoveredService, WriteType,
};
use crate::uuid::Uuid;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const CLIENT_ID: ClientId = 7;

const HEART_RATE_SERVICE: u16 = 0x180D;
const BATTERY_SERVICE: u16 = 0x180F;
const HEART_RATE_MEASUREMENT: u16 = 0x2A37;
const HEART_RATE_CONTROL_POINT: u16 = 0x2A39;
const BATTERY_LEVEL: u16 = 0x2A19;
const CLIENT_CONFIG: u16 = 0x2902;

/// Request recorded by the mock peripheral service
#[derive(Debug, Clone, PartialEq)]
enum Request {
    Register { eatt_support: bool },
    Unregister(ClientId),
    Connect { client_id: ClientId, direct: bool },
    Disconnect(ClientId),
    Refresh,
    Discover(Option<Uuid>),
    ReadCharacteristic { handle: u16, auth: AuthRequirement },
    WriteCharacteristic {
        handle: u16,
        write_type: WriteType,
        auth: AuthRequirement,
        value: Vec<u8>,
    },
    ReadDescriptor { handle: u16, auth: AuthRequirement },
    WriteDescriptor {
        handle: u16,
        auth: AuthRequirement,
        value: Vec<u8>,
    },
    BeginReliableWrite,
    EndReliableWrite { commit: bool },
    Notification { handle: u16, enable: bool },
    RequestMtu(u16),
    SetPreferredPhy { tx: PhyMask, rx: PhyMask },
    ReadPhy,
    ConnectionPriority(ConnectionPriority),
    ReadRemoteRssi,
}

/// Mock peripheral service for testing
#[derive(Default)]
struct MockPeripheralService {
    requests: Mutex<Vec<Request>>,
    /// Results handed out to write submissions, in order; `Ok` once exhausted
    write_results: Mutex<VecDeque<SubmitResult>>,
    sink: Mutex<Option<EventSink>>,
}

impl MockPeripheralService {
    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    fn count(&self, matches: impl Fn(&Request) -> bool) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| matches(r)).count()
    }

    fn last(&self) -> Option<Request> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn script_writes(&self, results: impl IntoIterator<Item = SubmitResult>) {
        self.write_results.lock().unwrap().extend(results);
    }

    /// Push an event through the sink handed over at registration.
    fn emit(&self, event: PeripheralEvent) {
        let sink = self.sink.lock().unwrap();
        sink.as_ref().expect("client not registered").send(event).unwrap();
    }

    fn record(&self, request: Request) -> SubmitResult {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }

    fn record_write(&self, request: Request) -> SubmitResult {
        self.requests.lock().unwrap().push(request);
        self.write_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

impl PeripheralService for MockPeripheralService {
    fn register_client(&self, _app_uuid: Uuid, events: EventSink, eatt_support: bool) -> SubmitResult {
        *self.sink.lock().unwrap() = Some(events);
        self.record(Request::Register { eatt_support })
    }

    fn unregister_client(&self, client_id: ClientId) -> SubmitResult {
        self.record(Request::Unregister(client_id))
    }

    fn connect(&self, client_id: ClientId, _address: BdAddr, params: ConnectParams) -> SubmitResult {
        self.record(Request::Connect {
            client_id,
            direct: params.direct,
        })
    }

    fn disconnect(&self, client_id: ClientId, _address: BdAddr) -> SubmitResult {
        self.record(Request::Disconnect(client_id))
    }

    fn refresh(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        self.record(Request::Refresh)
    }

    fn discover_services(&self, _client_id: ClientId, _address: BdAddr, filter: Option<Uuid>) -> SubmitResult {
        self.record(Request::Discover(filter))
    }

    fn read_characteristic(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        handle: u16,
        auth: AuthRequirement,
    ) -> SubmitResult {
        self.record(Request::ReadCharacteristic { handle, auth })
    }

    fn write_characteristic(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        handle: u16,
        write_type: WriteType,
        auth: AuthRequirement,
        value: &[u8],
    ) -> SubmitResult {
        self.record_write(Request::WriteCharacteristic {
            handle,
            write_type,
            auth,
            value: value.to_vec(),
        })
    }

    fn read_descriptor(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        handle: u16,
        auth: AuthRequirement,
    ) -> SubmitResult {
        self.record(Request::ReadDescriptor { handle, auth })
    }

    fn write_descriptor(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        handle: u16,
        auth: AuthRequirement,
        value: &[u8],
    ) -> SubmitResult {
        self.record_write(Request::WriteDescriptor {
            handle,
            auth,
            value: value.to_vec(),
        })
    }

    fn begin_reliable_write(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        self.record(Request::BeginReliableWrite)
    }

    fn end_reliable_write(&self, _client_id: ClientId, _address: BdAddr, commit: bool) -> SubmitResult {
        self.record(Request::EndReliableWrite { commit })
    }

    fn register_for_notification(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        handle: u16,
        enable: bool,
    ) -> SubmitResult {
        self.record(Request::Notification { handle, enable })
    }

    fn request_mtu(&self, _client_id: ClientId, _address: BdAddr, mtu: u16) -> SubmitResult {
        self.record(Request::RequestMtu(mtu))
    }

    fn set_preferred_phy(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        tx: PhyMask,
        rx: PhyMask,
        _options: PhyOptions,
    ) -> SubmitResult {
        self.record(Request::SetPreferredPhy { tx, rx })
    }

    fn read_phy(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        self.record(Request::ReadPhy)
    }

    fn connection_parameter_update(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        priority: ConnectionPriority,
    ) -> SubmitResult {
        self.record(Request::ConnectionPriority(priority))
    }

    fn read_remote_rssi(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        self.record(Request::ReadRemoteRssi)
    }
}

/// Callback recorded by the listener
#[derive(Debug, Clone, PartialEq)]
enum Delivered {
    ConnectionState(GattStatus, ConnectionState),
    ServicesDiscovered(GattStatus),
    CharacteristicRead(AttributeKey, GattStatus, Vec<u8>),
    CharacteristicWrite(AttributeKey, GattStatus),
    CharacteristicChanged(AttributeKey, Vec<u8>),
    DescriptorRead(AttributeKey, GattStatus, Vec<u8>),
    DescriptorWrite(AttributeKey, GattStatus),
    ReliableWriteCompleted(GattStatus),
    MtuChanged(u16, GattStatus),
    ServiceChanged,
}

#[derive(Default)]
struct RecordingCallback {
    delivered: Mutex<Vec<Delivered>>,
}

impl RecordingCallback {
    fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }

    fn count(&self, matches: impl Fn(&Delivered) -> bool) -> usize {
        self.delivered.lock().unwrap().iter().filter(|d| matches(d)).count()
    }

    fn push(&self, delivered: Delivered) {
        self.delivered.lock().unwrap().push(delivered);
    }
}

impl GattCallback for RecordingCallback {
    fn on_connection_state_change(&self, status: GattStatus, state: ConnectionState) {
        self.push(Delivered::ConnectionState(status, state));
    }

    fn on_services_discovered(&self, status: GattStatus) {
        self.push(Delivered::ServicesDiscovered(status));
    }

    fn on_characteristic_read(&self, characteristic: AttributeKey, status: GattStatus, value: &[u8]) {
        self.push(Delivered::CharacteristicRead(characteristic, status, value.to_vec()));
    }

    fn on_characteristic_write(&self, characteristic: AttributeKey, status: GattStatus) {
        self.push(Delivered::CharacteristicWrite(characteristic, status));
    }

    fn on_characteristic_changed(&self, characteristic: AttributeKey, value: &[u8]) {
        self.push(Delivered::CharacteristicChanged(characteristic, value.to_vec()));
    }

    fn on_descriptor_read(&self, descriptor: AttributeKey, status: GattStatus, value: &[u8]) {
        self.push(Delivered::DescriptorRead(descriptor, status, value.to_vec()));
    }

    fn on_descriptor_write(&self, descriptor: AttributeKey, status: GattStatus) {
        self.push(Delivered::DescriptorWrite(descriptor, status));
    }

    fn on_reliable_write_completed(&self, status: GattStatus) {
        self.push(Delivered::ReliableWriteCompleted(status));
    }

    fn on_mtu_changed(&self, mtu: u16, status: GattStatus) {
        self.push(Delivered::MtuChanged(mtu, status));
    }

    fn on_service_changed(&self) {
        self.push(Delivered::ServiceChanged);
    }
}

struct Fixture {
    service: Arc<MockPeripheralService>,
    callback: Arc<RecordingCallback>,
    session: GattSession,
}

fn device() -> BdAddr {
    BdAddr::new([0x55, 0x44, 0x33, 0x22, 0x11, 0x00])
}

fn measurement() -> AttributeKey {
    AttributeKey::new(Uuid::from_u16(HEART_RATE_MEASUREMENT), 11)
}

fn measurement_config() -> AttributeKey {
    AttributeKey::new(Uuid::from_u16(CLIENT_CONFIG), 12)
}

fn control_point() -> AttributeKey {
    AttributeKey::new(Uuid::from_u16(HEART_RATE_CONTROL_POINT), 13)
}

fn battery_level() -> AttributeKey {
    AttributeKey::new(Uuid::from_u16(BATTERY_LEVEL), 21)
}

fn heart_rate_service() -> DiscoveredService {
    let mut service = DiscoveredService::primary(Uuid::from_u16(HEART_RATE_SERVICE), 10);
    service.characteristics = vec![
        DiscoveredCharacteristic {
            uuid: Uuid::from_u16(HEART_RATE_MEASUREMENT),
            instance_id: 11,
            properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            descriptors: vec![DiscoveredDescriptor {
                uuid: Uuid::from_u16(CLIENT_CONFIG),
                instance_id: 12,
            }],
        },
        DiscoveredCharacteristic {
            uuid: Uuid::from_u16(HEART_RATE_CONTROL_POINT),
            instance_id: 13,
            properties: CharacteristicProperties::WRITE,
            descriptors: Vec::new(),
        },
    ];
    service
}

fn battery_service() -> DiscoveredService {
    let mut service = DiscoveredService::primary(Uuid::from_u16(BATTERY_SERVICE), 20);
    service.characteristics.push(DiscoveredCharacteristic {
        uuid: Uuid::from_u16(BATTERY_LEVEL),
        instance_id: 21,
        properties: CharacteristicProperties::READ,
        descriptors: Vec::new(),
    });
    service
}

fn fixture_with(config: SessionConfig) -> Fixture {
    let service = Arc::new(MockPeripheralService::default());
    let callback = Arc::new(RecordingCallback::default());
    let session = GattSession::new(service.clone(), device(), config, callback.clone());
    Fixture {
        service,
        callback,
        session,
    }
}

fn fixture() -> Fixture {
    fixture_with(SessionConfig::default().with_write_busy_retry(5, Duration::from_millis(1)))
}

fn connect(fixture: &Fixture, auto_connect: bool) {
    fixture.session.connect(auto_connect).unwrap();
    fixture.session.handle_event(PeripheralEvent::ClientRegistered {
        status: GattStatus::Success,
        client_id: CLIENT_ID,
    });
    fixture.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: true,
    });
}

fn discover(fixture: &Fixture) {
    fixture.session.discover_services().unwrap();
    fixture.session.handle_event(PeripheralEvent::ServicesDiscovered {
        status: GattStatus::Success,
        services: vec![heart_rate_service(), battery_service()],
    });
}

/// Connected session with the heart rate and battery services cached
fn connected() -> Fixture {
    let fixture = fixture();
    connect(&fixture, false);
    discover(&fixture);
    fixture
}

fn read_completion(handle: u16, status: GattStatus, value: &[u8]) -> PeripheralEvent {
    PeripheralEvent::CharacteristicRead {
        handle,
        status,
        value: value.to_vec(),
    }
}

fn is_characteristic_read(request: &Request) -> bool {
    matches!(request, Request::ReadCharacteristic { .. })
}

fn is_characteristic_write(request: &Request) -> bool {
    matches!(request, Request::WriteCharacteristic { .. })
}

#[test]
fn test_session_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<GattSession>();
}

#[test]
fn test_connect_registers_then_connects() {
    let f = fixture();
    assert_eq!(f.session.state(), ConnectionState::Idle);

    f.session.connect(false).unwrap();
    assert_eq!(f.session.state(), ConnectionState::Connecting);
    assert_eq!(f.service.requests(), vec![Request::Register { eatt_support: false }]);
    assert_eq!(f.session.connect(false), Err(GattError::AlreadyConnecting));

    f.session.handle_event(PeripheralEvent::ClientRegistered {
        status: GattStatus::Success,
        client_id: CLIENT_ID,
    });
    assert_eq!(f.session.client_id(), CLIENT_ID);
    assert_eq!(
        f.service.last(),
        Some(Request::Connect {
            client_id: CLIENT_ID,
            direct: true
        })
    );

    f.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: true,
    });
    assert_eq!(f.session.state(), ConnectionState::Connected);
    assert_eq!(
        f.callback.delivered(),
        vec![Delivered::ConnectionState(GattStatus::Success, ConnectionState::Connected)]
    );
}

#[test]
fn test_auto_connect_requests_background_connection() {
    let f = fixture_with(SessionConfig::default().with_eatt_support(true));
    f.session.connect(true).unwrap();
    f.session.handle_event(PeripheralEvent::ClientRegistered {
        status: GattStatus::Success,
        client_id: CLIENT_ID,
    });

    assert_eq!(
        f.service.requests(),
        vec![
            Request::Register { eatt_support: true },
            Request::Connect {
                client_id: CLIENT_ID,
                direct: false
            },
        ]
    );
}

#[test]
fn test_registration_failure_reports_failure() {
    let f = fixture();
    f.session.connect(false).unwrap();
    f.session.handle_event(PeripheralEvent::ClientRegistered {
        status: GattStatus::Failure,
        client_id: UNREGISTERED,
    });

    assert_eq!(f.session.state(), ConnectionState::Idle);
    assert_eq!(
        f.callback.delivered(),
        vec![Delivered::ConnectionState(GattStatus::Failure, ConnectionState::Idle)]
    );
    assert_eq!(f.service.count(|r| matches!(r, Request::Connect { .. })), 0);
}

#[test]
fn test_remote_disconnect_releases_registration() {
    let f = connected();
    f.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::ConnectionTimeout,
        connected: false,
    });

    assert_eq!(f.session.state(), ConnectionState::Idle);
    assert_eq!(f.session.client_id(), UNREGISTERED);
    assert_eq!(f.service.last(), Some(Request::Unregister(CLIENT_ID)));
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::ConnectionState(
            GattStatus::ConnectionTimeout,
            ConnectionState::Idle
        ))
    );
}

#[test]
fn test_auto_connect_disconnect_keeps_registration() {
    let f = fixture();
    connect(&f, true);
    f.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: false,
    });

    assert_eq!(f.session.client_id(), CLIENT_ID);
    assert_eq!(f.service.count(|r| matches!(r, Request::Unregister(_))), 0);

    // Reconnecting reuses the registration
    f.session.connect(true).unwrap();
    assert_eq!(
        f.service.last(),
        Some(Request::Connect {
            client_id: CLIENT_ID,
            direct: true
        })
    );
}

#[test]
fn test_close_twice_is_noop() {
    let f = connected();
    f.session.close();
    f.session.close();

    assert_eq!(f.session.state(), ConnectionState::Closed);
    assert_eq!(f.service.count(|r| matches!(r, Request::Unregister(_))), 1);
    assert_eq!(f.session.connect(false), Err(GattError::Closed));
    assert_eq!(f.session.read_characteristic(&measurement()), Err(GattError::Closed));
    assert_eq!(f.session.disconnect(), Err(GattError::Closed));

    // Nothing reaches the listener after close
    let delivered = f.callback.delivered().len();
    f.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: true,
    });
    f.session.handle_event(PeripheralEvent::Notification {
        handle: 11,
        value: vec![0x00, 0x50],
    });
    assert_eq!(f.callback.delivered().len(), delivered);
    assert_eq!(f.session.state(), ConnectionState::Closed);
}

#[test]
fn test_registration_after_close_is_released() {
    let f = fixture();
    f.session.connect(false).unwrap();
    f.session.close();
    assert_eq!(f.service.count(|r| matches!(r, Request::Unregister(_))), 0);

    f.session.handle_event(PeripheralEvent::ClientRegistered {
        status: GattStatus::Success,
        client_id: 9,
    });
    assert_eq!(f.service.last(), Some(Request::Unregister(9)));
    assert_eq!(f.session.state(), ConnectionState::Closed);
}

#[test]
fn test_operations_require_registration() {
    let f = fixture();
    assert_eq!(
        f.session.read_characteristic(&measurement()),
        Err(GattError::NotRegistered)
    );
    assert_eq!(f.session.discover_services(), Err(GattError::NotRegistered));
    assert_eq!(f.session.request_mtu(100), Err(GattError::NotRegistered));
    assert_eq!(f.session.disconnect(), Err(GattError::NotRegistered));
    assert!(f.service.requests().is_empty());
}

#[test]
fn test_attribute_preconditions() {
    let f = connected();
    let unknown = AttributeKey::new(Uuid::from_u16(0x2A00), 99);

    assert_eq!(
        f.session.read_characteristic(&unknown),
        Err(GattError::AttributeNotFound(unknown))
    );
    assert_eq!(
        f.session.read_characteristic(&control_point()),
        Err(GattError::NotPermitted(control_point()))
    );
    assert_eq!(
        f.session.write_characteristic(&battery_level(), &[0x10], WriteType::Default),
        Err(GattError::NotPermitted(battery_level()))
    );
    assert_eq!(
        f.session.write_characteristic(&control_point(), &[0u8; 513], WriteType::Default),
        Err(GattError::ValueTooLong { len: 513, max: 512 })
    );
    assert_eq!(
        f.session.read_descriptor(&unknown),
        Err(GattError::AttributeNotFound(unknown))
    );
    assert!(!f.session.is_busy());
    assert_eq!(f.service.count(is_characteristic_read), 0);

    // The limit itself is accepted
    f.session
        .write_characteristic(&control_point(), &[0u8; 512], WriteType::Default)
        .unwrap();
    assert!(f.session.is_busy());
}

#[test]
fn test_single_flight() {
    let f = connected();
    f.session.read_characteristic(&measurement()).unwrap();

    assert_eq!(
        f.session.read_characteristic(&battery_level()),
        Err(GattError::DeviceBusy)
    );
    assert_eq!(
        f.session.write_characteristic(&control_point(), &[0x01], WriteType::Default),
        Err(GattError::DeviceBusy)
    );
    assert_eq!(f.session.write_descriptor(&measurement_config(), &[0x01, 0x00]), Err(GattError::DeviceBusy));
    assert_eq!(f.service.count(is_characteristic_read), 1);
    assert_eq!(f.service.count(is_characteristic_write), 0);

    f.session
        .handle_event(read_completion(11, GattStatus::Success, &[0x06, 0x48]));
    assert!(!f.session.is_busy());
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::CharacteristicRead(
            measurement(),
            GattStatus::Success,
            vec![0x06, 0x48]
        ))
    );
    assert_eq!(
        f.session.characteristic(&measurement()).unwrap().value,
        vec![0x06, 0x48]
    );

    f.session.read_characteristic(&battery_level()).unwrap();
    assert_eq!(
        f.service.last(),
        Some(Request::ReadCharacteristic {
            handle: 21,
            auth: AuthRequirement::None
        })
    );
}

#[test]
fn test_concurrent_reads_admit_one() {
    let f = connected();
    let session = Arc::new(f.session);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let session = session.clone();
            thread::spawn(move || session.read_characteristic(&battery_level()).is_ok())
        })
        .collect();
    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(admitted, 1);
    assert_eq!(f.service.count(is_characteristic_read), 1);
}

#[test]
fn test_auth_escalation_exhausted() {
    let f = connected();
    f.session.read_characteristic(&battery_level()).unwrap();

    f.session
        .handle_event(read_completion(21, GattStatus::InsufficientAuthentication, &[]));
    assert_eq!(
        f.service.last(),
        Some(Request::ReadCharacteristic {
            handle: 21,
            auth: AuthRequirement::NoMitm
        })
    );
    assert_eq!(f.session.auth_retry_state(), AuthRetryState::EscalatedNoMitm);
    assert!(f.session.is_busy());

    f.session
        .handle_event(read_completion(21, GattStatus::InsufficientEncryption, &[]));
    assert_eq!(
        f.service.last(),
        Some(Request::ReadCharacteristic {
            handle: 21,
            auth: AuthRequirement::Mitm
        })
    );

    f.session
        .handle_event(read_completion(21, GattStatus::InsufficientAuthentication, &[]));
    assert_eq!(f.service.count(is_characteristic_read), 3);
    assert_eq!(
        f.callback
            .count(|d| matches!(d, Delivered::CharacteristicRead(..))),
        1
    );
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::CharacteristicRead(
            battery_level(),
            GattStatus::InsufficientAuthentication,
            Vec::new()
        ))
    );
    assert_eq!(f.session.auth_retry_state(), AuthRetryState::Idle);
    assert!(!f.session.is_busy());
}

#[test]
fn test_auth_escalation_recovers() {
    let f = connected();
    f.session
        .write_characteristic(&control_point(), &[0x01], WriteType::Default)
        .unwrap();
    f.session.handle_event(PeripheralEvent::CharacteristicWrite {
        handle: 13,
        status: GattStatus::InsufficientEncryption,
        value: Vec::new(),
    });
    assert_eq!(
        f.service.last(),
        Some(Request::WriteCharacteristic {
            handle: 13,
            write_type: WriteType::Default,
            auth: AuthRequirement::NoMitm,
            value: vec![0x01]
        })
    );

    f.session.handle_event(PeripheralEvent::CharacteristicWrite {
        handle: 13,
        status: GattStatus::Success,
        value: Vec::new(),
    });
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::CharacteristicWrite(control_point(), GattStatus::Success))
    );
    assert_eq!(f.session.auth_retry_state(), AuthRetryState::Idle);
    assert!(!f.session.is_busy());
}

#[test]
fn test_write_busy_backoff_succeeds() {
    let f = connected();
    f.service.script_writes(vec![Err(SubmitError::Busy); 4]);

    f.session
        .write_characteristic(&control_point(), &[0x01], WriteType::Default)
        .unwrap();
    assert_eq!(f.service.count(is_characteristic_write), 5);
    assert!(f.session.is_busy());

    f.session.handle_event(PeripheralEvent::CharacteristicWrite {
        handle: 13,
        status: GattStatus::Success,
        value: vec![0x01],
    });
    assert_eq!(
        f.callback
            .count(|d| matches!(d, Delivered::CharacteristicWrite(..))),
        1
    );
    assert_eq!(
        f.session.characteristic(&control_point()).unwrap().value,
        vec![0x01]
    );
}

#[test]
fn test_write_busy_backoff_gives_up() {
    let f = connected();
    f.service.script_writes(vec![Err(SubmitError::Busy); 5]);
    let delivered = f.callback.delivered().len();

    assert_eq!(
        f.session
            .write_characteristic(&control_point(), &[0x01], WriteType::Default),
        Err(GattError::WriteRequestBusy { attempts: 5 })
    );
    assert_eq!(f.service.count(is_characteristic_write), 5);
    assert!(!f.session.is_busy());
    assert_eq!(f.callback.delivered().len(), delivered);

    // The gate is free for the next operation
    f.session.read_characteristic(&battery_level()).unwrap();
}

#[test]
fn test_submission_failure_releases_gate() {
    let f = connected();
    f.service
        .script_writes([Err(SubmitError::Channel("service gone".into()))]);

    assert_eq!(
        f.session.write_descriptor(&measurement_config(), &[0x01, 0x00]),
        Err(GattError::Submit(SubmitError::Channel("service gone".into())))
    );
    assert_eq!(f.service.count(|r| matches!(r, Request::WriteDescriptor { .. })), 1);
    assert!(!f.session.is_busy());
}

#[test]
fn test_late_completion_after_disconnect_is_ignored() {
    let f = connected();
    f.session.read_characteristic(&measurement()).unwrap();

    f.session.disconnect().unwrap();
    assert_eq!(f.service.last(), Some(Request::Disconnect(CLIENT_ID)));
    assert_eq!(f.session.state(), ConnectionState::Idle);
    assert!(!f.session.is_busy());

    f.session
        .handle_event(read_completion(11, GattStatus::Success, &[0x06, 0x48]));
    assert_eq!(
        f.callback
            .count(|d| matches!(d, Delivered::CharacteristicRead(..))),
        0
    );
    assert!(f.session.characteristic(&measurement()).unwrap().value.is_empty());

    // The service's disconnect event still releases the registration
    f.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: false,
    });
    assert_eq!(f.service.last(), Some(Request::Unregister(CLIENT_ID)));
}

#[test]
fn test_mismatched_completion_is_ignored() {
    let f = connected();
    f.session.read_characteristic(&measurement()).unwrap();

    f.session
        .handle_event(read_completion(21, GattStatus::Success, &[0x64]));
    f.session.handle_event(PeripheralEvent::CharacteristicWrite {
        handle: 11,
        status: GattStatus::Success,
        value: Vec::new(),
    });

    assert!(f.session.is_busy());
    assert_eq!(
        f.callback
            .count(|d| matches!(d, Delivered::CharacteristicRead(..) | Delivered::CharacteristicWrite(..))),
        0
    );
}

#[test]
fn test_descriptor_round_trip_updates_cache() {
    let f = connected();
    f.session
        .write_descriptor(&measurement_config(), &[0x01, 0x00])
        .unwrap();
    f.session.handle_event(PeripheralEvent::DescriptorWrite {
        handle: 12,
        status: GattStatus::Success,
        value: Vec::new(),
    });
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::DescriptorWrite(measurement_config(), GattStatus::Success))
    );

    f.session.read_descriptor(&measurement_config()).unwrap();
    f.session.handle_event(PeripheralEvent::DescriptorRead {
        handle: 12,
        status: GattStatus::Success,
        value: vec![0x01, 0x00],
    });
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::DescriptorRead(
            measurement_config(),
            GattStatus::Success,
            vec![0x01, 0x00]
        ))
    );

    let tree = f.session.attribute_tree();
    assert_eq!(tree.descriptor_by_handle(12).unwrap().value, vec![0x01, 0x00]);
}

#[test]
fn test_discovery_replace_is_idempotent() {
    let f = connected();
    discover(&f);

    let services = f.session.services();
    assert_eq!(services.len(), 2);
    assert!(f.session.attribute_tree().integrity_warnings().is_empty());
    assert_eq!(
        f.callback
            .count(|d| *d == Delivered::ServicesDiscovered(GattStatus::Success)),
        2
    );
}

#[test]
fn test_discovery_append_policy() {
    let f = fixture_with(SessionConfig::default().with_discovery_policy(DiscoveryPolicy::Append));
    connect(&f, false);

    f.session
        .discover_service_by_uuid(Uuid::from_u16(HEART_RATE_SERVICE))
        .unwrap();
    assert_eq!(
        f.service.last(),
        Some(Request::Discover(Some(Uuid::from_u16(HEART_RATE_SERVICE))))
    );
    f.session.handle_event(PeripheralEvent::ServicesDiscovered {
        status: GattStatus::Success,
        services: vec![heart_rate_service()],
    });
    f.session.handle_event(PeripheralEvent::ServicesDiscovered {
        status: GattStatus::Success,
        services: vec![battery_service(), heart_rate_service()],
    });

    assert_eq!(f.session.services().len(), 2);
    assert!(f.session.service(&Uuid::from_u16(BATTERY_SERVICE)).is_some());
}

#[test]
fn test_included_service_resolves_into_cache() {
    let f = fixture();
    connect(&f, false);

    let mut heart_rate = heart_rate_service();
    heart_rate
        .included_services
        .push(DiscoveredService::primary(Uuid::from_u16(BATTERY_SERVICE), 20));
    f.session.handle_event(PeripheralEvent::ServicesDiscovered {
        status: GattStatus::Success,
        services: vec![heart_rate, battery_service()],
    });

    let tree = f.session.attribute_tree();
    let heart_rate = tree.service(&Uuid::from_u16(HEART_RATE_SERVICE)).unwrap();
    let battery = tree.service(&Uuid::from_u16(BATTERY_SERVICE)).unwrap();
    let included: Vec<_> = tree.included_services(heart_rate).collect();
    assert_eq!(included.len(), 1);
    assert!(std::ptr::eq(included[0], battery));
}

#[test]
fn test_failed_discovery_keeps_cache() {
    let f = connected();
    f.session.handle_event(PeripheralEvent::ServicesDiscovered {
        status: GattStatus::Failure,
        services: Vec::new(),
    });

    assert_eq!(f.session.services().len(), 2);
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::ServicesDiscovered(GattStatus::Failure))
    );
}

#[test]
fn test_refresh_clears_cache() {
    let f = connected();
    f.session.refresh().unwrap();

    assert_eq!(f.service.last(), Some(Request::Refresh));
    assert!(f.session.services().is_empty());
    assert_eq!(
        f.session.read_characteristic(&measurement()),
        Err(GattError::AttributeNotFound(measurement()))
    );
}

#[test]
fn test_notification_updates_cache() {
    let f = connected();
    f.session.set_notification(&measurement(), true).unwrap();
    assert_eq!(
        f.service.last(),
        Some(Request::Notification {
            handle: 11,
            enable: true
        })
    );

    f.session.handle_event(PeripheralEvent::Notification {
        handle: 11,
        value: vec![0x00, 0x4E],
    });
    f.session.handle_event(PeripheralEvent::Notification {
        handle: 77,
        value: vec![0xFF],
    });

    assert_eq!(
        f.callback
            .count(|d| matches!(d, Delivered::CharacteristicChanged(..))),
        1
    );
    assert_eq!(
        f.session.characteristic(&measurement()).unwrap().value,
        vec![0x00, 0x4E]
    );
}

#[test]
fn test_reliable_write_lifecycle() {
    let f = connected();
    assert_eq!(f.session.execute_reliable_write(), Err(GattError::NoReliableWrite));
    assert_eq!(f.session.abort_reliable_write(), Err(GattError::NoReliableWrite));

    f.session.begin_reliable_write().unwrap();
    assert_eq!(
        f.session.begin_reliable_write(),
        Err(GattError::ReliableWriteInProgress)
    );
    assert_eq!(f.service.last(), Some(Request::BeginReliableWrite));

    f.session.execute_reliable_write().unwrap();
    assert_eq!(f.service.last(), Some(Request::EndReliableWrite { commit: true }));
    assert!(f.session.is_busy());
    assert_eq!(
        f.session.read_characteristic(&battery_level()),
        Err(GattError::DeviceBusy)
    );

    f.session.handle_event(PeripheralEvent::ReliableWriteCompleted {
        status: GattStatus::Success,
    });
    assert!(!f.session.is_busy());
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::ReliableWriteCompleted(GattStatus::Success))
    );
    assert_eq!(f.session.abort_reliable_write(), Err(GattError::NoReliableWrite));

    // A second completion is late
    f.session.handle_event(PeripheralEvent::ReliableWriteCompleted {
        status: GattStatus::Success,
    });
    assert_eq!(
        f.callback
            .count(|d| matches!(d, Delivered::ReliableWriteCompleted(_))),
        1
    );
}

#[test]
fn test_abort_reliable_write() {
    let f = connected();
    f.session.begin_reliable_write().unwrap();
    f.session.abort_reliable_write().unwrap();

    assert_eq!(f.service.last(), Some(Request::EndReliableWrite { commit: false }));
    assert!(!f.session.is_busy());
    f.session.begin_reliable_write().unwrap();
}

#[test]
fn test_execute_reliable_write_respects_gate() {
    let f = connected();
    f.session.begin_reliable_write().unwrap();
    f.session.read_characteristic(&measurement()).unwrap();

    assert_eq!(f.session.execute_reliable_write(), Err(GattError::DeviceBusy));
    assert_eq!(f.service.count(|r| matches!(r, Request::EndReliableWrite { .. })), 0);
}

#[test]
fn test_disconnect_resets_reliable_write() {
    let f = connected();
    f.session.begin_reliable_write().unwrap();
    f.session.execute_reliable_write().unwrap();

    f.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: false,
    });
    assert!(!f.session.is_busy());
    assert_eq!(f.session.begin_reliable_write(), Err(GattError::NotRegistered));
}

#[test]
fn test_request_mtu_bounds() {
    let f = connected();
    assert!(matches!(
        f.session.request_mtu(22),
        Err(GattError::InvalidArgument(_))
    ));
    assert!(matches!(
        f.session.request_mtu(518),
        Err(GattError::InvalidArgument(_))
    ));

    f.session.request_mtu(517).unwrap();
    assert_eq!(f.service.last(), Some(Request::RequestMtu(517)));

    f.session.handle_event(PeripheralEvent::MtuChanged {
        mtu: 247,
        status: GattStatus::Success,
    });
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::MtuChanged(247, GattStatus::Success))
    );
}

#[test]
fn test_link_pass_through_requests() {
    let f = connected();
    f.session
        .set_preferred_phy(PhyMask::LE_2M, PhyMask::LE_1M | PhyMask::LE_2M, PhyOptions::NoPreferred)
        .unwrap();
    f.session.read_phy().unwrap();
    f.session
        .request_connection_priority(ConnectionPriority::High)
        .unwrap();
    f.session.read_remote_rssi().unwrap();
    assert!(matches!(
        f.session
            .set_preferred_phy(PhyMask::empty(), PhyMask::LE_1M, PhyOptions::S2),
        Err(GattError::InvalidArgument(_))
    ));

    let requests = f.service.requests();
    assert_eq!(
        requests[requests.len() - 4..],
        [
            Request::SetPreferredPhy {
                tx: PhyMask::LE_2M,
                rx: PhyMask::LE_1M | PhyMask::LE_2M
            },
            Request::ReadPhy,
            Request::ConnectionPriority(ConnectionPriority::High),
            Request::ReadRemoteRssi,
        ]
    );

    f.session.handle_event(PeripheralEvent::ServiceChanged);
    assert_eq!(f.callback.delivered().last(), Some(&Delivered::ServiceChanged));
}

#[test]
fn test_events_flow_through_sink() {
    let f = fixture();
    f.session.connect(false).unwrap();
    assert_eq!(f.session.process_events(None), 0);

    f.service.emit(PeripheralEvent::ClientRegistered {
        status: GattStatus::Success,
        client_id: CLIENT_ID,
    });
    assert_eq!(f.session.process_events(Some(Duration::from_millis(100))), 1);
    assert_eq!(
        f.service.last(),
        Some(Request::Connect {
            client_id: CLIENT_ID,
            direct: true
        })
    );

    f.service.emit(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: true,
    });
    f.service.emit(PeripheralEvent::MtuChanged {
        mtu: 185,
        status: GattStatus::Success,
    });
    assert_eq!(f.session.process_events(None), 2);
    assert_eq!(f.session.state(), ConnectionState::Connected);
}

#[test]
fn test_dispatcher_stops_after_close() {
    let f = fixture();
    let session = Arc::new(f.session);
    let dispatcher = session.spawn_dispatcher().unwrap();

    session.connect(false).unwrap();
    f.service.emit(PeripheralEvent::ClientRegistered {
        status: GattStatus::Success,
        client_id: CLIENT_ID,
    });
    f.service.emit(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: true,
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != ConnectionState::Connected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(session.state(), ConnectionState::Connected);

    session.close();
    dispatcher.join().unwrap();
    assert_eq!(f.service.last(), Some(Request::Unregister(CLIENT_ID)));
}

#[test]
fn test_reconnect_after_local_disconnect() {
    let f = connected();
    f.session.disconnect().unwrap();
    f.session.connect(false).unwrap();
    assert_eq!(
        f.service.last(),
        Some(Request::Connect {
            client_id: CLIENT_ID,
            direct: true
        })
    );

    // The old link's disconnect arrives after the reconnect was issued
    f.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: false,
    });
    assert_eq!(f.session.state(), ConnectionState::Connecting);
    assert_eq!(f.session.client_id(), CLIENT_ID);
    assert_eq!(f.service.count(|r| matches!(r, Request::Unregister(_))), 0);

    f.session.handle_event(PeripheralEvent::ConnectionStateChanged {
        status: GattStatus::Success,
        connected: true,
    });
    assert_eq!(f.session.state(), ConnectionState::Connected);
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::ConnectionState(GattStatus::Success, ConnectionState::Connected))
    );
    f.session.read_characteristic(&battery_level()).unwrap();
}

#[test]
fn test_auth_retry_that_cannot_be_issued_delivers_failure() {
    let f = connected();
    f.service.script_writes([Ok(()), Err(SubmitError::Busy)]);

    f.session
        .write_characteristic(&control_point(), &[0x01], WriteType::Default)
        .unwrap();
    f.session.handle_event(PeripheralEvent::CharacteristicWrite {
        handle: 13,
        status: GattStatus::InsufficientEncryption,
        value: Vec::new(),
    });

    // One escalated attempt, refused as busy, then the failure is delivered
    assert_eq!(f.service.count(is_characteristic_write), 2);
    assert_eq!(
        f.callback
            .count(|d| matches!(d, Delivered::CharacteristicWrite(..))),
        1
    );
    assert_eq!(
        f.callback.delivered().last(),
        Some(&Delivered::CharacteristicWrite(
            control_point(),
            GattStatus::InsufficientEncryption
        ))
    );
    assert_eq!(f.session.auth_retry_state(), AuthRetryState::Idle);
    assert!(!f.session.is_busy());
}

#[test]
fn test_operations_racing_disconnect_leave_gate_consistent() {
    for _ in 0..50 {
        let f = connected();
        let session = Arc::new(f.session);

        let reader = {
            let session = session.clone();
            thread::spawn(move || session.read_characteristic(&battery_level()).is_ok())
        };
        let disconnector = {
            let session = session.clone();
            thread::spawn(move || session.disconnect())
        };
        let submitted = reader.join().unwrap();
        disconnector.join().unwrap().unwrap();

        // A read is tracked exactly when it still holds the gate
        let busy = session.is_busy();
        assert!(submitted || !busy);
        session.handle_event(read_completion(21, GattStatus::Success, &[0x64]));
        assert_eq!(
            f.callback
                .count(|d| matches!(d, Delivered::CharacteristicRead(..))),
            usize::from(busy)
        );
        assert!(!session.is_busy());
    }
}
