use log::{debug, info};
use rustygatt::error::SubmitError;
use rustygatt::gatt::{
    AuthRequirement, ClientId, ConnectParams, ConnectionPriority, DiscoveredCharacteristic,
    DiscoveredDescriptor, DiscoveredService, EventSink, Phy, PhyMask, PhyOptions, SubmitResult,
};
use rustygatt::{
    AttributeKey, BdAddr, CharacteristicProperties, ConnectionState, GattCallback, GattSession,
    GattStatus, PeripheralEvent, PeripheralService, SessionConfig, Uuid, WriteType,
};
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const BATTERY_LEVEL_HANDLE: u16 = 0x0003;
const BATTERY_CONFIG_HANDLE: u16 = 0x0004;
const MANUFACTURER_NAME_HANDLE: u16 = 0x000C;

/// In-memory peripheral that answers every request through the event sink
struct LoopbackPeripheral {
    sink: Mutex<Option<EventSink>>,
    values: Mutex<HashMap<u16, Vec<u8>>>,
}

impl LoopbackPeripheral {
    fn new() -> Self {
        let mut values = HashMap::new();
        values.insert(BATTERY_LEVEL_HANDLE, vec![87]);
        values.insert(BATTERY_CONFIG_HANDLE, vec![0x00, 0x00]);
        values.insert(MANUFACTURER_NAME_HANDLE, b"Loopback Labs".to_vec());

        Self {
            sink: Mutex::new(None),
            values: Mutex::new(values),
        }
    }

    fn send(&self, event: PeripheralEvent) -> SubmitResult {
        let sink = self.sink.lock().unwrap();
        match sink.as_ref() {
            Some(sink) => sink
                .send(event)
                .map_err(|e| SubmitError::Channel(e.to_string())),
            None => Err(SubmitError::Channel("no client registered".into())),
        }
    }

    fn value(&self, handle: u16) -> Vec<u8> {
        self.values
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .unwrap_or_default()
    }

    fn store(&self, handle: u16, value: &[u8]) {
        self.values.lock().unwrap().insert(handle, value.to_vec());
    }

    fn database() -> Vec<DiscoveredService> {
        let mut battery = DiscoveredService::primary(Uuid::from_u16(0x180F), 0x0001);
        battery.characteristics.push(DiscoveredCharacteristic {
            uuid: Uuid::from_u16(0x2A19),
            instance_id: BATTERY_LEVEL_HANDLE,
            properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            descriptors: vec![DiscoveredDescriptor {
                uuid: Uuid::from_u16(0x2902),
                instance_id: BATTERY_CONFIG_HANDLE,
            }],
        });

        let mut device_info = DiscoveredService::primary(Uuid::from_u16(0x180A), 0x000A);
        device_info.characteristics.push(DiscoveredCharacteristic {
            uuid: Uuid::from_u16(0x2A29),
            instance_id: MANUFACTURER_NAME_HANDLE,
            properties: CharacteristicProperties::READ,
            descriptors: Vec::new(),
        });

        vec![battery, device_info]
    }
}

impl PeripheralService for LoopbackPeripheral {
    fn register_client(&self, app_uuid: Uuid, events: EventSink, _eatt_support: bool) -> SubmitResult {
        debug!("Registering application {}", app_uuid);
        *self.sink.lock().unwrap() = Some(events);
        self.send(PeripheralEvent::ClientRegistered {
            status: GattStatus::Success,
            client_id: 1,
        })
    }

    fn unregister_client(&self, client_id: ClientId) -> SubmitResult {
        debug!("Unregistering client {}", client_id);
        Ok(())
    }

    fn connect(&self, _client_id: ClientId, address: BdAddr, params: ConnectParams) -> SubmitResult {
        debug!("Connecting to {} (direct={})", address, params.direct);
        self.send(PeripheralEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: true,
        })
    }

    fn disconnect(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        self.send(PeripheralEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            connected: false,
        })
    }

    fn refresh(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        Ok(())
    }

    fn discover_services(&self, _client_id: ClientId, _address: BdAddr, filter: Option<Uuid>) -> SubmitResult {
        let services = Self::database()
            .into_iter()
            .filter(|s| filter.map_or(true, |uuid| s.uuid == uuid))
            .collect();
        self.send(PeripheralEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services,
        })
    }

    fn read_characteristic(&self, _client_id: ClientId, _address: BdAddr, handle: u16, _auth: AuthRequirement) -> SubmitResult {
        self.send(PeripheralEvent::CharacteristicRead {
            handle,
            status: GattStatus::Success,
            value: self.value(handle),
        })
    }

    fn write_characteristic(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        handle: u16,
        _write_type: WriteType,
        _auth: AuthRequirement,
        value: &[u8],
    ) -> SubmitResult {
        self.store(handle, value);
        self.send(PeripheralEvent::CharacteristicWrite {
            handle,
            status: GattStatus::Success,
            value: value.to_vec(),
        })
    }

    fn read_descriptor(&self, _client_id: ClientId, _address: BdAddr, handle: u16, _auth: AuthRequirement) -> SubmitResult {
        self.send(PeripheralEvent::DescriptorRead {
            handle,
            status: GattStatus::Success,
            value: self.value(handle),
        })
    }

    fn write_descriptor(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        handle: u16,
        _auth: AuthRequirement,
        value: &[u8],
    ) -> SubmitResult {
        self.store(handle, value);
        self.send(PeripheralEvent::DescriptorWrite {
            handle,
            status: GattStatus::Success,
            value: value.to_vec(),
        })
    }

    fn begin_reliable_write(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        Ok(())
    }

    fn end_reliable_write(&self, _client_id: ClientId, _address: BdAddr, _commit: bool) -> SubmitResult {
        self.send(PeripheralEvent::ReliableWriteCompleted {
            status: GattStatus::Success,
        })
    }

    fn register_for_notification(&self, _client_id: ClientId, _address: BdAddr, handle: u16, enable: bool) -> SubmitResult {
        if !enable {
            return Ok(());
        }
        // Pretend the peripheral pushes its current value right away
        self.send(PeripheralEvent::Notification {
            handle,
            value: self.value(handle),
        })
    }

    fn request_mtu(&self, _client_id: ClientId, _address: BdAddr, mtu: u16) -> SubmitResult {
        self.send(PeripheralEvent::MtuChanged {
            mtu: mtu.min(247),
            status: GattStatus::Success,
        })
    }

    fn set_preferred_phy(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        _tx: PhyMask,
        _rx: PhyMask,
        _options: PhyOptions,
    ) -> SubmitResult {
        self.send(PeripheralEvent::PhyUpdated {
            tx: Phy::Le2m,
            rx: Phy::Le2m,
            status: GattStatus::Success,
        })
    }

    fn read_phy(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        self.send(PeripheralEvent::PhyRead {
            tx: Phy::Le2m,
            rx: Phy::Le2m,
            status: GattStatus::Success,
        })
    }

    fn connection_parameter_update(
        &self,
        _client_id: ClientId,
        _address: BdAddr,
        priority: ConnectionPriority,
    ) -> SubmitResult {
        let interval = match priority {
            ConnectionPriority::High => 6,
            ConnectionPriority::Balanced => 24,
            ConnectionPriority::LowPower => 80,
        };
        self.send(PeripheralEvent::ConnectionUpdated {
            interval,
            latency: 0,
            timeout: 500,
            status: GattStatus::Success,
        })
    }

    fn read_remote_rssi(&self, _client_id: ClientId, _address: BdAddr) -> SubmitResult {
        self.send(PeripheralEvent::RemoteRssiRead {
            rssi: -58,
            status: GattStatus::Success,
        })
    }
}

struct PrintingCallback;

impl GattCallback for PrintingCallback {
    fn on_connection_state_change(&self, status: GattStatus, state: ConnectionState) {
        println!("Connection state: {:?} ({})", state, status);
    }

    fn on_services_discovered(&self, status: GattStatus) {
        println!("Services discovered ({})", status);
    }

    fn on_characteristic_read(&self, characteristic: AttributeKey, status: GattStatus, value: &[u8]) {
        println!("Read {}: {:02X?} ({})", characteristic, value, status);
    }

    fn on_characteristic_changed(&self, characteristic: AttributeKey, value: &[u8]) {
        println!("Notification from {}: {:02X?}", characteristic, value);
    }

    fn on_descriptor_write(&self, descriptor: AttributeKey, status: GattStatus) {
        println!("Wrote {} ({})", descriptor, status);
    }

    fn on_mtu_changed(&self, mtu: u16, status: GattStatus) {
        println!("MTU is now {} ({})", mtu, status);
    }

    fn on_phy_update(&self, tx: Phy, rx: Phy, status: GattStatus) {
        println!("PHY tx={:?} rx={:?} ({})", tx, rx, status);
    }

    fn on_read_remote_rssi(&self, rssi: i8, status: GattStatus) {
        println!("RSSI: {} dBm ({})", rssi, status);
    }
}

/// Poll until `done` holds or a second has passed.
fn wait_for(what: &str, done: impl Fn() -> bool) -> Result<(), Box<dyn Error>> {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !done() {
        if Instant::now() > deadline {
            return Err(format!("timed out waiting for {}", what).into());
        }
        thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let device: BdAddr = "00:11:22:33:44:55".parse()?;
    let session = Arc::new(GattSession::new(
        Arc::new(LoopbackPeripheral::new()),
        device,
        SessionConfig::default(),
        Arc::new(PrintingCallback),
    ));
    let dispatcher = session.spawn_dispatcher()?;

    info!("Connecting to {}", device);
    session.connect(false)?;
    wait_for("connection", || session.state() == ConnectionState::Connected)?;

    session.discover_services()?;
    wait_for("discovery", || !session.services().is_empty())?;
    for service in session.services() {
        println!("Service: {}", service.uuid);
        for characteristic in &service.characteristics {
            println!(
                "  Characteristic: {} (handle 0x{:04X}, {:?})",
                characteristic.uuid, characteristic.instance_id, characteristic.properties
            );
        }
    }

    let battery = session
        .service(&Uuid::from_u16(0x180F))
        .ok_or("battery service not discovered")?;
    let level = battery
        .characteristic(&Uuid::from_u16(0x2A19))
        .ok_or("battery level not discovered")?;
    let battery_level = level.key();
    let battery_config = level
        .descriptor(&Uuid::from_u16(0x2902))
        .ok_or("battery level has no client configuration")?
        .key();
    let manufacturer = AttributeKey::new(Uuid::from_u16(0x2A29), MANUFACTURER_NAME_HANDLE);

    session.read_characteristic(&battery_level)?;
    wait_for("battery level", || !session.is_busy())?;
    session.read_characteristic(&manufacturer)?;
    wait_for("manufacturer name", || !session.is_busy())?;

    session.write_descriptor(&battery_config, &[0x01, 0x00])?;
    wait_for("notification config", || !session.is_busy())?;
    session.set_notification(&battery_level, true)?;

    session.request_mtu(517)?;
    session.set_preferred_phy(PhyMask::LE_2M, PhyMask::LE_2M, PhyOptions::NoPreferred)?;
    session.read_remote_rssi()?;
    thread::sleep(Duration::from_millis(50));

    if let Some(characteristic) = session.characteristic(&manufacturer) {
        println!(
            "Cached manufacturer name: {}",
            String::from_utf8_lossy(&characteristic.value)
        );
    }

    session.disconnect()?;
    session.close();
    dispatcher
        .join()
        .map_err(|_| "dispatcher thread panicked")?;
    Ok(())
}
