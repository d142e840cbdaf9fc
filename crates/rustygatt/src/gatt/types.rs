//! Attribute types
//!
//! The cached attribute nodes held by the [`AttributeTree`](super::tree::AttributeTree)
//! and the raw payload shapes delivered by service discovery.

use crate::address::BdAddr;
use crate::uuid::Uuid;
use bitflags::bitflags;
use std::fmt;

/// Largest attribute value accepted for a write.
pub const MAX_ATTRIBUTE_LEN: usize = 512;

/// Identity of an attribute node: its UUID plus the per-discovery instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeKey {
    pub uuid: Uuid,
    pub instance_id: u16,
}

impl AttributeKey {
    pub fn new(uuid: Uuid, instance_id: u16) -> Self {
        Self { uuid, instance_id }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uuid, self.instance_id)
    }
}

bitflags! {
    /// Characteristic properties as declared by the peripheral
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }
}

/// How a characteristic write is carried out on the air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    /// Write request, acknowledged by the peripheral
    #[default]
    Default,
    /// Write command, no acknowledgement
    NoResponse,
    /// Signed write command
    Signed,
}

impl WriteType {
    /// Picks the natural write type for a characteristic's declared properties.
    pub fn for_properties(properties: CharacteristicProperties) -> Self {
        if properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
            && !properties.contains(CharacteristicProperties::WRITE)
        {
            WriteType::NoResponse
        } else {
            WriteType::Default
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Primary,
    Secondary,
}

/// A cached descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub instance_id: u16,
    pub value: Vec<u8>,
}

impl Descriptor {
    pub fn key(&self) -> AttributeKey {
        AttributeKey::new(self.uuid, self.instance_id)
    }
}

/// A cached characteristic
#[derive(Debug, Clone, PartialEq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub instance_id: u16,
    pub properties: CharacteristicProperties,
    pub write_type: WriteType,
    /// Last value read, written or notified
    pub value: Vec<u8>,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn key(&self) -> AttributeKey {
        AttributeKey::new(self.uuid, self.instance_id)
    }

    pub fn descriptor(&self, uuid: &Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| &d.uuid == uuid)
    }
}

/// A cached service
///
/// `included` holds keys of other cached services. They are resolved through the tree
/// and never own a copy of the included node.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub uuid: Uuid,
    pub instance_id: u16,
    pub service_type: ServiceType,
    pub device: BdAddr,
    pub included: Vec<AttributeKey>,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn key(&self) -> AttributeKey {
        AttributeKey::new(self.uuid, self.instance_id)
    }

    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Descriptor as reported by discovery
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDescriptor {
    pub uuid: Uuid,
    pub instance_id: u16,
}

/// Characteristic as reported by discovery
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub instance_id: u16,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<DiscoveredDescriptor>,
}

/// Service as reported by discovery
///
/// Included services arrive as detached copies carrying only their identity; they are
/// matched against the top-level services during reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub instance_id: u16,
    pub service_type: ServiceType,
    pub included_services: Vec<DiscoveredService>,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

impl DiscoveredService {
    pub fn primary(uuid: Uuid, instance_id: u16) -> Self {
        Self {
            uuid,
            instance_id,
            service_type: ServiceType::Primary,
            included_services: Vec::new(),
            characteristics: Vec::new(),
        }
    }

    pub fn key(&self) -> AttributeKey {
        AttributeKey::new(self.uuid, self.instance_id)
    }
}
