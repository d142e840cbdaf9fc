//! Attribute tree
//!
//! Cache of the services, characteristics and descriptors discovered on one peripheral.
//! Nodes are keyed by [`AttributeKey`]; characteristics and descriptors are additionally
//! indexed by instance id, which is what completion events carry.

use super::types::{
    AttributeKey, Characteristic, Descriptor, DiscoveredCharacteristic, DiscoveredService,
    Service, WriteType,
};
use crate::address::BdAddr;
use crate::uuid::Uuid;
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;

/// What a discovery completion does with the nodes already cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryPolicy {
    /// Drop the cache and rebuild it from the new payload
    #[default]
    Replace,
    /// Keep the cache; services with a known key are replaced in place
    Append,
}

/// Non-fatal inconsistency found while reconciling a discovery payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityWarning {
    /// An included service has no matching top-level service; the reference was dropped
    UnresolvedIncludedService {
        service: AttributeKey,
        included: AttributeKey,
    },
    /// A characteristic instance id was already cached; the duplicate was dropped
    DuplicateCharacteristic {
        service: AttributeKey,
        characteristic: AttributeKey,
    },
    /// A descriptor instance id was already cached; the duplicate was dropped
    DuplicateDescriptor {
        characteristic: AttributeKey,
        descriptor: AttributeKey,
    },
}

impl fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityWarning::UnresolvedIncludedService { service, included } => write!(
                f,
                "broken GATT database: service {} includes unknown service {}",
                service, included
            ),
            IntegrityWarning::DuplicateCharacteristic {
                service,
                characteristic,
            } => write!(
                f,
                "duplicate characteristic {} in service {}",
                characteristic, service
            ),
            IntegrityWarning::DuplicateDescriptor {
                characteristic,
                descriptor,
            } => write!(
                f,
                "duplicate descriptor {} in characteristic {}",
                descriptor, characteristic
            ),
        }
    }
}

#[derive(Debug)]
pub struct AttributeTree {
    device: BdAddr,
    services: Vec<Service>,
    service_index: HashMap<AttributeKey, usize>,
    /// Characteristic instance id -> (service, characteristic)
    characteristic_index: HashMap<u16, (usize, usize)>,
    /// Descriptor instance id -> (service, characteristic, descriptor)
    descriptor_index: HashMap<u16, (usize, usize, usize)>,
    warnings: Vec<IntegrityWarning>,
}

impl AttributeTree {
    pub fn new(device: BdAddr) -> Self {
        Self {
            device,
            services: Vec::new(),
            service_index: HashMap::new(),
            characteristic_index: HashMap::new(),
            descriptor_index: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.services.clear();
        self.service_index.clear();
        self.characteristic_index.clear();
        self.descriptor_index.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// First cached service with this UUID.
    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.iter().find(|s| &s.uuid == uuid)
    }

    pub fn service_by_key(&self, key: &AttributeKey) -> Option<&Service> {
        self.service_index.get(key).map(|&idx| &self.services[idx])
    }

    /// Resolves a service's included-service references to the cached nodes.
    pub fn included_services<'a>(
        &'a self,
        service: &'a Service,
    ) -> impl Iterator<Item = &'a Service> {
        service
            .included
            .iter()
            .filter_map(move |key| self.service_by_key(key))
    }

    pub fn characteristic(&self, key: &AttributeKey) -> Option<&Characteristic> {
        self.characteristic_by_handle(key.instance_id)
            .filter(|c| c.uuid == key.uuid)
    }

    pub fn characteristic_by_handle(&self, handle: u16) -> Option<&Characteristic> {
        self.characteristic_index
            .get(&handle)
            .map(|&(s, c)| &self.services[s].characteristics[c])
    }

    pub fn descriptor(&self, key: &AttributeKey) -> Option<&Descriptor> {
        self.descriptor_by_handle(key.instance_id)
            .filter(|d| d.uuid == key.uuid)
    }

    pub fn descriptor_by_handle(&self, handle: u16) -> Option<&Descriptor> {
        self.descriptor_index
            .get(&handle)
            .map(|&(s, c, d)| &self.services[s].characteristics[c].descriptors[d])
    }

    /// Stores a new characteristic value, returning the characteristic's key.
    pub fn set_characteristic_value(&mut self, handle: u16, value: &[u8]) -> Option<AttributeKey> {
        let &(s, c) = self.characteristic_index.get(&handle)?;
        let characteristic = &mut self.services[s].characteristics[c];
        characteristic.value = value.to_vec();
        Some(characteristic.key())
    }

    /// Stores a new descriptor value, returning the descriptor's key.
    pub fn set_descriptor_value(&mut self, handle: u16, value: &[u8]) -> Option<AttributeKey> {
        let &(s, c, d) = self.descriptor_index.get(&handle)?;
        let descriptor = &mut self.services[s].characteristics[c].descriptors[d];
        descriptor.value = value.to_vec();
        Some(descriptor.key())
    }

    /// Warnings recorded by the most recent reconciliation.
    pub fn integrity_warnings(&self) -> &[IntegrityWarning] {
        &self.warnings
    }

    /// Merges a discovery payload into the cache.
    ///
    /// After this returns every included-service reference resolves by key to a cached
    /// service, and no service, characteristic or descriptor key is cached twice.
    pub fn reconcile(&mut self, discovered: Vec<DiscoveredService>, policy: DiscoveryPolicy) {
        if policy == DiscoveryPolicy::Replace {
            self.clear();
        }
        self.warnings.clear();

        let mut pending_includes = Vec::with_capacity(discovered.len());
        for raw in discovered {
            let includes: Vec<AttributeKey> =
                raw.included_services.iter().map(|inc| inc.key()).collect();
            let idx = self.insert_service(raw);
            pending_includes.push((idx, includes));
        }

        // Previously cached references are revalidated along with the new ones
        let fresh: Vec<usize> = pending_includes.iter().map(|(idx, _)| *idx).collect();
        for idx in 0..self.services.len() {
            if !fresh.contains(&idx) {
                let existing = std::mem::take(&mut self.services[idx].included);
                pending_includes.push((idx, existing));
            }
        }

        for (idx, includes) in pending_includes {
            let service_key = self.services[idx].key();
            let mut resolved = Vec::with_capacity(includes.len());
            for included in includes {
                if self.service_index.contains_key(&included) {
                    resolved.push(included);
                } else {
                    self.record(IntegrityWarning::UnresolvedIncludedService {
                        service: service_key,
                        included,
                    });
                }
            }
            self.services[idx].included = resolved;
        }

        debug!(
            "Attribute tree for {} holds {} services after reconciliation",
            self.device,
            self.services.len()
        );
    }

    fn insert_service(&mut self, raw: DiscoveredService) -> usize {
        let key = raw.key();
        let existing = self.service_index.get(&key).copied();
        let idx = match existing {
            Some(idx) => {
                self.unindex_service(idx);
                idx
            }
            None => {
                self.services.push(Service {
                    uuid: raw.uuid,
                    instance_id: raw.instance_id,
                    service_type: raw.service_type,
                    device: self.device,
                    included: Vec::new(),
                    characteristics: Vec::new(),
                });
                let idx = self.services.len() - 1;
                self.service_index.insert(key, idx);
                idx
            }
        };

        let service = &mut self.services[idx];
        service.service_type = raw.service_type;
        service.included.clear();
        service.characteristics.clear();

        for raw_char in raw.characteristics {
            self.insert_characteristic(idx, key, raw_char);
        }
        idx
    }

    fn insert_characteristic(
        &mut self,
        service_idx: usize,
        service_key: AttributeKey,
        raw: DiscoveredCharacteristic,
    ) {
        let char_key = AttributeKey::new(raw.uuid, raw.instance_id);
        if self.characteristic_index.contains_key(&raw.instance_id) {
            self.record(IntegrityWarning::DuplicateCharacteristic {
                service: service_key,
                characteristic: char_key,
            });
            return;
        }

        let char_idx = self.services[service_idx].characteristics.len();
        let mut characteristic = Characteristic {
            uuid: raw.uuid,
            instance_id: raw.instance_id,
            properties: raw.properties,
            write_type: WriteType::for_properties(raw.properties),
            value: Vec::new(),
            descriptors: Vec::with_capacity(raw.descriptors.len()),
        };

        for raw_desc in raw.descriptors {
            if self.descriptor_index.contains_key(&raw_desc.instance_id) {
                self.record(IntegrityWarning::DuplicateDescriptor {
                    characteristic: char_key,
                    descriptor: AttributeKey::new(raw_desc.uuid, raw_desc.instance_id),
                });
                continue;
            }
            let desc_idx = characteristic.descriptors.len();
            self.descriptor_index
                .insert(raw_desc.instance_id, (service_idx, char_idx, desc_idx));
            characteristic.descriptors.push(Descriptor {
                uuid: raw_desc.uuid,
                instance_id: raw_desc.instance_id,
                value: Vec::new(),
            });
        }

        self.characteristic_index
            .insert(raw.instance_id, (service_idx, char_idx));
        self.services[service_idx].characteristics.push(characteristic);
    }

    fn unindex_service(&mut self, idx: usize) {
        for characteristic in &self.services[idx].characteristics {
            self.characteristic_index.remove(&characteristic.instance_id);
            for descriptor in &characteristic.descriptors {
                self.descriptor_index.remove(&descriptor.instance_id);
            }
        }
    }

    fn record(&mut self, warning: IntegrityWarning) {
        warn!("{}: {}", self.device, warning);
        self.warnings.push(warning);
    }
}
