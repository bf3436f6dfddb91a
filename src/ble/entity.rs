//! Handles to cached GATT entities
//!
//! A handle names one cache node by key. It stays cheap to hold after the node is gone;
//! operations on a stale handle fail with `UnknownEntity` (or `Disposed` once the device
//! itself was removed).

use std::fmt;
use uuid::Uuid;

use super::adapter::{EntityKey, EntityKind, OperationKind, Payload, Response, Target};
use super::cache::{refs_of, CharacteristicNode, DescriptorNode, LookupError, ServiceNode};
use super::correlator::{CallOptions, OperationRequest};
use super::device::Device;
use super::error::BleError;
use super::gatt::{self, AttributePermissions, Capability, CharacteristicProperties, WriteType};

fn unknown(device: &Device, target: Target) -> BleError {
    BleError::UnknownEntity {
        device: device.id().clone(),
        target,
    }
}

fn invalid_response(device: &Device, operation: OperationKind) -> BleError {
    BleError::InvalidResponse {
        device: device.id().clone(),
        operation,
    }
}

/// A primary or secondary service of a remote device
#[derive(Clone)]
pub struct Service {
    device: Device,
    key: EntityKey,
    uuid: Uuid,
    is_primary: bool,
}

impl Service {
    pub(crate) fn from_node(device: &Device, node: &ServiceNode) -> Self {
        Self {
            device: device.clone(),
            key: node.key,
            uuid: node.uuid,
            is_primary: node.is_primary,
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The node left the cache (removed, invalidated or device disposed)
    pub fn is_disposed(&self) -> bool {
        self.device.shared.state.lock().cache.service(self.key).is_none()
    }

    fn parent_label(&self) -> String {
        format!("service {} on {}", self.uuid, self.device.id())
    }

    fn with_node<R>(&self, f: impl FnOnce(&ServiceNode) -> R) -> Option<R> {
        let st = self.device.shared.state.lock();
        st.cache.service(self.key).map(f)
    }

    /// Discover this service's characteristics
    pub async fn explore_characteristics(
        &self,
        options: CallOptions,
    ) -> Result<Vec<Characteristic>, BleError> {
        let shared = &self.device.shared;
        let target = Target::Service(self.key);
        let response = shared
            .run(
                OperationRequest::new(OperationKind::ExploreCharacteristics, target),
                &options,
            )
            .await?;
        let Response::Characteristics(found) = response else {
            return Err(invalid_response(&self.device, OperationKind::ExploreCharacteristics));
        };

        let (characteristics, refs) = {
            let mut st = shared.state.lock();
            st.ensure_alive(&shared.id)?;
            let keys = &shared.ctx.keys;
            let service = st
                .cache
                .service_mut(self.key)
                .ok_or_else(|| unknown(&self.device, target))?;
            let removed = service.characteristics.apply_exploration(
                found,
                |d| d.uuid,
                |d| CharacteristicNode::from_discovered(keys.next(), d),
                |node, d| {
                    node.properties = d.properties;
                    node.permissions = d.permissions;
                },
            );
            let characteristics = service
                .characteristics
                .iter()
                .map(|node| Characteristic::from_node(&self.device, self.key, node))
                .collect::<Vec<_>>();
            (characteristics, refs_of(&removed))
        };

        shared.ctx.release_entities(&shared.id, &refs);
        tracing::debug!(
            "Service {} on {} has {} characteristic(s)",
            self.uuid,
            shared.id,
            characteristics.len()
        );
        Ok(characteristics)
    }

    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.with_node(|service| {
            service
                .characteristics
                .iter()
                .map(|node| Characteristic::from_node(&self.device, self.key, node))
                .collect()
        })
        .unwrap_or_default()
    }

    /// The one characteristic with `uuid`
    pub fn find_characteristic(
        &self,
        uuid: Uuid,
    ) -> Result<Characteristic, LookupError<Characteristic>> {
        let parent = self.parent_label();
        let st = self.device.shared.state.lock();
        let Some(service) = st.cache.service(self.key) else {
            return Err(LookupError::NotFound {
                kind: EntityKind::Characteristic,
                parent,
                id: uuid,
            });
        };
        service
            .characteristics
            .find_one(&parent, uuid)
            .map(|node| Characteristic::from_node(&self.device, self.key, node))
            .map_err(|e| e.map(|node| Characteristic::from_node(&self.device, self.key, node)))
    }

    pub fn first_characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.with_node(|service| {
            service
                .characteristics
                .first(uuid)
                .map(|node| Characteristic::from_node(&self.device, self.key, node))
        })
        .flatten()
    }

    pub fn find_characteristics(&self, uuid: Uuid) -> Vec<Characteristic> {
        self.with_node(|service| {
            service
                .characteristics
                .find_all(uuid)
                .into_iter()
                .map(|node| Characteristic::from_node(&self.device, self.key, node))
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn clear_characteristics(&self) {
        let shared = &self.device.shared;
        let refs = shared
            .state
            .lock()
            .cache
            .invalidate(Target::Service(self.key));
        shared.ctx.release_entities(&shared.id, &refs);
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("device", self.device.id())
            .field("key", &self.key)
            .field("uuid", &self.uuid)
            .finish()
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device && self.key == other.key
    }
}

/// A characteristic of a remote service
#[derive(Clone)]
pub struct Characteristic {
    device: Device,
    service: EntityKey,
    key: EntityKey,
    uuid: Uuid,
    properties: CharacteristicProperties,
    permissions: AttributePermissions,
}

impl Characteristic {
    pub(crate) fn from_node(device: &Device, service: EntityKey, node: &CharacteristicNode) -> Self {
        Self {
            device: device.clone(),
            service,
            key: node.key,
            uuid: node.uuid,
            properties: node.properties,
            permissions: node.permissions,
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn service_key(&self) -> EntityKey {
        self.service
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Properties as of the last exploration
    pub fn properties(&self) -> CharacteristicProperties {
        self.with_node(|node| node.properties)
            .unwrap_or(self.properties)
    }

    pub fn permissions(&self) -> AttributePermissions {
        self.with_node(|node| node.permissions)
            .unwrap_or(self.permissions)
    }

    pub fn can(&self, capability: Capability) -> bool {
        gatt::supports(self.properties(), capability)
    }

    /// Last value read or notified
    pub fn value(&self) -> Vec<u8> {
        self.with_node(|node| node.value.clone()).unwrap_or_default()
    }

    pub fn is_listening(&self) -> bool {
        self.with_node(|node| node.listening).unwrap_or(false)
    }

    /// Operation currently in flight on this characteristic
    pub fn busy(&self) -> Option<OperationKind> {
        self.with_node(|node| node.busy).flatten()
    }

    pub fn is_disposed(&self) -> bool {
        self.with_node(|_| ()).is_none()
    }

    fn target(&self) -> Target {
        Target::Characteristic(self.key)
    }

    fn with_node<R>(&self, f: impl FnOnce(&CharacteristicNode) -> R) -> Option<R> {
        let st = self.device.shared.state.lock();
        st.cache.characteristic(self.key).map(|(_, node)| f(node))
    }

    /// Run `f` on the live node under the device lock
    fn live<R>(
        &self,
        f: impl FnOnce(&mut CharacteristicNode) -> Result<R, BleError>,
    ) -> Result<R, BleError> {
        let shared = &self.device.shared;
        let mut st = shared.state.lock();
        st.ensure_alive(&shared.id)?;
        let node = st
            .cache
            .characteristic_mut(self.key)
            .ok_or_else(|| unknown(&self.device, self.target()))?;
        f(node)
    }

    pub async fn read(&self, options: CallOptions) -> Result<Vec<u8>, BleError> {
        let uuid = self.uuid;
        self.live(|node| {
            if gatt::supports(node.properties, Capability::Read) {
                Ok(())
            } else {
                Err(BleError::CantRead { uuid })
            }
        })?;

        let response = self
            .device
            .shared
            .run(OperationRequest::new(OperationKind::Read, self.target()), &options)
            .await?;
        let Response::Value(value) = response else {
            return Err(invalid_response(&self.device, OperationKind::Read));
        };
        self.live(|node| {
            node.value = value.clone();
            Ok(())
        })?;
        Ok(value)
    }

    /// Write with the best write type the characteristic allows
    pub async fn write(&self, data: &[u8], options: CallOptions) -> Result<(), BleError> {
        let uuid = self.uuid;
        let write_type = self.live(|node| {
            WriteType::preferred_for(node.properties).ok_or(BleError::CantWrite {
                uuid,
                capability: Capability::Write(WriteType::WithResponse),
            })
        })?;
        self.write_with(data, write_type, options).await
    }

    pub async fn write_with(
        &self,
        data: &[u8],
        write_type: WriteType,
        options: CallOptions,
    ) -> Result<(), BleError> {
        let uuid = self.uuid;
        let capability = Capability::Write(write_type);
        self.live(|node| {
            if gatt::supports(node.properties, capability) {
                Ok(())
            } else {
                Err(BleError::CantWrite { uuid, capability })
            }
        })?;

        let request = OperationRequest::new(OperationKind::Write, self.target()).with_payload(
            Payload::Write {
                data: data.to_vec(),
                write_type,
            },
        );
        self.device.shared.run(request, &options).await?;
        self.live(|node| {
            node.value = data.to_vec();
            Ok(())
        })
    }

    /// Enable notifications or indications
    pub async fn subscribe(&self, options: CallOptions) -> Result<(), BleError> {
        let uuid = self.uuid;
        self.live(|node| {
            if !gatt::supports(node.properties, Capability::Listen) {
                Err(BleError::CantListen { uuid })
            } else if node.listening {
                Err(BleError::AlreadyListening { uuid })
            } else {
                Ok(())
            }
        })?;

        self.device
            .shared
            .run(
                OperationRequest::new(OperationKind::Subscribe, self.target()),
                &options,
            )
            .await?;
        self.live(|node| {
            node.listening = true;
            Ok(())
        })
    }

    pub async fn unsubscribe(&self, options: CallOptions) -> Result<(), BleError> {
        let uuid = self.uuid;
        self.live(|node| {
            if node.listening {
                Ok(())
            } else {
                Err(BleError::NotListening { uuid })
            }
        })?;

        self.device
            .shared
            .run(
                OperationRequest::new(OperationKind::Unsubscribe, self.target()),
                &options,
            )
            .await?;
        self.live(|node| {
            node.listening = false;
            Ok(())
        })
    }

    /// Discover this characteristic's descriptors
    pub async fn explore_descriptors(&self, options: CallOptions) -> Result<Vec<Descriptor>, BleError> {
        let shared = &self.device.shared;
        let response = shared
            .run(
                OperationRequest::new(OperationKind::ExploreDescriptors, self.target()),
                &options,
            )
            .await?;
        let Response::Descriptors(found) = response else {
            return Err(invalid_response(&self.device, OperationKind::ExploreDescriptors));
        };

        let keys = &shared.ctx.keys;
        let (descriptors, refs) = self.live(|node| {
            let removed = node.descriptors.apply_exploration(
                found,
                |d| d.uuid,
                |d| DescriptorNode::from_discovered(keys.next(), d),
                |existing, d| existing.permissions = d.permissions,
            );
            let descriptors = node
                .descriptors
                .iter()
                .map(|descriptor| Descriptor::from_node(&self.device, self.key, descriptor))
                .collect::<Vec<_>>();
            Ok((descriptors, refs_of(&removed)))
        })?;

        shared.ctx.release_entities(&shared.id, &refs);
        Ok(descriptors)
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.with_node(|node| {
            node.descriptors
                .iter()
                .map(|descriptor| Descriptor::from_node(&self.device, self.key, descriptor))
                .collect()
        })
        .unwrap_or_default()
    }

    /// The one descriptor with `uuid`
    pub fn find_descriptor(&self, uuid: Uuid) -> Result<Descriptor, LookupError<Descriptor>> {
        let parent = format!("characteristic {} on {}", self.uuid, self.device.id());
        let st = self.device.shared.state.lock();
        let Some((_, node)) = st.cache.characteristic(self.key) else {
            return Err(LookupError::NotFound {
                kind: EntityKind::Descriptor,
                parent,
                id: uuid,
            });
        };
        node.descriptors
            .find_one(&parent, uuid)
            .map(|descriptor| Descriptor::from_node(&self.device, self.key, descriptor))
            .map_err(|e| e.map(|descriptor| Descriptor::from_node(&self.device, self.key, descriptor)))
    }

    pub fn first_descriptor(&self, uuid: Uuid) -> Option<Descriptor> {
        self.with_node(|node| {
            node.descriptors
                .first(uuid)
                .map(|descriptor| Descriptor::from_node(&self.device, self.key, descriptor))
        })
        .flatten()
    }

    pub fn find_descriptors(&self, uuid: Uuid) -> Vec<Descriptor> {
        self.with_node(|node| {
            node.descriptors
                .find_all(uuid)
                .into_iter()
                .map(|descriptor| Descriptor::from_node(&self.device, self.key, descriptor))
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn clear_descriptors(&self) {
        let shared = &self.device.shared;
        let refs = shared.state.lock().cache.invalidate(self.target());
        shared.ctx.release_entities(&shared.id, &refs);
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("device", self.device.id())
            .field("key", &self.key)
            .field("uuid", &self.uuid)
            .field("properties", &self.properties)
            .finish()
    }
}

impl PartialEq for Characteristic {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device && self.key == other.key
    }
}

/// A descriptor of a remote characteristic
#[derive(Clone)]
pub struct Descriptor {
    device: Device,
    characteristic: EntityKey,
    key: EntityKey,
    uuid: Uuid,
    permissions: AttributePermissions,
}

impl Descriptor {
    pub(crate) fn from_node(device: &Device, characteristic: EntityKey, node: &DescriptorNode) -> Self {
        Self {
            device: device.clone(),
            characteristic,
            key: node.key,
            uuid: node.uuid,
            permissions: node.permissions,
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn characteristic_key(&self) -> EntityKey {
        self.characteristic
    }

    pub fn permissions(&self) -> AttributePermissions {
        self.permissions
    }

    pub fn value(&self) -> Vec<u8> {
        let st = self.device.shared.state.lock();
        st.cache
            .descriptor(self.key)
            .map(|(_, _, node)| node.value.clone())
            .unwrap_or_default()
    }

    pub fn is_disposed(&self) -> bool {
        self.device.shared.state.lock().cache.descriptor(self.key).is_none()
    }

    fn target(&self) -> Target {
        Target::Descriptor(self.key)
    }

    fn live<R>(&self, f: impl FnOnce(&mut DescriptorNode) -> Result<R, BleError>) -> Result<R, BleError> {
        let shared = &self.device.shared;
        let mut st = shared.state.lock();
        st.ensure_alive(&shared.id)?;
        let node = st
            .cache
            .descriptor_mut(self.key)
            .ok_or_else(|| unknown(&self.device, self.target()))?;
        f(node)
    }

    pub async fn read(&self, options: CallOptions) -> Result<Vec<u8>, BleError> {
        let uuid = self.uuid;
        self.live(|node| {
            if gatt::descriptor_supports(node.permissions, Capability::Read) {
                Ok(())
            } else {
                Err(BleError::CantRead { uuid })
            }
        })?;

        let response = self
            .device
            .shared
            .run(OperationRequest::new(OperationKind::Read, self.target()), &options)
            .await?;
        let Response::Value(value) = response else {
            return Err(invalid_response(&self.device, OperationKind::Read));
        };
        self.live(|node| {
            node.value = value.clone();
            Ok(())
        })?;
        Ok(value)
    }

    pub async fn write(&self, data: &[u8], options: CallOptions) -> Result<(), BleError> {
        let uuid = self.uuid;
        let capability = Capability::Write(WriteType::WithResponse);
        self.live(|node| {
            if gatt::descriptor_supports(node.permissions, capability) {
                Ok(())
            } else {
                Err(BleError::CantWrite { uuid, capability })
            }
        })?;

        let request = OperationRequest::new(OperationKind::Write, self.target())
            .with_payload(Payload::Bytes(data.to_vec()));
        self.device.shared.run(request, &options).await?;
        self.live(|node| {
            node.value = data.to_vec();
            Ok(())
        })
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("device", self.device.id())
            .field("key", &self.key)
            .field("uuid", &self.uuid)
            .finish()
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device && self.key == other.key
    }
}
