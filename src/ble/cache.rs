//! Entity cache: Device → Service → Characteristic → Descriptor
//!
//! UUIDs are not unique under a parent, so lookups come in three flavours with distinct
//! failure semantics: exactly one ([`EntityList::find_one`]), first in discovery order
//! ([`EntityList::first`]) and all matches ([`EntityList::find_all`]). The cache never
//! guesses: two matches for "exactly one" is a [`LookupError::MultipleFound`] carrying both.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

use super::adapter::{
    AttributePath, DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, EntityKey,
    EntityKind, EntityRef, OperationKind, Target,
};
use super::error::BleError;
use super::gatt::{AttributePermissions, CharacteristicProperties};

/// Typed outcome of a failed "exactly one" lookup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError<T>
where
    T: std::fmt::Debug,
{
    #[error("No {kind} {id} found under {parent}")]
    NotFound {
        kind: EntityKind,
        parent: String,
        id: Uuid,
    },

    #[error("{} {kind} entries match {id} under {parent}", matches.len())]
    MultipleFound {
        kind: EntityKind,
        parent: String,
        id: Uuid,
        matches: Vec<T>,
    },
}

impl<T: std::fmt::Debug> LookupError<T> {
    pub fn map<U: std::fmt::Debug>(self, f: impl FnMut(T) -> U) -> LookupError<U> {
        match self {
            LookupError::NotFound { kind, parent, id } => LookupError::NotFound { kind, parent, id },
            LookupError::MultipleFound {
                kind,
                parent,
                id,
                matches,
            } => LookupError::MultipleFound {
                kind,
                parent,
                id,
                matches: matches.into_iter().map(f).collect(),
            },
        }
    }

    /// All candidates of an ambiguous lookup (empty for NotFound)
    pub fn matches(&self) -> &[T] {
        match self {
            LookupError::NotFound { .. } => &[],
            LookupError::MultipleFound { matches, .. } => matches,
        }
    }
}

impl<T: std::fmt::Debug> From<LookupError<T>> for BleError {
    fn from(err: LookupError<T>) -> Self {
        match err {
            LookupError::NotFound { kind, parent, id } => BleError::NotFound { kind, parent, id },
            LookupError::MultipleFound {
                kind,
                parent,
                id,
                matches,
            } => BleError::MultipleFound {
                kind,
                parent,
                id,
                count: matches.len(),
            },
        }
    }
}

/// Something that can live in an [`EntityList`]
pub trait CacheEntry {
    const KIND: EntityKind;

    fn key(&self) -> EntityKey;

    fn uuid(&self) -> Uuid;

    /// Push references to this entry and its descendants, descendants first
    fn collect_refs(&self, out: &mut Vec<EntityRef>) {
        out.push(EntityRef {
            key: self.key(),
            kind: Self::KIND,
            uuid: self.uuid(),
        });
    }
}

/// Ordered children of one parent (insertion order = discovery order)
#[derive(Debug, Clone)]
pub struct EntityList<T> {
    items: Vec<T>,
    explored: bool,
}

impl<T> Default for EntityList<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            explored: false,
        }
    }
}

impl<T: CacheEntry + std::fmt::Debug> EntityList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether an exploration has populated this list
    pub fn is_explored(&self) -> bool {
        self.explored
    }

    pub fn get(&self, key: EntityKey) -> Option<&T> {
        self.items.iter().find(|item| item.key() == key)
    }

    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.key() == key)
    }

    /// Exactly one child with `id`
    pub fn find_one(&self, parent: &str, id: Uuid) -> Result<&T, LookupError<&T>> {
        let mut matches = self.find_all(id);
        match matches.len() {
            0 => Err(LookupError::NotFound {
                kind: T::KIND,
                parent: parent.to_string(),
                id,
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(LookupError::MultipleFound {
                kind: T::KIND,
                parent: parent.to_string(),
                id,
                matches,
            }),
        }
    }

    /// First child with `id` in discovery order
    pub fn first(&self, id: Uuid) -> Option<&T> {
        self.items.iter().find(|item| item.uuid() == id)
    }

    /// All children with `id`; never fails
    pub fn find_all(&self, id: Uuid) -> Vec<&T> {
        self.items.iter().filter(|item| item.uuid() == id).collect()
    }

    /// Add a child; fails only if this very entry (same key) is already present
    pub fn add(&mut self, parent: &str, child: T) -> Result<(), BleError> {
        if self.get(child.key()).is_some() {
            return Err(BleError::AlreadyExists {
                kind: T::KIND,
                parent: parent.to_string(),
                key: child.key(),
            });
        }
        self.items.push(child);
        Ok(())
    }

    pub fn remove(&mut self, key: EntityKey) -> Option<T> {
        let index = self.items.iter().position(|item| item.key() == key)?;
        Some(self.items.remove(index))
    }

    /// Drop every child and forget that the list was explored
    pub fn clear(&mut self) -> Vec<T> {
        self.explored = false;
        std::mem::take(&mut self.items)
    }

    /// Apply an exploration result and return the entries that left the list.
    ///
    /// The first exploration replaces the list. A refresh merges: the k-th existing entry
    /// with a UUID is kept (same key, refreshed attributes) for the k-th discovered entry
    /// with that UUID, so duplicates survive and existing handles stay valid.
    pub fn apply_exploration<D>(
        &mut self,
        discovered: Vec<D>,
        uuid_of: impl Fn(&D) -> Uuid,
        mut create: impl FnMut(D) -> T,
        mut refresh: impl FnMut(&mut T, D),
    ) -> Vec<T> {
        if !self.explored {
            let removed = std::mem::take(&mut self.items);
            self.items = discovered.into_iter().map(create).collect();
            self.explored = true;
            return removed;
        }

        let mut previous: Vec<Option<T>> = std::mem::take(&mut self.items)
            .into_iter()
            .map(Some)
            .collect();
        let mut next = Vec::with_capacity(discovered.len());
        for entry in discovered {
            let id = uuid_of(&entry);
            let reused = previous
                .iter_mut()
                .find(|slot| matches!(slot, Some(item) if item.uuid() == id))
                .and_then(Option::take);
            match reused {
                Some(mut item) => {
                    refresh(&mut item, entry);
                    next.push(item);
                }
                None => next.push(create(entry)),
            }
        }
        self.items = next;
        previous.into_iter().flatten().collect()
    }
}

/// Hands out entity keys; never reuses one
#[derive(Debug, Default)]
pub struct KeyAllocator(AtomicU64);

impl KeyAllocator {
    pub fn next(&self) -> EntityKey {
        EntityKey(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DescriptorNode {
    pub key: EntityKey,
    pub uuid: Uuid,
    pub permissions: AttributePermissions,
    pub value: Vec<u8>,
}

impl CacheEntry for DescriptorNode {
    const KIND: EntityKind = EntityKind::Descriptor;

    fn key(&self) -> EntityKey {
        self.key
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl DescriptorNode {
    pub fn from_discovered(key: EntityKey, discovered: DiscoveredDescriptor) -> Self {
        Self {
            key,
            uuid: discovered.uuid,
            permissions: discovered.permissions,
            value: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CharacteristicNode {
    pub key: EntityKey,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    /// Last value read or notified; may be stale
    pub value: Vec<u8>,
    pub listening: bool,
    /// In-flight operation marker
    pub busy: Option<OperationKind>,
    pub descriptors: EntityList<DescriptorNode>,
}

impl CacheEntry for CharacteristicNode {
    const KIND: EntityKind = EntityKind::Characteristic;

    fn key(&self) -> EntityKey {
        self.key
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn collect_refs(&self, out: &mut Vec<EntityRef>) {
        for descriptor in self.descriptors.iter() {
            descriptor.collect_refs(out);
        }
        out.push(EntityRef {
            key: self.key,
            kind: Self::KIND,
            uuid: self.uuid,
        });
    }
}

impl CharacteristicNode {
    pub fn from_discovered(key: EntityKey, discovered: DiscoveredCharacteristic) -> Self {
        Self {
            key,
            uuid: discovered.uuid,
            properties: discovered.properties,
            permissions: discovered.permissions,
            value: Vec::new(),
            listening: false,
            busy: None,
            descriptors: EntityList::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceNode {
    pub key: EntityKey,
    pub uuid: Uuid,
    pub is_primary: bool,
    pub characteristics: EntityList<CharacteristicNode>,
}

impl CacheEntry for ServiceNode {
    const KIND: EntityKind = EntityKind::Service;

    fn key(&self) -> EntityKey {
        self.key
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn collect_refs(&self, out: &mut Vec<EntityRef>) {
        for characteristic in self.characteristics.iter() {
            characteristic.collect_refs(out);
        }
        out.push(EntityRef {
            key: self.key,
            kind: Self::KIND,
            uuid: self.uuid,
        });
    }
}

impl ServiceNode {
    pub fn from_discovered(key: EntityKey, discovered: DiscoveredService) -> Self {
        Self {
            key,
            uuid: discovered.uuid,
            is_primary: discovered.is_primary,
            characteristics: EntityList::new(),
        }
    }
}

/// Collect release references for a batch of removed entries
pub(crate) fn refs_of<T: CacheEntry>(removed: &[T]) -> Vec<EntityRef> {
    let mut refs = Vec::new();
    for entry in removed {
        entry.collect_refs(&mut refs);
    }
    refs
}

/// The GATT tree of one device
#[derive(Debug, Default)]
pub(crate) struct GattCache {
    pub services: EntityList<ServiceNode>,
}

impl GattCache {
    pub fn service(&self, key: EntityKey) -> Option<&ServiceNode> {
        self.services.get(key)
    }

    pub fn service_mut(&mut self, key: EntityKey) -> Option<&mut ServiceNode> {
        self.services.get_mut(key)
    }

    pub fn characteristic(&self, key: EntityKey) -> Option<(&ServiceNode, &CharacteristicNode)> {
        self.services.iter().find_map(|service| {
            service
                .characteristics
                .get(key)
                .map(|characteristic| (service, characteristic))
        })
    }

    pub fn characteristic_mut(&mut self, key: EntityKey) -> Option<&mut CharacteristicNode> {
        self.services
            .items
            .iter_mut()
            .find_map(|service| service.characteristics.get_mut(key))
    }

    pub fn descriptor(
        &self,
        key: EntityKey,
    ) -> Option<(&ServiceNode, &CharacteristicNode, &DescriptorNode)> {
        self.services.iter().find_map(|service| {
            service.characteristics.iter().find_map(|characteristic| {
                characteristic
                    .descriptors
                    .get(key)
                    .map(|descriptor| (service, characteristic, descriptor))
            })
        })
    }

    pub fn descriptor_mut(&mut self, key: EntityKey) -> Option<&mut DescriptorNode> {
        self.services.items.iter_mut().find_map(|service| {
            service
                .characteristics
                .items
                .iter_mut()
                .find_map(|characteristic| characteristic.descriptors.get_mut(key))
        })
    }

    pub fn contains(&self, target: Target) -> bool {
        match target {
            Target::Device => true,
            Target::Service(key) => self.service(key).is_some(),
            Target::Characteristic(key) => self.characteristic(key).is_some(),
            Target::Descriptor(key) => self.descriptor(key).is_some(),
        }
    }

    /// UUID path of a cached target
    pub fn path(&self, target: Target) -> Option<AttributePath> {
        match target {
            Target::Device => Some(AttributePath::default()),
            Target::Service(key) => self.service(key).map(|service| AttributePath {
                service: Some(service.uuid),
                ..Default::default()
            }),
            Target::Characteristic(key) => {
                self.characteristic(key)
                    .map(|(service, characteristic)| AttributePath {
                        service: Some(service.uuid),
                        characteristic: Some(characteristic.uuid),
                        descriptor: None,
                    })
            }
            Target::Descriptor(key) => {
                self.descriptor(key)
                    .map(|(service, characteristic, descriptor)| AttributePath {
                        service: Some(service.uuid),
                        characteristic: Some(characteristic.uuid),
                        descriptor: Some(descriptor.uuid),
                    })
            }
        }
    }

    /// Set or clear the in-flight marker on a characteristic target
    pub fn mark_busy(&mut self, target: Target, busy: Option<OperationKind>) {
        if let Target::Characteristic(key) = target {
            if let Some(characteristic) = self.characteristic_mut(key) {
                characteristic.busy = busy;
            }
        }
    }

    /// Drop the children of `parent`, marking it unexplored
    pub fn invalidate(&mut self, parent: Target) -> Vec<EntityRef> {
        match parent {
            Target::Device => refs_of(&self.services.clear()),
            Target::Service(key) => self
                .service_mut(key)
                .map(|service| refs_of(&service.characteristics.clear()))
                .unwrap_or_default(),
            Target::Characteristic(key) => self
                .characteristic_mut(key)
                .map(|characteristic| refs_of(&characteristic.descriptors.clear()))
                .unwrap_or_default(),
            Target::Descriptor(_) => Vec::new(),
        }
    }

    pub fn clear(&mut self) -> Vec<EntityRef> {
        self.invalidate(Target::Device)
    }

    /// Keep the tree but forget per-link state. Lists stay explored, so the next
    /// exploration merges and existing handles survive.
    pub fn reset_link_state(&mut self) {
        for service in self.services.items.iter_mut() {
            for characteristic in service.characteristics.items.iter_mut() {
                characteristic.listening = false;
                characteristic.busy = None;
            }
        }
    }
}
