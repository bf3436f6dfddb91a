//! Broadcaster: peripheral role
//!
//! Advertises the locally hosted services and tracks the remote centrals connected to us.
//! Client devices share the device model of the scanner, starting out `Connected`.

use std::sync::Arc;
use uuid::Uuid;

use super::adapter::{AdvertisingOptions, DeviceId, EntityKey, EntityKind, Permission};
use super::cache::{CacheEntry, EntityList, LookupError};
use super::device::{Device, DeviceRole};
use super::error::BleError;
use super::events::SessionEvent;
use super::gatt::{AttributePermissions, CharacteristicProperties};
use super::state::{ConnectionState, Lifecycle};
use super::{collapse_retry, ensure_permission, Context};
use crate::retry;

/// A characteristic hosted by the local GATT server
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub value: Vec<u8>,
}

impl LocalCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            permissions: AttributePermissions::empty(),
            value: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }
}

/// A service hosted by the local GATT server
#[derive(Debug, Clone, PartialEq)]
pub struct LocalService {
    key: EntityKey,
    uuid: Uuid,
    is_primary: bool,
    characteristics: Vec<LocalCharacteristic>,
}

impl LocalService {
    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn characteristics(&self) -> &[LocalCharacteristic] {
        &self.characteristics
    }

    pub fn with_characteristic(mut self, characteristic: LocalCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }
}

impl CacheEntry for LocalService {
    const KIND: EntityKind = EntityKind::Service;

    fn key(&self) -> EntityKey {
        self.key
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

#[derive(Debug, Default)]
pub(crate) struct AdvertisingState {
    pub lifecycle: Lifecycle,
    pub services: EntityList<LocalService>,
}

const LOCAL: &str = "local server";

/// Peripheral-role entry point
#[derive(Clone)]
pub struct Broadcaster {
    ctx: Arc<Context>,
}

impl Broadcaster {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.ctx.advertising.lock().lifecycle
    }

    pub fn is_advertising(&self) -> bool {
        self.lifecycle() == Lifecycle::Started
    }

    /// A new, not yet hosted service with its own key
    pub fn new_service(&self, uuid: Uuid, is_primary: bool) -> LocalService {
        LocalService {
            key: self.ctx.keys.next(),
            uuid,
            is_primary,
            characteristics: Vec::new(),
        }
    }

    /// Host `service`; fails if this very service is already hosted
    pub fn add_service(&self, service: LocalService) -> Result<(), BleError> {
        let uuid = service.uuid;
        self.ctx.advertising.lock().services.add(LOCAL, service)?;
        tracing::debug!("Hosting service {}", uuid);
        Ok(())
    }

    pub fn remove_service(&self, key: EntityKey) -> Option<LocalService> {
        self.ctx.advertising.lock().services.remove(key)
    }

    pub fn clear_services(&self) -> Vec<LocalService> {
        self.ctx.advertising.lock().services.clear()
    }

    pub fn services(&self) -> Vec<LocalService> {
        self.ctx.advertising.lock().services.iter().cloned().collect()
    }

    pub fn find_service(&self, uuid: Uuid) -> Result<LocalService, LookupError<LocalService>> {
        let advertising = self.ctx.advertising.lock();
        advertising
            .services
            .find_one(LOCAL, uuid)
            .cloned()
            .map_err(|e| e.map(LocalService::clone))
    }

    pub fn first_service(&self, uuid: Uuid) -> Option<LocalService> {
        self.ctx.advertising.lock().services.first(uuid).cloned()
    }

    pub fn find_services(&self, uuid: Uuid) -> Vec<LocalService> {
        self.ctx
            .advertising
            .lock()
            .services
            .find_all(uuid)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Start advertising. With no explicit service UUIDs, the hosted primary services are
    /// advertised.
    pub async fn start(&self, mut options: AdvertisingOptions) -> Result<(), BleError> {
        {
            let mut advertising = self.ctx.advertising.lock();
            advertising.lifecycle = advertising.lifecycle.begin_start("broadcaster")?;
            if options.service_uuids.is_empty() {
                options.service_uuids = advertising
                    .services
                    .iter()
                    .filter(|service| service.is_primary)
                    .map(|service| service.uuid)
                    .collect();
            }
        }

        if let Err(e) = ensure_permission(&self.ctx, Permission::Advertise).await {
            self.ctx.advertising.lock().lifecycle = Lifecycle::Stopped;
            return Err(e);
        }

        let binding = &self.ctx.binding;
        let requested = &options;
        let result = retry::run_with(
            &self.ctx.options.retry,
            None,
            BleError::is_retryable,
            move |_| binding.start_advertising(requested),
        )
        .await
        .map_err(|e| collapse_retry(e, BleError::AdvertisingFailed));

        match result {
            Ok(()) => {
                self.ctx.advertising.lock().lifecycle = Lifecycle::Started;
                tracing::info!(
                    "📡 Advertising {} service(s){}",
                    options.service_uuids.len(),
                    options
                        .local_name
                        .as_deref()
                        .map(|name| format!(" as {}", name))
                        .unwrap_or_default()
                );
                self.ctx.events.publish(SessionEvent::AdvertisingStarted);
                Ok(())
            }
            Err(e) => {
                self.ctx.advertising.lock().lifecycle = Lifecycle::Stopped;
                tracing::error!("❌ Failed to start advertising: {}", e);
                Err(e)
            }
        }
    }

    /// Stop advertising; with `auto_cleanup_on_stop`, drop every client
    pub async fn stop(&self) -> Result<(), BleError> {
        {
            let mut advertising = self.ctx.advertising.lock();
            advertising.lifecycle = advertising.lifecycle.begin_stop("broadcaster")?;
        }

        let binding = &self.ctx.binding;
        let result = retry::run_with(
            &self.ctx.options.retry,
            None,
            BleError::is_retryable,
            move |_| binding.stop_advertising(),
        )
        .await
        .map_err(|e| collapse_retry(e, BleError::AdvertisingFailed));

        if let Err(e) = result {
            self.ctx.advertising.lock().lifecycle = Lifecycle::Started;
            tracing::warn!("Failed to stop advertising: {}", e);
            return Err(e);
        }

        self.ctx.advertising.lock().lifecycle = Lifecycle::Stopped;
        tracing::info!("🛑 Advertising stopped");
        self.ctx.events.publish(SessionEvent::AdvertisingStopped);

        if self.ctx.options.auto_cleanup_on_stop {
            for client in self.clients() {
                client.shared.retire();
            }
        }
        Ok(())
    }

    /// Remote centrals currently known to the server
    pub fn clients(&self) -> Vec<Device> {
        self.ctx.clients.read().values().cloned().collect()
    }

    pub fn client(&self, id: &DeviceId) -> Option<Device> {
        self.ctx.clients.read().get(id).cloned()
    }

    pub(crate) fn on_client_connected(&self, id: DeviceId) {
        let mut clients = self.ctx.clients.write();
        let reconnected = match clients.get(&id) {
            Some(existing) => {
                let shared = &existing.shared;
                let mut st = shared.state.lock();
                if st.removed {
                    drop(st);
                    clients.remove(&id);
                    false
                } else {
                    shared.transition(&mut st, ConnectionState::Connected);
                    true
                }
            }
            None => false,
        };
        if !reconnected {
            let device = Device::new(id.clone(), DeviceRole::Client, self.ctx.clone(), ConnectionState::Connected);
            clients.insert(id.clone(), device);
        }
        drop(clients);

        tracing::info!("🤝 Client {} connected", id);
        self.ctx
            .events
            .publish(SessionEvent::ClientConnected { device: id });
    }

    pub(crate) fn on_client_disconnected(&self, id: &DeviceId) -> Result<(), BleError> {
        let Some(client) = self.client(id) else {
            tracing::debug!("Disconnect reported for unknown client {}", id);
            return Ok(());
        };

        let refs = {
            let shared = &client.shared;
            let mut st = shared.state.lock();
            if st.connection == ConnectionState::Disconnected {
                return Ok(());
            }
            shared.enter_disconnected(&mut st, "client disconnected")
        };

        tracing::info!("👋 Client {} disconnected", id);
        self.ctx
            .events
            .publish(SessionEvent::ClientDisconnected { device: id.clone() });
        client.shared.after_disconnected(refs);
        Ok(())
    }
}
