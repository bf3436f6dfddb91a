//! BLE GATT session core
//!
//! Turns a callback-driven native radio binding into a per-device session: connection and
//! exploration state machine, GATT entity cache, operation correlator and retry executor.
//! The [`Scanner`] (central role) and [`Broadcaster`] (peripheral role) are thin
//! orchestrators on top.

pub mod adapter;
pub mod broadcaster;
pub mod cache;
pub mod correlator;
pub mod device;
pub mod entity;
pub mod error;
pub mod events;
pub mod gatt;
pub mod recording;
pub mod rssi;
pub mod scanner;
pub mod state;

#[cfg(feature = "ble")]
pub mod btleplug_binding;

pub use adapter::{
    AdapterInfo, AdvertisingOptions, AttributePath, DeviceId, DiscoveredCharacteristic,
    DiscoveredDescriptor, DiscoveredService, EntityKey, EntityKind, EntityRef, NativeBinding,
    NativeCall, NativeFailure, NativeOutcome, OperationKind, Payload, Permission,
    PermissionStatus, Response, ScanFilter, Target,
};
pub use broadcaster::{Broadcaster, LocalCharacteristic, LocalService};
pub use cache::LookupError;
pub use correlator::{CallOptions, OperationRequest};
pub use device::{Device, DeviceRole};
pub use entity::{Characteristic, Descriptor, Service};
pub use error::{AggregateError, BleError, ErrorKind};
pub use events::{EventBus, SessionEvent, UnhandledErrorPolicy, UnhandledErrors};
pub use gatt::{AttributePermissions, Capability, CharacteristicProperties, WriteType};
pub use recording::RecordingBinding;
pub use rssi::{Passthrough, RssiConverter, SmoothedRssi};
pub use scanner::Scanner;
pub use state::{ConnectionState, Lifecycle};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::config::InfrastructureOptions;
use crate::retry::RetryError;
use broadcaster::AdvertisingState;
use cache::KeyAllocator;
use scanner::ScanState;

/// State shared by every device, scanner and broadcaster of one infrastructure
pub(crate) struct Context {
    pub options: InfrastructureOptions,
    pub binding: Arc<dyn NativeBinding>,
    pub events: EventBus,
    pub unhandled: UnhandledErrors,
    pub keys: KeyAllocator,
    pub rssi: Arc<dyn RssiConverter>,
    /// Runtime for background work (auto-reconnect)
    pub runtime: Option<Handle>,
    active_connections: AtomicUsize,
    pub devices: RwLock<HashMap<DeviceId, Device>>,
    pub clients: RwLock<HashMap<DeviceId, Device>>,
    pub scan: Mutex<ScanState>,
    pub advertising: Mutex<AdvertisingState>,
}

impl Context {
    /// Route an error nobody is waiting for
    pub fn report(&self, error: BleError) -> Result<(), BleError> {
        self.unhandled.report(self.options.unhandled_errors, error)
    }

    /// Claim a connection slot against `max_concurrent_connections`
    pub fn reserve_connection(&self) -> Result<(), BleError> {
        match self.options.max_concurrent_connections {
            None => {
                self.active_connections.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(limit) => self
                .active_connections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                    (active < limit).then_some(active + 1)
                })
                .map(|_| ())
                .map_err(|_| BleError::ConnectionLimitReached { limit }),
        }
    }

    pub fn release_connection(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| active.checked_sub(1));
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Run the binding's release hook for removed entities
    pub fn release_entities(&self, device: &DeviceId, refs: &[EntityRef]) {
        if refs.is_empty() || !self.options.auto_dispose_on_removal {
            return;
        }
        for entity in refs {
            self.binding.release(device, entity);
        }
        tracing::debug!("Released {} entities of {}", refs.len(), device);
    }

    fn registry(&self, role: DeviceRole) -> &RwLock<HashMap<DeviceId, Device>> {
        match role {
            DeviceRole::Peripheral => &self.devices,
            DeviceRole::Client => &self.clients,
        }
    }

    /// Drop a device from its registry; true if it was there
    pub fn unregister(&self, role: DeviceRole, id: &DeviceId) -> bool {
        self.registry(role).write().remove(id).is_some()
    }

    /// Any device known under `id`, peripherals first
    pub fn lookup(&self, id: &DeviceId) -> Option<Device> {
        if let Some(device) = self.devices.read().get(id) {
            return Some(device.clone());
        }
        self.clients.read().get(id).cloned()
    }
}

/// Single-cause failures surface as themselves; several are summarised by `wrap`
pub(crate) fn collapse_retry(err: RetryError<BleError>, wrap: fn(String) -> BleError) -> BleError {
    let mut causes = match err {
        RetryError::Cancelled { attempts, .. } => {
            return wrap(format!("cancelled after {} attempt(s)", attempts))
        }
        RetryError::Exhausted(aggregate) => aggregate.into_causes(),
        RetryError::Aborted { causes } => causes,
    };
    if causes.len() == 1 {
        if let Some(cause) = causes.pop() {
            return cause;
        }
    }
    wrap(AggregateError::new(causes).to_string())
}

/// Check a platform permission, asking for it if not yet held
pub(crate) async fn ensure_permission(ctx: &Context, permission: Permission) -> Result<(), BleError> {
    let status = match ctx.binding.check_permission(permission).await {
        PermissionStatus::Granted => return Ok(()),
        _ => ctx.binding.request_permission(permission).await,
    };
    match status {
        PermissionStatus::Granted => {
            tracing::info!("🔓 {:?} permission granted", permission);
            Ok(())
        }
        refused => {
            tracing::warn!("🔒 {:?} permission {:?}", permission, refused);
            Err(BleError::PermissionDenied(format!(
                "{:?} permission {:?}",
                permission, refused
            )))
        }
    }
}

/// Entry point for bindings to report native events
///
/// Every method returns `Ok(())` when the event was handled or dispatched on the
/// unhandled-error channel, and `Err` only under [`UnhandledErrorPolicy::Raise`].
#[derive(Clone)]
pub struct Inbound {
    ctx: Weak<Context>,
}

impl Inbound {
    fn context(&self) -> Result<Arc<Context>, BleError> {
        self.ctx.upgrade().ok_or_else(|| {
            BleError::PlatformError("infrastructure has been shut down".to_string())
        })
    }

    /// `Complete(deviceId, operationKind, targetEntityId, outcome)`
    pub fn notify_native_completion(
        &self,
        device: &DeviceId,
        kind: OperationKind,
        target: Target,
        outcome: NativeOutcome,
    ) -> Result<(), BleError> {
        let ctx = self.context()?;
        let Some(known) = ctx.lookup(device) else {
            return ctx.report(BleError::UnexpectedCompletion {
                device: device.clone(),
                operation: kind,
                target,
            });
        };
        match known.shared.complete(kind, target, outcome) {
            Ok(()) => Ok(()),
            Err(unmatched) => ctx.report(unmatched),
        }
    }

    /// The link to `device` dropped without a disconnect request
    pub fn notify_unexpected_disconnect(
        &self,
        device: &DeviceId,
        reason: impl Into<String>,
    ) -> Result<(), BleError> {
        let ctx = self.context()?;
        match ctx.lookup(device) {
            Some(known) if known.role() == DeviceRole::Client => {
                Broadcaster::new(ctx).on_client_disconnected(device)
            }
            Some(known) => known.shared.on_unexpected_disconnect(reason.into()),
            None => {
                tracing::debug!("Link loss reported for unknown device {}", device);
                Ok(())
            }
        }
    }

    /// The platform re-explored the children of `parent` on its own
    pub fn notify_children_changed(&self, device: &DeviceId, parent: Target) -> Result<(), BleError> {
        let ctx = self.context()?;
        match ctx.lookup(device) {
            Some(known) => known.shared.on_children_changed(parent),
            None => ctx.report(BleError::UnexpectedExploration {
                device: device.clone(),
                parent,
            }),
        }
    }

    /// Notification or indication received on a characteristic
    pub fn notify_value_changed(
        &self,
        device: &DeviceId,
        target: Target,
        value: Vec<u8>,
    ) -> Result<(), BleError> {
        let ctx = self.context()?;
        match ctx.lookup(device) {
            Some(known) => known.shared.on_value_changed(target, value),
            None => ctx.report(BleError::UnknownEntity {
                device: device.clone(),
                target,
            }),
        }
    }

    /// Advertisement seen while scanning
    pub fn notify_advertisement(
        &self,
        device: DeviceId,
        rssi: i16,
        payload: Vec<u8>,
    ) -> Result<(), BleError> {
        let ctx = self.context()?;
        Scanner::new(ctx).observe(device, rssi, payload);
        Ok(())
    }

    /// A remote central connected to our server
    pub fn notify_client_connected(&self, device: DeviceId) -> Result<(), BleError> {
        let ctx = self.context()?;
        Broadcaster::new(ctx).on_client_connected(device);
        Ok(())
    }

    /// A remote central disconnected from our server
    pub fn notify_client_disconnected(&self, device: &DeviceId) -> Result<(), BleError> {
        let ctx = self.context()?;
        Broadcaster::new(ctx).on_client_disconnected(device)
    }
}

/// Builder for [`Infrastructure`]
pub struct InfrastructureBuilder {
    binding: Arc<dyn NativeBinding>,
    options: InfrastructureOptions,
    rssi: Arc<dyn RssiConverter>,
    unhandled: Option<UnhandledErrors>,
    runtime: Option<Handle>,
}

impl InfrastructureBuilder {
    pub fn options(mut self, options: InfrastructureOptions) -> Self {
        self.options = options;
        self
    }

    pub fn rssi_converter(mut self, converter: Arc<dyn RssiConverter>) -> Self {
        self.rssi = converter;
        self
    }

    /// Use a private unhandled-error channel instead of the process-wide one
    pub fn unhandled_errors(mut self, channel: UnhandledErrors) -> Self {
        self.unhandled = Some(channel);
        self
    }

    /// Runtime for background reconnects; defaults to the current runtime if any
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Infrastructure, BleError> {
        self.options
            .validate()
            .map_err(|e| BleError::Configuration(e.to_string()))?;

        let ctx = Arc::new(Context {
            events: EventBus::new(self.options.event_capacity),
            unhandled: self.unhandled.unwrap_or_else(UnhandledErrors::global),
            keys: KeyAllocator::default(),
            rssi: self.rssi,
            runtime: self.runtime.or_else(|| Handle::try_current().ok()),
            active_connections: AtomicUsize::new(0),
            devices: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            scan: Mutex::new(ScanState::default()),
            advertising: Mutex::new(AdvertisingState::default()),
            binding: self.binding,
            options: self.options,
        });

        ctx.binding.attach(Inbound {
            ctx: Arc::downgrade(&ctx),
        });

        let info = ctx.binding.adapter_info();
        tracing::info!("🚀 BLE session core ready on {}", info);

        Ok(Infrastructure {
            inner: Arc::new(InfraInner { ctx }),
        })
    }
}

struct InfraInner {
    ctx: Arc<Context>,
}

impl Drop for InfraInner {
    fn drop(&mut self) {
        // Devices hold the context; dispose them to break the cycle
        let devices: Vec<Device> = self
            .ctx
            .devices
            .write()
            .drain()
            .chain(self.ctx.clients.write().drain())
            .map(|(_, device)| device)
            .collect();
        for device in devices {
            let refs = device.shared.dispose();
            self.ctx.release_entities(device.id(), &refs);
        }
    }
}

/// Owner of one BLE session: options, binding, devices and both orchestrators
#[derive(Clone)]
pub struct Infrastructure {
    inner: Arc<InfraInner>,
}

impl Infrastructure {
    /// Infrastructure with default options
    pub fn new(binding: Arc<dyn NativeBinding>) -> Result<Self, BleError> {
        Self::builder(binding).build()
    }

    pub fn builder(binding: Arc<dyn NativeBinding>) -> InfrastructureBuilder {
        InfrastructureBuilder {
            binding,
            options: InfrastructureOptions::default(),
            rssi: Arc::new(Passthrough),
            unhandled: None,
            runtime: None,
        }
    }

    fn ctx(&self) -> &Arc<Context> {
        &self.inner.ctx
    }

    pub fn options(&self) -> &InfrastructureOptions {
        &self.ctx().options
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(self.ctx().clone())
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(self.ctx().clone())
    }

    /// Handle for bindings that were not handed one through `attach`
    pub fn inbound(&self) -> Inbound {
        Inbound {
            ctx: Arc::downgrade(self.ctx()),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx().events.subscribe()
    }

    /// The unhandled-error channel this infrastructure reports to
    pub fn unhandled_errors(&self) -> &UnhandledErrors {
        &self.ctx().unhandled
    }

    pub fn adapter_info(&self) -> AdapterInfo {
        self.ctx().binding.adapter_info()
    }

    /// Devices currently counted against the connection limit
    pub fn active_connections(&self) -> usize {
        self.ctx().active_connections()
    }

    /// Any device (peripheral or client) known under `id`
    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.ctx().lookup(id)
    }

    /// Stop both orchestrators and disconnect every device concurrently
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down BLE session");
        let scanner = self.scanner();
        if scanner.is_scanning() {
            if let Err(e) = scanner.stop().await {
                tracing::warn!("Failed to stop scanner during shutdown: {}", e);
            }
        }
        let broadcaster = self.broadcaster();
        if broadcaster.is_advertising() {
            if let Err(e) = broadcaster.stop().await {
                tracing::warn!("Failed to stop broadcaster during shutdown: {}", e);
            }
        }

        let connected: Vec<Device> = scanner
            .devices()
            .into_iter()
            .filter(|device| device.state().holds_connection())
            .collect();
        let results = join_all(
            connected
                .iter()
                .map(|device| device.disconnect(CallOptions::default())),
        )
        .await;
        for (device, result) in connected.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Failed to disconnect {} during shutdown: {}", device.id(), e);
            }
        }
    }
}
