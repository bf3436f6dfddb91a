//! Native binding over btleplug (central role only)
//!
//! Calls run as tasks on the tokio runtime and report back through [`Inbound`]. btleplug
//! addresses attributes by UUID, so when a device exposes duplicate UUIDs the first match
//! in the platform's order is used.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic as BtleCharacteristic, Descriptor as BtleDescriptor,
    Manager as _, Peripheral as _, ScanFilter as BtleScanFilter, WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::adapter::{
    AdapterInfo, AttributePath, DeviceId, DiscoveredCharacteristic, DiscoveredDescriptor,
    DiscoveredService, NativeBinding, NativeCall, NativeFailure, NativeOutcome, OperationKind,
    Payload, Response, ScanFilter, Target,
};
use super::error::BleError;
use super::gatt::{AttributePermissions, CharacteristicProperties, WriteType};
use super::Inbound;

type Peripherals = Arc<RwLock<HashMap<DeviceId, Peripheral>>>;

fn platform(e: btleplug::Error) -> BleError {
    BleError::PlatformError(e.to_string())
}

fn failure(e: btleplug::Error) -> NativeFailure {
    NativeFailure::new(e.to_string())
}

/// btleplug-backed [`NativeBinding`]
pub struct BtleplugBinding {
    adapter: Adapter,
    runtime: Handle,
    info: AdapterInfo,
    inbound: Mutex<Option<Inbound>>,
    peripherals: Peripherals,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugBinding {
    /// Bind to the first adapter of the platform manager
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(platform)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform)?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterNotAvailable)?;
        let name = adapter.adapter_info().await.map_err(platform)?;
        tracing::info!("🔵 Using Bluetooth adapter: {}", name);

        Ok(Self {
            adapter,
            runtime: Handle::current(),
            info: AdapterInfo {
                platform: std::env::consts::OS.to_string(),
                name,
                powered: true,
            },
            inbound: Mutex::new(None),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            event_task: Mutex::new(None),
        })
    }

    fn attached(&self) -> Result<Inbound, BleError> {
        self.inbound
            .lock()
            .clone()
            .ok_or_else(|| BleError::PlatformError("binding not attached".to_string()))
    }
}

fn to_properties(characteristic: &BtleCharacteristic) -> CharacteristicProperties {
    // btleplug uses the GATT property bit layout
    CharacteristicProperties::from_bits_truncate(characteristic.properties.bits())
}

fn find_characteristic(peripheral: &Peripheral, path: &AttributePath) -> Option<BtleCharacteristic> {
    let service = path.service?;
    let uuid = path.characteristic?;
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == service && c.uuid == uuid)
}

fn find_descriptor(peripheral: &Peripheral, path: &AttributePath) -> Option<BtleDescriptor> {
    let uuid = path.descriptor?;
    find_characteristic(peripheral, path)?
        .descriptors
        .into_iter()
        .find(|d| d.uuid == uuid)
}

fn missing(call: &NativeCall) -> NativeFailure {
    NativeFailure::new(format!("{} not present on {}", call.target, call.device))
}

fn payload_bytes(payload: &Payload) -> (&[u8], BtleWriteType) {
    match payload {
        Payload::None => (&[], BtleWriteType::WithResponse),
        Payload::Bytes(data) => (data.as_slice(), BtleWriteType::WithResponse),
        Payload::Write { data, write_type } => {
            let mode = match write_type {
                WriteType::WithResponse => BtleWriteType::WithResponse,
                WriteType::WithoutResponse | WriteType::Signed => BtleWriteType::WithoutResponse,
            };
            (data.as_slice(), mode)
        }
    }
}

async fn execute(peripheral: &Peripheral, call: &NativeCall) -> NativeOutcome {
    match call.kind {
        OperationKind::Connect => {
            peripheral.connect().await.map_err(failure)?;
            Ok(Response::Done)
        }
        OperationKind::Disconnect => {
            peripheral.disconnect().await.map_err(failure)?;
            Ok(Response::Done)
        }
        OperationKind::ExploreServices => {
            peripheral.discover_services().await.map_err(failure)?;
            let services = peripheral
                .services()
                .into_iter()
                .map(|service| DiscoveredService {
                    uuid: service.uuid,
                    is_primary: service.primary,
                })
                .collect();
            Ok(Response::Services(services))
        }
        OperationKind::ExploreCharacteristics => {
            let uuid = call.path.service.ok_or_else(|| missing(call))?;
            let service = peripheral
                .services()
                .into_iter()
                .find(|service| service.uuid == uuid)
                .ok_or_else(|| missing(call))?;
            let characteristics = service
                .characteristics
                .iter()
                .map(|c| DiscoveredCharacteristic {
                    uuid: c.uuid,
                    properties: to_properties(c),
                    permissions: AttributePermissions::empty(),
                })
                .collect();
            Ok(Response::Characteristics(characteristics))
        }
        OperationKind::ExploreDescriptors => {
            let characteristic = find_characteristic(peripheral, &call.path).ok_or_else(|| missing(call))?;
            let descriptors = characteristic
                .descriptors
                .iter()
                .map(|d| DiscoveredDescriptor {
                    uuid: d.uuid,
                    permissions: AttributePermissions::empty(),
                })
                .collect();
            Ok(Response::Descriptors(descriptors))
        }
        OperationKind::Read => match call.target {
            Target::Descriptor(_) => {
                let descriptor = find_descriptor(peripheral, &call.path).ok_or_else(|| missing(call))?;
                let value = peripheral.read_descriptor(&descriptor).await.map_err(failure)?;
                Ok(Response::Value(value))
            }
            _ => {
                let characteristic = find_characteristic(peripheral, &call.path).ok_or_else(|| missing(call))?;
                let value = peripheral.read(&characteristic).await.map_err(failure)?;
                Ok(Response::Value(value))
            }
        },
        OperationKind::Write => {
            let (data, mode) = payload_bytes(&call.payload);
            match call.target {
                Target::Descriptor(_) => {
                    let descriptor = find_descriptor(peripheral, &call.path).ok_or_else(|| missing(call))?;
                    peripheral
                        .write_descriptor(&descriptor, data)
                        .await
                        .map_err(failure)?;
                }
                _ => {
                    let characteristic = find_characteristic(peripheral, &call.path).ok_or_else(|| missing(call))?;
                    peripheral
                        .write(&characteristic, data, mode)
                        .await
                        .map_err(failure)?;
                }
            }
            Ok(Response::Done)
        }
        OperationKind::Subscribe => {
            let characteristic = find_characteristic(peripheral, &call.path).ok_or_else(|| missing(call))?;
            peripheral.subscribe(&characteristic).await.map_err(failure)?;
            Ok(Response::Done)
        }
        OperationKind::Unsubscribe => {
            let characteristic = find_characteristic(peripheral, &call.path).ok_or_else(|| missing(call))?;
            peripheral.unsubscribe(&characteristic).await.map_err(failure)?;
            Ok(Response::Done)
        }
        OperationKind::ReadRssi => {
            let properties = peripheral.properties().await.map_err(failure)?;
            properties
                .and_then(|p| p.rssi)
                .map(Response::Rssi)
                .ok_or_else(|| NativeFailure::new("RSSI unavailable"))
        }
    }
}

/// Forward notifications of one characteristic until the peripheral's stream ends
async fn forward_notifications(peripheral: Peripheral, call: NativeCall, inbound: Inbound) {
    let Some(uuid) = call.path.characteristic else {
        return;
    };
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("No notification stream for {}: {}", call.device, e);
            return;
        }
    };
    while let Some(notification) = notifications.next().await {
        if notification.uuid != uuid {
            continue;
        }
        if let Err(e) = inbound.notify_value_changed(&call.device, call.target, notification.value) {
            tracing::debug!("Notification for {} not delivered: {}", call.device, e);
            break;
        }
    }
}

#[async_trait]
impl NativeBinding for BtleplugBinding {
    fn attach(&self, inbound: Inbound) {
        *self.inbound.lock() = Some(inbound);
    }

    fn issue(&self, call: NativeCall) -> Result<(), BleError> {
        let inbound = self.attached()?;
        let peripheral = self
            .peripherals
            .read()
            .get(&call.device)
            .cloned()
            .ok_or_else(|| BleError::PlatformError(format!("unknown peripheral {}", call.device)))?;

        self.runtime.spawn(async move {
            let outcome = execute(&peripheral, &call).await;
            let subscribed = call.kind == OperationKind::Subscribe && outcome.is_ok();
            if let Err(e) = inbound.notify_native_completion(&call.device, call.kind, call.target, outcome) {
                tracing::warn!("Completion for {} raised: {}", call.device, e);
            }
            if subscribed {
                forward_notifications(peripheral, call, inbound).await;
            }
        });
        Ok(())
    }

    async fn start_scanning(&self, filter: &ScanFilter) -> Result<(), BleError> {
        let inbound = self.attached()?;
        let mut events = self.adapter.events().await.map_err(platform)?;
        self.adapter
            .start_scan(BtleScanFilter {
                services: filter.service_uuids.clone(),
            })
            .await
            .map_err(|e| BleError::ScanningFailed(e.to_string()))?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let task = self.runtime.spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let Ok(Some(properties)) = peripheral.properties().await else {
                            continue;
                        };
                        let Some(rssi) = properties.rssi else {
                            continue;
                        };
                        let device = DeviceId::new(properties.address.to_string());
                        let payload: Vec<u8> = properties
                            .manufacturer_data
                            .values()
                            .flatten()
                            .copied()
                            .collect();
                        peripherals.write().insert(device.clone(), peripheral);
                        if let Err(e) = inbound.notify_advertisement(device, rssi, payload) {
                            tracing::debug!("Advertisement not delivered: {}", e);
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let Ok(peripheral) = adapter.peripheral(&id).await else {
                            continue;
                        };
                        let device = DeviceId::new(peripheral.address().to_string());
                        if let Err(e) = inbound.notify_unexpected_disconnect(&device, "link lost") {
                            tracing::debug!("Disconnect of {} not delivered: {}", device, e);
                        }
                    }
                    _ => {}
                }
            }
        });

        if let Some(previous) = self.event_task.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), BleError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanningFailed(e.to_string()))?;
        // Keep the event task: disconnect events still matter after scanning stops
        Ok(())
    }

    fn adapter_info(&self) -> AdapterInfo {
        self.info.clone()
    }
}

impl Drop for BtleplugBinding {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }
}
