//! Scanner: discovers peripherals and keeps the device list
//!
//! Thin orchestration over the native binding. Every device it hands out routes its
//! operations through the shared correlator and state machine.

use futures::future::join_all;
use std::sync::Arc;

use super::adapter::{DeviceId, Permission, ScanFilter};
use super::correlator::CallOptions;
use super::device::{Device, DeviceRole};
use super::error::BleError;
use super::events::SessionEvent;
use super::state::{ConnectionState, Lifecycle};
use super::{collapse_retry, ensure_permission, Context};
use crate::retry;

#[derive(Debug, Default)]
pub(crate) struct ScanState {
    pub lifecycle: Lifecycle,
    pub filter: ScanFilter,
}

/// Central-role entry point
#[derive(Clone)]
pub struct Scanner {
    ctx: Arc<Context>,
}

impl Scanner {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.ctx.scan.lock().lifecycle
    }

    pub fn is_scanning(&self) -> bool {
        self.lifecycle() == Lifecycle::Started
    }

    /// Start scanning with `filter`
    pub async fn start(&self, filter: ScanFilter) -> Result<(), BleError> {
        {
            let mut scan = self.ctx.scan.lock();
            scan.lifecycle = scan.lifecycle.begin_start("scanner")?;
        }

        if let Err(e) = ensure_permission(&self.ctx, Permission::Scan).await {
            self.ctx.scan.lock().lifecycle = Lifecycle::Stopped;
            return Err(e);
        }

        let binding = &self.ctx.binding;
        let requested = &filter;
        let result = retry::run_with(
            &self.ctx.options.retry,
            None,
            BleError::is_retryable,
            move |_| binding.start_scanning(requested),
        )
        .await
        .map_err(|e| collapse_retry(e, BleError::ScanningFailed));

        let mut scan = self.ctx.scan.lock();
        match result {
            Ok(()) => {
                scan.lifecycle = Lifecycle::Started;
                scan.filter = filter;
                drop(scan);
                tracing::info!("🔍 Scanning started");
                self.ctx.events.publish(SessionEvent::ScanStarted);
                Ok(())
            }
            Err(e) => {
                scan.lifecycle = Lifecycle::Stopped;
                drop(scan);
                tracing::error!("❌ Failed to start scanning: {}", e);
                Err(e)
            }
        }
    }

    /// Stop scanning; with `auto_cleanup_on_stop`, forget disconnected devices
    pub async fn stop(&self) -> Result<(), BleError> {
        {
            let mut scan = self.ctx.scan.lock();
            scan.lifecycle = scan.lifecycle.begin_stop("scanner")?;
        }

        let binding = &self.ctx.binding;
        let result = retry::run_with(
            &self.ctx.options.retry,
            None,
            BleError::is_retryable,
            move |_| binding.stop_scanning(),
        )
        .await
        .map_err(|e| collapse_retry(e, BleError::ScanningFailed));

        if let Err(e) = result {
            self.ctx.scan.lock().lifecycle = Lifecycle::Started;
            tracing::warn!("Failed to stop scanning: {}", e);
            return Err(e);
        }

        self.ctx.scan.lock().lifecycle = Lifecycle::Stopped;
        tracing::info!("🛑 Scanning stopped");
        self.ctx.events.publish(SessionEvent::ScanStopped);

        if self.ctx.options.auto_cleanup_on_stop {
            let idle: Vec<Device> = self
                .devices()
                .into_iter()
                .filter(|device| device.state() == ConnectionState::Disconnected)
                .collect();
            for device in &idle {
                device.shared.retire();
            }
            tracing::debug!("Cleaned up {} idle device(s)", idle.len());
        }
        Ok(())
    }

    /// Known devices, in no particular order
    pub fn devices(&self) -> Vec<Device> {
        self.ctx.devices.read().values().cloned().collect()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.ctx.devices.read().get(id).cloned()
    }

    /// Handle for a device known by address, whether or not it was seen advertising
    pub fn get_or_create(&self, id: DeviceId) -> Device {
        let mut devices = self.ctx.devices.write();
        devices
            .entry(id.clone())
            .or_insert_with(|| {
                Device::new(id, DeviceRole::Peripheral, self.ctx.clone(), ConnectionState::Disconnected)
            })
            .clone()
    }

    /// Disconnect if needed, then dispose the device and its whole entity subtree
    pub async fn remove_device(&self, id: &DeviceId) -> Result<(), BleError> {
        let device = self.device(id).ok_or_else(|| BleError::Disposed { device: id.clone() })?;

        if device.state().holds_connection() {
            if let Err(e) = device.disconnect(CallOptions::default()).await {
                tracing::warn!("Disconnect before removing {} failed: {}", id, e);
            }
        }
        device.shared.retire();
        Ok(())
    }

    /// Remove every device, disconnecting the connected ones concurrently
    pub async fn clear(&self) {
        let ids: Vec<DeviceId> = self.ctx.devices.read().keys().cloned().collect();
        let removals = ids.iter().map(|id| self.remove_device(id));
        for result in join_all(removals).await {
            if let Err(e) = result {
                tracing::debug!("Device already gone during clear: {}", e);
            }
        }
    }

    /// Advertisement reported by the binding
    pub(crate) fn observe(&self, id: DeviceId, raw_rssi: i16, payload: Vec<u8>) {
        let min_rssi = {
            let scan = self.ctx.scan.lock();
            if scan.lifecycle != Lifecycle::Started {
                tracing::trace!("Ignoring advertisement from {} while not scanning", id);
                return;
            }
            scan.filter.min_rssi
        };

        let rssi = self.ctx.rssi.convert(&id, raw_rssi);
        if min_rssi.is_some_and(|min| rssi < min) {
            tracing::trace!("Ignoring {} below RSSI threshold ({} dBm)", id, rssi);
            return;
        }

        let (device, discovered) = {
            let mut devices = self.ctx.devices.write();
            match devices.get(&id) {
                Some(device) => (device.clone(), false),
                None => {
                    let device = Device::new(
                        id.clone(),
                        DeviceRole::Peripheral,
                        self.ctx.clone(),
                        ConnectionState::Disconnected,
                    );
                    devices.insert(id.clone(), device.clone());
                    (device, true)
                }
            }
        };
        device.record_advertisement(rssi, payload);

        if discovered {
            tracing::info!("📱 Discovered {} (RSSI: {} dBm)", id, rssi);
            self.ctx
                .events
                .publish(SessionEvent::DeviceDiscovered { device: id, rssi });
        } else {
            self.ctx
                .events
                .publish(SessionEvent::DeviceUpdated { device: id, rssi });
        }
    }
}
