//! In-memory native binding
//!
//! Records every outbound call and lets the caller complete it by hand, or automatically
//! through a responder closure. Used by the test suite and the demo binary; also handy
//! for exercising application code without a radio.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

use super::adapter::{
    AdapterInfo, AdvertisingOptions, DeviceId, EntityRef, NativeBinding, NativeCall,
    NativeFailure, NativeOutcome, Permission, PermissionStatus, Response, ScanFilter,
};
use super::error::BleError;
use super::Inbound;

type Responder = Box<dyn Fn(&NativeCall) -> Option<NativeOutcome> + Send + Sync>;

#[derive(Default)]
struct Recorded {
    calls: Vec<NativeCall>,
    released: Vec<(DeviceId, EntityRef)>,
    scanning: bool,
    advertising: bool,
    scan_filter: Option<ScanFilter>,
    issue_failures: VecDeque<BleError>,
    radio_failures: VecDeque<BleError>,
    permissions: HashMap<Permission, PermissionStatus>,
    grant_on_request: bool,
}

/// Native binding that records calls instead of talking to a radio
pub struct RecordingBinding {
    recorded: Mutex<Recorded>,
    inbound: Mutex<Option<Inbound>>,
    responder: Mutex<Option<Responder>>,
    calls_tx: mpsc::UnboundedSender<NativeCall>,
    calls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<NativeCall>>,
}

impl Default for RecordingBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBinding {
    pub fn new() -> Self {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        Self {
            recorded: Mutex::new(Recorded {
                grant_on_request: true,
                ..Default::default()
            }),
            inbound: Mutex::new(None),
            responder: Mutex::new(None),
            calls_tx,
            calls_rx: tokio::sync::Mutex::new(calls_rx),
        }
    }

    /// Answer calls as they are issued; calls the closure declines stay pending
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&NativeCall) -> Option<NativeOutcome> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    pub fn clear_responder(&self) {
        *self.responder.lock() = None;
    }

    /// The inbound handle received through `attach`
    pub fn inbound(&self) -> Option<Inbound> {
        self.inbound.lock().clone()
    }

    /// Every call issued so far
    pub fn calls(&self) -> Vec<NativeCall> {
        self.recorded.lock().calls.clone()
    }

    /// Wait for the next issued call
    pub async fn next_call(&self) -> Option<NativeCall> {
        self.calls_rx.lock().await.recv().await
    }

    /// Report the outcome of `call` through the inbound handle
    pub fn complete(&self, call: &NativeCall, outcome: NativeOutcome) -> Result<(), BleError> {
        let inbound = self
            .inbound()
            .ok_or_else(|| BleError::PlatformError("binding not attached".to_string()))?;
        inbound.notify_native_completion(&call.device, call.kind, call.target, outcome)
    }

    pub fn succeed(&self, call: &NativeCall, response: Response) -> Result<(), BleError> {
        self.complete(call, Ok(response))
    }

    pub fn fail(&self, call: &NativeCall, message: &str) -> Result<(), BleError> {
        self.complete(call, Err(NativeFailure::new(message)))
    }

    /// Entities whose release hook ran
    pub fn released(&self) -> Vec<(DeviceId, EntityRef)> {
        self.recorded.lock().released.clone()
    }

    /// Make the next `issue` refuse the call synchronously
    pub fn fail_next_issue(&self, error: BleError) {
        self.recorded.lock().issue_failures.push_back(error);
    }

    /// Make the next scanning/advertising start or stop fail
    pub fn fail_next_radio_call(&self, error: BleError) {
        self.recorded.lock().radio_failures.push_back(error);
    }

    pub fn set_permission(&self, permission: Permission, status: PermissionStatus) {
        self.recorded.lock().permissions.insert(permission, status);
    }

    /// Whether `request_permission` grants what `check_permission` reports missing
    pub fn grant_on_request(&self, grant: bool) {
        self.recorded.lock().grant_on_request = grant;
    }

    pub fn is_scanning(&self) -> bool {
        self.recorded.lock().scanning
    }

    pub fn scan_filter(&self) -> Option<ScanFilter> {
        self.recorded.lock().scan_filter.clone()
    }

    pub fn is_advertising(&self) -> bool {
        self.recorded.lock().advertising
    }

    fn radio_call(&self, apply: impl FnOnce(&mut Recorded)) -> Result<(), BleError> {
        let mut recorded = self.recorded.lock();
        if let Some(error) = recorded.radio_failures.pop_front() {
            return Err(error);
        }
        apply(&mut recorded);
        Ok(())
    }
}

#[async_trait]
impl NativeBinding for RecordingBinding {
    fn attach(&self, inbound: Inbound) {
        *self.inbound.lock() = Some(inbound);
    }

    fn issue(&self, call: NativeCall) -> Result<(), BleError> {
        {
            let mut recorded = self.recorded.lock();
            if let Some(error) = recorded.issue_failures.pop_front() {
                return Err(error);
            }
            recorded.calls.push(call.clone());
        }
        tracing::trace!(device = %call.device, operation = %call.kind, "Recorded native call");

        let answer = self
            .responder
            .lock()
            .as_ref()
            .and_then(|responder| responder(&call));
        match answer {
            Some(outcome) => {
                if let Err(e) = self.complete(&call, outcome) {
                    tracing::debug!("Scripted completion was not accepted: {}", e);
                }
            }
            None => {
                let _ = self.calls_tx.send(call);
            }
        }
        Ok(())
    }

    fn release(&self, device: &DeviceId, entity: &EntityRef) {
        self.recorded
            .lock()
            .released
            .push((device.clone(), entity.clone()));
    }

    async fn start_scanning(&self, filter: &ScanFilter) -> Result<(), BleError> {
        self.radio_call(|recorded| {
            recorded.scanning = true;
            recorded.scan_filter = Some(filter.clone());
        })
    }

    async fn stop_scanning(&self) -> Result<(), BleError> {
        self.radio_call(|recorded| recorded.scanning = false)
    }

    async fn start_advertising(&self, _options: &AdvertisingOptions) -> Result<(), BleError> {
        self.radio_call(|recorded| recorded.advertising = true)
    }

    async fn stop_advertising(&self) -> Result<(), BleError> {
        self.radio_call(|recorded| recorded.advertising = false)
    }

    async fn check_permission(&self, permission: Permission) -> PermissionStatus {
        self.recorded
            .lock()
            .permissions
            .get(&permission)
            .copied()
            .unwrap_or(PermissionStatus::Granted)
    }

    async fn request_permission(&self, permission: Permission) -> PermissionStatus {
        let mut recorded = self.recorded.lock();
        if recorded.grant_on_request {
            recorded
                .permissions
                .insert(permission, PermissionStatus::Granted);
            PermissionStatus::Granted
        } else {
            recorded
                .permissions
                .get(&permission)
                .copied()
                .unwrap_or(PermissionStatus::Denied)
        }
    }

    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            platform: "Recording".to_string(),
            name: "in-memory".to_string(),
            powered: true,
        }
    }
}
