//! Platform-agnostic boundary with the native radio bindings
//!
//! The session core never talks to an OS radio API directly. Every native operation is
//! described as a [`NativeCall`] and handed to a [`NativeBinding`]; the binding reports the
//! outcome later through the [`Inbound`](super::Inbound) handle, exactly once per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::error::BleError;
use super::gatt::{AttributePermissions, CharacteristicProperties, WriteType};
use super::Inbound;

/// Opaque identifier of a remote radio endpoint (platform address or session token)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of one cached GATT entity.
///
/// UUIDs are not unique inside a parent, so every entity gets its own key when it enters
/// the cache. Keys are never reused within one [`Infrastructure`](super::Infrastructure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(pub u64);

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of GATT entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Service,
    Characteristic,
    Descriptor,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Service => f.write_str("service"),
            EntityKind::Characteristic => f.write_str("characteristic"),
            EntityKind::Descriptor => f.write_str("descriptor"),
        }
    }
}

/// The entity an operation is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Device,
    Service(EntityKey),
    Characteristic(EntityKey),
    Descriptor(EntityKey),
}

impl Target {
    pub fn key(&self) -> Option<EntityKey> {
        match self {
            Target::Device => None,
            Target::Service(key) | Target::Characteristic(key) | Target::Descriptor(key) => {
                Some(*key)
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device => f.write_str("device"),
            Target::Service(key) => write!(f, "service {}", key),
            Target::Characteristic(key) => write!(f, "characteristic {}", key),
            Target::Descriptor(key) => write!(f, "descriptor {}", key),
        }
    }
}

/// Kind of native operation routed through the correlator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Connect,
    Disconnect,
    ExploreServices,
    ExploreCharacteristics,
    ExploreDescriptors,
    Read,
    Write,
    Subscribe,
    Unsubscribe,
    ReadRssi,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::ExploreServices => "explore-services",
            OperationKind::ExploreCharacteristics => "explore-characteristics",
            OperationKind::ExploreDescriptors => "explore-descriptors",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Subscribe => "subscribe",
            OperationKind::Unsubscribe => "unsubscribe",
            OperationKind::ReadRssi => "read-rssi",
        };
        f.write_str(name)
    }
}

/// UUID path of the target, for bindings that address attributes by UUID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributePath {
    pub service: Option<Uuid>,
    pub characteristic: Option<Uuid>,
    pub descriptor: Option<Uuid>,
}

/// Data carried by an outbound call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    None,
    Bytes(Vec<u8>),
    Write { data: Vec<u8>, write_type: WriteType },
}

/// One outbound native call: `IssueNativeCall(deviceId, operationKind, targetEntityId, payload)`
#[derive(Debug, Clone)]
pub struct NativeCall {
    pub device: DeviceId,
    pub kind: OperationKind,
    pub target: Target,
    pub path: AttributePath,
    pub payload: Payload,
}

/// A service reported by native exploration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub is_primary: bool,
}

/// A characteristic reported by native exploration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
}

/// A descriptor reported by native exploration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDescriptor {
    pub uuid: Uuid,
    pub permissions: AttributePermissions,
}

/// Successful result of a native call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Done,
    Value(Vec<u8>),
    Rssi(i16),
    Services(Vec<DiscoveredService>),
    Characteristics(Vec<DiscoveredCharacteristic>),
    Descriptors(Vec<DiscoveredDescriptor>),
}

/// Failure reported by the native stack for one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFailure {
    /// Platform status code, when the platform provides one (e.g. GATT status)
    pub code: Option<i32>,
    pub message: String,
}

impl NativeFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (status {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// What the native binding reports back for one call
pub type NativeOutcome = Result<Response, NativeFailure>;

/// Reference to a cached entity handed to [`NativeBinding::release`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub key: EntityKey,
    pub kind: EntityKind,
    pub uuid: Uuid,
}

/// Scan filter handed to the native scanner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Only report devices advertising one of these services (empty = all)
    pub service_uuids: Vec<Uuid>,
    /// Drop advertisements weaker than this (applied after RSSI conversion)
    pub min_rssi: Option<i16>,
}

/// Advertising parameters for the broadcaster role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvertisingOptions {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub connectable: bool,
}

/// Platform permission the radio may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Scan,
    Connect,
    Advertise,
}

/// Result of a permission check or request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Restricted,
}

/// Information about the BLE adapter
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Platform name (e.g., "Linux", "macOS", "Windows")
    pub platform: String,
    /// Adapter name or identifier
    pub name: String,
    /// Whether the adapter is powered on
    pub powered: bool,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) - Powered: {}", self.name, self.platform, self.powered)
    }
}

/// Native radio binding consumed by the session core
///
/// Implementations wrap one platform API. `issue` is fire-and-forget: the binding must
/// eventually call [`Inbound::notify_native_completion`](super::Inbound::notify_native_completion)
/// exactly once for every call it accepted.
#[async_trait]
pub trait NativeBinding: Send + Sync {
    /// Receive the inbound handle used for completions and spontaneous events
    fn attach(&self, _inbound: Inbound) {}

    /// Start one native call
    ///
    /// Returning `Err` means the call was never started; no completion is expected.
    fn issue(&self, call: NativeCall) -> Result<(), BleError>;

    /// Release hook run when a cached entity is disposed
    fn release(&self, _device: &DeviceId, _entity: &EntityRef) {}

    /// Start scanning for advertisements
    async fn start_scanning(&self, filter: &ScanFilter) -> Result<(), BleError>;

    /// Stop scanning
    async fn stop_scanning(&self) -> Result<(), BleError>;

    /// Start advertising the hosted services (broadcaster role)
    async fn start_advertising(&self, _options: &AdvertisingOptions) -> Result<(), BleError> {
        Err(BleError::OperationNotSupported(
            "Advertising not supported on this platform".to_string(),
        ))
    }

    /// Stop advertising
    async fn stop_advertising(&self) -> Result<(), BleError> {
        Err(BleError::OperationNotSupported(
            "Advertising not supported on this platform".to_string(),
        ))
    }

    /// Check whether a permission is currently held
    async fn check_permission(&self, _permission: Permission) -> PermissionStatus {
        PermissionStatus::Granted
    }

    /// Ask the platform for a permission
    async fn request_permission(&self, permission: Permission) -> PermissionStatus {
        self.check_permission(permission).await
    }

    /// Get adapter information (platform-specific details)
    fn adapter_info(&self) -> AdapterInfo;
}
