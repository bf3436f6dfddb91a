//! Error taxonomy of the session core

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::adapter::{DeviceId, EntityKind, OperationKind, Target};
use super::gatt::Capability;
use super::state::ConnectionState;

/// Broad classification of a [`BleError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wrong state for the request; caller-correctable, never retried
    StateViolation,
    /// Characteristic/descriptor lacks the requested capability
    CapabilityViolation,
    /// Not found, multiple found, unexpected exploration
    Lookup,
    /// Native radio failure; eligible for retry
    Transport,
    Timeout,
    Cancelled,
    /// Native callback that matched no pending operation
    UnexpectedCompletion,
    Configuration,
    Platform,
}

/// All failures of a retried operation, in attempt order
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateError<E> {
    causes: Vec<E>,
}

impl<E> AggregateError<E> {
    pub fn new(causes: Vec<E>) -> Self {
        Self { causes }
    }

    pub fn causes(&self) -> &[E] {
        &self.causes
    }

    pub fn into_causes(self) -> Vec<E> {
        self.causes
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    pub fn last(&self) -> Option<&E> {
        self.causes.last()
    }
}

impl<E: fmt::Display> fmt::Display for AggregateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} attempt(s) failed", self.causes.len())?;
        if let Some(last) = self.causes.last() {
            write!(f, "; last error: {}", last)?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for AggregateError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.causes
            .last()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// BLE session error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BleError {
    // State violations
    #[error("Device {device} is already connected")]
    AlreadyConnected { device: DeviceId },

    #[error("Device {device} is already connecting")]
    AlreadyConnecting { device: DeviceId },

    #[error("Device {device} is already disconnected")]
    AlreadyDisconnected { device: DeviceId },

    #[error("Device {device} is not connected (state: {state:?})")]
    NotConnected {
        device: DeviceId,
        state: ConnectionState,
    },

    #[error("Cannot {operation} device {device} while {state:?}")]
    InvalidState {
        device: DeviceId,
        operation: OperationKind,
        state: ConnectionState,
    },

    #[error("{0} is already started")]
    AlreadyStarted(&'static str),

    #[error("{0} is already stopped")]
    AlreadyStopped(&'static str),

    #[error("{0} is still starting")]
    StillStarting(&'static str),

    #[error("Connection limit of {limit} reached")]
    ConnectionLimitReached { limit: usize },

    #[error("Characteristic {uuid} is already listening")]
    AlreadyListening { uuid: Uuid },

    #[error("Characteristic {uuid} is not listening")]
    NotListening { uuid: Uuid },

    #[error("Device {device} already has a {pending} in progress ({requested} rejected)")]
    AlreadyInProgress {
        device: DeviceId,
        pending: OperationKind,
        requested: OperationKind,
    },

    #[error("Device {device} has been removed")]
    Disposed { device: DeviceId },

    // Capability violations
    #[error("Characteristic {uuid} cannot be read")]
    CantRead { uuid: Uuid },

    #[error("Characteristic {uuid} cannot be written ({capability})")]
    CantWrite { uuid: Uuid, capability: Capability },

    #[error("Characteristic {uuid} cannot be listened to")]
    CantListen { uuid: Uuid },

    // Lookup
    #[error("No {kind} {id} found under {parent}")]
    NotFound {
        kind: EntityKind,
        parent: String,
        id: Uuid,
    },

    #[error("{count} {kind} entries match {id} under {parent}")]
    MultipleFound {
        kind: EntityKind,
        parent: String,
        id: Uuid,
        count: usize,
    },

    #[error("{kind} entry {key} already present under {parent}")]
    AlreadyExists {
        kind: EntityKind,
        parent: String,
        key: super::adapter::EntityKey,
    },

    #[error("Device {device} reported new children under {parent} outside of exploration")]
    UnexpectedExploration { device: DeviceId, parent: Target },

    #[error("Device {device} has no cached {target}")]
    UnknownEntity { device: DeviceId, target: Target },

    // Transport
    #[error("BLE {operation} failed on {device}: {reason}")]
    Native {
        device: DeviceId,
        operation: OperationKind,
        reason: String,
    },

    #[error("Device {device} disconnected unexpectedly: {reason}")]
    UnexpectedDisconnection { device: DeviceId, reason: String },

    #[error("BLE {operation} on {device} returned an unexpected response")]
    InvalidResponse {
        device: DeviceId,
        operation: OperationKind,
    },

    #[error("BLE {operation} on {device} failed after retries: {errors}")]
    Exhausted {
        device: DeviceId,
        operation: OperationKind,
        errors: AggregateError<BleError>,
    },

    #[error("BLE scanning failed: {0}")]
    ScanningFailed(String),

    #[error("BLE advertising failed: {0}")]
    AdvertisingFailed(String),

    // Timeout / cancellation
    #[error("BLE {operation} on {device} timed out after {after:?}")]
    Timeout {
        device: DeviceId,
        operation: OperationKind,
        after: Duration,
    },

    #[error("BLE {operation} on {device} was cancelled")]
    Cancelled {
        device: DeviceId,
        operation: OperationKind,
    },

    #[error("Unexpected {operation} completion from {device} for {target}")]
    UnexpectedCompletion {
        device: DeviceId,
        operation: OperationKind,
        target: Target,
    },

    // Platform / configuration
    #[error("BLE permission denied: {0}")]
    PermissionDenied(String),

    #[error("BLE operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Platform error: {0}")]
    PlatformError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BleError::AlreadyConnected { .. }
            | BleError::AlreadyConnecting { .. }
            | BleError::AlreadyDisconnected { .. }
            | BleError::NotConnected { .. }
            | BleError::InvalidState { .. }
            | BleError::AlreadyStarted(_)
            | BleError::AlreadyStopped(_)
            | BleError::StillStarting(_)
            | BleError::ConnectionLimitReached { .. }
            | BleError::AlreadyListening { .. }
            | BleError::NotListening { .. }
            | BleError::AlreadyInProgress { .. }
            | BleError::Disposed { .. } => ErrorKind::StateViolation,
            BleError::CantRead { .. } | BleError::CantWrite { .. } | BleError::CantListen { .. } => {
                ErrorKind::CapabilityViolation
            }
            BleError::NotFound { .. }
            | BleError::MultipleFound { .. }
            | BleError::AlreadyExists { .. }
            | BleError::UnexpectedExploration { .. }
            | BleError::UnknownEntity { .. } => ErrorKind::Lookup,
            BleError::Native { .. }
            | BleError::UnexpectedDisconnection { .. }
            | BleError::InvalidResponse { .. }
            | BleError::Exhausted { .. }
            | BleError::ScanningFailed(_)
            | BleError::AdvertisingFailed(_) => ErrorKind::Transport,
            BleError::Timeout { .. } => ErrorKind::Timeout,
            BleError::Cancelled { .. } => ErrorKind::Cancelled,
            BleError::UnexpectedCompletion { .. } => ErrorKind::UnexpectedCompletion,
            BleError::Configuration(_) => ErrorKind::Configuration,
            BleError::PermissionDenied(_)
            | BleError::OperationNotSupported(_)
            | BleError::AdapterNotAvailable
            | BleError::PlatformError(_) => ErrorKind::Platform,
        }
    }

    /// Only transport failures are retried. A timed-out call may still be running on the
    /// radio, so issuing it again could apply a write twice.
    pub fn is_retryable(&self) -> bool {
        match self {
            BleError::Exhausted { .. } => false,
            _ => self.kind() == ErrorKind::Transport,
        }
    }
}
