//! Connection / exploration state machine
//!
//! The transition rules are pure functions so every `(state, request)` pair can be
//! checked without a radio. The device layer applies them under its per-device lock.

use serde::{Deserialize, Serialize};

use super::adapter::{DeviceId, OperationKind};
use super::error::BleError;

/// Connection state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected, services not (or no longer) explored
    Connected,
    /// Service exploration in flight
    Exploring,
    /// Connected with an explored service set
    Ready,
    Disconnecting,
    /// Lost the link unexpectedly; auto-reconnect in progress
    Reconnecting,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 7] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Exploring,
        ConnectionState::Ready,
        ConnectionState::Disconnecting,
        ConnectionState::Reconnecting,
    ];

    /// Link is up and GATT operations are legal
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Exploring | ConnectionState::Ready
        )
    }

    /// Device holds one of the connection slots counted against the connection limit
    pub fn holds_connection(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Lifecycle of the scanner and the broadcaster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl Lifecycle {
    /// Validate `start`; `what` names the orchestrator in errors
    pub fn begin_start(self, what: &'static str) -> Result<Lifecycle, BleError> {
        match self {
            Lifecycle::Stopped => Ok(Lifecycle::Starting),
            _ => Err(BleError::AlreadyStarted(what)),
        }
    }

    /// Validate `stop`
    pub fn begin_stop(self, what: &'static str) -> Result<Lifecycle, BleError> {
        match self {
            Lifecycle::Started => Ok(Lifecycle::Stopping),
            Lifecycle::Starting => Err(BleError::StillStarting(what)),
            Lifecycle::Stopped | Lifecycle::Stopping => Err(BleError::AlreadyStopped(what)),
        }
    }
}

/// Validate `Connect`; returns the state to enter
pub fn begin_connect(device: &DeviceId, state: ConnectionState) -> Result<ConnectionState, BleError> {
    match state {
        ConnectionState::Disconnected => Ok(ConnectionState::Connecting),
        ConnectionState::Connecting | ConnectionState::Reconnecting => {
            Err(BleError::AlreadyConnecting {
                device: device.clone(),
            })
        }
        ConnectionState::Connected | ConnectionState::Exploring | ConnectionState::Ready => {
            Err(BleError::AlreadyConnected {
                device: device.clone(),
            })
        }
        ConnectionState::Disconnecting => Err(BleError::InvalidState {
            device: device.clone(),
            operation: OperationKind::Connect,
            state,
        }),
    }
}

/// What a `Disconnect` request does in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectPlan {
    /// Issue a native disconnect from an established link
    Disconnect,
    /// Cancel the connect attempt first, then issue a native disconnect
    AbortConnect,
    /// Another disconnect is in flight; wait for it
    Join,
}

/// Validate `Disconnect`
pub fn begin_disconnect(device: &DeviceId, state: ConnectionState) -> Result<DisconnectPlan, BleError> {
    match state {
        ConnectionState::Disconnected => Err(BleError::AlreadyDisconnected {
            device: device.clone(),
        }),
        ConnectionState::Connecting | ConnectionState::Reconnecting => Ok(DisconnectPlan::AbortConnect),
        ConnectionState::Connected | ConnectionState::Exploring | ConnectionState::Ready => {
            Ok(DisconnectPlan::Disconnect)
        }
        ConnectionState::Disconnecting => Ok(DisconnectPlan::Join),
    }
}

/// Validate `ExploreServices`; returns the state to enter
pub fn begin_explore(device: &DeviceId, state: ConnectionState) -> Result<ConnectionState, BleError> {
    match state {
        ConnectionState::Connected | ConnectionState::Ready => Ok(ConnectionState::Exploring),
        ConnectionState::Exploring => Err(BleError::InvalidState {
            device: device.clone(),
            operation: OperationKind::ExploreServices,
            state,
        }),
        _ => Err(BleError::NotConnected {
            device: device.clone(),
            state,
        }),
    }
}

/// Whether the correlator may issue `kind` in `state`
///
/// `Connect` and `Disconnect` are only issued by the device layer after it has entered
/// the matching transitional state.
pub fn check_operation(
    device: &DeviceId,
    state: ConnectionState,
    kind: OperationKind,
) -> Result<(), BleError> {
    let legal = match kind {
        OperationKind::Connect => {
            matches!(state, ConnectionState::Connecting | ConnectionState::Reconnecting)
        }
        OperationKind::Disconnect => state == ConnectionState::Disconnecting,
        _ => state.is_connected(),
    };
    if legal {
        return Ok(());
    }
    match kind {
        OperationKind::Connect => Err(begin_connect(device, state)
            .err()
            .unwrap_or(BleError::InvalidState {
                device: device.clone(),
                operation: kind,
                state,
            })),
        OperationKind::Disconnect if state == ConnectionState::Disconnected => {
            Err(BleError::AlreadyDisconnected {
                device: device.clone(),
            })
        }
        OperationKind::Disconnect => Err(BleError::InvalidState {
            device: device.clone(),
            operation: kind,
            state,
        }),
        _ => Err(BleError::NotConnected {
            device: device.clone(),
            state,
        }),
    }
}

/// State reached when the link drops without a `Disconnect` call
pub fn on_unexpected_disconnect(state: ConnectionState, auto_reconnect: bool) -> ConnectionState {
    if auto_reconnect && state.is_connected() {
        ConnectionState::Reconnecting
    } else {
        ConnectionState::Disconnected
    }
}
