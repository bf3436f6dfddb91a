//! Observable session events and the unhandled-error channel
//!
//! Events with a waiting caller are returned to that caller. Everything else (stray
//! native callbacks, background disconnects, spontaneous re-exploration) is reported on
//! the unhandled-error channel.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::adapter::{DeviceId, EntityKey, Target};
use super::error::BleError;
use super::state::ConnectionState;

/// Something observable happened in the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ScanStarted,
    ScanStopped,
    DeviceDiscovered {
        device: DeviceId,
        rssi: i16,
    },
    DeviceUpdated {
        device: DeviceId,
        rssi: i16,
    },
    DeviceRemoved {
        device: DeviceId,
    },
    StateChanged {
        device: DeviceId,
        from: ConnectionState,
        to: ConnectionState,
    },
    Disconnected {
        device: DeviceId,
        /// Not initiated by a `disconnect` call
        unexpected: bool,
        reason: Option<String>,
    },
    Reconnected {
        device: DeviceId,
    },
    ChildrenChanged {
        device: DeviceId,
        parent: Target,
    },
    ValueChanged {
        device: DeviceId,
        characteristic: EntityKey,
        uuid: Uuid,
        value: Vec<u8>,
    },
    AdvertisingStarted,
    AdvertisingStopped,
    ClientConnected {
        device: DeviceId,
    },
    ClientDisconnected {
        device: DeviceId,
    },
}

/// Fan-out of [`SessionEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        tracing::trace!(?event, "Session event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// What to do with an error that has no waiting caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledErrorPolicy {
    /// Publish on the unhandled-error channel
    #[default]
    Dispatch,
    /// Hand the error back to whoever reported it (the native binding's callback)
    Raise,
}

/// Process-wide channel for errors no caller is waiting for
#[derive(Debug, Clone)]
pub struct UnhandledErrors {
    tx: broadcast::Sender<BleError>,
}

static GLOBAL: OnceCell<UnhandledErrors> = OnceCell::new();

impl UnhandledErrors {
    /// A private channel, independent of the process-wide one
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// The process-wide channel shared by every infrastructure built with defaults
    pub fn global() -> UnhandledErrors {
        GLOBAL.get_or_init(|| UnhandledErrors::new(256)).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BleError> {
        self.tx.subscribe()
    }

    /// Route `error` according to `policy`
    pub fn report(&self, policy: UnhandledErrorPolicy, error: BleError) -> Result<(), BleError> {
        match policy {
            UnhandledErrorPolicy::Raise => {
                tracing::warn!("Raising unhandled error: {}", error);
                Err(error)
            }
            UnhandledErrorPolicy::Dispatch => {
                if self.tx.send(error.clone()).is_err() {
                    tracing::warn!("Unhandled error with no listener: {}", error);
                } else {
                    tracing::debug!("Dispatched unhandled error: {}", error);
                }
                Ok(())
            }
        }
    }
}
