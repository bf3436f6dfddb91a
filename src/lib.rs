//! gattlink - BLE GATT session core
//!
//! Turns a callback-driven native Bluetooth Low Energy binding into a reliable session:
//! one in-flight operation per device, every native completion routed to the caller that
//! is waiting for it, an explicit connection/exploration state machine, a GATT entity
//! cache that tolerates duplicate UUIDs, and bounded retries with backoff.
//!
//! Platform radio code lives behind [`ble::NativeBinding`]. The crate ships an in-memory
//! [`ble::RecordingBinding`] and, with the `ble` feature, a btleplug binding.

pub mod ble;
pub mod config;
pub mod retry;

use std::sync::Arc;
use thiserror::Error;

pub use ble::{
    BleError, Broadcaster, CallOptions, Characteristic, ConnectionState, Descriptor, Device,
    DeviceId, Inbound, Infrastructure, NativeBinding, Scanner, Service, SessionEvent,
};
pub use config::{ConfigError, InfrastructureOptions, SubmitMode};
pub use retry::{RetryError, RetryPolicy};

/// Build an infrastructure from a configuration file (see [`InfrastructureOptions::load`])
#[cfg(feature = "config-file")]
pub fn infrastructure_from_file(
    path: impl AsRef<std::path::Path>,
    binding: Arc<dyn NativeBinding>,
) -> Result<Infrastructure, GattLinkError> {
    let options = InfrastructureOptions::load(path)?;
    Ok(Infrastructure::builder(binding).options(options).build()?)
}

/// Build an infrastructure from JSON options
pub fn infrastructure_from_json(
    json: &str,
    binding: Arc<dyn NativeBinding>,
) -> Result<Infrastructure, GattLinkError> {
    let options = InfrastructureOptions::from_json(json)?;
    Ok(Infrastructure::builder(binding).options(options).build()?)
}

/// Errors surfaced by the crate's top-level helpers
#[derive(Error, Debug)]
pub enum GattLinkError {
    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
