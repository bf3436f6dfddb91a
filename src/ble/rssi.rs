//! RSSI conversion applied to every advertisement and RSSI read

use parking_lot::Mutex;
use std::collections::HashMap;

use super::adapter::DeviceId;

/// Converts a raw RSSI reading (dBm) into the value exposed on [`Device`](super::Device)
pub trait RssiConverter: Send + Sync {
    fn convert(&self, device: &DeviceId, raw: i16) -> i16;
}

/// Reports readings unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl RssiConverter for Passthrough {
    fn convert(&self, _device: &DeviceId, raw: i16) -> i16 {
        raw
    }
}

/// Exponential moving average per device
///
/// `alpha` is the weight of the newest reading, clamped to `(0, 1]`.
#[derive(Debug)]
pub struct SmoothedRssi {
    alpha: f32,
    averages: Mutex<HashMap<DeviceId, f32>>,
}

impl SmoothedRssi {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(f32::EPSILON, 1.0),
            averages: Mutex::new(HashMap::new()),
        }
    }

    /// Forget the history of one device
    pub fn reset(&self, device: &DeviceId) {
        self.averages.lock().remove(device);
    }
}

impl RssiConverter for SmoothedRssi {
    fn convert(&self, device: &DeviceId, raw: i16) -> i16 {
        let mut averages = self.averages.lock();
        let average = averages
            .entry(device.clone())
            .and_modify(|avg| *avg += self.alpha * (raw as f32 - *avg))
            .or_insert(raw as f32);
        average.round() as i16
    }
}
