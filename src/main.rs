//! gattlink demonstration
//!
//! Drives a full central-role session against the in-memory binding: scan, connect,
//! explore, read, subscribe, receive a notification, disconnect.

use anyhow::Context as _;
use gattlink::ble::{
    CharacteristicProperties, DiscoveredCharacteristic, DiscoveredService, NativeCall,
    OperationKind, RecordingBinding, Response, ScanFilter, Target,
};
use gattlink::{BleError, CallOptions, DeviceId, Infrastructure, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// A battery sensor that answers every call immediately
fn simulated_sensor(call: &NativeCall) -> Option<gattlink::ble::NativeOutcome> {
    let response = match call.kind {
        OperationKind::Connect | OperationKind::Disconnect => Response::Done,
        OperationKind::ExploreServices => Response::Services(vec![DiscoveredService {
            uuid: BATTERY_SERVICE,
            is_primary: true,
        }]),
        OperationKind::ExploreCharacteristics => {
            Response::Characteristics(vec![DiscoveredCharacteristic {
                uuid: BATTERY_LEVEL,
                properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                permissions: Default::default(),
            }])
        }
        OperationKind::ExploreDescriptors => Response::Descriptors(Vec::new()),
        OperationKind::Read => Response::Value(vec![87]),
        OperationKind::Write | OperationKind::Subscribe | OperationKind::Unsubscribe => Response::Done,
        OperationKind::ReadRssi => Response::Rssi(-58),
    };
    Some(Ok(response))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting gattlink demonstration...");

    let binding = Arc::new(RecordingBinding::new());
    binding.respond_with(simulated_sensor);
    let infra = Infrastructure::new(binding.clone()).context("building infrastructure")?;
    let mut events = infra.events();

    let scanner = infra.scanner();
    scanner.start(ScanFilter::default()).await?;

    // The radio reports an advertisement
    let inbound = binding.inbound().context("binding was not attached")?;
    let id = DeviceId::new("C4:7C:8D:6A:2B:10");
    inbound.notify_advertisement(id.clone(), -61, vec![0x0f, 0x18])?;

    let device = scanner.device(&id).context("advertisement did not register a device")?;
    info!("📱 Found {} at {:?} dBm", device.id(), device.rssi());

    device.connect(CallOptions::default()).await?;
    let services = device.explore_services(CallOptions::default()).await?;
    info!("🔍 {} service(s) discovered", services.len());

    let battery = device.find_service(BATTERY_SERVICE).map_err(BleError::from)?;
    battery.explore_characteristics(CallOptions::default()).await?;
    let level = battery
        .find_characteristic(BATTERY_LEVEL)
        .map_err(BleError::from)?;

    let value = level
        .read(CallOptions::with_timeout(Duration::from_secs(5)))
        .await?;
    info!("🔋 Battery level: {}%", value.first().copied().unwrap_or_default());

    level.subscribe(CallOptions::default()).await?;
    inbound.notify_value_changed(&id, Target::Characteristic(level.key()), vec![86])?;

    while let Ok(event) = events.try_recv() {
        if let SessionEvent::ValueChanged { value, .. } = event {
            info!("📡 Notification: battery now {}%", value.first().copied().unwrap_or_default());
        }
    }

    match device.read_rssi(CallOptions::default()).await {
        Ok(rssi) => info!("📶 Link RSSI: {} dBm", rssi),
        Err(e) => error!("❌ Failed to read RSSI: {}", e),
    }

    device.disconnect(CallOptions::default()).await?;
    infra.shutdown().await;

    info!("🎉 Demonstration completed ({} native calls issued)", binding.calls().len());
    Ok(())
}
