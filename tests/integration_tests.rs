//! Integration tests for the gattlink session core
//!
//! Every test drives the public API against the in-memory `RecordingBinding` and a private
//! unhandled-error channel, so tests never observe each other's stray errors.

use gattlink::ble::{
    AdvertisingOptions, AttributePermissions, CharacteristicProperties, ConnectionState,
    DeviceRole, DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, Lifecycle,
    LocalCharacteristic, LookupError, NativeCall, NativeFailure, NativeOutcome, OperationKind, Permission, PermissionStatus,
    RecordingBinding, Response, ScanFilter, Target, UnhandledErrorPolicy, UnhandledErrors,
};
use gattlink::{
    BleError, CallOptions, Characteristic, Device, DeviceId, Infrastructure,
    InfrastructureOptions, RetryPolicy, SessionEvent, SubmitMode,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
const LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
const CONTROL: Uuid = Uuid::from_u128(0x00002a9f_0000_1000_8000_00805f9b34fb);

struct Harness {
    binding: Arc<RecordingBinding>,
    infra: Infrastructure,
    unhandled: broadcast::Receiver<BleError>,
}

fn harness(options: InfrastructureOptions) -> Harness {
    let binding = Arc::new(RecordingBinding::new());
    let channel = UnhandledErrors::new(32);
    let unhandled = channel.subscribe();
    let infra = Infrastructure::builder(binding.clone())
        .options(options)
        .unhandled_errors(channel)
        .build()
        .expect("infrastructure should build");
    Harness {
        binding,
        infra,
        unhandled,
    }
}

fn fast_retry() -> InfrastructureOptions {
    InfrastructureOptions {
        retry: RetryPolicy::new(3, Duration::ZERO, false),
        ..Default::default()
    }
}

fn service(uuid: Uuid) -> DiscoveredService {
    DiscoveredService {
        uuid,
        is_primary: true,
    }
}

fn characteristic(uuid: Uuid, properties: CharacteristicProperties) -> DiscoveredCharacteristic {
    DiscoveredCharacteristic {
        uuid,
        properties,
        permissions: Default::default(),
    }
}

/// Answers every call as a healthy peripheral exposing `services`, each with `characteristics`
fn peripheral(
    services: Vec<DiscoveredService>,
    characteristics: Vec<DiscoveredCharacteristic>,
) -> impl Fn(&NativeCall) -> Option<NativeOutcome> + Send + Sync + 'static {
    move |call| {
        let response = match call.kind {
            OperationKind::ExploreServices => Response::Services(services.clone()),
            OperationKind::ExploreCharacteristics => {
                Response::Characteristics(characteristics.clone())
            }
            OperationKind::ExploreDescriptors => Response::Descriptors(Vec::new()),
            OperationKind::Read => Response::Value(b"value".to_vec()),
            OperationKind::ReadRssi => Response::Rssi(-60),
            _ => Response::Done,
        };
        Some(Ok(response))
    }
}

fn default_layout() -> Vec<DiscoveredCharacteristic> {
    vec![
        characteristic(
            LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
        ),
        characteristic(
            CONTROL,
            CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ),
    ]
}

/// Connect and fully explore one device; the responder stays installed
async fn ready_device(h: &Harness, id: &str) -> (Device, Characteristic, Characteristic) {
    h.binding
        .respond_with(peripheral(vec![service(SERVICE)], default_layout()));
    let device = h.infra.scanner().get_or_create(DeviceId::new(id));
    device.connect(CallOptions::default()).await.unwrap();
    device.explore_services(CallOptions::default()).await.unwrap();
    let battery = device.find_service(SERVICE).unwrap();
    battery
        .explore_characteristics(CallOptions::default())
        .await
        .unwrap();
    let level = battery.find_characteristic(LEVEL).unwrap();
    let control = battery.find_characteristic(CONTROL).unwrap();
    assert_eq!(device.state(), ConnectionState::Ready);
    (device, level, control)
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_full_session_round_trip() {
    let h = harness(InfrastructureOptions::default());
    let (device, level, control) = ready_device(&h, "AA:00").await;

    assert_eq!(level.read(CallOptions::default()).await.unwrap(), b"value");
    assert_eq!(level.value(), b"value");
    control.write(b"\x01", CallOptions::default()).await.unwrap();
    assert_eq!(control.value(), b"\x01");

    device.disconnect(CallOptions::default()).await.unwrap();
    assert_eq!(device.state(), ConnectionState::Disconnected);
    // Default options clear the cache on disconnect
    assert!(device.services().is_empty());
    assert!(level.is_disposed());

    let kinds: Vec<OperationKind> = h.binding.calls().iter().map(|call| call.kind).collect();
    assert_eq!(
        kinds,
        vec![
            OperationKind::Connect,
            OperationKind::ExploreServices,
            OperationKind::ExploreCharacteristics,
            OperationKind::Read,
            OperationKind::Write,
            OperationKind::Disconnect,
        ]
    );
}

#[tokio::test]
async fn test_second_connect_while_connecting_is_rejected() {
    let h = harness(InfrastructureOptions::default());
    let device = h.infra.scanner().get_or_create(DeviceId::new("AA:01"));

    let connecting = device.clone();
    let first = tokio::spawn(async move { connecting.connect(CallOptions::default()).await });
    let call = h.binding.next_call().await.unwrap();
    assert_eq!(call.kind, OperationKind::Connect);
    assert_eq!(device.state(), ConnectionState::Connecting);

    let second = device.connect(CallOptions::default()).await;
    assert_eq!(
        second,
        Err(BleError::AlreadyConnecting {
            device: DeviceId::new("AA:01")
        })
    );
    assert_eq!(device.state(), ConnectionState::Connecting);
    assert_eq!(h.binding.calls().len(), 1);

    h.binding.succeed(&call, Response::Done).unwrap();
    first.await.unwrap().unwrap();
    assert_eq!(device.state(), ConnectionState::Connected);
    assert_eq!(
        device.connect(CallOptions::default()).await,
        Err(BleError::AlreadyConnected {
            device: DeviceId::new("AA:01")
        })
    );
}

#[tokio::test]
async fn test_state_violations_fail_without_native_calls() {
    let h = harness(InfrastructureOptions::default());
    let device = h.infra.scanner().get_or_create(DeviceId::new("AA:02"));

    assert!(matches!(
        device.disconnect(CallOptions::default()).await,
        Err(BleError::AlreadyDisconnected { .. })
    ));
    assert!(matches!(
        device.explore_services(CallOptions::default()).await,
        Err(BleError::NotConnected {
            state: ConnectionState::Disconnected,
            ..
        })
    ));
    assert!(matches!(
        device.read_rssi(CallOptions::default()).await,
        Err(BleError::NotConnected { .. })
    ));
    assert!(h.binding.calls().is_empty());
}

#[tokio::test]
async fn test_duplicate_service_uuids_are_reported_not_guessed() {
    let h = harness(InfrastructureOptions::default());
    h.binding.respond_with(peripheral(
        vec![service(SERVICE), service(SERVICE)],
        default_layout(),
    ));
    let device = h.infra.scanner().get_or_create(DeviceId::new("AA:03"));
    device.connect(CallOptions::default()).await.unwrap();
    let services = device.explore_services(CallOptions::default()).await.unwrap();
    assert_eq!(services.len(), 2);
    assert_ne!(services[0].key(), services[1].key());

    match device.find_service(SERVICE) {
        Err(LookupError::MultipleFound { matches, .. }) => {
            assert_eq!(matches, services);
        }
        other => panic!("expected MultipleFound, got {:?}", other),
    }
    assert_eq!(device.first_service(SERVICE), Some(services[0].clone()));
    assert_eq!(device.find_services(SERVICE).len(), 2);
    assert!(matches!(
        device.find_service(Uuid::nil()),
        Err(LookupError::NotFound { .. })
    ));

    // The error converts into the flat taxonomy with the match count
    let flat: BleError = device.find_service(SERVICE).unwrap_err().into();
    assert!(matches!(flat, BleError::MultipleFound { count: 2, .. }));
}

#[tokio::test]
async fn test_reexploration_keeps_surviving_handles() {
    let h = harness(InfrastructureOptions::default());
    let (device, level, _) = ready_device(&h, "AA:04").await;
    let before = device.find_service(SERVICE).unwrap();

    device.explore_services(CallOptions::default()).await.unwrap();
    let after = device.find_service(SERVICE).unwrap();
    assert_eq!(before.key(), after.key());
    assert!(!level.is_disposed());
    assert!(h.binding.released().is_empty());
}

#[tokio::test]
async fn test_descriptor_exploration_and_access() {
    const CCCD: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);
    const USER_DESCRIPTION: Uuid = Uuid::from_u128(0x00002901_0000_1000_8000_00805f9b34fb);

    let h = harness(InfrastructureOptions::default());
    let (_device, level, _) = ready_device(&h, "AA:19").await;
    h.binding.respond_with(|call| {
        let response = match call.kind {
            OperationKind::ExploreDescriptors => Response::Descriptors(vec![
                DiscoveredDescriptor {
                    uuid: CCCD,
                    permissions: AttributePermissions::empty(),
                },
                DiscoveredDescriptor {
                    uuid: USER_DESCRIPTION,
                    permissions: AttributePermissions::READ,
                },
            ]),
            OperationKind::Read => Response::Value(b"Battery".to_vec()),
            _ => Response::Done,
        };
        Some(Ok(response))
    });

    let descriptors = level
        .explore_descriptors(CallOptions::default())
        .await
        .unwrap();
    assert_eq!(descriptors.len(), 2);

    let description = level.find_descriptor(USER_DESCRIPTION).unwrap();
    assert_eq!(
        description.read(CallOptions::default()).await.unwrap(),
        b"Battery"
    );
    assert_eq!(description.value(), b"Battery");
    assert!(matches!(
        description.write(b"x", CallOptions::default()).await,
        Err(BleError::CantWrite { .. })
    ));

    let cccd = level.first_descriptor(CCCD).unwrap();
    cccd.write(&[0x01, 0x00], CallOptions::default()).await.unwrap();
    let last = h.binding.calls().pop().unwrap();
    assert_eq!(last.target, Target::Descriptor(cccd.key()));
    assert_eq!(last.path.descriptor, Some(CCCD));
    assert_eq!(last.path.characteristic, Some(LEVEL));

    level.clear_descriptors();
    assert!(level.descriptors().is_empty());
    assert!(cccd.is_disposed());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_late_callback_goes_to_unhandled_channel() {
    let mut h = harness(InfrastructureOptions::default());
    let (_device, level, _) = ready_device(&h, "AA:05").await;
    h.binding.clear_responder();

    let started = tokio::time::Instant::now();
    let reader = level.clone();
    let timed_out = tokio::spawn(async move {
        reader
            .read(CallOptions::with_timeout(Duration::from_secs(1)).retry(RetryPolicy::once()))
            .await
    });
    let late = h.binding.next_call().await.unwrap();

    let err = timed_out.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        BleError::Timeout {
            operation: OperationKind::Read,
            after,
            ..
        } if after == Duration::from_secs(1)
    ));
    assert_eq!(level.busy(), None);

    // The radio answers two seconds after the caller gave up
    tokio::time::sleep_until(started + Duration::from_secs(3)).await;
    h.binding.succeed(&late, Response::Value(vec![0xAA])).unwrap();
    assert!(matches!(
        h.unhandled.recv().await.unwrap(),
        BleError::UnexpectedCompletion {
            operation: OperationKind::Read,
            ..
        }
    ));
    assert_ne!(level.value(), vec![0xAA]);

    let reader = level.clone();
    let fresh = tokio::spawn(async move { reader.read(CallOptions::default()).await });
    let call = h.binding.next_call().await.unwrap();
    h.binding.succeed(&call, Response::Value(vec![0xBB])).unwrap();
    assert_eq!(fresh.await.unwrap().unwrap(), vec![0xBB]);
    assert_eq!(level.value(), vec![0xBB]);
}

#[tokio::test(start_paused = true)]
async fn test_late_callback_within_grace_does_not_resolve_newer_operation() {
    let mut h = harness(InfrastructureOptions {
        orphan_grace_ms: Some(60_000),
        ..Default::default()
    });
    let (_device, level, _) = ready_device(&h, "AA:06").await;
    h.binding.clear_responder();

    let reader = level.clone();
    let first = tokio::spawn(async move {
        reader
            .read(CallOptions::with_timeout(Duration::from_secs(1)).retry(RetryPolicy::once()))
            .await
    });
    let stale = h.binding.next_call().await.unwrap();
    assert!(matches!(
        first.await.unwrap(),
        Err(BleError::Timeout { .. })
    ));

    let reader = level.clone();
    let second = tokio::spawn(async move { reader.read(CallOptions::default()).await });
    let current = h.binding.next_call().await.unwrap();

    // Same kind and target: the stale answer is drained by the orphan first
    h.binding.succeed(&stale, Response::Value(vec![1])).unwrap();
    assert!(matches!(
        h.unhandled.recv().await.unwrap(),
        BleError::UnexpectedCompletion { .. }
    ));
    assert!(!second.is_finished());

    h.binding.succeed(&current, Response::Value(vec![2])).unwrap();
    assert_eq!(second.await.unwrap().unwrap(), vec![2]);
}

#[tokio::test]
async fn test_queue_mode_runs_operations_in_submission_order() {
    let h = harness(InfrastructureOptions::default());
    let (device, level, control) = ready_device(&h, "AA:07").await;
    h.binding.clear_responder();

    let reader = level.clone();
    let read = tokio::spawn(async move { reader.read(CallOptions::default()).await });
    let read_call = h.binding.next_call().await.unwrap();
    assert_eq!(read_call.kind, OperationKind::Read);

    let writer = control.clone();
    let write = tokio::spawn(async move { writer.write(b"go", CallOptions::default()).await });
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    // The write waits for the device; nothing new reached the radio
    assert_eq!(device.pending_operation(), Some(OperationKind::Read));
    assert_eq!(level.busy(), Some(OperationKind::Read));
    assert_eq!(
        h.binding
            .calls()
            .iter()
            .filter(|call| call.kind == OperationKind::Write)
            .count(),
        0
    );

    h.binding.succeed(&read_call, Response::Value(vec![7])).unwrap();
    assert_eq!(read.await.unwrap().unwrap(), vec![7]);

    let write_call = h.binding.next_call().await.unwrap();
    assert_eq!(write_call.kind, OperationKind::Write);
    assert_eq!(write_call.target, Target::Characteristic(control.key()));
    h.binding.succeed(&write_call, Response::Done).unwrap();
    write.await.unwrap().unwrap();
    assert_eq!(device.pending_operation(), None);
}

#[tokio::test]
async fn test_reject_mode_fails_second_submission() {
    let h = harness(InfrastructureOptions {
        submit_mode: SubmitMode::Reject,
        ..Default::default()
    });
    let (_device, level, control) = ready_device(&h, "AA:08").await;
    h.binding.clear_responder();

    let reader = level.clone();
    let read = tokio::spawn(async move { reader.read(CallOptions::default()).await });
    let read_call = h.binding.next_call().await.unwrap();

    let rejected = control.write(b"x", CallOptions::default()).await;
    assert_eq!(
        rejected,
        Err(BleError::AlreadyInProgress {
            device: DeviceId::new("AA:08"),
            pending: OperationKind::Read,
            requested: OperationKind::Write,
        })
    );

    h.binding.succeed(&read_call, Response::Value(vec![1])).unwrap();
    read.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancellation_abandons_the_operation() {
    let mut h = harness(InfrastructureOptions::default());
    let (device, level, _) = ready_device(&h, "AA:09").await;
    h.binding.clear_responder();

    let token = CancellationToken::new();
    let reader = level.clone();
    let options = CallOptions::with_cancel(token.clone());
    let read = tokio::spawn(async move { reader.read(options).await });
    let call = h.binding.next_call().await.unwrap();

    token.cancel();
    assert_eq!(
        read.await.unwrap(),
        Err(BleError::Cancelled {
            device: DeviceId::new("AA:09"),
            operation: OperationKind::Read,
        })
    );
    assert_eq!(device.pending_operation(), None);

    h.binding.succeed(&call, Response::Value(vec![9])).unwrap();
    assert!(matches!(
        h.unhandled.recv().await.unwrap(),
        BleError::UnexpectedCompletion { .. }
    ));

    // Already-cancelled signals never reach the radio
    let before = h.binding.calls().len();
    assert!(matches!(
        level.read(CallOptions::with_cancel(token)).await,
        Err(BleError::Cancelled { .. })
    ));
    assert_eq!(h.binding.calls().len(), before);
}

#[tokio::test]
async fn test_unexpected_disconnect_fails_pending_and_clears_cache() {
    let mut h = harness(InfrastructureOptions::default());
    let (device, level, _) = ready_device(&h, "AA:0A").await;
    h.binding.clear_responder();
    let mut events = h.infra.events();

    let reader = level.clone();
    let read = tokio::spawn(async move {
        reader
            .read(CallOptions::default().retry(RetryPolicy::once()))
            .await
    });
    h.binding.next_call().await.unwrap();

    let inbound = h.binding.inbound().unwrap();
    inbound
        .notify_unexpected_disconnect(&DeviceId::new("AA:0A"), "supervision timeout")
        .unwrap();

    assert!(matches!(
        read.await.unwrap(),
        Err(BleError::UnexpectedDisconnection { .. })
    ));
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(device.services().is_empty());
    assert!(level.is_disposed());
    assert_eq!(h.infra.active_connections(), 0);
    assert!(matches!(
        h.unhandled.recv().await.unwrap(),
        BleError::UnexpectedDisconnection { .. }
    ));
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        SessionEvent::Disconnected {
            unexpected: true,
            ..
        }
    )));
}

#[tokio::test]
async fn test_auto_reconnect_restores_connection() {
    let h = harness(InfrastructureOptions {
        auto_reconnect: true,
        ..Default::default()
    });
    let (device, level, _) = ready_device(&h, "AA:0B").await;
    let mut events = h.infra.events();

    h.binding
        .inbound()
        .unwrap()
        .notify_unexpected_disconnect(&DeviceId::new("AA:0B"), "link lost")
        .unwrap();
    assert_eq!(device.state(), ConnectionState::Reconnecting);

    let mut state = device.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("reconnect should finish")
    .unwrap();

    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::Reconnected { .. })));
    // The cache survives a reconnect; listening state does not
    assert!(!level.is_disposed());
    assert!(!level.is_listening());
    assert_eq!(h.infra.active_connections(), 1);
}

#[tokio::test]
async fn test_connection_limit() {
    let h = harness(InfrastructureOptions {
        max_concurrent_connections: Some(1),
        ..Default::default()
    });
    h.binding
        .respond_with(peripheral(vec![service(SERVICE)], default_layout()));
    let scanner = h.infra.scanner();
    let first = scanner.get_or_create(DeviceId::new("AA:0C"));
    let second = scanner.get_or_create(DeviceId::new("AA:0D"));

    first.connect(CallOptions::default()).await.unwrap();
    assert_eq!(
        second.connect(CallOptions::default()).await,
        Err(BleError::ConnectionLimitReached { limit: 1 })
    );
    assert_eq!(second.state(), ConnectionState::Disconnected);

    first.disconnect(CallOptions::default()).await.unwrap();
    second.connect(CallOptions::default()).await.unwrap();
    assert_eq!(h.infra.active_connections(), 1);
}

#[tokio::test]
async fn test_failed_connect_returns_to_disconnected() {
    let h = harness(fast_retry());
    h.binding.respond_with(|call| match call.kind {
        OperationKind::Connect => Some(Err(NativeFailure::with_code(133, "GATT error"))),
        _ => Some(Ok(Response::Done)),
    });
    let device = h.infra.scanner().get_or_create(DeviceId::new("AA:0E"));

    let err = device.connect(CallOptions::default()).await.unwrap_err();
    match err {
        BleError::Exhausted {
            operation, errors, ..
        } => {
            assert_eq!(operation, OperationKind::Connect);
            assert_eq!(errors.len(), 3);
            assert!(errors
                .causes()
                .iter()
                .all(|cause| matches!(cause, BleError::Native { .. })));
        }
        other => panic!("expected Exhausted, got {:?}", other),
    }
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(h.infra.active_connections(), 0);
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failure() {
    let h = harness(fast_retry());
    let (_device, level, _) = ready_device(&h, "AA:0F").await;

    let failures = Arc::new(AtomicU32::new(0));
    let counter = failures.clone();
    h.binding.respond_with(move |call| match call.kind {
        OperationKind::Read if counter.fetch_add(1, Ordering::SeqCst) == 0 => {
            Some(Err(NativeFailure::new("busy")))
        }
        OperationKind::Read => Some(Ok(Response::Value(vec![42]))),
        _ => Some(Ok(Response::Done)),
    });

    assert_eq!(level.read(CallOptions::default()).await.unwrap(), vec![42]);
    assert_eq!(failures.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_gatt_calls_are_not_reissued() {
    // Default options: three attempts with a 250 ms delay
    let h = harness(InfrastructureOptions::default());
    let (_device, level, control) = ready_device(&h, "AA:1A").await;
    h.binding.clear_responder();

    let started = tokio::time::Instant::now();
    let reader = level.clone();
    let read = tokio::spawn(async move {
        reader
            .read(CallOptions::with_timeout(Duration::from_secs(1)))
            .await
    });
    let read_call = h.binding.next_call().await.unwrap();
    assert!(matches!(
        read.await.unwrap(),
        Err(BleError::Timeout {
            operation: OperationKind::Read,
            ..
        })
    ));
    assert!(started.elapsed() < Duration::from_millis(1250));

    let writer = control.clone();
    let write = tokio::spawn(async move {
        writer
            .write(b"once", CallOptions::with_timeout(Duration::from_secs(1)))
            .await
    });
    let write_call = h.binding.next_call().await.unwrap();
    assert!(matches!(
        write.await.unwrap(),
        Err(BleError::Timeout {
            operation: OperationKind::Write,
            ..
        })
    ));

    let issued = |kind: OperationKind| {
        h.binding
            .calls()
            .iter()
            .filter(|call| call.kind == kind)
            .count()
    };
    assert_eq!(issued(OperationKind::Read), 1);
    assert_eq!(issued(OperationKind::Write), 1);

    // Late answers drain as unexpected completions
    h.binding.succeed(&read_call, Response::Value(vec![1])).unwrap();
    h.binding.succeed(&write_call, Response::Done).unwrap();
    assert_eq!(level.busy(), None);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failures_retry_under_default_policy() {
    let h = harness(InfrastructureOptions::default());
    let (_device, level, _) = ready_device(&h, "AA:1B").await;

    let reads = Arc::new(AtomicU32::new(0));
    let counter = reads.clone();
    h.binding.respond_with(move |call| match call.kind {
        OperationKind::Read if counter.fetch_add(1, Ordering::SeqCst) < 2 => {
            Some(Err(NativeFailure::new("busy")))
        }
        OperationKind::Read => Some(Ok(Response::Value(vec![7]))),
        _ => Some(Ok(Response::Done)),
    });

    assert_eq!(level.read(CallOptions::default()).await.unwrap(), vec![7]);
    assert_eq!(reads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_disconnect_while_connecting_cancels_the_attempt() {
    let h = harness(InfrastructureOptions::default());
    let device = h.infra.scanner().get_or_create(DeviceId::new("AA:10"));

    let connecting = device.clone();
    let connect = tokio::spawn(async move { connecting.connect(CallOptions::default()).await });
    assert_eq!(h.binding.next_call().await.unwrap().kind, OperationKind::Connect);

    let disconnecting = device.clone();
    let disconnect =
        tokio::spawn(async move { disconnecting.disconnect(CallOptions::default()).await });
    let call = h.binding.next_call().await.unwrap();
    assert_eq!(call.kind, OperationKind::Disconnect);
    assert!(matches!(
        connect.await.unwrap(),
        Err(BleError::Cancelled {
            operation: OperationKind::Connect,
            ..
        })
    ));

    h.binding.succeed(&call, Response::Done).unwrap();
    disconnect.await.unwrap().unwrap();
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(h.infra.active_connections(), 0);
}

#[tokio::test]
async fn test_reject_mode_disconnect_while_connecting_reaches_the_radio() {
    let h = harness(InfrastructureOptions {
        submit_mode: SubmitMode::Reject,
        ..Default::default()
    });
    let device = h.infra.scanner().get_or_create(DeviceId::new("AA:1C"));

    let connecting = device.clone();
    let connect = tokio::spawn(async move { connecting.connect(CallOptions::default()).await });
    let connect_call = h.binding.next_call().await.unwrap();
    assert_eq!(connect_call.kind, OperationKind::Connect);

    let disconnecting = device.clone();
    let disconnect =
        tokio::spawn(async move { disconnecting.disconnect(CallOptions::default()).await });
    let call = h.binding.next_call().await.unwrap();
    assert_eq!(call.kind, OperationKind::Disconnect);
    assert!(matches!(
        connect.await.unwrap(),
        Err(BleError::Cancelled {
            operation: OperationKind::Connect,
            ..
        })
    ));

    h.binding.succeed(&call, Response::Done).unwrap();
    disconnect.await.unwrap().unwrap();
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(h.infra.active_connections(), 0);
    let kinds: Vec<_> = h.binding.calls().iter().map(|call| call.kind).collect();
    assert_eq!(kinds, vec![OperationKind::Connect, OperationKind::Disconnect]);
}

#[tokio::test]
async fn test_reject_mode_connect_and_disconnect_guards() {
    let h = harness(InfrastructureOptions {
        submit_mode: SubmitMode::Reject,
        ..Default::default()
    });
    let (device, level, _) = ready_device(&h, "AA:1D").await;
    h.binding.clear_responder();

    let disconnecting = device.clone();
    let disconnect =
        tokio::spawn(async move { disconnecting.disconnect(CallOptions::default()).await });
    let call = h.binding.next_call().await.unwrap();
    assert_eq!(device.state(), ConnectionState::Disconnecting);

    // State guards answer before the busy slot does
    assert!(matches!(
        device.connect(CallOptions::default()).await,
        Err(BleError::InvalidState { .. })
    ));
    assert!(matches!(
        level.read(CallOptions::default()).await,
        Err(BleError::NotConnected { .. }) | Err(BleError::InvalidState { .. })
    ));

    h.binding.succeed(&call, Response::Done).unwrap();
    disconnect.await.unwrap().unwrap();
    assert_eq!(device.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_concurrent_disconnects_join() {
    let h = harness(InfrastructureOptions::default());
    let (device, _, _) = ready_device(&h, "AA:11").await;
    h.binding.clear_responder();

    let first_handle = device.clone();
    let first = tokio::spawn(async move { first_handle.disconnect(CallOptions::default()).await });
    let call = h.binding.next_call().await.unwrap();
    assert_eq!(device.state(), ConnectionState::Disconnecting);

    let second_handle = device.clone();
    let second =
        tokio::spawn(async move { second_handle.disconnect(CallOptions::default()).await });
    tokio::task::yield_now().await;

    h.binding.succeed(&call, Response::Done).unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(
        h.binding
            .calls()
            .iter()
            .filter(|call| call.kind == OperationKind::Disconnect)
            .count(),
        1
    );
    assert_eq!(device.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_failed_exploration_restores_previous_state() {
    let h = harness(InfrastructureOptions::default());
    h.binding.respond_with(|call| match call.kind {
        OperationKind::ExploreServices => Some(Err(NativeFailure::new("discovery failed"))),
        _ => Some(Ok(Response::Done)),
    });
    let device = h.infra.scanner().get_or_create(DeviceId::new("AA:12"));
    device.connect(CallOptions::default()).await.unwrap();

    let result = device
        .explore_services(CallOptions::default().retry(RetryPolicy::once()))
        .await;
    assert!(matches!(result, Err(BleError::Native { .. })));
    assert_eq!(device.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_capability_checks_run_before_submission() {
    let h = harness(InfrastructureOptions::default());
    let (_device, level, control) = ready_device(&h, "AA:13").await;
    let before = h.binding.calls().len();

    assert_eq!(
        control.read(CallOptions::default()).await,
        Err(BleError::CantRead { uuid: CONTROL })
    );
    assert_eq!(
        control.subscribe(CallOptions::default()).await,
        Err(BleError::CantListen { uuid: CONTROL })
    );
    assert!(matches!(
        level.write(b"x", CallOptions::default()).await,
        Err(BleError::CantWrite { uuid: LEVEL, .. })
    ));
    assert_eq!(
        level.unsubscribe(CallOptions::default()).await,
        Err(BleError::NotListening { uuid: LEVEL })
    );
    assert_eq!(h.binding.calls().len(), before);

    level.subscribe(CallOptions::default()).await.unwrap();
    assert!(level.is_listening());
    assert_eq!(
        level.subscribe(CallOptions::default()).await,
        Err(BleError::AlreadyListening { uuid: LEVEL })
    );
    level.unsubscribe(CallOptions::default()).await.unwrap();
    assert!(!level.is_listening());
}

#[tokio::test]
async fn test_notifications_update_value_and_publish() {
    let h = harness(InfrastructureOptions::default());
    let (_device, level, _) = ready_device(&h, "AA:14").await;
    level.subscribe(CallOptions::default()).await.unwrap();
    let mut events = h.infra.events();

    h.binding
        .inbound()
        .unwrap()
        .notify_value_changed(
            &DeviceId::new("AA:14"),
            Target::Characteristic(level.key()),
            vec![55],
        )
        .unwrap();

    assert_eq!(level.value(), vec![55]);
    assert!(drain(&mut events).contains(&SessionEvent::ValueChanged {
        device: DeviceId::new("AA:14"),
        characteristic: level.key(),
        uuid: LEVEL,
        value: vec![55],
    }));
}

#[tokio::test]
async fn test_spontaneous_reexploration_drops_back_to_connected() {
    let mut h = harness(InfrastructureOptions::default());
    let (device, level, _) = ready_device(&h, "AA:15").await;

    h.binding
        .inbound()
        .unwrap()
        .notify_children_changed(&DeviceId::new("AA:15"), Target::Device)
        .unwrap();

    assert_eq!(device.state(), ConnectionState::Connected);
    assert!(device.services().is_empty());
    assert!(level.is_disposed());
    assert_eq!(
        h.unhandled.recv().await.unwrap(),
        BleError::UnexpectedExploration {
            device: DeviceId::new("AA:15"),
            parent: Target::Device,
        }
    );

    // Exploring again brings the device back to Ready
    device.explore_services(CallOptions::default()).await.unwrap();
    assert_eq!(device.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_release_hooks_follow_removal() {
    let h = harness(InfrastructureOptions::default());
    let (device, level, control) = ready_device(&h, "AA:16").await;
    let battery = device.find_service(SERVICE).unwrap();

    device.remove_service(&battery).unwrap();
    let released: Vec<_> = h.binding.released().into_iter().map(|(_, r)| r.key).collect();
    assert!(released.contains(&battery.key()));
    assert!(released.contains(&level.key()));
    assert!(released.contains(&control.key()));
    assert!(battery.is_disposed());

    assert!(matches!(
        device.remove_service(&battery),
        Err(BleError::UnknownEntity { .. })
    ));
}

#[tokio::test]
async fn test_release_hooks_skipped_without_auto_dispose() {
    let h = harness(InfrastructureOptions {
        auto_dispose_on_removal: false,
        ..Default::default()
    });
    let (device, _, _) = ready_device(&h, "AA:17").await;
    device.clear_services();
    assert!(device.services().is_empty());
    assert!(h.binding.released().is_empty());
}

#[tokio::test]
async fn test_removed_device_is_disposed() {
    let h = harness(InfrastructureOptions::default());
    let (device, level, _) = ready_device(&h, "AA:18").await;
    let scanner = h.infra.scanner();
    let id = DeviceId::new("AA:18");

    scanner.remove_device(&id).await.unwrap();
    assert!(device.is_disposed());
    assert!(scanner.device(&id).is_none());
    assert_eq!(
        h.binding.calls().last().map(|call| call.kind),
        Some(OperationKind::Disconnect)
    );

    assert_eq!(
        level.read(CallOptions::default()).await,
        Err(BleError::Disposed { device: id.clone() })
    );
    assert_eq!(
        device.connect(CallOptions::default()).await,
        Err(BleError::Disposed { device: id.clone() })
    );
    assert_eq!(
        scanner.remove_device(&id).await,
        Err(BleError::Disposed { device: id })
    );
}

#[tokio::test]
async fn test_completion_for_unknown_device_is_unhandled() {
    let mut h = harness(InfrastructureOptions::default());
    let ghost = DeviceId::new("FF:FF");

    h.binding
        .inbound()
        .unwrap()
        .notify_native_completion(&ghost, OperationKind::Read, Target::Device, Ok(Response::Done))
        .unwrap();

    assert_eq!(
        h.unhandled.recv().await.unwrap(),
        BleError::UnexpectedCompletion {
            device: ghost,
            operation: OperationKind::Read,
            target: Target::Device,
        }
    );
}

#[tokio::test]
async fn test_raise_policy_hands_error_back_to_binding() {
    let mut h = harness(InfrastructureOptions {
        unhandled_errors: UnhandledErrorPolicy::Raise,
        ..Default::default()
    });
    let ghost = DeviceId::new("FF:FE");

    let raised = h.binding.inbound().unwrap().notify_native_completion(
        &ghost,
        OperationKind::Write,
        Target::Device,
        Ok(Response::Done),
    );
    assert!(matches!(
        raised,
        Err(BleError::UnexpectedCompletion {
            operation: OperationKind::Write,
            ..
        })
    ));
    assert!(h.unhandled.try_recv().is_err());
}

#[tokio::test]
async fn test_scanner_lifecycle_and_discovery() {
    let h = harness(InfrastructureOptions::default());
    let scanner = h.infra.scanner();
    let inbound = h.binding.inbound().unwrap();
    let mut events = h.infra.events();

    // Not scanning: advertisements are ignored
    inbound
        .notify_advertisement(DeviceId::new("BB:00"), -40, vec![])
        .unwrap();
    assert!(scanner.devices().is_empty());

    scanner
        .start(ScanFilter {
            service_uuids: vec![SERVICE],
            min_rssi: Some(-80),
        })
        .await
        .unwrap();
    assert!(h.binding.is_scanning());
    assert_eq!(
        h.binding.scan_filter().map(|filter| filter.service_uuids),
        Some(vec![SERVICE])
    );
    assert_eq!(
        scanner.start(ScanFilter::default()).await,
        Err(BleError::AlreadyStarted("scanner"))
    );

    inbound
        .notify_advertisement(DeviceId::new("BB:01"), -50, vec![1, 2])
        .unwrap();
    inbound
        .notify_advertisement(DeviceId::new("BB:01"), -52, vec![3])
        .unwrap();
    inbound
        .notify_advertisement(DeviceId::new("BB:02"), -95, vec![])
        .unwrap();

    let found = scanner.device(&DeviceId::new("BB:01")).unwrap();
    assert_eq!(found.rssi(), Some(-52));
    assert_eq!(found.advertisement(), vec![3]);
    assert!(found.last_seen().is_some());
    assert!(scanner.device(&DeviceId::new("BB:02")).is_none());

    let seen = drain(&mut events);
    assert!(seen.contains(&SessionEvent::ScanStarted));
    assert!(seen.contains(&SessionEvent::DeviceDiscovered {
        device: DeviceId::new("BB:01"),
        rssi: -50,
    }));
    assert!(seen.contains(&SessionEvent::DeviceUpdated {
        device: DeviceId::new("BB:01"),
        rssi: -52,
    }));

    scanner.stop().await.unwrap();
    assert_eq!(scanner.lifecycle(), Lifecycle::Stopped);
    assert!(!h.binding.is_scanning());
    // Auto-cleanup forgets devices that never connected
    assert!(scanner.devices().is_empty());
    assert!(found.is_disposed());
    assert_eq!(
        scanner.stop().await,
        Err(BleError::AlreadyStopped("scanner"))
    );
}

#[tokio::test]
async fn test_scanner_stop_keeps_connected_devices() {
    let h = harness(InfrastructureOptions::default());
    let scanner = h.infra.scanner();
    scanner.start(ScanFilter::default()).await.unwrap();
    let (device, _, _) = ready_device(&h, "BB:03").await;

    scanner.stop().await.unwrap();
    assert!(!device.is_disposed());
    assert_eq!(scanner.devices(), vec![device]);
}

#[tokio::test]
async fn test_scan_permission_denied() {
    let h = harness(InfrastructureOptions::default());
    h.binding
        .set_permission(Permission::Scan, PermissionStatus::Denied);
    h.binding.grant_on_request(false);
    let scanner = h.infra.scanner();

    assert!(matches!(
        scanner.start(ScanFilter::default()).await,
        Err(BleError::PermissionDenied(_))
    ));
    assert_eq!(scanner.lifecycle(), Lifecycle::Stopped);
    assert!(!h.binding.is_scanning());

    // A later request that succeeds lets scanning start
    h.binding.grant_on_request(true);
    scanner.start(ScanFilter::default()).await.unwrap();
    assert!(scanner.is_scanning());
}

#[tokio::test]
async fn test_scan_start_failure_is_retried_then_reported() {
    let h = harness(fast_retry());
    for _ in 0..3 {
        h.binding
            .fail_next_radio_call(BleError::ScanningFailed("radio busy".into()));
    }
    let scanner = h.infra.scanner();

    let err = scanner.start(ScanFilter::default()).await.unwrap_err();
    assert!(matches!(err, BleError::ScanningFailed(ref message) if message.contains("3 attempt")));
    assert_eq!(scanner.lifecycle(), Lifecycle::Stopped);

    // A single failure surfaces as itself after the retry succeeds
    h.binding
        .fail_next_radio_call(BleError::ScanningFailed("once".into()));
    scanner.start(ScanFilter::default()).await.unwrap();
}

#[tokio::test]
async fn test_broadcaster_hosts_services_and_tracks_clients() {
    let h = harness(InfrastructureOptions::default());
    let broadcaster = h.infra.broadcaster();
    let mut events = h.infra.events();

    let hosted = broadcaster.new_service(SERVICE, true).with_characteristic(
        LocalCharacteristic::new(LEVEL, CharacteristicProperties::READ).with_value(vec![90]),
    );
    broadcaster.add_service(hosted.clone()).unwrap();
    assert!(matches!(
        broadcaster.add_service(hosted.clone()),
        Err(BleError::AlreadyExists { .. })
    ));
    // Same UUID, different service: allowed
    broadcaster
        .add_service(broadcaster.new_service(SERVICE, false))
        .unwrap();
    assert!(matches!(
        broadcaster.find_service(SERVICE),
        Err(LookupError::MultipleFound { .. })
    ));
    assert_eq!(broadcaster.first_service(SERVICE), Some(hosted.clone()));

    broadcaster
        .start(AdvertisingOptions {
            local_name: Some("gattlink".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(h.binding.is_advertising());
    assert_eq!(
        broadcaster.start(AdvertisingOptions::default()).await,
        Err(BleError::AlreadyStarted("broadcaster"))
    );

    let inbound = h.binding.inbound().unwrap();
    let central = DeviceId::new("CC:00");
    inbound.notify_client_connected(central.clone()).unwrap();
    let client = broadcaster.client(&central).unwrap();
    assert_eq!(client.role(), DeviceRole::Client);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(h.infra.device(&central), Some(client.clone()));

    inbound.notify_client_disconnected(&central).unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    broadcaster.stop().await.unwrap();
    assert!(!h.binding.is_advertising());
    assert!(broadcaster.clients().is_empty());
    assert_eq!(
        broadcaster.stop().await,
        Err(BleError::AlreadyStopped("broadcaster"))
    );

    let seen = drain(&mut events);
    assert!(seen.contains(&SessionEvent::AdvertisingStarted));
    assert!(seen.contains(&SessionEvent::ClientConnected {
        device: central.clone()
    }));
    assert!(seen.contains(&SessionEvent::ClientDisconnected { device: central }));
    assert!(seen.contains(&SessionEvent::AdvertisingStopped));

    assert_eq!(broadcaster.remove_service(hosted.key()), Some(hosted));
    assert_eq!(broadcaster.services().len(), 1);
}

#[tokio::test]
async fn test_advertise_permission_denied() {
    let h = harness(InfrastructureOptions::default());
    h.binding
        .set_permission(Permission::Advertise, PermissionStatus::Restricted);
    h.binding.grant_on_request(false);
    let broadcaster = h.infra.broadcaster();

    assert!(matches!(
        broadcaster.start(AdvertisingOptions::default()).await,
        Err(BleError::PermissionDenied(_))
    ));
    assert_eq!(broadcaster.lifecycle(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let h = harness(InfrastructureOptions::default());
    h.infra
        .scanner()
        .start(ScanFilter::default())
        .await
        .unwrap();
    let (first, _, _) = ready_device(&h, "DD:00").await;
    let (second, _, _) = ready_device(&h, "DD:01").await;

    h.infra.shutdown().await;
    assert_eq!(first.state(), ConnectionState::Disconnected);
    assert_eq!(second.state(), ConnectionState::Disconnected);
    assert!(!h.infra.scanner().is_scanning());
    assert_eq!(h.infra.active_connections(), 0);
}

#[tokio::test]
async fn test_invalid_options_are_rejected() {
    let binding = Arc::new(RecordingBinding::new());
    let result = Infrastructure::builder(binding)
        .options(InfrastructureOptions {
            default_timeout_ms: 0,
            ..Default::default()
        })
        .build();
    assert!(matches!(result, Err(BleError::Configuration(_))));
}

#[tokio::test]
async fn test_infrastructure_from_json() {
    let binding = Arc::new(RecordingBinding::new());
    let infra = gattlink::infrastructure_from_json(
        r#"{ "submit_mode": "reject", "max_concurrent_connections": 2 }"#,
        binding.clone(),
    )
    .unwrap();
    assert_eq!(infra.options().submit_mode, SubmitMode::Reject);
    assert_eq!(infra.adapter_info().platform, "Recording");

    let broken = gattlink::infrastructure_from_json("{", binding);
    assert!(matches!(broken, Err(gattlink::GattLinkError::Config(_))));
}
