//! Remote device handle
//!
//! A [`Device`] owns the connection state machine, the GATT cache and the operation slot
//! of one remote endpoint. All three live behind one short-lived lock; the lock is never
//! held across an await point or while calling into the native binding.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::adapter::{DeviceId, EntityRef, OperationKind, Response, Target};
use super::cache::{refs_of, GattCache, LookupError, ServiceNode};
use super::correlator::{CallOptions, OperationRequest, OperationSlot};
use super::entity::Service;
use super::error::{AggregateError, BleError};
use super::events::SessionEvent;
use super::state::{self, ConnectionState, DisconnectPlan};
use super::Context;
use crate::retry::{self, RetryError};

/// Which side of the link the local radio plays for this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// Remote peripheral found by the scanner; we are the central
    Peripheral,
    /// Remote central connected to our broadcaster
    Client,
}

#[derive(Debug, Default)]
pub(crate) struct DeviceState {
    pub connection: ConnectionState,
    pub rssi: Option<i16>,
    pub advertisement: Vec<u8>,
    pub last_seen: Option<Instant>,
    pub cache: GattCache,
    pub slot: OperationSlot,
    /// Counted against `max_concurrent_connections`
    pub holds_connection_permit: bool,
    pub removed: bool,
    pub connect_cancel: Option<CancellationToken>,
}

impl DeviceState {
    pub fn ensure_alive(&self, device: &DeviceId) -> Result<(), BleError> {
        if self.removed {
            return Err(BleError::Disposed {
                device: device.clone(),
            });
        }
        Ok(())
    }
}

pub(crate) struct DeviceShared {
    pub id: DeviceId,
    pub role: DeviceRole,
    pub ctx: Arc<Context>,
    pub state: Mutex<DeviceState>,
    /// One permit: the in-flight operation
    pub permit: Semaphore,
    state_tx: watch::Sender<ConnectionState>,
}

impl DeviceShared {
    pub fn new(id: DeviceId, role: DeviceRole, ctx: Arc<Context>, initial: ConnectionState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            id,
            role,
            ctx,
            state: Mutex::new(DeviceState {
                connection: initial,
                ..Default::default()
            }),
            permit: Semaphore::new(1),
            state_tx,
        }
    }

    /// Move to `to` and publish the change. Caller holds the lock.
    pub fn transition(&self, st: &mut DeviceState, to: ConnectionState) {
        let from = st.connection;
        if from == to {
            return;
        }
        st.connection = to;
        self.state_tx.send_replace(to);
        tracing::debug!(device = %self.id, "State {:?} -> {:?}", from, to);
        self.ctx.events.publish(SessionEvent::StateChanged {
            device: self.id.clone(),
            from,
            to,
        });
    }

    /// Enter `Disconnected` and tear the link state down. Caller holds the lock and runs
    /// the returned release hooks after unlocking.
    pub fn enter_disconnected(&self, st: &mut DeviceState, reason: &str) -> Vec<EntityRef> {
        self.transition(st, ConnectionState::Disconnected);
        if std::mem::take(&mut st.holds_connection_permit) {
            self.ctx.release_connection();
        }
        if let Some(token) = st.connect_cancel.take() {
            token.cancel();
        }
        st.slot.resolve_pending(Err(BleError::UnexpectedDisconnection {
            device: self.id.clone(),
            reason: reason.to_string(),
        }));
        st.slot.clear_orphans();
        if self.ctx.options.clear_cache_on_disconnect {
            st.cache.clear()
        } else {
            st.cache.reset_link_state();
            Vec::new()
        }
    }

    /// Work that follows `Disconnected` outside the lock
    pub fn after_disconnected(&self, refs: Vec<EntityRef>) {
        self.ctx.release_entities(&self.id, &refs);
        if self.ctx.options.remove_device_on_disconnect {
            self.retire();
        }
    }

    /// Mark the device removed and drop everything it owns
    pub fn dispose(&self) -> Vec<EntityRef> {
        let refs = {
            let mut st = self.state.lock();
            if st.removed {
                return Vec::new();
            }
            st.removed = true;
            let refs = if st.connection != ConnectionState::Disconnected {
                let mut refs = self.enter_disconnected(&mut st, "device removed");
                refs.extend(st.cache.clear());
                refs
            } else {
                st.cache.clear()
            };
            st.slot.resolve_pending(Err(self.disposed()));
            refs
        };
        // Queued submissions fail with Disposed
        self.permit.close();
        refs
    }

    /// Dispose, unregister and announce removal
    pub fn retire(&self) {
        let refs = self.dispose();
        self.ctx.release_entities(&self.id, &refs);
        if self.ctx.unregister(self.role, &self.id) {
            tracing::info!("🗑️ Removed device {}", self.id);
            self.ctx.events.publish(SessionEvent::DeviceRemoved {
                device: self.id.clone(),
            });
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Submit through the retry executor
    pub async fn run(&self, request: OperationRequest, options: &CallOptions) -> Result<Response, BleError> {
        let kind = request.kind;
        let policy = options
            .retry
            .clone()
            .unwrap_or_else(|| self.ctx.options.retry.clone());

        let result = retry::run_with(
            &policy,
            options.cancel.as_ref(),
            BleError::is_retryable,
            |attempt| {
                let request = request.clone();
                async move {
                    if attempt > 1 {
                        tracing::debug!(device = %self.id, operation = %kind, attempt, "Retrying");
                    }
                    self.submit(request, options).await
                }
            },
        )
        .await;

        result.map_err(|err| self.flatten(kind, err))
    }

    fn flatten(&self, operation: OperationKind, err: RetryError<BleError>) -> BleError {
        let mut causes = match err {
            RetryError::Cancelled { .. } => {
                return BleError::Cancelled {
                    device: self.id.clone(),
                    operation,
                }
            }
            RetryError::Exhausted(aggregate) => aggregate.into_causes(),
            RetryError::Aborted { causes } => causes,
        };
        if causes.len() == 1 {
            if let Some(cause) = causes.pop() {
                return cause;
            }
        }
        BleError::Exhausted {
            device: self.id.clone(),
            operation,
            errors: AggregateError::new(causes),
        }
    }

    /// Spontaneous link loss reported by the binding
    pub fn on_unexpected_disconnect(self: &Arc<Self>, reason: String) -> Result<(), BleError> {
        let lost = || BleError::UnexpectedDisconnection {
            device: self.id.clone(),
            reason: reason.clone(),
        };

        let (refs, reconnect) = {
            let mut st = self.state.lock();
            match st.connection {
                ConnectionState::Disconnected => {
                    tracing::debug!(device = %self.id, "Link loss reported while already disconnected");
                    return Ok(());
                }
                ConnectionState::Disconnecting => {
                    // The link went down under an in-flight disconnect
                    if st.slot.pending_kind() == Some(OperationKind::Disconnect) {
                        st.slot.resolve_pending(Ok(Response::Done));
                    } else {
                        st.slot.resolve_pending(Err(lost()));
                    }
                    return Ok(());
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    // The connect loop sees a retryable failure
                    st.slot.resolve_pending(Err(lost()));
                    return Ok(());
                }
                ConnectionState::Connected | ConnectionState::Exploring | ConnectionState::Ready => {
                    st.slot.resolve_pending(Err(lost()));
                    let auto_reconnect =
                        self.ctx.options.auto_reconnect && self.ctx.runtime.is_some() && self.role == DeviceRole::Peripheral;
                    match state::on_unexpected_disconnect(st.connection, auto_reconnect) {
                        ConnectionState::Reconnecting => {
                            self.transition(&mut st, ConnectionState::Reconnecting);
                            st.slot.clear_orphans();
                            st.cache.reset_link_state();
                            let token = CancellationToken::new();
                            st.connect_cancel = Some(token.clone());
                            (Vec::new(), Some(token))
                        }
                        _ => (self.enter_disconnected(&mut st, &reason), None),
                    }
                }
            }
        };

        tracing::warn!("⚠️ Lost connection to {}: {}", self.id, reason);
        self.ctx.events.publish(SessionEvent::Disconnected {
            device: self.id.clone(),
            unexpected: true,
            reason: Some(reason.clone()),
        });

        match reconnect {
            Some(token) => self.spawn_reconnect(token),
            None => self.after_disconnected(refs),
        }
        self.ctx.report(lost())
    }

    fn spawn_reconnect(self: &Arc<Self>, token: CancellationToken) {
        let Some(handle) = self.ctx.runtime.clone() else {
            return;
        };
        let shared = Arc::clone(self);
        handle.spawn(async move {
            shared.reconnect(token).await;
        });
    }

    async fn reconnect(&self, token: CancellationToken) {
        tracing::info!("🔄 Reconnecting to {}", self.id);
        let options = CallOptions::with_cancel(token);
        let result = self
            .run(
                OperationRequest::new(OperationKind::Connect, Target::Device),
                &options,
            )
            .await;

        let refs = {
            let mut st = self.state.lock();
            if st.connection != ConnectionState::Reconnecting {
                // A disconnect call took over
                return;
            }
            match &result {
                Ok(_) => {
                    st.connect_cancel = None;
                    self.transition(&mut st, ConnectionState::Connected);
                    None
                }
                Err(e) => Some(self.enter_disconnected(&mut st, &e.to_string())),
            }
        };

        match (refs, result) {
            (None, _) => {
                tracing::info!("✅ Reconnected to {}", self.id);
                self.ctx.events.publish(SessionEvent::Reconnected {
                    device: self.id.clone(),
                });
            }
            (Some(refs), Err(e)) => {
                tracing::warn!("Reconnect to {} failed: {}", self.id, e);
                self.ctx.events.publish(SessionEvent::Disconnected {
                    device: self.id.clone(),
                    unexpected: true,
                    reason: Some(e.to_string()),
                });
                self.after_disconnected(refs);
                if let Err(raised) = self.ctx.report(e) {
                    tracing::error!("Unhandled reconnect failure for {}: {}", self.id, raised);
                }
            }
            (Some(refs), Ok(_)) => self.after_disconnected(refs),
        }
    }

    /// The platform reports that the children of `parent` changed
    pub fn on_children_changed(&self, parent: Target) -> Result<(), BleError> {
        let refs = {
            let mut st = self.state.lock();
            if !st.cache.contains(parent) {
                drop(st);
                return self.ctx.report(BleError::UnknownEntity {
                    device: self.id.clone(),
                    target: parent,
                });
            }
            let refs = st.cache.invalidate(parent);
            if parent == Target::Device && st.connection == ConnectionState::Ready {
                self.transition(&mut st, ConnectionState::Connected);
            }
            refs
        };

        tracing::info!("🔁 {} re-explored {} on its own", self.id, parent);
        self.ctx.release_entities(&self.id, &refs);
        self.ctx.events.publish(SessionEvent::ChildrenChanged {
            device: self.id.clone(),
            parent,
        });
        self.ctx.report(BleError::UnexpectedExploration {
            device: self.id.clone(),
            parent,
        })
    }

    /// Notification or indication on a subscribed characteristic
    pub fn on_value_changed(&self, target: Target, value: Vec<u8>) -> Result<(), BleError> {
        let updated = {
            let mut st = self.state.lock();
            match target {
                Target::Characteristic(key) => st.cache.characteristic_mut(key).map(|node| {
                    node.value = value.clone();
                    (key, node.uuid)
                }),
                _ => None,
            }
        };

        match updated {
            Some((characteristic, uuid)) => {
                tracing::trace!(device = %self.id, %uuid, len = value.len(), "Value changed");
                self.ctx.events.publish(SessionEvent::ValueChanged {
                    device: self.id.clone(),
                    characteristic,
                    uuid,
                    value,
                });
                Ok(())
            }
            None => self.ctx.report(BleError::UnknownEntity {
                device: self.id.clone(),
                target,
            }),
        }
    }
}

/// Handle to a remote device; cheap to clone
#[derive(Clone)]
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Device {
    pub(crate) fn new(id: DeviceId, role: DeviceRole, ctx: Arc<Context>, initial: ConnectionState) -> Self {
        Self {
            shared: Arc::new(DeviceShared::new(id, role, ctx, initial)),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.shared.id
    }

    pub fn role(&self) -> DeviceRole {
        self.shared.role
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    /// Receiver that sees every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.subscribe_state()
    }

    /// Last RSSI, already converted
    pub fn rssi(&self) -> Option<i16> {
        self.shared.state.lock().rssi
    }

    /// Raw payload of the last advertisement
    pub fn advertisement(&self) -> Vec<u8> {
        self.shared.state.lock().advertisement.clone()
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.shared.state.lock().last_seen
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().removed
    }

    /// The in-flight operation, if any
    pub fn pending_operation(&self) -> Option<OperationKind> {
        self.shared.state.lock().slot.pending_kind()
    }

    pub(crate) fn record_advertisement(&self, rssi: i16, payload: Vec<u8>) {
        let mut st = self.shared.state.lock();
        st.rssi = Some(rssi);
        st.advertisement = payload;
        st.last_seen = Some(Instant::now());
    }

    /// Open the link: `Disconnected → Connecting → Connected`
    pub async fn connect(&self, options: CallOptions) -> Result<(), BleError> {
        let shared = &self.shared;
        let token = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        {
            let mut st = shared.state.lock();
            st.ensure_alive(&shared.id)?;
            let next = state::begin_connect(&shared.id, st.connection)?;
            shared.ctx.reserve_connection()?;
            st.holds_connection_permit = true;
            st.connect_cancel = Some(token.clone());
            shared.transition(&mut st, next);
        }

        tracing::info!("🔗 Connecting to {}", shared.id);
        let attempt = CallOptions {
            cancel: Some(token),
            ..options
        };
        let result = shared
            .run(
                OperationRequest::new(OperationKind::Connect, Target::Device),
                &attempt,
            )
            .await;

        let (outcome, refs) = {
            let mut st = shared.state.lock();
            if st.connection != ConnectionState::Connecting {
                // Disconnect or removal took over; it owns the teardown
                let err = match result {
                    Err(e) => e,
                    Ok(_) => BleError::Cancelled {
                        device: shared.id.clone(),
                        operation: OperationKind::Connect,
                    },
                };
                return Err(err);
            }
            match result {
                Ok(_) => {
                    st.connect_cancel = None;
                    shared.transition(&mut st, ConnectionState::Connected);
                    (Ok(()), Vec::new())
                }
                Err(e) => {
                    let refs = shared.enter_disconnected(&mut st, &e.to_string());
                    (Err(e), refs)
                }
            }
        };

        match &outcome {
            Ok(()) => tracing::info!("✅ Connected to {}", shared.id),
            Err(e) => {
                tracing::warn!("❌ Failed to connect to {}: {}", shared.id, e);
                shared.after_disconnected(refs);
            }
        }
        outcome
    }

    /// Close the link; joins a disconnect already in flight
    pub async fn disconnect(&self, options: CallOptions) -> Result<(), BleError> {
        let shared = &self.shared;
        let (plan, previous) = {
            let mut st = shared.state.lock();
            st.ensure_alive(&shared.id)?;
            let previous = st.connection;
            let plan = state::begin_disconnect(&shared.id, previous)?;
            match plan {
                DisconnectPlan::Join => {}
                DisconnectPlan::AbortConnect => {
                    if let Some(token) = st.connect_cancel.take() {
                        token.cancel();
                    }
                    shared.transition(&mut st, ConnectionState::Disconnecting);
                }
                DisconnectPlan::Disconnect => {
                    shared.transition(&mut st, ConnectionState::Disconnecting);
                }
            }
            (plan, previous)
        };

        if plan == DisconnectPlan::Join {
            return self.wait_until_disconnected(&options).await;
        }

        tracing::info!("🔌 Disconnecting from {}", shared.id);
        let result = async {
            if plan == DisconnectPlan::AbortConnect {
                // The cancelled connect holds the device until its future unwinds
                shared.wait_idle(OperationKind::Disconnect, &options).await?;
            }
            shared
                .run(
                    OperationRequest::new(OperationKind::Disconnect, Target::Device),
                    &options,
                )
                .await
        }
        .await;

        match result {
            Ok(_) => {
                let refs = {
                    let mut st = shared.state.lock();
                    if st.connection != ConnectionState::Disconnecting {
                        return Ok(());
                    }
                    shared.enter_disconnected(&mut st, "disconnected")
                };
                shared.ctx.events.publish(SessionEvent::Disconnected {
                    device: shared.id.clone(),
                    unexpected: false,
                    reason: None,
                });
                shared.after_disconnected(refs);
                Ok(())
            }
            Err(e) => {
                let refs = {
                    let mut st = shared.state.lock();
                    if st.connection != ConnectionState::Disconnecting {
                        None
                    } else if previous.is_connected() {
                        // The link is still up
                        let restored = if previous == ConnectionState::Exploring {
                            ConnectionState::Connected
                        } else {
                            previous
                        };
                        shared.transition(&mut st, restored);
                        None
                    } else {
                        Some(shared.enter_disconnected(&mut st, &e.to_string()))
                    }
                };
                if let Some(refs) = refs {
                    shared.after_disconnected(refs);
                }
                tracing::warn!("Disconnect from {} failed: {}", shared.id, e);
                Err(e)
            }
        }
    }

    async fn wait_until_disconnected(&self, options: &CallOptions) -> Result<(), BleError> {
        let shared = &self.shared;
        let mut rx = shared.subscribe_state();
        let timeout = options
            .timeout
            .unwrap_or_else(|| shared.ctx.options.default_timeout());
        let never = CancellationToken::new();
        let cancel = options.cancel.as_ref().unwrap_or(&never);

        tokio::select! {
            reached = rx.wait_for(|state| *state == ConnectionState::Disconnected) => {
                reached.map(|_| ()).map_err(|_| shared.disposed())
            }
            _ = tokio::time::sleep(timeout) => Err(BleError::Timeout {
                device: shared.id.clone(),
                operation: OperationKind::Disconnect,
                after: timeout,
            }),
            _ = cancel.cancelled() => Err(BleError::Cancelled {
                device: shared.id.clone(),
                operation: OperationKind::Disconnect,
            }),
        }
    }

    /// Discover the primary services: `Connected|Ready → Exploring → Ready`.
    ///
    /// The first exploration replaces the service list; later ones merge so handles to
    /// surviving services stay valid. On failure the previous state is restored.
    pub async fn explore_services(&self, options: CallOptions) -> Result<Vec<Service>, BleError> {
        let shared = &self.shared;
        let previous = {
            let mut st = shared.state.lock();
            st.ensure_alive(&shared.id)?;
            let next = state::begin_explore(&shared.id, st.connection)?;
            let previous = st.connection;
            shared.transition(&mut st, next);
            previous
        };

        let result = shared
            .run(
                OperationRequest::new(OperationKind::ExploreServices, Target::Device),
                &options,
            )
            .await;

        let (outcome, refs) = {
            let mut st = shared.state.lock();
            if st.connection != ConnectionState::Exploring {
                let state = st.connection;
                drop(st);
                return Err(match result {
                    Err(e) => e,
                    Ok(_) => BleError::NotConnected {
                        device: shared.id.clone(),
                        state,
                    },
                });
            }
            match result {
                Ok(Response::Services(found)) => {
                    let keys = &shared.ctx.keys;
                    let removed = st.cache.services.apply_exploration(
                        found,
                        |d| d.uuid,
                        |d| ServiceNode::from_discovered(keys.next(), d),
                        |node, d| node.is_primary = d.is_primary,
                    );
                    shared.transition(&mut st, ConnectionState::Ready);
                    let services = st
                        .cache
                        .services
                        .iter()
                        .map(|node| Service::from_node(self, node))
                        .collect::<Vec<_>>();
                    (Ok(services), refs_of(&removed))
                }
                Ok(_) => {
                    shared.transition(&mut st, previous);
                    (
                        Err(BleError::InvalidResponse {
                            device: shared.id.clone(),
                            operation: OperationKind::ExploreServices,
                        }),
                        Vec::new(),
                    )
                }
                Err(e) => {
                    shared.transition(&mut st, previous);
                    (Err(e), Vec::new())
                }
            }
        };

        shared.ctx.release_entities(&shared.id, &refs);
        if let Ok(services) = &outcome {
            tracing::info!("🔍 {} exposes {} service(s)", shared.id, services.len());
        }
        outcome
    }

    /// Cached services in discovery order
    pub fn services(&self) -> Vec<Service> {
        let st = self.shared.state.lock();
        st.cache
            .services
            .iter()
            .map(|node| Service::from_node(self, node))
            .collect()
    }

    /// The one service with `uuid`
    pub fn find_service(&self, uuid: Uuid) -> Result<Service, LookupError<Service>> {
        let parent = format!("device {}", self.shared.id);
        let st = self.shared.state.lock();
        st.cache
            .services
            .find_one(&parent, uuid)
            .map(|node| Service::from_node(self, node))
            .map_err(|e| e.map(|node| Service::from_node(self, node)))
    }

    /// First service with `uuid` in discovery order
    pub fn first_service(&self, uuid: Uuid) -> Option<Service> {
        let st = self.shared.state.lock();
        st.cache
            .services
            .first(uuid)
            .map(|node| Service::from_node(self, node))
    }

    /// Every service with `uuid`
    pub fn find_services(&self, uuid: Uuid) -> Vec<Service> {
        let st = self.shared.state.lock();
        st.cache
            .services
            .find_all(uuid)
            .into_iter()
            .map(|node| Service::from_node(self, node))
            .collect()
    }

    /// Drop one service (and its subtree) from the cache
    pub fn remove_service(&self, service: &Service) -> Result<(), BleError> {
        let refs = {
            let mut st = self.shared.state.lock();
            st.ensure_alive(&self.shared.id)?;
            let removed = st
                .cache
                .services
                .remove(service.key())
                .ok_or_else(|| BleError::UnknownEntity {
                    device: self.shared.id.clone(),
                    target: Target::Service(service.key()),
                })?;
            refs_of(std::slice::from_ref(&removed))
        };
        self.shared.ctx.release_entities(&self.shared.id, &refs);
        Ok(())
    }

    /// Drop every cached service; the next exploration starts from scratch
    pub fn clear_services(&self) {
        let refs = self.shared.state.lock().cache.clear();
        self.shared.ctx.release_entities(&self.shared.id, &refs);
    }

    /// Read the link RSSI, converted by the infrastructure's converter
    pub async fn read_rssi(&self, options: CallOptions) -> Result<i16, BleError> {
        let shared = &self.shared;
        match shared
            .run(
                OperationRequest::new(OperationKind::ReadRssi, Target::Device),
                &options,
            )
            .await?
        {
            Response::Rssi(raw) => {
                let rssi = shared.ctx.rssi.convert(&shared.id, raw);
                shared.state.lock().rssi = Some(rssi);
                Ok(rssi)
            }
            _ => Err(BleError::InvalidResponse {
                device: shared.id.clone(),
                operation: OperationKind::ReadRssi,
            }),
        }
    }

    /// One raw correlated call: no retry, no cache update
    pub async fn submit(&self, request: OperationRequest, options: CallOptions) -> Result<Response, BleError> {
        self.shared.submit(request, &options).await
    }
}
