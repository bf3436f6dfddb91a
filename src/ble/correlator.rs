//! Operation correlator
//!
//! Serializes native operations per device and routes every native completion back to
//! the caller waiting for it. Matching is by `(operation kind, target)` because most
//! platforms give no correlation token. At most one operation per device is in flight;
//! further submissions queue FIFO behind a one-permit semaphore or are rejected.
//!
//! A pending operation is resolved exactly once, by whoever takes it out of the slot
//! under the device lock: a native completion, the timeout, or cancellation. Operations
//! abandoned by timeout or cancellation leave an orphan entry so their late completion is
//! drained as an unexpected completion instead of resolving a newer operation.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{oneshot, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::adapter::{DeviceId, NativeCall, NativeOutcome, OperationKind, Payload, Response, Target};
use super::device::DeviceShared;
use super::error::BleError;
use super::state;
use crate::config::SubmitMode;
use crate::retry::RetryPolicy;

type Responder = oneshot::Sender<Result<Response, BleError>>;

/// Per-call options for every suspending operation
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the infrastructure default timeout
    pub timeout: Option<Duration>,
    /// Cooperative cancellation; resolves only the caller's view of the operation
    pub cancel: Option<CancellationToken>,
    /// Overrides the infrastructure retry policy
    pub retry: Option<RetryPolicy>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// One request for the correlator
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub target: Target,
    pub payload: Payload,
}

impl OperationRequest {
    pub fn new(kind: OperationKind, target: Target) -> Self {
        Self {
            kind,
            target,
            payload: Payload::None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// The one in-flight native call of a device
#[derive(Debug)]
pub(crate) struct PendingOperation {
    seq: u64,
    kind: OperationKind,
    target: Target,
    created_at: Instant,
    responder: Responder,
}

impl PendingOperation {
    fn matches(&self, kind: OperationKind, target: Target) -> bool {
        self.kind == kind && self.target == target
    }

    fn resolve(self, result: Result<Response, BleError>) {
        tracing::trace!(
            operation = %self.kind,
            target = %self.target,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "Resolving pending operation"
        );
        // The waiting side removes the slot entry before it stops listening
        let _ = self.responder.send(result);
    }
}

/// An operation whose caller gave up before the native completion arrived
#[derive(Debug, Clone)]
struct Orphan {
    kind: OperationKind,
    target: Target,
    expires_at: Instant,
}

/// Single-slot record of the device's in-flight operation
#[derive(Debug, Default)]
pub(crate) struct OperationSlot {
    pending: Option<PendingOperation>,
    orphans: VecDeque<Orphan>,
    next_seq: u64,
}

impl OperationSlot {
    pub fn pending_kind(&self) -> Option<OperationKind> {
        self.pending.as_ref().map(|pending| pending.kind)
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    fn prune_orphans(&mut self) {
        let now = Instant::now();
        self.orphans.retain(|orphan| orphan.expires_at > now);
    }

    /// Open the slot for a new operation
    pub fn begin(
        &mut self,
        device: &DeviceId,
        kind: OperationKind,
        target: Target,
    ) -> Result<(u64, oneshot::Receiver<Result<Response, BleError>>), BleError> {
        if let Some(pending) = &self.pending {
            return Err(BleError::AlreadyInProgress {
                device: device.clone(),
                pending: pending.kind,
                requested: kind,
            });
        }
        self.prune_orphans();
        self.next_seq += 1;
        let (responder, rx) = oneshot::channel();
        self.pending = Some(PendingOperation {
            seq: self.next_seq,
            kind,
            target,
            created_at: Instant::now(),
            responder,
        });
        Ok((self.next_seq, rx))
    }

    /// Route a native completion. Orphans are drained first, oldest first.
    pub fn complete(
        &mut self,
        device: &DeviceId,
        kind: OperationKind,
        target: Target,
        result: Result<Response, BleError>,
    ) -> Result<(), BleError> {
        self.prune_orphans();

        let unexpected = || BleError::UnexpectedCompletion {
            device: device.clone(),
            operation: kind,
            target,
        };

        if let Some(index) = self
            .orphans
            .iter()
            .position(|orphan| orphan.kind == kind && orphan.target == target)
        {
            self.orphans.remove(index);
            tracing::warn!(device = %device, operation = %kind, "Late completion of an abandoned operation");
            return Err(unexpected());
        }

        match self.pending.take() {
            Some(pending) if pending.matches(kind, target) => {
                pending.resolve(result);
                Ok(())
            }
            other => {
                self.pending = other;
                tracing::warn!(device = %device, operation = %kind, target = %target, "Completion matches no pending operation");
                Err(unexpected())
            }
        }
    }

    /// Give up on operation `seq` after a timeout or cancellation.
    ///
    /// Returns `false` if a completion already took it, in which case the result is
    /// waiting on the caller's receiver.
    pub fn abandon(&mut self, seq: u64, grace: Duration) -> bool {
        match self.pending.take() {
            Some(pending) if pending.seq == seq => {
                self.orphans.push_back(Orphan {
                    kind: pending.kind,
                    target: pending.target,
                    expires_at: Instant::now() + grace,
                });
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    /// Drop operation `seq` whose native call never started
    pub fn withdraw(&mut self, seq: u64) {
        if self.pending.as_ref().map(|pending| pending.seq) == Some(seq) {
            self.pending = None;
        }
    }

    /// Resolve the in-flight operation, whatever it is
    pub fn resolve_pending(&mut self, result: Result<Response, BleError>) -> Option<OperationKind> {
        let pending = self.pending.take()?;
        let kind = pending.kind;
        pending.resolve(result);
        Some(kind)
    }

    pub fn clear_orphans(&mut self) {
        self.orphans.clear();
    }
}

/// Clears the slot and busy marker however the waiting future ends
struct InFlight<'a> {
    device: &'a DeviceShared,
    seq: u64,
    target: Target,
    grace: Duration,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self) {
        self.settled = true;
        self.device.state.lock().cache.mark_busy(self.target, None);
    }

    fn withdraw(&mut self) {
        self.settled = true;
        let mut st = self.device.state.lock();
        st.slot.withdraw(self.seq);
        st.cache.mark_busy(self.target, None);
    }

    fn abandon(&mut self) -> bool {
        self.settled = true;
        let mut st = self.device.state.lock();
        st.cache.mark_busy(self.target, None);
        st.slot.abandon(self.seq, self.grace)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // Caller dropped the future mid-flight
            self.abandon();
        }
    }
}

enum Wake {
    Resolved(Result<Result<Response, BleError>, oneshot::error::RecvError>),
    TimedOut,
    Cancelled,
}

impl DeviceShared {
    fn check_submittable(&self, kind: OperationKind, target: Target) -> Result<(), BleError> {
        let st = self.state.lock();
        st.ensure_alive(&self.id)?;
        state::check_operation(&self.id, st.connection, kind)?;
        if !st.cache.contains(target) {
            return Err(BleError::UnknownEntity {
                device: self.id.clone(),
                target,
            });
        }
        Ok(())
    }

    /// `Submit(deviceId, operationKind, targetEntityId, timeout, cancellationSignal)`
    pub(crate) async fn submit(
        &self,
        request: OperationRequest,
        options: &CallOptions,
    ) -> Result<Response, BleError> {
        let kind = request.kind;
        let target = request.target;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.ctx.options.default_timeout());
        let never = CancellationToken::new();
        let cancel = options.cancel.as_ref().unwrap_or(&never);
        let cancelled = || BleError::Cancelled {
            device: self.id.clone(),
            operation: kind,
        };

        // State violations fail before queueing
        self.check_submittable(kind, target)?;
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let _permit = match self.ctx.options.submit_mode {
            SubmitMode::Queue => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(cancelled()),
                    permit = self.permit.acquire() => permit.map_err(|_| self.disposed())?,
                }
            }
            SubmitMode::Reject => match self.permit.try_acquire() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    let pending = self.state.lock().slot.pending_kind().unwrap_or(kind);
                    return Err(BleError::AlreadyInProgress {
                        device: self.id.clone(),
                        pending,
                        requested: kind,
                    });
                }
                Err(TryAcquireError::Closed) => return Err(self.disposed()),
            },
        };

        let (seq, rx, call) = {
            let mut st = self.state.lock();
            st.ensure_alive(&self.id)?;
            // The state may have moved while we were queued
            state::check_operation(&self.id, st.connection, kind)?;
            let path = st.cache.path(target).ok_or_else(|| BleError::UnknownEntity {
                device: self.id.clone(),
                target,
            })?;
            let (seq, rx) = st.slot.begin(&self.id, kind, target)?;
            st.cache.mark_busy(target, Some(kind));
            let call = NativeCall {
                device: self.id.clone(),
                kind,
                target,
                path,
                payload: request.payload,
            };
            (seq, rx, call)
        };

        let mut flight = InFlight {
            device: self,
            seq,
            target,
            grace: self.ctx.options.orphan_grace(timeout),
            settled: false,
        };

        tracing::debug!(device = %self.id, operation = %kind, target = %target, "Issuing native call");
        if let Err(e) = self.ctx.binding.issue(call) {
            flight.withdraw();
            tracing::warn!(device = %self.id, operation = %kind, "Native call rejected: {}", e);
            return Err(e);
        }

        let mut rx = rx;
        let wake = tokio::select! {
            result = &mut rx => Wake::Resolved(result),
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
            _ = cancel.cancelled() => Wake::Cancelled,
        };

        let abandoned_with = match wake {
            Wake::Resolved(result) => {
                flight.settle();
                return result.unwrap_or_else(|_| Err(self.disposed()));
            }
            Wake::TimedOut => BleError::Timeout {
                device: self.id.clone(),
                operation: kind,
                after: timeout,
            },
            Wake::Cancelled => cancelled(),
        };

        if flight.abandon() {
            tracing::warn!(device = %self.id, operation = %kind, "{}", abandoned_with);
            Err(abandoned_with)
        } else {
            // A completion won the race; its result is already in the channel
            rx.await.unwrap_or_else(|_| Err(self.disposed()))
        }
    }

    /// Wait until no operation holds the device, without keeping the turn.
    ///
    /// Always queues, whatever the submit mode.
    pub(crate) async fn wait_idle(&self, kind: OperationKind, options: &CallOptions) -> Result<(), BleError> {
        let never = CancellationToken::new();
        let cancel = options.cancel.as_ref().unwrap_or(&never);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BleError::Cancelled {
                device: self.id.clone(),
                operation: kind,
            }),
            permit = self.permit.acquire() => permit.map(drop).map_err(|_| self.disposed()),
        }
    }

    /// `Complete(deviceId, operationKind, targetEntityId, outcome)`
    pub(crate) fn complete(
        &self,
        kind: OperationKind,
        target: Target,
        outcome: NativeOutcome,
    ) -> Result<(), BleError> {
        let result = outcome.map_err(|failure| BleError::Native {
            device: self.id.clone(),
            operation: kind,
            reason: failure.to_string(),
        });
        self.state.lock().slot.complete(&self.id, kind, target, result)
    }

    pub(crate) fn disposed(&self) -> BleError {
        BleError::Disposed {
            device: self.id.clone(),
        }
    }
}
