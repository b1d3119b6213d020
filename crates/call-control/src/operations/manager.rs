//! Operation manager
//!
//! Admission, correlation and resolution of every asynchronous operation.
//! Admission runs under the per-call locks of the calls involved, so two
//! submitters racing on one call see each other's reservation. The pending
//! table is the single arbiter of resolution: whoever removes an entry from
//! it resolves the operation, and nobody else can.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::handle::{CancelOutcome, OperationHandle, PendingOperation};
use super::{LinkedCalls, OperationKind, OperationOutput, OperationParams, OperationRequest};
use crate::conference;
use crate::errors::{CallControlError, ProviderFailure, Result};
use crate::events::{CallEvent, OperationOutcome};
use crate::gather::{GatherReason, GatherSession};
use crate::provider::{ProviderBoundary, ProviderOutput, ProviderRequest};
use crate::registry::{CallRegistry, ConferenceRole, NewCall, StateChange};
use crate::state::{CallState, TransitionCause};
use crate::tone;
use crate::transfer;
use crate::types::{AddressId, CallId, CallOrigin, OperationId, ProviderCallId, TransferMode};

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Provider events that matched no operation or call
    pub unmatched_events: u64,
    /// Completions for operations that had already resolved
    pub late_completions: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    unmatched_events: AtomicU64,
    late_completions: AtomicU64,
}

struct Admission {
    address: AddressId,
    provider_call: Option<ProviderCallId>,
}

/// Submits, correlates and resolves operations
pub struct OperationManager {
    registry: Arc<CallRegistry>,
    provider: Arc<dyn ProviderBoundary>,
    pending: DashMap<OperationId, Arc<PendingOperation>>,
    next_id: AtomicU64,
    max_conference_parties: u32,
    counters: Counters,
}

impl OperationManager {
    pub(crate) fn new(registry: Arc<CallRegistry>, provider: Arc<dyn ProviderBoundary>, max_conference_parties: u32) -> Self {
        Self {
            registry,
            provider,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_conference_parties,
            counters: Counters::default(),
        }
    }

    /// Submit an operation.
    ///
    /// State and concurrency violations are returned immediately. Once a
    /// handle is returned every other outcome, provider rejection included,
    /// arrives through it.
    pub async fn submit<T>(self: &Arc<Self>, request: OperationRequest) -> Result<OperationHandle<T>>
    where
        T: TryFrom<OperationOutput, Error = CallControlError>,
    {
        self.validate(&request)?;
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let admission = self.admit(id, &request)?;
        let linked = self.create_linked(id, &request, admission.address);

        let gather = match &request.params {
            OperationParams::GatherDigits(params) => Some(GatherSession::new(id, request.call, params.clone())),
            _ => None,
        };

        let op = Arc::new(PendingOperation::new(id, request.clone(), linked, gather.clone()));
        self.pending.insert(id, Arc::clone(&op));
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        if let Some(session) = &gather {
            let attached = self
                .registry
                .with_record_mut(request.call, |record| record.gather = Some(Arc::clone(session)));
            if attached.is_ok() {
                let manager = Arc::downgrade(self);
                session.spawn_timer(move |result| {
                    if let Some(manager) = manager.upgrade() {
                        manager.finish(id, Ok(OperationOutput::Digits(result)));
                    }
                });
            }
        }

        info!(op = %id, call = %request.call, kind = ?request.kind, "operation submitted");

        let provider_request = ProviderRequest {
            correlation: id,
            call: request.call,
            provider_call: admission.provider_call,
            kind: request.kind,
            params: request.params,
            linked,
        };
        if let Err(failure) = self.provider.issue(provider_request).await {
            warn!(op = %id, error = %failure, "provider rejected operation");
            if let Some(session) = &gather {
                session.cancel();
            }
            self.finish(id, Err(failure.into()));
        }

        Ok(OperationHandle::new(op, Arc::clone(self)))
    }

    fn validate(&self, request: &OperationRequest) -> Result<()> {
        if !request.kind.accepts(&request.params) {
            return Err(CallControlError::invalid_parameter(format!(
                "{:?} cannot be issued with {:?}",
                request.kind, request.params
            )));
        }

        match &request.params {
            OperationParams::Destination { address, .. } if address.trim().is_empty() => {
                Err(CallControlError::invalid_parameter("destination address is empty"))
            }
            OperationParams::GatherDigits(params) => params.validate(),
            OperationParams::GenerateTone { tone, .. } => tone.validate(),
            OperationParams::GenerateDigits { mode, digits, .. } => tone::validate_generated_digits(*mode, digits),
            OperationParams::SetupConference { party_count, .. }
                if *party_count < 3 || *party_count > self.max_conference_parties =>
            {
                Err(CallControlError::invalid_parameter(format!(
                    "conference party count {} outside 3..={}",
                    party_count, self.max_conference_parties
                )))
            }
            _ => Ok(()),
        }
    }

    /// Check preconditions and reserve the calls involved
    fn admit(&self, id: OperationId, request: &OperationRequest) -> Result<Admission> {
        let kind = request.kind;
        let mut calls = vec![request.call];
        calls.extend(request.related_call());

        self.registry.lock_calls(&calls, |guards| {
            for guard in guards.iter() {
                if let Some((pending, pending_kind)) = guard.blocking(kind) {
                    debug!(op = %id, call = %guard.id(), ?kind, %pending, "rejected by pending operation");
                    return Err(CallControlError::ConcurrencyViolation {
                        call_id: guard.id(),
                        requested: kind,
                        pending,
                        pending_kind,
                    });
                }
            }

            let primary = &guards[0];
            if !kind.allowed_in(primary.state()) {
                return Err(CallControlError::InvalidStateForOperation {
                    call_id: primary.id(),
                    operation: kind,
                    required: kind.required_states().to_vec(),
                    actual: primary.state(),
                });
            }

            match kind {
                OperationKind::SwapHold => {
                    let other = &guards[1];
                    if other.state() != CallState::OnHold {
                        return Err(CallControlError::pairing(
                            kind,
                            format!("{} is {}, not on hold", other.id(), other.state()),
                        ));
                    }
                }
                OperationKind::CompleteTransfer => transfer::check_complete(&guards[0], &guards[1])?,
                OperationKind::AddToConference => conference::check_add(&guards[0], &guards[1])?,
                OperationKind::RemoveFromConference => conference::check_remove(&guards[0])?,
                OperationKind::PrepareAddToConference => conference::check_prepare(&guards[0])?,
                _ => {}
            }

            for guard in guards.iter_mut() {
                guard.reserve(id, kind);
            }
            Ok(Admission {
                address: guards[0].info.address,
                provider_call: guards[0].info.provider_id,
            })
        })?
    }

    /// Create the calls an operation produces; they start Idle
    fn create_linked(&self, id: OperationId, request: &OperationRequest, address: AddressId) -> LinkedCalls {
        let mut linked = LinkedCalls::default();
        match &request.params {
            OperationParams::SetupTransfer(_) | OperationParams::PrepareAddToConference(_) => {
                linked.consultation = Some(self.registry.create_call(NewCall::local(address, CallOrigin::Outbound)));
            }
            OperationParams::SetupConference { .. } => {
                linked.conference = Some(self.registry.create_call(NewCall::local(address, CallOrigin::Conference)));
                linked.consultation = Some(self.registry.create_call(NewCall::local(address, CallOrigin::Outbound)));
            }
            OperationParams::CompleteTransfer {
                mode: TransferMode::Conference,
                ..
            } => {
                linked.conference = Some(self.registry.create_call(NewCall::local(address, CallOrigin::Conference)));
            }
            _ => {}
        }

        // a consultation belongs to the conference when one is created, else to the primary call
        let consultation_of = linked.conference.unwrap_or(request.call);
        if let Some(hub) = linked.conference {
            let _ = self.registry.with_record_mut(hub, |record| {
                record.reference(id);
                record.links.conference = Some(ConferenceRole::Hub {
                    members: Default::default(),
                });
            });
        }
        if let Some(consultation) = linked.consultation {
            let _ = self.registry.with_record_mut(consultation, |record| {
                record.reference(id);
                record.links.consultation_of = Some(consultation_of);
            });
        }
        linked
    }

    /// Resolve an operation. Returns false if it was already resolved.
    pub(crate) fn finish(&self, id: OperationId, outcome: Result<OperationOutput>) -> bool {
        let Some((_, op)) = self.pending.remove(&id) else {
            return false;
        };
        let kind = op.kind();

        let changes = match &outcome {
            Ok(_) => self.apply_effects(&op),
            Err(_) => self.discard_linked(&op),
        };
        self.registry.publish_changes(&changes, TransitionCause::Operation(kind));

        for call in op.calls() {
            let _ = self.registry.with_record_mut(call, |record| record.release(id));
        }

        let event_outcome = match &outcome {
            Ok(OperationOutput::Digits(result)) if result.reason == GatherReason::Cancelled => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                OperationOutcome::Cancelled
            }
            Ok(_) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                OperationOutcome::Succeeded
            }
            Err(CallControlError::Cancelled { .. }) => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                OperationOutcome::Cancelled
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                OperationOutcome::Failed(e.category())
            }
        };
        debug!(op = %id, call = %op.call(), ?kind, outcome = ?event_outcome, "operation resolved");

        op.resolve(outcome);
        self.registry.publish(CallEvent::OperationCompleted {
            call: op.call(),
            operation: id,
            kind,
            outcome: event_outcome,
        });

        for change in changes.iter().filter(|c| c.to == CallState::Disconnected) {
            self.on_disconnected(change.call);
        }
        for call in op.calls() {
            self.registry.dispose_if_finished(call);
        }
        true
    }

    /// State effects of a successful operation
    fn apply_effects(&self, op: &PendingOperation) -> Vec<StateChange> {
        use CallState::*;

        let mut changes = Vec::new();
        let call = op.call();
        let linked = op.linked;
        let registry = &self.registry;
        let missing = || CallControlError::internal(format!("{} lost its linked call", op.id));

        let applied: Result<()> = match (op.kind(), &op.request.params) {
            (OperationKind::Accept, _) => registry.with_record_mut(call, |r| r.move_to(Accepted, &mut changes)),
            (OperationKind::Answer | OperationKind::Unhold, _) => {
                registry.with_record_mut(call, |r| r.move_to(Connected, &mut changes))
            }
            (OperationKind::Dial, _) => registry.with_record_mut(call, |r| {
                if r.state() == Dialtone {
                    r.move_to(Dialing, &mut changes);
                }
            }),
            (OperationKind::Hold, _) => registry.with_record_mut(call, |r| r.move_to(OnHold, &mut changes)),
            (
                OperationKind::Drop | OperationKind::BlindTransfer | OperationKind::Redirect | OperationKind::Park,
                _,
            ) => registry.with_record_mut(call, |r| r.move_to(Disconnected, &mut changes)),
            (OperationKind::SwapHold, OperationParams::SwapHold { other }) => {
                registry.lock_calls(&[call, *other], |guards| {
                    if let [active, held] = guards {
                        active.move_to(OnHold, &mut changes);
                        held.move_to(Connected, &mut changes);
                    }
                })
            }
            (OperationKind::SetupTransfer, _) => linked.consultation.ok_or_else(missing).and_then(|consultation| {
                registry.lock_calls(&[call, consultation], |guards| {
                    if let [original, consultation] = guards {
                        transfer::apply_setup(original, consultation, &mut changes);
                    }
                })
            }),
            (OperationKind::CompleteTransfer, OperationParams::CompleteTransfer { consultation, mode }) => match mode {
                TransferMode::Transfer => registry.lock_calls(&[call, *consultation], |guards| {
                    if let [original, consultation] = guards {
                        transfer::apply_complete(original, consultation, &mut changes);
                    }
                }),
                TransferMode::Conference => linked.conference.ok_or_else(missing).and_then(|hub| {
                    registry.lock_calls(&[hub, call, *consultation], |guards| {
                        if let [hub, original, consultation] = guards {
                            transfer::apply_complete_to_conference(hub, original, consultation, &mut changes);
                        }
                    })
                }),
            },
            (OperationKind::SetupConference, _) => match (linked.conference, linked.consultation) {
                (Some(hub), Some(consultation)) => registry.lock_calls(&[hub, call, consultation], |guards| {
                    if let [hub, original, consultation] = guards {
                        conference::apply_setup(hub, original, consultation, &mut changes);
                    }
                }),
                _ => Err(missing()),
            },
            (OperationKind::PrepareAddToConference, _) => {
                linked.consultation.ok_or_else(missing).and_then(|consultation| {
                    registry.lock_calls(&[call, consultation], |guards| {
                        if let [hub, consultation] = guards {
                            conference::apply_prepare(hub, consultation, &mut changes);
                        }
                    })
                })
            }
            (OperationKind::AddToConference, OperationParams::AddToConference { call: target }) => {
                registry.lock_calls(&[call, *target], |guards| {
                    if let [hub, target] = guards {
                        conference::apply_add(hub, target, &mut changes);
                    }
                })
            }
            (OperationKind::RemoveFromConference, _) => match registry.with_record(call, |r| r.links.hub()) {
                Ok(Some(hub)) if registry.contains(hub) => registry.lock_calls(&[hub, call], |guards| {
                    if let [hub, member] = guards {
                        conference::apply_remove(hub, member, &mut changes);
                    }
                }),
                Ok(_) => registry.with_record_mut(call, |member| {
                    member.links.conference = None;
                    member.move_to(Connected, &mut changes);
                }),
                Err(e) => Err(e),
            },
            _ => Ok(()),
        };

        if let Err(e) = applied {
            warn!(op = %op.id, call = %call, error = %e, "could not apply operation effects");
        }
        changes
    }

    /// Tear down calls created for an operation that did not succeed
    fn discard_linked(&self, op: &PendingOperation) -> Vec<StateChange> {
        let mut changes = Vec::new();
        for call in op.linked.iter() {
            let _ = self.registry.with_record_mut(call, |record| {
                record.move_to(CallState::Disconnected, &mut changes);
                record.closed = true;
            });
        }
        changes
    }

    /// Clean up a call that reached Disconnected
    pub(crate) fn on_disconnected(&self, call: CallId) {
        let gather = self
            .registry
            .with_record_mut(call, |record| {
                record.close_monitors(None);
                record.gather.take()
            })
            .ok()
            .flatten();
        if let Some(session) = gather {
            if let Some(result) = session.cancel() {
                debug!(call = %call, op = %session.op, "cancelling digit gather on disconnect");
                self.finish(session.op, Ok(OperationOutput::Digits(result)));
            }
        }
        conference::detach(&self.registry, call);
    }

    /// Handle an `OperationCompleted` provider event
    pub(crate) fn on_provider_completion(
        &self,
        correlation: OperationId,
        result: std::result::Result<ProviderOutput, ProviderFailure>,
    ) {
        let Some(op) = self.pending.get(&correlation).map(|entry| Arc::clone(entry.value())) else {
            self.unmatched_completion(correlation);
            return;
        };

        if op.kind().resolves_locally() {
            match result {
                Ok(_) => debug!(op = %correlation, "provider acknowledged digit gather"),
                Err(failure) => {
                    if let Some(session) = &op.gather {
                        session.cancel();
                    }
                    self.finish(correlation, Err(failure.into()));
                }
            }
            return;
        }

        let outcome = result
            .map_err(CallControlError::from)
            .and_then(|output| OperationOutput::from_provider(op.id, op.kind(), &op.request.params, &op.linked, output));
        if let Err(CallControlError::ProtocolMismatch { detail }) = &outcome {
            warn!(op = %correlation, %detail, "unexpected completion payload");
        }
        if !self.finish(correlation, outcome) {
            self.unmatched_completion(correlation);
        }
    }

    fn unmatched_completion(&self, correlation: OperationId) {
        if correlation.0 > 0 && correlation.0 < self.next_id.load(Ordering::Relaxed) {
            self.counters.late_completions.fetch_add(1, Ordering::Relaxed);
            debug!(op = %correlation, "completion for an operation that already resolved");
        } else {
            self.record_unmatched();
            warn!(op = %correlation, "completion does not match any operation");
        }
    }

    pub(crate) fn record_unmatched(&self) {
        self.counters.unmatched_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Cancel a pending operation
    pub(crate) async fn cancel(&self, op: &Arc<PendingOperation>) -> CancelOutcome {
        let won = match &op.gather {
            Some(session) => match session.cancel() {
                Some(result) => self.finish(op.id, Ok(OperationOutput::Digits(result))),
                None => false,
            },
            None => self.finish(op.id, Err(CallControlError::Cancelled { operation: op.id })),
        };
        if !won {
            debug!(op = %op.id, "cancel after resolution");
            return CancelOutcome::AlreadyResolved;
        }

        op.mark_cancelled();
        info!(op = %op.id, call = %op.call(), kind = ?op.kind(), "operation cancelled");
        self.provider.abort(op.id, op.call()).await;
        CancelOutcome::Cancelled
    }

    /// Cancel the pending operation of `kind` on `call`, if there is one
    pub(crate) async fn cancel_kind(&self, call: CallId, kind: OperationKind) -> Result<CancelOutcome> {
        let pending = self.registry.with_record(call, |record| record.blocking(kind))?;
        let op = pending
            .filter(|(_, pending_kind)| *pending_kind == kind)
            .and_then(|(id, _)| self.pending.get(&id).map(|entry| Arc::clone(entry.value())));
        match op {
            Some(op) => Ok(self.cancel(&op).await),
            None => Ok(CancelOutcome::AlreadyResolved),
        }
    }

    pub fn is_pending(&self, id: OperationId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Pending operations touching `call`
    pub fn pending_for(&self, call: CallId) -> Vec<(OperationId, OperationKind)> {
        let mut ops: Vec<_> = self
            .pending
            .iter()
            .filter(|entry| entry.value().calls().contains(&call))
            .map(|entry| (*entry.key(), entry.value().kind()))
            .collect();
        ops.sort();
        ops
    }

    pub fn stats(&self) -> OperationStats {
        OperationStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            unmatched_events: self.counters.unmatched_events.load(Ordering::Relaxed),
            late_completions: self.counters.late_completions.load(Ordering::Relaxed),
            pending: self.pending.len(),
        }
    }
}

impl std::fmt::Debug for OperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationManager")
            .field("pending", &self.pending.len())
            .finish()
    }
}
