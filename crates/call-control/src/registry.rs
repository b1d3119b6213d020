//! Call registry
//!
//! The registry owns every live call. Each call's mutable record sits behind
//! its own mutex, which is the per-call exclusion scope: admission checks,
//! reservations and state effects all happen while it is held. Work that
//! spans several calls locks them in ascending [`CallId`] order through
//! [`CallRegistry::lock_calls`].
//!
//! Links between calls (consultation, conference membership) are stored as
//! ids and resolved through the registry, never as references to other
//! records.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::errors::{CallControlError, Result};
use crate::events::CallEvent;
use crate::gather::GatherSession;
use crate::monitor::{DigitRegistration, MonitorKind, ToneRegistration};
use crate::operations::{Exclusion, OperationKind};
use crate::provider::{CallInfoUpdate, CallKey, MonitoringSet, ProviderBoundary};
use crate::state::{CallState, TransitionCause, TransitionError};
use crate::types::{
    AddressId, BearerMode, CallId, CallOrigin, CallParamsUpdate, CallReason, CallTreatment, DialParams,
    MediaMode, OperationId, PartyInfo, Privilege, ProviderCallId, SubscriptionId,
};

/// Snapshot of a call's attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallInfo {
    pub id: CallId,
    pub guid: Uuid,
    pub provider_id: Option<ProviderCallId>,
    pub address: AddressId,
    pub state: CallState,
    pub origin: CallOrigin,
    pub reason: CallReason,
    pub bearer_mode: BearerMode,
    pub media_mode: MediaMode,
    pub privilege: Privilege,
    pub app_specific: u32,
    /// Free-form application data, never sent to the provider
    pub tag: serde_json::Value,
    pub call_data: Bytes,
    pub user_user_info: Option<Bytes>,
    pub caller: PartyInfo,
    pub called: PartyInfo,
    pub connected: PartyInfo,
    pub redirecting: PartyInfo,
    pub redirection: PartyInfo,
    pub trunk_id: Option<u32>,
    pub related_id: Option<u32>,
    pub data_rate: u32,
    pub dial_params: DialParams,
    pub treatment: Option<CallTreatment>,
    pub media_detection: bool,
    pub device_specific_data: Bytes,
    pub last_event_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Role of a call in a conference
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConferenceRole {
    /// The conference call itself
    Hub { members: BTreeSet<CallId> },
    Member { hub: CallId },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CallLinks {
    /// Consultation call created from this call
    pub consultation: Option<CallId>,
    /// Call this consultation call was created for
    pub consultation_of: Option<CallId>,
    pub conference: Option<ConferenceRole>,
}

impl CallLinks {
    pub(crate) fn hub(&self) -> Option<CallId> {
        match &self.conference {
            Some(ConferenceRole::Member { hub }) => Some(*hub),
            _ => None,
        }
    }

    pub(crate) fn is_hub(&self) -> bool {
        matches!(self.conference, Some(ConferenceRole::Hub { .. }))
    }
}

/// A state transition that was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateChange {
    pub call: CallId,
    pub from: CallState,
    pub to: CallState,
}

/// Mutable per-call data, guarded by the call's mutex
pub(crate) struct CallRecord {
    pub info: CallInfo,
    pub capabilities: Option<BTreeSet<OperationKind>>,
    pub links: CallLinks,
    /// The pending state-changing operation, if any
    pub exclusive: Option<(OperationId, OperationKind)>,
    /// Pending operations of the per-kind class
    pub singular: BTreeMap<OperationKind, OperationId>,
    /// Every pending operation that touches this call
    pub referenced_by: BTreeSet<OperationId>,
    pub gather: Option<Arc<GatherSession>>,
    pub digit_monitors: Vec<DigitRegistration>,
    pub tone_monitors: Vec<ToneRegistration>,
    pub comm_port_open: bool,
    /// Released by the provider or deallocated by the application
    pub closed: bool,
}

impl CallRecord {
    pub(crate) fn id(&self) -> CallId {
        self.info.id
    }

    pub(crate) fn state(&self) -> CallState {
        self.info.state
    }

    /// Validate and apply a transition; `None` if the state is unchanged
    pub(crate) fn apply_state(&mut self, to: CallState) -> std::result::Result<Option<StateChange>, TransitionError> {
        let from = self.info.state;
        self.info.state = from.transition(to)?;
        self.info.last_event_time = Utc::now();
        if from == to {
            return Ok(None);
        }
        Ok(Some(StateChange {
            call: self.info.id,
            from,
            to,
        }))
    }

    /// Apply an effect of a completed operation, logging illegal moves
    pub(crate) fn move_to(&mut self, to: CallState, changes: &mut Vec<StateChange>) {
        match self.apply_state(to) {
            Ok(Some(change)) => changes.push(change),
            Ok(None) => {}
            Err(e) => warn!(call = %self.info.id, error = %e, "skipping state effect"),
        }
    }

    /// Pending operation that blocks `kind`, if any
    pub(crate) fn blocking(&self, kind: OperationKind) -> Option<(OperationId, OperationKind)> {
        match kind.exclusion() {
            Exclusion::StateChange => self.exclusive,
            Exclusion::PerKind => self.singular.get(&kind).map(|id| (*id, kind)),
        }
    }

    pub(crate) fn reserve(&mut self, op: OperationId, kind: OperationKind) {
        match kind.exclusion() {
            Exclusion::StateChange => self.exclusive = Some((op, kind)),
            Exclusion::PerKind => {
                self.singular.insert(kind, op);
            }
        }
        self.referenced_by.insert(op);
    }

    /// Mark the call as touched by an operation without reserving a slot
    pub(crate) fn reference(&mut self, op: OperationId) {
        self.referenced_by.insert(op);
    }

    pub(crate) fn release(&mut self, op: OperationId) {
        if matches!(self.exclusive, Some((id, _)) if id == op) {
            self.exclusive = None;
        }
        self.singular.retain(|_, id| *id != op);
        self.referenced_by.remove(&op);
        if matches!(&self.gather, Some(session) if session.op == op) {
            self.gather = None;
        }
    }

    pub(crate) fn is_disposable(&self) -> bool {
        self.closed && self.info.state.is_terminal() && self.referenced_by.is_empty()
    }

    /// Operations legal now, given state and provider capabilities
    pub(crate) fn features(&self) -> BTreeSet<OperationKind> {
        OperationKind::ALL
            .into_iter()
            .filter(|kind| kind.allowed_in(self.info.state))
            .filter(|kind| match kind {
                OperationKind::RemoveFromConference => self.links.hub().is_some(),
                OperationKind::AddToConference | OperationKind::PrepareAddToConference => self.links.is_hub(),
                OperationKind::CompleteTransfer => self.links.consultation.is_some(),
                _ => true,
            })
            .filter(|kind| self.capabilities.as_ref().map_or(true, |caps| caps.contains(kind)))
            .collect()
    }

    pub(crate) fn monitoring_set(&self) -> MonitoringSet {
        let mut set = MonitoringSet::default();
        for reg in &self.digit_monitors {
            set.digit_modes.extend(reg.filter.iter().copied());
        }
        for reg in &self.tone_monitors {
            for tone in &reg.filter {
                if !set.tones.contains(tone) {
                    set.tones.push(tone.clone());
                }
            }
        }
        set
    }

    /// Close every monitoring subscription on the call
    pub(crate) fn close_monitors(&mut self, kind: Option<MonitorKind>) {
        if kind != Some(MonitorKind::Tones) {
            for reg in self.digit_monitors.drain(..) {
                reg.close();
            }
        }
        if kind != Some(MonitorKind::Digits) {
            for reg in self.tone_monitors.drain(..) {
                reg.close();
            }
        }
    }

    pub(crate) fn apply_info(&mut self, update: CallInfoUpdate) {
        let info = &mut self.info;
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(value) = update.$field { info.$field = value; })*
            };
        }
        set!(bearer_mode, media_mode, origin, reason, data_rate, caller, called, connected, redirecting, redirection, call_data, device_specific_data);
        if update.provider_id.is_some() {
            info.provider_id = update.provider_id;
        }
        if update.trunk_id.is_some() {
            info.trunk_id = update.trunk_id;
        }
        if update.related_id.is_some() {
            info.related_id = update.related_id;
        }
        if update.user_user_info.is_some() {
            info.user_user_info = update.user_user_info;
        }
        if update.capabilities.is_some() {
            self.capabilities = update.capabilities;
        }
        info.last_event_time = Utc::now();
    }

    pub(crate) fn apply_params(&mut self, update: &CallParamsUpdate) {
        let info = &mut self.info;
        match update {
            CallParamsUpdate::BearerMode(mode) => info.bearer_mode = *mode,
            CallParamsUpdate::MediaMode(mode) => info.media_mode = *mode,
            CallParamsUpdate::DataRate(rate) => info.data_rate = *rate,
            CallParamsUpdate::DialParams(params) => info.dial_params = *params,
            CallParamsUpdate::CallData(data) => info.call_data = data.clone(),
            CallParamsUpdate::Privilege(privilege) => info.privilege = *privilege,
            CallParamsUpdate::Treatment(treatment) => info.treatment = Some(*treatment),
            CallParamsUpdate::MediaDetection(enabled) => info.media_detection = *enabled,
        }
    }
}

/// Attributes of a call being created
#[derive(Debug, Clone)]
pub(crate) struct NewCall {
    pub address: AddressId,
    pub provider_id: Option<ProviderCallId>,
    pub state: CallState,
    pub origin: CallOrigin,
    pub reason: CallReason,
    pub privilege: Privilege,
    pub media_mode: MediaMode,
}

impl NewCall {
    /// An idle call the application owns
    pub(crate) fn local(address: AddressId, origin: CallOrigin) -> Self {
        Self {
            address,
            provider_id: None,
            state: CallState::Idle,
            origin,
            reason: CallReason::Direct,
            privilege: Privilege::Owner,
            media_mode: MediaMode::InteractiveVoice,
        }
    }
}

pub(crate) struct CallEntry {
    pub id: CallId,
    pub record: Mutex<CallRecord>,
    /// Held across a monitoring push to the provider
    monitoring: tokio::sync::Mutex<()>,
}

/// Owner of every live call
pub struct CallRegistry {
    calls: DashMap<CallId, Arc<CallEntry>>,
    by_provider_id: DashMap<ProviderCallId, CallId>,
    next_call: AtomicU64,
    next_subscription: AtomicU64,
    events: broadcast::Sender<CallEvent>,
}

impl CallRegistry {
    pub(crate) fn new(events: broadcast::Sender<CallEvent>) -> Self {
        Self {
            calls: DashMap::new(),
            by_provider_id: DashMap::new(),
            next_call: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            events,
        }
    }

    pub(crate) fn publish(&self, event: CallEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn create_call(&self, new: NewCall) -> CallId {
        let id = CallId(self.next_call.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        let info = CallInfo {
            id,
            guid: Uuid::new_v4(),
            provider_id: new.provider_id,
            address: new.address,
            state: new.state,
            origin: new.origin,
            reason: new.reason,
            bearer_mode: BearerMode::Voice,
            media_mode: new.media_mode,
            privilege: new.privilege,
            app_specific: 0,
            tag: serde_json::Value::Null,
            call_data: Bytes::new(),
            user_user_info: None,
            caller: PartyInfo::default(),
            called: PartyInfo::default(),
            connected: PartyInfo::default(),
            redirecting: PartyInfo::default(),
            redirection: PartyInfo::default(),
            trunk_id: None,
            related_id: None,
            data_rate: 0,
            dial_params: DialParams::default(),
            treatment: None,
            media_detection: false,
            device_specific_data: Bytes::new(),
            last_event_time: now,
            created_at: now,
        };
        let record = CallRecord {
            info,
            capabilities: None,
            links: CallLinks::default(),
            exclusive: None,
            singular: BTreeMap::new(),
            referenced_by: BTreeSet::new(),
            gather: None,
            digit_monitors: Vec::new(),
            tone_monitors: Vec::new(),
            comm_port_open: false,
            closed: false,
        };
        self.calls.insert(
            id,
            Arc::new(CallEntry {
                id,
                record: Mutex::new(record),
                monitoring: tokio::sync::Mutex::new(()),
            }),
        );
        if let Some(provider_id) = new.provider_id {
            self.by_provider_id.insert(provider_id, id);
        }

        info!(call = %id, address = %new.address, state = %new.state, "call created");
        self.publish(CallEvent::NewCall {
            call: id,
            address: new.address,
            state: new.state,
        });
        id
    }

    pub(crate) fn entry(&self, id: CallId) -> Result<Arc<CallEntry>> {
        if let Some(entry) = self.calls.get(&id) {
            return Ok(Arc::clone(entry.value()));
        }
        if id.0 > 0 && id.0 < self.next_call.load(Ordering::Relaxed) {
            Err(CallControlError::CallDisposed(id))
        } else {
            Err(CallControlError::CallNotFound(id.to_string()))
        }
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn call_ids(&self) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self.calls.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Map an event's call key onto a live call
    pub fn resolve(&self, key: CallKey) -> Option<CallId> {
        match key {
            CallKey::Local(id) => self.calls.contains_key(&id).then_some(id),
            CallKey::Provider(provider_id) => self.by_provider_id.get(&provider_id).map(|id| *id),
        }
    }

    pub fn current_state(&self, id: CallId) -> Result<CallState> {
        self.with_record(id, |record| record.state())
    }

    pub fn info(&self, id: CallId) -> Result<CallInfo> {
        self.with_record(id, |record| record.info.clone())
    }

    /// Apply a transition and publish it
    pub fn try_transition(&self, id: CallId, to: CallState, cause: TransitionCause) -> Result<CallState> {
        let change = self.with_record_mut(id, |record| {
            record
                .apply_state(to)
                .map_err(|e| CallControlError::InvalidTransition {
                    call_id: id,
                    from: e.from,
                    to: e.to,
                })
        })??;
        if let Some(change) = change {
            self.publish_changes(&[change], cause);
        }
        Ok(to)
    }

    pub(crate) fn publish_changes(&self, changes: &[StateChange], cause: TransitionCause) {
        for change in changes {
            debug!(call = %change.call, from = %change.from, to = %change.to, %cause, "call state changed");
            self.publish(CallEvent::StateChanged {
                call: change.call,
                from: change.from,
                to: change.to,
                cause,
            });
        }
    }

    pub(crate) fn with_record<R>(&self, id: CallId, f: impl FnOnce(&CallRecord) -> R) -> Result<R> {
        let entry = self.entry(id)?;
        let record = entry.record.lock();
        Ok(f(&record))
    }

    pub(crate) fn with_record_mut<R>(&self, id: CallId, f: impl FnOnce(&mut CallRecord) -> R) -> Result<R> {
        let entry = self.entry(id)?;
        let mut record = entry.record.lock();
        Ok(f(&mut record))
    }

    /// Lock several calls in ascending id order.
    ///
    /// Guards are handed to `f` in the order of `ids`. Duplicate ids are
    /// rejected.
    pub(crate) fn lock_calls<R>(
        &self,
        ids: &[CallId],
        f: impl FnOnce(&mut [MutexGuard<'_, CallRecord>]) -> R,
    ) -> Result<R> {
        let entries = ids.iter().map(|id| self.entry(*id)).collect::<Result<Vec<_>>>()?;
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by_key(|i| entries[*i].id);
        if order.windows(2).any(|w| entries[w[0]].id == entries[w[1]].id) {
            return Err(CallControlError::invalid_parameter("the same call was given twice"));
        }

        let mut slots: Vec<Option<MutexGuard<'_, CallRecord>>> = entries.iter().map(|_| None).collect();
        for i in order {
            slots[i] = Some(entries[i].record.lock());
        }
        let mut guards: Vec<MutexGuard<'_, CallRecord>> = slots.into_iter().flatten().collect();
        Ok(f(&mut guards))
    }

    pub(crate) fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    /// Drop one monitoring registration; false if the call is gone
    pub(crate) fn remove_monitor(&self, call: CallId, kind: MonitorKind, id: SubscriptionId) -> bool {
        self.with_record_mut(call, |record| match kind {
            MonitorKind::Digits => record.digit_monitors.retain(|reg| reg.id != id),
            MonitorKind::Tones => record.tone_monitors.retain(|reg| reg.id != id),
        })
        .is_ok()
    }

    /// Tell the provider the union of the call's monitoring filters.
    ///
    /// Pushes for one call are serialised and each reads the set only once
    /// the previous push has returned, so the provider always ends up with
    /// the set that matches the live registrations.
    pub(crate) async fn sync_monitoring(&self, call: CallId, provider: &dyn ProviderBoundary) -> Result<()> {
        let entry = self.entry(call)?;
        let _push = entry.monitoring.lock().await;
        let set = entry.record.lock().monitoring_set();
        provider.set_monitoring(call, &set).await?;
        trace!(call = %call, digit_modes = set.digit_modes.len(), tones = set.tones.len(), "monitoring set pushed");
        Ok(())
    }

    /// Remove the call if it is disconnected, closed and unreferenced
    pub(crate) fn dispose_if_finished(&self, id: CallId) -> bool {
        let Ok(entry) = self.entry(id) else {
            return false;
        };
        let provider_id = {
            let record = entry.record.lock();
            if !record.is_disposable() {
                return false;
            }
            record.info.provider_id
        };
        if self.calls.remove(&id).is_none() {
            return false;
        }
        if let Some(provider_id) = provider_id {
            self.by_provider_id.remove_if(&provider_id, |_, mapped| *mapped == id);
        }
        info!(call = %id, "call disposed");
        self.publish(CallEvent::Disposed { call: id });
        true
    }

    pub(crate) fn index_provider_id(&self, id: CallId, provider_id: ProviderCallId) {
        self.by_provider_id.insert(provider_id, id);
    }
}

impl std::fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRegistry").field("calls", &self.calls.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (CallRegistry, broadcast::Receiver<CallEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (CallRegistry::new(tx), rx)
    }

    fn offered(registry: &CallRegistry) -> CallId {
        registry.create_call(NewCall {
            state: CallState::Offering,
            ..NewCall::local(AddressId::new(0, 0), CallOrigin::Inbound)
        })
    }

    #[test]
    fn test_transition_publishes_event() {
        let (registry, mut rx) = registry();
        let id = offered(&registry);
        assert!(matches!(rx.try_recv(), Ok(CallEvent::NewCall { .. })));

        registry
            .try_transition(id, CallState::Connected, TransitionCause::Provider)
            .unwrap();
        assert_eq!(registry.current_state(id).unwrap(), CallState::Connected);
        assert_eq!(
            rx.try_recv().unwrap(),
            CallEvent::StateChanged {
                call: id,
                from: CallState::Offering,
                to: CallState::Connected,
                cause: TransitionCause::Provider,
            }
        );
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let (registry, _rx) = registry();
        let id = offered(&registry);
        let err = registry
            .try_transition(id, CallState::OnHold, TransitionCause::Provider)
            .unwrap_err();
        assert!(err.is_state_violation());
        assert_eq!(registry.current_state(id).unwrap(), CallState::Offering);
    }

    #[test]
    fn test_disposed_ids_are_reported_as_disposed() {
        let (registry, _rx) = registry();
        let id = offered(&registry);
        registry
            .try_transition(id, CallState::Disconnected, TransitionCause::Provider)
            .unwrap();
        assert!(!registry.dispose_if_finished(id), "still open");
        registry.with_record_mut(id, |r| r.closed = true).unwrap();
        assert!(registry.dispose_if_finished(id));

        assert!(matches!(registry.entry(id), Err(CallControlError::CallDisposed(_))));
        assert!(matches!(
            registry.entry(CallId(999)),
            Err(CallControlError::CallNotFound(_))
        ));
    }

    #[test]
    fn test_lock_calls_returns_guards_in_request_order() {
        let (registry, _rx) = registry();
        let a = offered(&registry);
        let b = offered(&registry);
        let seen = registry
            .lock_calls(&[b, a], |guards| guards.iter().map(|g| g.id()).collect::<Vec<_>>())
            .unwrap();
        assert_eq!(seen, vec![b, a]);
        assert!(registry.lock_calls(&[a, a], |_| ()).is_err());
    }

    #[test]
    fn test_features_follow_state_and_capabilities() {
        let (registry, _rx) = registry();
        let id = offered(&registry);
        let features = registry.with_record(id, |r| r.features()).unwrap();
        assert!(features.contains(&OperationKind::Answer));
        assert!(!features.contains(&OperationKind::Hold));

        registry
            .with_record_mut(id, |r| r.capabilities = Some(BTreeSet::from([OperationKind::Drop])))
            .unwrap();
        let features = registry.with_record(id, |r| r.features()).unwrap();
        assert_eq!(features, BTreeSet::from([OperationKind::Drop]));
    }
}
