//! Conference coordination
//!
//! A conference is a hub call plus member calls. Membership is kept on the
//! hub's record as member ids and on each member as the hub's id.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RelatedCallPrivilege;
use crate::errors::{CallControlError, Result};
use crate::operations::{
    ConferenceSetup, OperationHandle, OperationKind, OperationManager, OperationParams, OperationRequest,
};
use crate::provider::ProviderBoundary;
use crate::registry::{CallRecord, CallRegistry, ConferenceRole, StateChange};
use crate::state::CallState;
use crate::types::{CallId, CallParamsUpdate, MakeCallParams, Privilege};

/// Target states that can be added to a conference
const ADDABLE: &[CallState] = &[
    CallState::Connected,
    CallState::OnHold,
    CallState::RingBack,
    CallState::Proceeding,
];

/// Conference setup, membership and enumeration
#[derive(Clone)]
pub struct ConferenceCoordinator {
    manager: Arc<OperationManager>,
    registry: Arc<CallRegistry>,
    provider: Arc<dyn ProviderBoundary>,
    policy: RelatedCallPrivilege,
}

impl ConferenceCoordinator {
    pub(crate) fn new(
        manager: Arc<OperationManager>,
        registry: Arc<CallRegistry>,
        provider: Arc<dyn ProviderBoundary>,
        policy: RelatedCallPrivilege,
    ) -> Self {
        Self {
            manager,
            registry,
            provider,
            policy,
        }
    }

    /// Create a conference around `call` plus a consultation call for the next party
    pub async fn setup_conference(
        &self,
        call: CallId,
        party_count: u32,
        params: MakeCallParams,
    ) -> Result<OperationHandle<ConferenceSetup>> {
        self.manager
            .submit(OperationRequest::new(
                call,
                OperationKind::SetupConference,
                OperationParams::SetupConference { party_count, params },
            ))
            .await
    }

    /// Hold the conference and create a consultation call for another party
    pub async fn prepare_add(&self, hub: CallId, params: MakeCallParams) -> Result<OperationHandle<CallId>> {
        self.manager
            .submit(OperationRequest::new(
                hub,
                OperationKind::PrepareAddToConference,
                OperationParams::PrepareAddToConference(params),
            ))
            .await
    }

    pub async fn add(&self, hub: CallId, target: CallId) -> Result<OperationHandle<()>> {
        self.manager
            .submit(OperationRequest::new(
                hub,
                OperationKind::AddToConference,
                OperationParams::AddToConference { call: target },
            ))
            .await
    }

    pub async fn remove(&self, member: CallId) -> Result<OperationHandle<()>> {
        self.manager
            .submit(OperationRequest::new(
                member,
                OperationKind::RemoveFromConference,
                OperationParams::None,
            ))
            .await
    }

    /// Hub of the conference `call` belongs to, or `call` itself if it is a hub
    pub fn conference_of(&self, call: CallId) -> Result<Option<CallId>> {
        self.registry.with_record(call, |record| match &record.links.conference {
            Some(ConferenceRole::Hub { .. }) => Some(call),
            Some(ConferenceRole::Member { hub }) => Some(*hub),
            None => None,
        })
    }

    pub fn members(&self, hub: CallId) -> Result<BTreeSet<CallId>> {
        self.registry.with_record(hub, |record| match &record.links.conference {
            Some(ConferenceRole::Hub { members }) => members.clone(),
            _ => BTreeSet::new(),
        })
    }

    /// Other calls of the same conference, hub included.
    ///
    /// Privileges are left alone unless the engine is configured with
    /// [`RelatedCallPrivilege::GrantMonitor`], in which case calls the
    /// application holds no privilege on are raised to `Monitor`.
    pub async fn related_calls(&self, call: CallId) -> Result<Vec<CallId>> {
        let Some(hub) = self.conference_of(call)? else {
            return Ok(Vec::new());
        };
        let mut related: Vec<CallId> = std::iter::once(hub)
            .chain(self.members(hub)?)
            .filter(|id| *id != call && self.registry.contains(*id))
            .collect();
        related.sort();

        if self.policy == RelatedCallPrivilege::GrantMonitor {
            for id in &related {
                if let Err(e) = self.grant_monitor_privilege(*id).await {
                    warn!(call = %id, error = %e, "could not grant monitor privilege");
                }
            }
        }
        Ok(related)
    }

    /// Raise the application's privilege on `call` to at least `Monitor`
    pub async fn grant_monitor_privilege(&self, call: CallId) -> Result<()> {
        let privilege = self.registry.with_record(call, |record| record.info.privilege)?;
        if privilege >= Privilege::Monitor {
            return Ok(());
        }
        let update = CallParamsUpdate::Privilege(Privilege::Monitor);
        self.provider.set_call_params(call, &update).await?;
        self.registry.with_record_mut(call, |record| record.apply_params(&update))?;
        debug!(call = %call, "monitor privilege granted");
        Ok(())
    }
}

pub(crate) fn check_add(hub: &CallRecord, target: &CallRecord) -> Result<()> {
    let kind = OperationKind::AddToConference;
    if !hub.links.is_hub() {
        return Err(CallControlError::pairing(kind, format!("{} is not a conference call", hub.id())));
    }
    if let Some(other) = target.links.hub() {
        return Err(CallControlError::pairing(
            kind,
            format!("{} already belongs to conference {}", target.id(), other),
        ));
    }
    if !ADDABLE.contains(&target.state()) {
        return Err(CallControlError::pairing(
            kind,
            format!("{} is {}, expected one of {:?}", target.id(), target.state(), ADDABLE),
        ));
    }
    Ok(())
}

pub(crate) fn check_remove(member: &CallRecord) -> Result<()> {
    match member.links.hub() {
        Some(_) => Ok(()),
        None => Err(CallControlError::pairing(
            OperationKind::RemoveFromConference,
            format!("{} is not a conference member", member.id()),
        )),
    }
}

pub(crate) fn check_prepare(hub: &CallRecord) -> Result<()> {
    if hub.links.is_hub() {
        Ok(())
    } else {
        Err(CallControlError::pairing(
            OperationKind::PrepareAddToConference,
            format!("{} is not a conference call", hub.id()),
        ))
    }
}

fn join(hub: &mut CallRecord, member: &mut CallRecord) {
    member.links.conference = Some(ConferenceRole::Member { hub: hub.id() });
    if member.links.consultation_of == Some(hub.id()) {
        member.links.consultation_of = None;
    }
    if hub.links.consultation == Some(member.id()) {
        hub.links.consultation = None;
    }
    if !hub.links.is_hub() {
        hub.links.conference = Some(ConferenceRole::Hub {
            members: BTreeSet::new(),
        });
    }
    if let Some(ConferenceRole::Hub { members }) = &mut hub.links.conference {
        members.insert(member.id());
    }
}

pub(crate) fn apply_setup(
    hub: &mut CallRecord,
    original: &mut CallRecord,
    consultation: &mut CallRecord,
    changes: &mut Vec<StateChange>,
) {
    hub.move_to(CallState::OnHoldPendingConference, changes);
    original.move_to(CallState::Conferenced, changes);
    join(hub, original);
    hub.links.consultation = Some(consultation.id());
    consultation.links.consultation_of = Some(hub.id());
    consultation.move_to(CallState::Dialtone, changes);
}

pub(crate) fn apply_prepare(hub: &mut CallRecord, consultation: &mut CallRecord, changes: &mut Vec<StateChange>) {
    hub.move_to(CallState::OnHoldPendingConference, changes);
    hub.links.consultation = Some(consultation.id());
    consultation.links.consultation_of = Some(hub.id());
    consultation.move_to(CallState::Dialtone, changes);
}

pub(crate) fn apply_add(hub: &mut CallRecord, target: &mut CallRecord, changes: &mut Vec<StateChange>) {
    target.move_to(CallState::Conferenced, changes);
    join(hub, target);
    hub.move_to(CallState::Connected, changes);
}

pub(crate) fn apply_remove(hub: &mut CallRecord, member: &mut CallRecord, changes: &mut Vec<StateChange>) {
    if let Some(ConferenceRole::Hub { members }) = &mut hub.links.conference {
        members.remove(&member.id());
    }
    member.links.conference = None;
    member.move_to(CallState::Connected, changes);
}

/// Forget a disconnected member on its hub
pub(crate) fn detach(registry: &CallRegistry, call: CallId) {
    let Ok(Some(hub)) = registry.with_record(call, |record| record.links.hub()) else {
        return;
    };
    let _ = registry.with_record_mut(hub, |record| {
        if let Some(ConferenceRole::Hub { members }) = &mut record.links.conference {
            members.remove(&call);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CallEvent;
    use crate::registry::NewCall;
    use crate::types::{AddressId, CallOrigin};
    use tokio::sync::broadcast;

    fn setup() -> (CallRegistry, CallId, CallId, CallId) {
        let (tx, _) = broadcast::channel::<CallEvent>(16);
        let registry = CallRegistry::new(tx);
        let address = AddressId::new(1, 0);
        let original = registry.create_call(NewCall {
            state: CallState::Connected,
            ..NewCall::local(address, CallOrigin::Inbound)
        });
        let hub = registry.create_call(NewCall::local(address, CallOrigin::Conference));
        let consultation = registry.create_call(NewCall::local(address, CallOrigin::Outbound));
        (registry, original, hub, consultation)
    }

    #[test]
    fn test_setup_then_add_consultation() {
        let (registry, original, hub, consultation) = setup();
        let mut changes = Vec::new();
        registry
            .lock_calls(&[hub, original, consultation], |g| {
                if let [h, o, c] = g {
                    apply_setup(h, o, c, &mut changes);
                }
            })
            .unwrap();
        assert_eq!(registry.current_state(hub).unwrap(), CallState::OnHoldPendingConference);
        assert_eq!(registry.current_state(original).unwrap(), CallState::Conferenced);
        assert_eq!(registry.current_state(consultation).unwrap(), CallState::Dialtone);

        // a dialing consultation call cannot join yet
        let early = registry
            .lock_calls(&[hub, consultation], |g| check_add(&g[0], &g[1]))
            .unwrap();
        assert!(early.unwrap_err().is_state_violation());

        registry
            .with_record_mut(consultation, |r| r.apply_state(CallState::Connected).map(|_| ()))
            .unwrap()
            .unwrap();
        registry
            .lock_calls(&[hub, consultation], |g| {
                check_add(&g[0], &g[1]).unwrap();
                if let [h, c] = g {
                    apply_add(h, c, &mut changes);
                }
            })
            .unwrap();

        assert_eq!(registry.current_state(hub).unwrap(), CallState::Connected);
        let members = registry
            .with_record(hub, |r| match &r.links.conference {
                Some(ConferenceRole::Hub { members }) => members.clone(),
                _ => BTreeSet::new(),
            })
            .unwrap();
        assert_eq!(members, BTreeSet::from([original, consultation]));
    }

    #[test]
    fn test_members_cannot_join_twice() {
        let (registry, original, hub, _) = setup();
        let mut changes = Vec::new();
        registry
            .lock_calls(&[hub, original], |g| {
                if let [h, o] = g {
                    h.move_to(CallState::Connected, &mut changes);
                    apply_add(h, o, &mut changes);
                }
            })
            .unwrap();
        let again = registry
            .lock_calls(&[hub, original], |g| check_add(&g[0], &g[1]))
            .unwrap();
        assert!(again.is_err());
    }
}
