//! Transfer coordination
//!
//! The coordinator composes requests and checks pair preconditions. The
//! provider performs the actual media switch; the effects here only move
//! the calls' states and links once it reports success.

use std::sync::Arc;

use crate::errors::{CallControlError, Result};
use crate::operations::{OperationHandle, OperationKind, OperationManager, OperationParams, OperationRequest};
use crate::registry::{CallRecord, ConferenceRole, StateChange};
use crate::state::CallState;
use crate::types::{CallId, MakeCallParams, TransferMode};

/// States of a consultation call that can be merged
const CONSULTATION_READY: &[CallState] = &[
    CallState::Connected,
    CallState::RingBack,
    CallState::Proceeding,
    CallState::OnHold,
];

/// Consultation transfers and blind transfers
#[derive(Clone)]
pub struct TransferCoordinator {
    manager: Arc<OperationManager>,
}

impl TransferCoordinator {
    pub(crate) fn new(manager: Arc<OperationManager>) -> Self {
        Self { manager }
    }

    /// Put `call` on hold pending transfer and create a consultation call
    pub async fn setup_transfer(&self, call: CallId, params: MakeCallParams) -> Result<OperationHandle<CallId>> {
        self.manager
            .submit(OperationRequest::new(
                call,
                OperationKind::SetupTransfer,
                OperationParams::SetupTransfer(params),
            ))
            .await
    }

    /// Hand the held party over to the consultation call's far end
    pub async fn complete_transfer(&self, call: CallId, consultation: CallId) -> Result<OperationHandle<()>> {
        self.manager
            .submit(complete_request(call, consultation, TransferMode::Transfer))
            .await
    }

    /// Merge the held call and the consultation call into a new conference
    pub async fn complete_transfer_to_conference(
        &self,
        call: CallId,
        consultation: CallId,
    ) -> Result<OperationHandle<CallId>> {
        self.manager
            .submit(complete_request(call, consultation, TransferMode::Conference))
            .await
    }

    /// Single-step transfer without a consultation call
    pub async fn blind_transfer(
        &self,
        call: CallId,
        address: impl Into<String>,
        country_code: u32,
    ) -> Result<OperationHandle<()>> {
        self.manager
            .submit(OperationRequest::new(
                call,
                OperationKind::BlindTransfer,
                OperationParams::Destination {
                    address: address.into(),
                    country_code,
                },
            ))
            .await
    }
}

fn complete_request(call: CallId, consultation: CallId, mode: TransferMode) -> OperationRequest {
    OperationRequest::new(
        call,
        OperationKind::CompleteTransfer,
        OperationParams::CompleteTransfer { consultation, mode },
    )
}

/// Pair precondition for completing a transfer
pub(crate) fn check_complete(original: &CallRecord, consultation: &CallRecord) -> Result<()> {
    let kind = OperationKind::CompleteTransfer;
    if original.links.consultation != Some(consultation.id())
        || consultation.links.consultation_of != Some(original.id())
    {
        return Err(CallControlError::pairing(
            kind,
            format!("{} is not the consultation call of {}", consultation.id(), original.id()),
        ));
    }
    if !CONSULTATION_READY.contains(&consultation.state()) {
        return Err(CallControlError::pairing(
            kind,
            format!(
                "consultation call {} is {}, expected one of {:?}",
                consultation.id(),
                consultation.state(),
                CONSULTATION_READY
            ),
        ));
    }
    Ok(())
}

pub(crate) fn apply_setup(original: &mut CallRecord, consultation: &mut CallRecord, changes: &mut Vec<StateChange>) {
    original.move_to(CallState::OnHoldPendingTransfer, changes);
    original.links.consultation = Some(consultation.id());
    consultation.links.consultation_of = Some(original.id());
    consultation.move_to(CallState::Dialtone, changes);
}

pub(crate) fn apply_complete(original: &mut CallRecord, consultation: &mut CallRecord, changes: &mut Vec<StateChange>) {
    original.links.consultation = None;
    consultation.links.consultation_of = None;
    original.move_to(CallState::Disconnected, changes);
    consultation.move_to(CallState::Disconnected, changes);
}

pub(crate) fn apply_complete_to_conference(
    hub: &mut CallRecord,
    original: &mut CallRecord,
    consultation: &mut CallRecord,
    changes: &mut Vec<StateChange>,
) {
    original.links.consultation = None;
    consultation.links.consultation_of = None;

    hub.move_to(CallState::Connected, changes);
    hub.links.conference = Some(ConferenceRole::Hub {
        members: [original.id(), consultation.id()].into_iter().collect(),
    });
    for member in [original, consultation] {
        member.move_to(CallState::Conferenced, changes);
        member.links.conference = Some(ConferenceRole::Member { hub: hub.id() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CallEvent;
    use crate::registry::{CallRegistry, NewCall};
    use crate::types::{AddressId, CallOrigin};
    use tokio::sync::broadcast;

    fn registry() -> CallRegistry {
        let (tx, _) = broadcast::channel::<CallEvent>(16);
        CallRegistry::new(tx)
    }

    fn call(registry: &CallRegistry, state: CallState) -> CallId {
        registry.create_call(NewCall {
            state,
            ..NewCall::local(AddressId::new(0, 0), CallOrigin::Outbound)
        })
    }

    #[test]
    fn test_complete_requires_linked_consultation() {
        let registry = registry();
        let original = call(&registry, CallState::Connected);
        let stranger = call(&registry, CallState::Connected);

        let err = registry
            .lock_calls(&[original, stranger], |g| check_complete(&g[0], &g[1]))
            .unwrap()
            .unwrap_err();
        assert!(err.is_state_violation());
    }

    #[test]
    fn test_setup_then_complete() {
        let registry = registry();
        let original = call(&registry, CallState::Connected);
        let consultation = call(&registry, CallState::Idle);
        let mut changes = Vec::new();

        registry
            .lock_calls(&[original, consultation], |g| {
                if let [o, c] = g {
                    apply_setup(o, c, &mut changes);
                }
            })
            .unwrap();
        assert_eq!(registry.current_state(original).unwrap(), CallState::OnHoldPendingTransfer);
        assert_eq!(registry.current_state(consultation).unwrap(), CallState::Dialtone);

        // dialtone is not a mergeable consultation state
        let early = registry
            .lock_calls(&[original, consultation], |g| check_complete(&g[0], &g[1]))
            .unwrap();
        assert!(early.is_err());

        registry
            .with_record_mut(consultation, |r| r.apply_state(CallState::Connected).map(|_| ()))
            .unwrap()
            .unwrap();
        registry
            .lock_calls(&[original, consultation], |g| check_complete(&g[0], &g[1]))
            .unwrap()
            .unwrap();

        registry
            .lock_calls(&[original, consultation], |g| {
                if let [o, c] = g {
                    apply_complete(o, c, &mut changes);
                }
            })
            .unwrap();
        assert_eq!(registry.current_state(original).unwrap(), CallState::Disconnected);
        assert_eq!(registry.current_state(consultation).unwrap(), CallState::Disconnected);
    }
}
