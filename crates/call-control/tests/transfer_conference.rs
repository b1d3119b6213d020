//! Transfer and Conference Tests
//!
//! Consultation transfers, blind transfers and N-party conferences. Pair
//! preconditions are checked atomically: a rejected cross-call operation
//! leaves both calls untouched.

mod common;

use pretty_assertions::assert_eq;

use common::{harness, harness_with, Harness};
use rvoip_call_control::{
    Call, CallControlConfig, CallControlError, CallId, CallState, ErrorCategory, MakeCallParams, OperationKind,
    Privilege, RelatedCallPrivilege,
};

/// Set up a consultation call from `original` and return it
async fn consult(h: &Harness, original: &Call) -> Call {
    let handle = original
        .begin_setup_transfer(MakeCallParams::new().with_destination("2001"))
        .await
        .unwrap();
    let consultation = h.provider.last_request().linked.consultation.expect("consultation created");
    h.complete(handle.id());
    assert_eq!(handle.wait().await.unwrap(), consultation);
    h.control.call(consultation).unwrap()
}

/// Set up a three-party conference; returns (conference, consultation)
async fn conference(h: &Harness, original: &Call) -> (Call, Call) {
    let handle = original.begin_setup_conference(3, MakeCallParams::new()).await.unwrap();
    h.complete(handle.id());
    let setup = handle.wait().await.unwrap();
    (
        h.control.call(setup.conference).unwrap(),
        h.control.call(setup.consultation).unwrap(),
    )
}

fn ids(calls: &[Call]) -> Vec<CallId> {
    calls.iter().map(Call::id).collect()
}

#[tokio::test]
async fn test_setup_and_complete_transfer() {
    let h = harness();
    let original = h.new_call(CallState::Connected);

    let consultation = consult(&h, &original).await;
    assert_eq!(h.state(&original), CallState::OnHoldPendingTransfer);
    assert_eq!(h.state(&consultation), CallState::Dialtone);
    assert_eq!(original.consultation_call().unwrap(), Some(consultation.clone()));
    assert!(original.features().unwrap().contains(&OperationKind::CompleteTransfer));

    h.report_state(&consultation, CallState::Connected);

    let handle = original.begin_complete_transfer(&consultation).await.unwrap();
    let request = h.provider.last_request();
    assert_eq!(request.kind, OperationKind::CompleteTransfer);
    h.complete(handle.id());
    handle.wait().await.unwrap();

    assert_eq!(h.state(&original), CallState::Disconnected);
    assert_eq!(h.state(&consultation), CallState::Disconnected);
}

#[tokio::test]
async fn test_complete_transfer_rejected_while_consultation_dialing() {
    let h = harness();
    let original = h.new_call(CallState::Connected);
    let consultation = consult(&h, &original).await;
    let issued = h.provider.request_count();

    let err = original.begin_complete_transfer(&consultation).await.unwrap_err();
    assert!(matches!(err, CallControlError::InvalidCallPairing { .. }));
    assert!(err.is_state_violation());

    assert_eq!(h.state(&original), CallState::OnHoldPendingTransfer);
    assert_eq!(h.state(&consultation), CallState::Dialtone);
    assert_eq!(h.provider.request_count(), issued);
    assert!(original.begin_unhold().await.is_ok(), "no slot left reserved by the rejection");
}

#[tokio::test]
async fn test_complete_transfer_with_unrelated_call() {
    let h = harness();
    let original = h.new_call(CallState::Connected);
    let _consultation = consult(&h, &original).await;
    let stranger = h.new_call(CallState::Connected);

    let err = original.begin_complete_transfer(&stranger).await.unwrap_err();
    assert!(matches!(err, CallControlError::InvalidCallPairing { .. }));
    assert_eq!(h.state(&stranger), CallState::Connected);
}

#[tokio::test]
async fn test_failed_setup_discards_consultation() {
    let h = harness();
    let original = h.new_call(CallState::Connected);

    let handle = original.begin_setup_transfer(MakeCallParams::new()).await.unwrap();
    let consultation = h.provider.last_request().linked.consultation.unwrap();
    assert!(h.control.call(consultation).is_ok());

    h.fail(handle.id(), rvoip_call_control::ProviderFailure::InvalidDestination("99".into()));
    assert_eq!(handle.wait().await.unwrap_err().category(), ErrorCategory::ProviderRejected);

    assert_eq!(h.state(&original), CallState::Connected);
    assert!(matches!(h.control.call(consultation), Err(CallControlError::CallDisposed(_))));
}

#[tokio::test]
async fn test_blind_transfer() {
    let h = harness();
    let offering = h.new_call(CallState::Offering);
    assert!(offering.begin_blind_transfer("3001", 0).await.unwrap_err().is_state_violation());

    let call = h.new_call(CallState::Connected);
    let handle = call.begin_blind_transfer("3001", 0).await.unwrap();
    h.complete(handle.id());
    handle.wait().await.unwrap();
    assert_eq!(h.state(&call), CallState::Disconnected);
}

#[tokio::test]
async fn test_complete_transfer_to_conference() {
    let h = harness();
    let original = h.new_call(CallState::Connected);
    let consultation = consult(&h, &original).await;
    h.report_state(&consultation, CallState::RingBack);

    let handle = original
        .begin_complete_transfer_to_conference(&consultation)
        .await
        .unwrap();
    h.complete(handle.id());
    let hub = h.control.call(handle.wait().await.unwrap()).unwrap();

    assert_eq!(h.state(&hub), CallState::Connected);
    assert_eq!(h.state(&original), CallState::Conferenced);
    assert_eq!(h.state(&consultation), CallState::Conferenced);
    assert_eq!(original.conference_call().unwrap(), Some(hub.clone()));
    assert_eq!(
        h.control.conferences().members(hub.id()).unwrap().into_iter().collect::<Vec<_>>(),
        vec![original.id(), consultation.id()]
    );
}

#[tokio::test]
async fn test_conference_setup_add_and_remove() {
    let h = harness();
    let original = h.new_call(CallState::Connected);

    let (hub, consultation) = conference(&h, &original).await;
    assert_eq!(h.state(&hub), CallState::OnHoldPendingConference);
    assert_eq!(h.state(&original), CallState::Conferenced);
    assert_eq!(h.state(&consultation), CallState::Dialtone);

    h.report_state(&consultation, CallState::Connected);
    let add = hub.begin_add_to_conference(&consultation).await.unwrap();
    h.complete(add.id());
    add.wait().await.unwrap();

    assert_eq!(h.state(&hub), CallState::Connected);
    assert_eq!(h.state(&consultation), CallState::Conferenced);
    let related = original.related_conference_calls().await.unwrap();
    assert_eq!(ids(&related), vec![hub.id(), consultation.id()]);

    let remove = consultation.begin_remove_from_conference().await.unwrap();
    h.complete(remove.id());
    remove.wait().await.unwrap();

    assert_eq!(h.state(&consultation), CallState::Connected);
    let related = original.related_conference_calls().await.unwrap();
    assert_eq!(ids(&related), vec![hub.id()]);
    assert!(consultation.related_conference_calls().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_prepare_add_creates_consultation_on_hub() {
    let h = harness();
    let original = h.new_call(CallState::Connected);
    let (hub, consultation) = conference(&h, &original).await;
    h.report_state(&consultation, CallState::Connected);
    let add = hub.begin_add_to_conference(&consultation).await.unwrap();
    h.complete(add.id());
    add.wait().await.unwrap();

    // only a conference call can prepare an add
    assert!(original.begin_prepare_add_to_conference(MakeCallParams::new()).await.is_err());

    let prepare = hub.begin_prepare_add_to_conference(MakeCallParams::new()).await.unwrap();
    h.complete(prepare.id());
    let third = h.control.call(prepare.wait().await.unwrap()).unwrap();
    assert_eq!(h.state(&hub), CallState::OnHoldPendingConference);
    assert_eq!(h.state(&third), CallState::Dialtone);
}

#[tokio::test]
async fn test_add_rejects_member_of_other_conference() {
    let h = harness();
    let first = h.new_call(CallState::Connected);
    let second = h.new_call(CallState::Connected);
    let (hub_a, _) = conference(&h, &first).await;
    let _ = conference(&h, &second).await;

    let err = hub_a.begin_add_to_conference(&second).await.unwrap_err();
    assert!(matches!(err, CallControlError::InvalidCallPairing { .. }));
    assert_eq!(h.state(&hub_a), CallState::OnHoldPendingConference);
    assert_eq!(h.state(&second), CallState::Conferenced);
}

#[tokio::test]
async fn test_conference_party_count_bounds() {
    let h = harness_with(CallControlConfig::new().with_max_conference_parties(4));
    let call = h.new_call(CallState::Connected);

    for count in [2, 5] {
        let err = call.begin_setup_conference(count, MakeCallParams::new()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Misuse, "party count {count}");
    }
    assert_eq!(h.provider.request_count(), 0);
    assert!(call.begin_setup_conference(4, MakeCallParams::new()).await.is_ok());
}

#[tokio::test]
async fn test_related_calls_leave_privilege_alone_by_default() {
    let h = harness();
    let original = h.new_call(CallState::Connected);
    let (hub, _) = conference(&h, &original).await;
    hub.set_privilege(Privilege::None).await.unwrap();

    let related = original.related_conference_calls().await.unwrap();
    assert!(ids(&related).contains(&hub.id()));
    assert_eq!(hub.privilege().unwrap(), Privilege::None);

    hub.grant_monitor_privilege().await.unwrap();
    assert_eq!(hub.privilege().unwrap(), Privilege::Monitor);
}

#[tokio::test]
async fn test_related_calls_grant_monitor_when_configured() {
    let h = harness_with(CallControlConfig::new().with_related_call_privilege(RelatedCallPrivilege::GrantMonitor));
    let original = h.new_call(CallState::Connected);
    let (hub, consultation) = conference(&h, &original).await;
    hub.set_privilege(Privilege::None).await.unwrap();

    original.related_conference_calls().await.unwrap();
    assert_eq!(hub.privilege().unwrap(), Privilege::Monitor);
    assert_eq!(consultation.privilege().unwrap(), Privilege::Owner, "owner privilege is kept");
    assert!(h
        .provider
        .params()
        .contains(&(hub.id(), rvoip_call_control::CallParamsUpdate::Privilege(Privilege::Monitor))));
}

#[tokio::test]
async fn test_swap_hold() {
    let h = harness();
    let active = h.new_call(CallState::Connected);
    let held = h.new_call(CallState::Connected);

    assert!(matches!(
        active.begin_swap_hold(&held).await.unwrap_err(),
        CallControlError::InvalidCallPairing { .. }
    ));

    let hold = held.begin_hold().await.unwrap();
    h.complete(hold.id());
    hold.wait().await.unwrap();

    let swap = active.begin_swap_hold(&held).await.unwrap();
    assert!(
        held.begin_unhold().await.unwrap_err().is_concurrency_violation(),
        "both calls are reserved while the swap is pending"
    );
    h.complete(swap.id());
    swap.wait().await.unwrap();

    assert_eq!(h.state(&active), CallState::OnHold);
    assert_eq!(h.state(&held), CallState::Connected);
}
