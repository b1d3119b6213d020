//! Digit Gather Tests
//!
//! Bounded digit collection driven by provider digit events and the
//! first-digit / inter-digit timers. Time is paused so timer expiry is exact.

mod common;

use std::time::Duration;

use common::{harness, harness_with, Harness};
use rvoip_call_control::{
    Call, CallControlConfig, CallControlError, CallState, CancelOutcome, DigitGatherParams, DigitGatherResult,
    DigitMode, ErrorCategory, GatherDefaults, GatherReason, OperationKind, OperationParams, OperationRequest,
    ProviderEvent, ProviderFailure,
};

fn params() -> DigitGatherParams {
    DigitGatherParams::new(4)
        .with_terminators("#")
        .with_first_digit_timeout(Duration::from_millis(500))
        .with_inter_digit_timeout(Duration::from_millis(300))
}

fn press(h: &Harness, call: &Call, digits: &str) {
    for digit in digits.chars() {
        h.control.handle_event(ProviderEvent::DigitDetected {
            call: call.id().into(),
            digit,
            mode: DigitMode::Dtmf,
        });
    }
}

#[tokio::test(start_paused = true)]
async fn test_gather_ends_at_max_digits() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    let handle = call.begin_gather_digits(params()).await.unwrap();
    assert_eq!(h.provider.last_request().kind, OperationKind::GatherDigits);

    press(&h, &call, "1234");
    let result = handle.wait().await.unwrap();
    assert_eq!(result.digits, "1234");
    assert_eq!(result.reason, GatherReason::MaxDigits);
    assert!(result.ensure_complete().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_terminator_ends_gather_and_is_kept() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    let handle = call.begin_gather_digits(params()).await.unwrap();
    press(&h, &call, "12#");

    let result = handle.wait().await.unwrap();
    assert_eq!(result.digits, "12#");
    assert_eq!(result.reason, GatherReason::TerminatorDigit);
}

#[tokio::test(start_paused = true)]
async fn test_first_digit_timeout() {
    let h = harness();
    let call = h.new_call(CallState::Connected);
    let started = tokio::time::Instant::now();

    let handle = call.begin_gather_digits(params()).await.unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.reason, GatherReason::FirstTimeout);
    assert_eq!(result.digits, "");
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(
        result.ensure_complete().unwrap_err().category(),
        ErrorCategory::Timeout
    );
}

#[tokio::test(start_paused = true)]
async fn test_inter_digit_timeout_restarts_on_each_digit() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    let handle = call.begin_gather_digits(params()).await.unwrap();
    press(&h, &call, "1");
    tokio::time::sleep(Duration::from_millis(200)).await;
    press(&h, &call, "2");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_resolved(), "each digit restarts the inter-digit timer");

    let result = handle.wait().await.unwrap();
    assert_eq!(result.digits, "12");
    assert_eq!(result.reason, GatherReason::InterDigitTimeout);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_keeps_collected_digits() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    let handle = call.begin_gather_digits(params()).await.unwrap();
    press(&h, &call, "9");

    assert_eq!(handle.cancel().await, CancelOutcome::Cancelled);
    assert_eq!(h.provider.aborts(), vec![handle.id()]);

    let result = handle.wait().await.unwrap();
    assert_eq!(result.digits, "9");
    assert_eq!(result.reason, GatherReason::Cancelled);
    assert_eq!(h.control.stats().cancelled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_by_kind() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    assert_eq!(call.cancel_gather_digits().await.unwrap(), CancelOutcome::AlreadyResolved);

    let handle = call.begin_gather_digits(params()).await.unwrap();
    assert_eq!(call.cancel_gather_digits().await.unwrap(), CancelOutcome::Cancelled);
    assert_eq!(handle.wait().await.unwrap().reason, GatherReason::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_one_gather_per_call() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    let _first = call.begin_gather_digits(params()).await.unwrap();
    let err = call.begin_gather_digits(params()).await.unwrap_err();
    assert!(err.is_concurrency_violation());

    // a gather does not block state changes
    assert!(call.begin_hold().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_gather() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    let handle = call.begin_gather_digits(params()).await.unwrap();
    press(&h, &call, "4");
    h.report_state(&call, CallState::Disconnected);

    let result = handle.wait().await.unwrap();
    assert_eq!(result.reason, GatherReason::Cancelled);
    assert_eq!(result.digits, "4");
}

#[tokio::test(start_paused = true)]
async fn test_provider_ack_does_not_resolve_gather() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    let handle = call.begin_gather_digits(params()).await.unwrap();
    h.complete(handle.id());
    assert!(!handle.is_resolved());

    press(&h, &call, "5#");
    assert_eq!(handle.wait().await.unwrap().digits, "5#");
}

#[tokio::test(start_paused = true)]
async fn test_provider_failure_ends_gather() {
    let h = harness();
    let call = h.new_call(CallState::Connected);

    let handle = call.begin_gather_digits(params()).await.unwrap();
    h.fail(handle.id(), ProviderFailure::ResourceBusy);
    match handle.wait().await {
        Err(CallControlError::ProviderRejected(ProviderFailure::ResourceBusy)) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }

    h.provider.reject_next(ProviderFailure::Denied);
    let rejected = call.begin_gather_digits(params()).await.unwrap();
    assert_eq!(rejected.wait().await.unwrap_err().category(), ErrorCategory::ProviderRejected);
}

#[tokio::test(start_paused = true)]
async fn test_gather_requires_media_state_and_valid_params() {
    let h = harness();
    let dialtone = h.new_call(CallState::Dialtone);
    assert!(dialtone.begin_gather_digits(params()).await.unwrap_err().is_state_violation());

    let call = h.new_call(CallState::Connected);
    let unbounded = DigitGatherParams::new(0)
        .with_first_digit_timeout(Duration::ZERO)
        .with_inter_digit_timeout(Duration::ZERO);
    let err = call.begin_gather_digits(unbounded).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Misuse);

    let pulse_with_hash = params().with_modes([DigitMode::Pulse]);
    assert!(call.begin_gather_digits(pulse_with_hash).await.is_err());
    assert_eq!(h.provider.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_gather_with_configured_defaults() {
    let defaults = GatherDefaults {
        first_digit_timeout_ms: 200,
        inter_digit_timeout_ms: 100,
        terminators: "*".to_string(),
    };
    let h = harness_with(CallControlConfig::new().with_gather_defaults(defaults));
    let call = h.new_call(CallState::Connected);

    let params = call.default_gather_params(6);
    assert_eq!(params.first_digit_timeout, Duration::from_millis(200));
    assert_eq!(params.terminators, "*");

    let handle = call.begin_gather_digits_with_defaults(6).await.unwrap();
    press(&h, &call, "12*");
    let result = handle.wait().await.unwrap();
    assert_eq!(result.digits, "12*");
    assert_eq!(result.reason, GatherReason::TerminatorDigit);

    let started = tokio::time::Instant::now();
    let result = call.begin_gather_digits_with_defaults(6).await.unwrap().wait().await.unwrap();
    assert_eq!(result.reason, GatherReason::FirstTimeout);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_gather_kind_requires_gather_params() {
    let h = harness();
    let call = h.new_call(CallState::Connected);
    let operations = h.control.operations();

    let err = operations
        .submit::<DigitGatherResult>(OperationRequest::new(
            call.id(),
            OperationKind::GatherDigits,
            OperationParams::None,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Misuse);

    let err = operations
        .submit::<()>(OperationRequest::new(
            call.id(),
            OperationKind::Hold,
            OperationParams::GatherDigits(params()),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Misuse);

    assert_eq!(h.provider.request_count(), 0);
    assert_eq!(h.control.stats().pending, 0);
    assert!(call.begin_gather_digits(params()).await.is_ok(), "nothing left reserved");
}
