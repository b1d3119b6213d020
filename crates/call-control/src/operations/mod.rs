//! Asynchronous operations against a call
//!
//! Every long-running request is an operation with one submit/poll/await/cancel
//! contract. The blocking forms on [`Call`](crate::Call) are implemented as
//! submit-then-await on the same engine.
//!
//! ```text
//!   submit ──► admission (state + exclusivity, per-call lock)
//!                 │
//!                 ▼
//!            Pending ──► provider.issue(request)
//!                 │
//!     ┌───────────┼──────────────┐
//!     ▼           ▼              ▼
//!  completed    failed       cancelled      (exactly one wins)
//! ```

pub mod handle;
pub mod manager;

pub use handle::{CancelOutcome, OperationHandle, OperationPoll};
pub use manager::{OperationManager, OperationStats};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{CallControlError, Result};
use crate::gather::{DigitGatherParams, DigitGatherResult};
use crate::provider::ProviderOutput;
use crate::state::CallState;
use crate::tone::ToneSpec;
use crate::types::{
    CallCompletionMode, CallId, DigitMode, MakeCallParams, OperationId, ParkTarget, TransferMode,
};

use CallState::*;

/// States in which media operations (digits, tones) are accepted
pub const MEDIA_STATES: &[CallState] = &[Offering, Accepted, Proceeding, RingBack, Connected, Conferenced];

const LIVE_STATES: &[CallState] = &[
    Idle,
    Offering,
    Accepted,
    Dialtone,
    Dialing,
    Proceeding,
    RingBack,
    Busy,
    Connected,
    OnHold,
    OnHoldPendingTransfer,
    OnHoldPendingConference,
    Conferenced,
];

/// Kind of asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Accept,
    Answer,
    Dial,
    Drop,
    Hold,
    Unhold,
    SwapHold,
    SecureCall,
    BlindTransfer,
    Redirect,
    CompleteCall,
    Park,
    SetupTransfer,
    CompleteTransfer,
    SetupConference,
    PrepareAddToConference,
    AddToConference,
    RemoveFromConference,
    DeviceSpecific,
    GatherDigits,
    GenerateDigits,
    GenerateTone,
}

/// How an operation kind serialises against others on the same call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    /// At most one state-changing operation of any kind per call
    StateChange,
    /// At most one operation of this exact kind per call
    PerKind,
}

impl OperationKind {
    pub const ALL: [OperationKind; 22] = [
        OperationKind::Accept,
        OperationKind::Answer,
        OperationKind::Dial,
        OperationKind::Drop,
        OperationKind::Hold,
        OperationKind::Unhold,
        OperationKind::SwapHold,
        OperationKind::SecureCall,
        OperationKind::BlindTransfer,
        OperationKind::Redirect,
        OperationKind::CompleteCall,
        OperationKind::Park,
        OperationKind::SetupTransfer,
        OperationKind::CompleteTransfer,
        OperationKind::SetupConference,
        OperationKind::PrepareAddToConference,
        OperationKind::AddToConference,
        OperationKind::RemoveFromConference,
        OperationKind::DeviceSpecific,
        OperationKind::GatherDigits,
        OperationKind::GenerateDigits,
        OperationKind::GenerateTone,
    ];

    pub fn exclusion(&self) -> Exclusion {
        match self {
            OperationKind::SecureCall
            | OperationKind::CompleteCall
            | OperationKind::DeviceSpecific
            | OperationKind::GatherDigits
            | OperationKind::GenerateDigits
            | OperationKind::GenerateTone => Exclusion::PerKind,
            _ => Exclusion::StateChange,
        }
    }

    /// States the primary call must be in for the operation to be admitted
    pub fn required_states(&self) -> &'static [CallState] {
        match self {
            OperationKind::Accept => &[Offering],
            OperationKind::Answer => &[Offering, Accepted],
            OperationKind::Dial => &[Dialtone, Dialing, Proceeding, Connected],
            OperationKind::Drop => LIVE_STATES,
            OperationKind::Hold => &[Connected],
            OperationKind::Unhold => &[OnHold, OnHoldPendingTransfer],
            OperationKind::SwapHold => &[Connected],
            OperationKind::SecureCall => &[Offering, Accepted, Dialtone, Dialing, Proceeding, RingBack, Connected],
            OperationKind::BlindTransfer => &[Connected],
            OperationKind::Redirect => &[Offering, Accepted],
            OperationKind::CompleteCall => &[Busy, RingBack, Proceeding],
            OperationKind::Park => &[Connected],
            OperationKind::SetupTransfer => &[Connected],
            OperationKind::CompleteTransfer => &[OnHoldPendingTransfer],
            OperationKind::SetupConference => &[Connected],
            OperationKind::PrepareAddToConference => &[Connected],
            OperationKind::AddToConference => &[OnHoldPendingConference, Connected],
            OperationKind::RemoveFromConference => &[Conferenced],
            OperationKind::DeviceSpecific => LIVE_STATES,
            OperationKind::GatherDigits | OperationKind::GenerateDigits | OperationKind::GenerateTone => {
                MEDIA_STATES
            }
        }
    }

    pub fn allowed_in(&self, state: CallState) -> bool {
        self.required_states().contains(&state)
    }

    /// Resolved by the engine itself rather than by a provider completion
    pub(crate) fn resolves_locally(&self) -> bool {
        matches!(self, OperationKind::GatherDigits)
    }

    /// Whether `params` is the parameter shape this kind is issued with
    pub fn accepts(&self, params: &OperationParams) -> bool {
        use OperationParams as P;
        match self {
            OperationKind::Accept | OperationKind::Answer | OperationKind::Drop => {
                matches!(params, P::UserUserInfo(_))
            }
            OperationKind::Hold
            | OperationKind::Unhold
            | OperationKind::SecureCall
            | OperationKind::RemoveFromConference => matches!(params, P::None),
            OperationKind::Dial | OperationKind::BlindTransfer | OperationKind::Redirect => {
                matches!(params, P::Destination { .. })
            }
            OperationKind::SwapHold => matches!(params, P::SwapHold { .. }),
            OperationKind::CompleteCall => matches!(params, P::CompleteCall { .. }),
            OperationKind::Park => matches!(params, P::Park(_)),
            OperationKind::SetupTransfer => matches!(params, P::SetupTransfer(_)),
            OperationKind::CompleteTransfer => matches!(params, P::CompleteTransfer { .. }),
            OperationKind::SetupConference => matches!(params, P::SetupConference { .. }),
            OperationKind::PrepareAddToConference => matches!(params, P::PrepareAddToConference(_)),
            OperationKind::AddToConference => matches!(params, P::AddToConference { .. }),
            OperationKind::DeviceSpecific => matches!(params, P::DeviceSpecific(_)),
            OperationKind::GatherDigits => matches!(params, P::GatherDigits(_)),
            OperationKind::GenerateDigits => matches!(params, P::GenerateDigits { .. }),
            OperationKind::GenerateTone => matches!(params, P::GenerateTone { .. }),
        }
    }
}

/// A request submitted to the operation manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Primary call the operation acts on
    pub call: CallId,
    pub kind: OperationKind,
    pub params: OperationParams,
}

impl OperationRequest {
    pub fn new(call: CallId, kind: OperationKind, params: OperationParams) -> Self {
        Self { call, kind, params }
    }

    /// Second call touched by a cross-call operation
    pub fn related_call(&self) -> Option<CallId> {
        match &self.params {
            OperationParams::SwapHold { other } => Some(*other),
            OperationParams::CompleteTransfer { consultation, .. } => Some(*consultation),
            OperationParams::AddToConference { call } => Some(*call),
            _ => None,
        }
    }
}

/// Kind-specific request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationParams {
    None,
    /// Optional user-user information for accept, answer and drop
    UserUserInfo(Option<Bytes>),
    /// Dial, blind transfer and redirect destination
    Destination { address: String, country_code: u32 },
    CompleteCall { mode: CallCompletionMode, message_id: u32 },
    Park(ParkTarget),
    SwapHold { other: CallId },
    SetupTransfer(MakeCallParams),
    CompleteTransfer { consultation: CallId, mode: TransferMode },
    SetupConference { party_count: u32, params: MakeCallParams },
    PrepareAddToConference(MakeCallParams),
    AddToConference { call: CallId },
    DeviceSpecific(Bytes),
    GatherDigits(DigitGatherParams),
    GenerateDigits { mode: DigitMode, digits: String, duration_ms: u32 },
    GenerateTone { tone: ToneSpec, duration_ms: u32 },
}

/// Calls created by the engine on behalf of an operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedCalls {
    pub consultation: Option<CallId>,
    pub conference: Option<CallId>,
}

impl LinkedCalls {
    pub fn is_empty(&self) -> bool {
        self.consultation.is_none() && self.conference.is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = CallId> {
        self.consultation.into_iter().chain(self.conference)
    }
}

/// Conference call and the consultation call created alongside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceSetup {
    pub conference: CallId,
    pub consultation: CallId,
}

/// Success payload of a resolved operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationOutput {
    Unit,
    Bytes(Bytes),
    Flag(bool),
    Digits(DigitGatherResult),
    ParkedAt(Option<String>),
    CompletionId(u32),
    Call(CallId),
    Conference(ConferenceSetup),
}

impl OperationOutput {
    /// Build the success payload from a provider completion
    pub(crate) fn from_provider(
        id: OperationId,
        kind: OperationKind,
        params: &OperationParams,
        linked: &LinkedCalls,
        output: ProviderOutput,
    ) -> Result<Self> {
        let missing_link = || CallControlError::internal(format!("{} has no linked call", id));
        let output = match kind {
            OperationKind::DeviceSpecific => match output {
                ProviderOutput::Bytes(bytes) => OperationOutput::Bytes(bytes),
                ProviderOutput::None => OperationOutput::Bytes(Bytes::new()),
                other => return Err(unexpected(id, kind, &other)),
            },
            OperationKind::GenerateDigits | OperationKind::GenerateTone => match output {
                ProviderOutput::Flag(flag) => OperationOutput::Flag(flag),
                ProviderOutput::None => OperationOutput::Flag(true),
                other => return Err(unexpected(id, kind, &other)),
            },
            OperationKind::CompleteCall => match output {
                ProviderOutput::CompletionId(completion) => OperationOutput::CompletionId(completion),
                other => return Err(unexpected(id, kind, &other)),
            },
            OperationKind::Park => match output {
                ProviderOutput::Address(address) => OperationOutput::ParkedAt(Some(address)),
                ProviderOutput::None => OperationOutput::ParkedAt(None),
                other => return Err(unexpected(id, kind, &other)),
            },
            OperationKind::SetupTransfer | OperationKind::PrepareAddToConference => {
                OperationOutput::Call(linked.consultation.ok_or_else(missing_link)?)
            }
            OperationKind::SetupConference => OperationOutput::Conference(ConferenceSetup {
                conference: linked.conference.ok_or_else(missing_link)?,
                consultation: linked.consultation.ok_or_else(missing_link)?,
            }),
            OperationKind::CompleteTransfer => match params {
                OperationParams::CompleteTransfer {
                    mode: TransferMode::Conference,
                    ..
                } => OperationOutput::Call(linked.conference.ok_or_else(missing_link)?),
                _ => OperationOutput::Unit,
            },
            _ => OperationOutput::Unit,
        };
        Ok(output)
    }
}

fn unexpected(id: OperationId, kind: OperationKind, output: &ProviderOutput) -> CallControlError {
    CallControlError::ProtocolMismatch {
        detail: format!("{} ({:?}) completed with unexpected payload {:?}", id, kind, output),
    }
}

fn wrong_output(expected: &str, got: &OperationOutput) -> CallControlError {
    CallControlError::internal(format!("expected {} output, got {:?}", expected, got))
}

impl TryFrom<OperationOutput> for () {
    type Error = CallControlError;

    fn try_from(output: OperationOutput) -> Result<Self> {
        match output {
            OperationOutput::Unit => Ok(()),
            other => Err(wrong_output("unit", &other)),
        }
    }
}

impl TryFrom<OperationOutput> for Bytes {
    type Error = CallControlError;

    fn try_from(output: OperationOutput) -> Result<Self> {
        match output {
            OperationOutput::Bytes(bytes) => Ok(bytes),
            other => Err(wrong_output("bytes", &other)),
        }
    }
}

impl TryFrom<OperationOutput> for bool {
    type Error = CallControlError;

    fn try_from(output: OperationOutput) -> Result<Self> {
        match output {
            OperationOutput::Flag(flag) => Ok(flag),
            other => Err(wrong_output("flag", &other)),
        }
    }
}

impl TryFrom<OperationOutput> for DigitGatherResult {
    type Error = CallControlError;

    fn try_from(output: OperationOutput) -> Result<Self> {
        match output {
            OperationOutput::Digits(result) => Ok(result),
            other => Err(wrong_output("digits", &other)),
        }
    }
}

impl TryFrom<OperationOutput> for Option<String> {
    type Error = CallControlError;

    fn try_from(output: OperationOutput) -> Result<Self> {
        match output {
            OperationOutput::ParkedAt(address) => Ok(address),
            other => Err(wrong_output("park address", &other)),
        }
    }
}

impl TryFrom<OperationOutput> for u32 {
    type Error = CallControlError;

    fn try_from(output: OperationOutput) -> Result<Self> {
        match output {
            OperationOutput::CompletionId(id) => Ok(id),
            other => Err(wrong_output("completion id", &other)),
        }
    }
}

impl TryFrom<OperationOutput> for CallId {
    type Error = CallControlError;

    fn try_from(output: OperationOutput) -> Result<Self> {
        match output {
            OperationOutput::Call(call) => Ok(call),
            other => Err(wrong_output("call", &other)),
        }
    }
}

impl TryFrom<OperationOutput> for ConferenceSetup {
    type Error = CallControlError;

    fn try_from(output: OperationOutput) -> Result<Self> {
        match output {
            OperationOutput::Conference(setup) => Ok(setup),
            other => Err(wrong_output("conference", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_changing_kinds_share_one_slot() {
        for kind in [
            OperationKind::Hold,
            OperationKind::Unhold,
            OperationKind::SwapHold,
            OperationKind::Drop,
            OperationKind::BlindTransfer,
            OperationKind::CompleteTransfer,
            OperationKind::AddToConference,
            OperationKind::RemoveFromConference,
        ] {
            assert_eq!(kind.exclusion(), Exclusion::StateChange, "{:?}", kind);
        }
        for kind in [
            OperationKind::GatherDigits,
            OperationKind::GenerateTone,
            OperationKind::GenerateDigits,
            OperationKind::DeviceSpecific,
        ] {
            assert_eq!(kind.exclusion(), Exclusion::PerKind, "{:?}", kind);
        }
    }

    #[test]
    fn test_nothing_is_allowed_when_disconnected() {
        for kind in OperationKind::ALL {
            assert!(!kind.allowed_in(CallState::Disconnected), "{:?}", kind);
        }
    }

    #[test]
    fn test_params_must_match_kind() {
        let gather = OperationParams::GatherDigits(DigitGatherParams::new(4));
        assert!(OperationKind::GatherDigits.accepts(&gather));
        assert!(!OperationKind::GatherDigits.accepts(&OperationParams::None));
        assert!(!OperationKind::Hold.accepts(&gather));
        assert!(OperationKind::Hold.accepts(&OperationParams::None));
        assert!(!OperationKind::SwapHold.accepts(&OperationParams::None));
    }

    #[test]
    fn test_blind_transfer_only_from_connected() {
        assert_eq!(OperationKind::BlindTransfer.required_states(), &[CallState::Connected]);
        assert!(OperationKind::Answer.allowed_in(CallState::Offering));
        assert!(!OperationKind::Hold.allowed_in(CallState::OnHold));
    }

    #[test]
    fn test_provider_output_mapping() {
        let linked = LinkedCalls {
            consultation: Some(CallId(9)),
            conference: None,
        };
        let out = OperationOutput::from_provider(
            OperationId(1),
            OperationKind::SetupTransfer,
            &OperationParams::SetupTransfer(MakeCallParams::new()),
            &linked,
            ProviderOutput::None,
        )
        .unwrap();
        assert_eq!(out, OperationOutput::Call(CallId(9)));

        let err = OperationOutput::from_provider(
            OperationId(2),
            OperationKind::CompleteCall,
            &OperationParams::None,
            &LinkedCalls::default(),
            ProviderOutput::None,
        )
        .unwrap_err();
        assert_eq!(err.category(), crate::errors::ErrorCategory::ProtocolMismatch);
    }
}
