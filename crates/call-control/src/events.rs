//! Events published to applications through [`CallControl::subscribe`](crate::CallControl::subscribe)

use crate::errors::ErrorCategory;
use crate::operations::OperationKind;
use crate::state::{CallState, TransitionCause};
use crate::types::{AddressId, CallId, OperationId};

/// How an operation was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Succeeded,
    Failed(ErrorCategory),
    Cancelled,
}

/// Call control event
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// A call appeared, reported by the provider or created by an operation
    NewCall {
        call: CallId,
        address: AddressId,
        state: CallState,
    },

    StateChanged {
        call: CallId,
        from: CallState,
        to: CallState,
        cause: TransitionCause,
    },

    /// Attributes of the call changed; read them with `Call::info`
    InfoChanged { call: CallId },

    OperationCompleted {
        call: CallId,
        operation: OperationId,
        kind: OperationKind,
        outcome: OperationOutcome,
    },

    /// The call left the registry; its id will never be handed out again
    Disposed { call: CallId },
}

impl CallEvent {
    pub fn call_id(&self) -> CallId {
        match self {
            CallEvent::NewCall { call, .. }
            | CallEvent::StateChanged { call, .. }
            | CallEvent::InfoChanged { call }
            | CallEvent::OperationCompleted { call, .. }
            | CallEvent::Disposed { call } => *call,
        }
    }
}
