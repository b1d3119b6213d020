//! Error types for the call control engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gather::GatherReason;
use crate::operations::OperationKind;
use crate::state::CallState;
use crate::types::{CallId, OperationId};

/// Result type for call control operations
pub type Result<T> = std::result::Result<T, CallControlError>;

/// Failure reported by the provider boundary
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProviderFailure {
    #[error("request denied by provider")]
    Denied,

    #[error("provider resource busy")]
    ResourceBusy,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("operation not supported by provider")]
    Unsupported,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider error {code}: {message}")]
    Other { code: u32, message: String },
}

/// Coarse classification of [`CallControlError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Operation illegal in the call's current state, or the call is gone
    StateViolation,
    /// A mutually exclusive operation is already pending on the call
    ConcurrencyViolation,
    /// The provider declined or failed the request
    ProviderRejected,
    /// A digit gather timer expired
    Timeout,
    /// The caller cancelled the operation
    Cancelled,
    /// An event did not match any outstanding operation or call
    ProtocolMismatch,
    /// The API was used incorrectly
    Misuse,
}

/// Errors that can occur in the call control engine
#[derive(Debug, Clone, Error)]
pub enum CallControlError {
    /// Operation precondition not met
    #[error("{operation:?} on {call_id} requires state {required:?}, but the call is {actual}")]
    InvalidStateForOperation {
        call_id: CallId,
        operation: OperationKind,
        required: Vec<CallState>,
        actual: CallState,
    },

    /// Monitoring requested outside the media states
    #[error("monitoring on {call_id} requires a media state, but the call is {actual}")]
    InvalidStateForMonitoring { call_id: CallId, actual: CallState },

    /// Pair precondition not met for a cross-call operation
    #[error("{operation:?} rejected: {reason}")]
    InvalidCallPairing {
        operation: OperationKind,
        reason: String,
    },

    /// Rejected state transition
    #[error("call {call_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        call_id: CallId,
        from: CallState,
        to: CallState,
    },

    /// The call has been disposed
    #[error("call {0} has been disposed")]
    CallDisposed(CallId),

    /// No such call
    #[error("call not found: {0}")]
    CallNotFound(String),

    /// A conflicting operation is pending
    #[error("{requested:?} rejected on {call_id}: {pending_kind:?} ({pending}) is still pending")]
    ConcurrencyViolation {
        call_id: CallId,
        requested: OperationKind,
        pending: OperationId,
        pending_kind: OperationKind,
    },

    /// Provider failure
    #[error("provider rejected the request: {0}")]
    ProviderRejected(#[from] ProviderFailure),

    /// Digit gather ended on a timer
    #[error("digit gather timed out ({reason:?}) after collecting {digits:?}")]
    Timeout { reason: GatherReason, digits: String },

    /// Cancelled before resolution
    #[error("operation {operation} was cancelled")]
    Cancelled { operation: OperationId },

    /// Unmatched or unexpected provider event
    #[error("protocol mismatch: {detail}")]
    ProtocolMismatch { detail: String },

    /// The operation result was already retrieved
    #[error("result of operation {0} was already taken")]
    ResultAlreadyTaken(OperationId),

    /// Invalid caller-supplied parameter
    #[error("invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// The requested device or channel is not available on this call
    #[error("device unavailable: {message}")]
    DeviceUnavailable { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CallControlError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create a pairing error for a cross-call operation
    pub fn pairing(operation: OperationKind, reason: impl Into<String>) -> Self {
        Self::InvalidCallPairing {
            operation,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a device unavailable error
    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map onto the error taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidStateForOperation { .. }
            | Self::InvalidStateForMonitoring { .. }
            | Self::InvalidCallPairing { .. }
            | Self::InvalidTransition { .. }
            | Self::CallDisposed(_) => ErrorCategory::StateViolation,
            Self::ConcurrencyViolation { .. } => ErrorCategory::ConcurrencyViolation,
            Self::ProviderRejected(_) => ErrorCategory::ProviderRejected,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::ProtocolMismatch { .. } => ErrorCategory::ProtocolMismatch,
            Self::CallNotFound(_)
            | Self::ResultAlreadyTaken(_)
            | Self::InvalidParameter { .. }
            | Self::DeviceUnavailable { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => ErrorCategory::Misuse,
        }
    }

    pub fn is_state_violation(&self) -> bool {
        self.category() == ErrorCategory::StateViolation
    }

    pub fn is_concurrency_violation(&self) -> bool {
        self.category() == ErrorCategory::ConcurrencyViolation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = CallControlError::InvalidStateForOperation {
            call_id: CallId(1),
            operation: OperationKind::Answer,
            required: vec![CallState::Offering],
            actual: CallState::Connected,
        };
        assert!(err.is_state_violation());
        assert_eq!(
            err.to_string(),
            "Answer on call-1 requires state [Offering], but the call is connected"
        );

        assert!(CallControlError::CallDisposed(CallId(4)).is_state_violation());
        assert_eq!(
            CallControlError::from(ProviderFailure::ResourceBusy).category(),
            ErrorCategory::ProviderRejected
        );
        assert_eq!(
            CallControlError::ResultAlreadyTaken(OperationId(2)).category(),
            ErrorCategory::Misuse
        );
    }
}
