//! Call lifecycle states and the transition table
//!
//! The state set is closed and ordered. Every transition the registry applies,
//! whether reported by the provider or caused by a completed operation, is
//! checked against [`CallState::legal_successors`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Created but not yet offered or dialed
    Idle,
    /// Inbound call being offered
    Offering,
    /// Offered call accepted, not yet answered
    Accepted,
    /// Dialtone present, ready for dialing
    Dialtone,
    /// Destination digits are being dialed
    Dialing,
    /// Dialing complete, call is proceeding through the network
    Proceeding,
    /// Remote station is ringing
    RingBack,
    /// Remote station is busy
    Busy,
    /// Call is established
    Connected,
    /// Call is held
    OnHold,
    /// Held while a consultation call is set up for transfer
    OnHoldPendingTransfer,
    /// Conference call held while a party is being added
    OnHoldPendingConference,
    /// Call is a member of a conference
    Conferenced,
    /// Call has ended; terminal
    Disconnected,
}

impl CallState {
    /// Every state, in declaration order
    pub const ALL: [CallState; 14] = [
        CallState::Idle,
        CallState::Offering,
        CallState::Accepted,
        CallState::Dialtone,
        CallState::Dialing,
        CallState::Proceeding,
        CallState::RingBack,
        CallState::Busy,
        CallState::Connected,
        CallState::OnHold,
        CallState::OnHoldPendingTransfer,
        CallState::OnHoldPendingConference,
        CallState::Conferenced,
        CallState::Disconnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Offering => "offering",
            CallState::Accepted => "accepted",
            CallState::Dialtone => "dialtone",
            CallState::Dialing => "dialing",
            CallState::Proceeding => "proceeding",
            CallState::RingBack => "ringback",
            CallState::Busy => "busy",
            CallState::Connected => "connected",
            CallState::OnHold => "on_hold",
            CallState::OnHoldPendingTransfer => "on_hold_pending_transfer",
            CallState::OnHoldPendingConference => "on_hold_pending_conference",
            CallState::Conferenced => "conferenced",
            CallState::Disconnected => "disconnected",
        }
    }

    /// Disconnected has no way out
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Disconnected)
    }

    pub fn is_on_hold(&self) -> bool {
        matches!(
            self,
            CallState::OnHold | CallState::OnHoldPendingTransfer | CallState::OnHoldPendingConference
        )
    }

    /// States reachable from this one in a single transition
    pub fn legal_successors(&self) -> &'static [CallState] {
        use CallState::*;
        match self {
            Idle => &[
                Offering,
                Accepted,
                Dialtone,
                Dialing,
                Proceeding,
                RingBack,
                Connected,
                OnHoldPendingConference,
                Disconnected,
            ],
            Offering => &[Accepted, Connected, Disconnected],
            Accepted => &[Connected, Disconnected],
            Dialtone => &[Dialing, Proceeding, RingBack, Busy, Connected, Disconnected],
            Dialing => &[Proceeding, RingBack, Busy, Connected, Disconnected],
            Proceeding => &[RingBack, Busy, Connected, Conferenced, Disconnected],
            RingBack => &[Busy, Connected, Conferenced, Disconnected],
            Busy => &[Disconnected],
            Connected => &[
                OnHold,
                OnHoldPendingTransfer,
                OnHoldPendingConference,
                Conferenced,
                Disconnected,
            ],
            OnHold => &[Connected, OnHoldPendingTransfer, Conferenced, Disconnected],
            OnHoldPendingTransfer => &[Connected, OnHold, Conferenced, Disconnected],
            OnHoldPendingConference => &[Connected, Disconnected],
            Conferenced => &[Connected, OnHold, Disconnected],
            Disconnected => &[],
        }
    }

    /// Whether moving to `next` is allowed.
    ///
    /// Re-reporting the current state is accepted as a no-op for every state
    /// except Disconnected.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self == next || self.legal_successors().contains(&next)
    }

    /// Validate a transition and return the resulting state
    pub fn transition(&self, next: CallState) -> Result<CallState, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: *self, to: next })
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal call state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: CallState,
    pub to: CallState,
}

/// What drove a transition; only used for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// Reported by the provider event feed
    Provider,
    /// Applied when a local operation completed successfully
    Operation(crate::operations::OperationKind),
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionCause::Provider => f.write_str("provider"),
            TransitionCause::Operation(kind) => write!(f, "{:?}", kind),
        }
    }
}
