//! The provider boundary
//!
//! The engine never performs telephony itself. Outbound requests go through
//! [`ProviderBoundary`]; everything the provider observes comes back as
//! [`ProviderEvent`]s fed to [`CallControl::handle_event`](crate::CallControl::handle_event).
//!
//! Every request accepted by [`ProviderBoundary::issue`] must eventually be
//! answered by an [`ProviderEvent::OperationCompleted`] carrying the same
//! correlation id. An operation whose completion never arrives stays pending.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::device::DeviceClass;
use crate::errors::ProviderFailure;
use crate::operations::{LinkedCalls, OperationKind, OperationParams};
use crate::state::CallState;
use crate::tone::MonitorTone;
use crate::types::{
    AddressId, BearerMode, CallId, CallOrigin, CallParamsUpdate, CallReason, DigitMode, DigitModes,
    MediaMode, OperationId, PartyInfo, Privilege, ProviderCallId,
};

/// An outbound operation request
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    /// Echo this back in the completion event
    pub correlation: OperationId,
    pub call: CallId,
    pub provider_call: Option<ProviderCallId>,
    pub kind: OperationKind,
    pub params: OperationParams,
    /// Calls the engine created for this request
    pub linked: LinkedCalls,
}

/// Payload of a successful provider completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutput {
    None,
    Bytes(Bytes),
    Flag(bool),
    Address(String),
    CompletionId(u32),
}

/// How an inbound event names its call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKey {
    Local(CallId),
    Provider(ProviderCallId),
}

impl From<CallId> for CallKey {
    fn from(id: CallId) -> Self {
        CallKey::Local(id)
    }
}

impl From<ProviderCallId> for CallKey {
    fn from(id: ProviderCallId) -> Self {
        CallKey::Provider(id)
    }
}

/// Attributes reported by the provider; `None` fields are unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallInfoUpdate {
    pub provider_id: Option<ProviderCallId>,
    pub bearer_mode: Option<BearerMode>,
    pub media_mode: Option<MediaMode>,
    pub origin: Option<CallOrigin>,
    pub reason: Option<CallReason>,
    pub data_rate: Option<u32>,
    pub caller: Option<PartyInfo>,
    pub called: Option<PartyInfo>,
    pub connected: Option<PartyInfo>,
    pub redirecting: Option<PartyInfo>,
    pub redirection: Option<PartyInfo>,
    pub trunk_id: Option<u32>,
    pub related_id: Option<u32>,
    pub call_data: Option<Bytes>,
    pub user_user_info: Option<Bytes>,
    pub device_specific_data: Option<Bytes>,
    /// Operations the provider can perform on this call
    pub capabilities: Option<BTreeSet<OperationKind>>,
}

/// Inbound provider event
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    NewCall {
        provider_id: Option<ProviderCallId>,
        address: AddressId,
        state: CallState,
        origin: CallOrigin,
        reason: CallReason,
        privilege: Privilege,
        media_mode: MediaMode,
    },
    StateChanged {
        call: CallKey,
        state: CallState,
    },
    InfoChanged {
        call: CallKey,
        update: CallInfoUpdate,
    },
    OperationCompleted {
        correlation: OperationId,
        result: Result<ProviderOutput, ProviderFailure>,
    },
    DigitDetected {
        call: CallKey,
        digit: char,
        mode: DigitMode,
    },
    ToneDetected {
        call: CallKey,
        /// Id of the matching [`MonitorTone`]
        tone_id: u32,
    },
    /// The provider released the call
    CallClosed {
        call: CallKey,
    },
}

/// Union of everything monitored on one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitoringSet {
    pub digit_modes: DigitModes,
    pub tones: Vec<MonitorTone>,
}

impl MonitoringSet {
    pub fn is_empty(&self) -> bool {
        self.digit_modes.is_empty() && self.tones.is_empty()
    }
}

/// Raw byte channel of a data call
pub trait CommPort: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> CommPort for T {}

/// Commands the engine sends to the telephony provider
#[async_trait]
pub trait ProviderBoundary: Send + Sync + 'static {
    /// Start an operation. `Ok` means accepted; the outcome arrives later as
    /// an `OperationCompleted` event.
    async fn issue(&self, request: ProviderRequest) -> Result<(), ProviderFailure>;

    /// Best-effort abort of a cancelled operation
    async fn abort(&self, _correlation: OperationId, _call: CallId) {}

    /// Change a provider-held call parameter
    async fn set_call_params(&self, call: CallId, update: &CallParamsUpdate) -> Result<(), ProviderFailure>;

    /// Replace the digit modes and tones monitored on a call
    async fn set_monitoring(&self, _call: CallId, _set: &MonitoringSet) -> Result<(), ProviderFailure> {
        Ok(())
    }

    async fn send_user_user_info(&self, _call: CallId, _info: Bytes) -> Result<(), ProviderFailure> {
        Err(ProviderFailure::Unsupported)
    }

    async fn device_id(&self, _call: CallId, _class: &DeviceClass) -> Result<u32, ProviderFailure> {
        Err(ProviderFailure::Unsupported)
    }

    async fn comm_device_name(&self, _call: CallId) -> Result<String, ProviderFailure> {
        Err(ProviderFailure::Unsupported)
    }

    async fn open_comm_port(&self, _call: CallId) -> Result<Box<dyn CommPort>, ProviderFailure> {
        Err(ProviderFailure::Unsupported)
    }

    /// Called exactly once for each port handed out by `open_comm_port`
    fn release_comm_port(&self, _call: CallId) {}
}
