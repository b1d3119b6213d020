//! # RVoIP Call Control
//!
//! Call-scoped asynchronous operation engine for line-controlled telephony.
//!
//! The engine sits between an application and a telephony provider. It owns
//! the lifecycle state of every call, admits or rejects operations against
//! that state, correlates each request with the provider's eventual
//! completion, and exposes the result through a cancellable handle.
//!
//! ## Features
//!
//! - **Call registry**: closed state set with a validated transition table
//! - **Operations**: one submit/poll/await/cancel contract for every
//!   long-running action, with per-call exclusivity
//! - **Digit gathering**: bounded collection with first-digit and
//!   inter-digit timers
//! - **Monitoring**: open-ended digit and tone detection subscriptions
//! - **Transfer and conference**: consultation calls, blind transfer,
//!   N-party conferences
//! - **Device bridge**: opaque device-specific payloads and scoped data streams
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rvoip_call_control::{CallControl, CallControlConfig, ProviderBoundary};
//!
//! # async fn example(provider: Arc<dyn ProviderBoundary>) -> rvoip_call_control::Result<()> {
//! let control = CallControl::new(CallControlConfig::default(), provider)?;
//! let _feed = control.event_feed(); // hand this to the provider
//!
//! for call in control.calls() {
//!     if call.state()? == rvoip_call_control::CallState::Offering {
//!         call.answer(None).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod conference;
pub mod config;
pub mod control;
pub mod device;
pub mod errors;
pub mod events;
pub mod gather;
pub mod logging;
pub mod monitor;
pub mod operations;
pub mod provider;
pub mod registry;
pub mod state;
pub mod tone;
pub mod transfer;
pub mod types;

pub use call::Call;
pub use conference::ConferenceCoordinator;
pub use config::{CallControlConfig, ConferenceConfig, GatherDefaults, RelatedCallPrivilege};
pub use control::CallControl;
pub use device::{CommStream, DeviceBridge, DeviceClass};
pub use errors::{CallControlError, ErrorCategory, ProviderFailure, Result};
pub use events::{CallEvent, OperationOutcome};
pub use gather::{DigitGatherParams, DigitGatherResult, DigitGatherer, GatherReason, GatherState};
pub use logging::{setup_logging, LoggingConfig};
pub use monitor::{DigitDetected, DigitMonitor, Subscription, ToneDetected, ToneMonitor};
pub use operations::{
    CancelOutcome, ConferenceSetup, OperationHandle, OperationKind, OperationManager, OperationOutput,
    OperationParams, OperationPoll, OperationRequest, OperationStats,
};
pub use provider::{
    CallInfoUpdate, CallKey, CommPort, MonitoringSet, ProviderBoundary, ProviderEvent, ProviderOutput,
    ProviderRequest,
};
pub use registry::{CallInfo, CallRegistry};
pub use state::{CallState, TransitionCause, TransitionError};
pub use tone::{CustomTone, MonitorTone, ToneMode, ToneSpec};
pub use transfer::TransferCoordinator;
pub use types::*;
