//! Core types for rvoip-call-control
//!
//! Identifiers, call attribute enums and the parameter structures shared by
//! the operation engines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Process-local call identifier.
///
/// Allocated by the call registry from a monotonic counter, so ids are never
/// reused and their ordering is the global lock order for cross-call work.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CallId(pub(crate) u64);

impl CallId {
    /// Get the raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Identifier assigned to a call by the provider, when known.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProviderCallId(pub u32);

impl fmt::Display for ProviderCallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider-{}", self.0)
    }
}

/// The line endpoint a call belongs to.
///
/// Calls keep this as a lookup key only; addresses are owned by the line
/// layer outside this crate.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct AddressId {
    pub line: u32,
    pub address: u32,
}

impl AddressId {
    pub fn new(line: u32, address: u32) -> Self {
        Self { line, address }
    }
}

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line-{}/{}", self.line, self.address)
    }
}

/// Operation identifier, also used as the correlation id towards the provider.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OperationId(pub(crate) u64);

impl OperationId {
    /// Build an operation id from a raw value (as echoed back by a provider)
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Identifier of a digit or tone monitoring subscription
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Bearer mode of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BearerMode {
    Voice,
    Speech,
    MultiUse,
    Data,
    AltSpeechData,
    NonCallSignaling,
    PassThrough,
    RestrictedData,
}

/// Media mode of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaMode {
    Unknown,
    InteractiveVoice,
    AutomatedVoice,
    DataModem,
    G3Fax,
    G4Fax,
    Tdd,
    DigitalData,
    Teletex,
    Videotex,
    Telex,
    Mixed,
    Adsi,
    VoiceView,
    Video,
}

impl MediaMode {
    /// Whether the call's raw I/O channel can be exposed as a byte stream
    pub fn is_stream_capable(&self) -> bool {
        matches!(self, MediaMode::DataModem)
    }
}

/// Privilege the application holds on a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Privilege {
    None,
    Monitor,
    Owner,
}

/// Where the call originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallOrigin {
    Unknown,
    Outbound,
    Inbound,
    Internal,
    External,
    Conference,
}

/// Why the call is present on the address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallReason {
    Unknown,
    Direct,
    ForwardBusy,
    ForwardNoAnswer,
    ForwardUnconditional,
    Pickup,
    Unpark,
    Redirect,
    CallCompletion,
    Transfer,
    Reminder,
    Unavailable,
    Intrude,
    Parked,
    CampedOn,
    RouteRequest,
}

/// Digit signalling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DigitMode {
    /// Rotary pulse digits, `0`-`9` only
    Pulse,
    /// DTMF digits reported on key down
    Dtmf,
    /// DTMF digits reported on key up
    DtmfEnd,
}

impl DigitMode {
    /// Whether `digit` is a valid digit in this signalling mode
    pub fn accepts(&self, digit: char) -> bool {
        match self {
            DigitMode::Pulse => digit.is_ascii_digit(),
            DigitMode::Dtmf | DigitMode::DtmfEnd => {
                digit.is_ascii_digit() || matches!(digit, '*' | '#' | 'A' | 'B' | 'C' | 'D')
            }
        }
    }
}

/// Set of digit modes
pub type DigitModes = BTreeSet<DigitMode>;

/// How a call that could not be connected normally should be completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallCompletionMode {
    CampOn,
    CallBack,
    Intrude,
    Message,
}

/// Park destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParkTarget {
    /// Park at the given address
    Directed(String),
    /// Let the switch pick the park address and report it back
    NonDirected,
}

/// How a consultation call is merged when a transfer completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferMode {
    /// Two-party merge; both calls leave the transferor
    Transfer,
    /// Merge both calls into a new conference
    Conference,
}

/// Treatment played to a call that is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallTreatment {
    Silence,
    Ringback,
    Busy,
    Music,
}

/// Id and name of one party to the call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyInfo {
    pub id: Option<String>,
    pub name: Option<String>,
}

impl PartyInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
        }
    }
}

/// Dialing parameters held by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialParams {
    /// Pause duration for `,` in dial strings, in milliseconds
    pub dial_pause_ms: u32,
    /// Inter-digit time when dialing, in milliseconds
    pub dial_speed_ms: u32,
    /// Duration of each dialed digit, in milliseconds
    pub digit_duration_ms: u32,
    /// Maximum wait for dialtone on `W`, in milliseconds
    pub wait_for_dialtone_ms: u32,
}

/// Parameters for creating a consultation or conference call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeCallParams {
    /// Address to dial immediately, if any
    pub destination: Option<String>,
    /// Country code, zero for default
    pub country_code: u32,
    pub bearer_mode: Option<BearerMode>,
    pub media_mode: Option<MediaMode>,
    /// Seconds to wait for an answer before giving up, zero for no limit
    pub no_answer_timeout_secs: u32,
}

impl MakeCallParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_country_code(mut self, country_code: u32) -> Self {
        self.country_code = country_code;
        self
    }

    pub fn with_media_mode(mut self, media_mode: MediaMode) -> Self {
        self.media_mode = Some(media_mode);
        self
    }
}

/// A provider-held call parameter change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallParamsUpdate {
    BearerMode(BearerMode),
    MediaMode(MediaMode),
    DataRate(u32),
    DialParams(DialParams),
    CallData(bytes::Bytes),
    Privilege(Privilege),
    Treatment(CallTreatment),
    MediaDetection(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digit_mode_accepts() {
        assert!(DigitMode::Pulse.accepts('7'));
        assert!(!DigitMode::Pulse.accepts('#'));
        assert!(DigitMode::Dtmf.accepts('#'));
        assert!(DigitMode::DtmfEnd.accepts('D'));
        assert!(!DigitMode::Dtmf.accepts('x'));
    }

    #[test]
    fn test_call_id_ordering_follows_allocation() {
        assert!(CallId(3) < CallId(10));
        assert_eq!(CallId(7).to_string(), "call-7");
    }
}
