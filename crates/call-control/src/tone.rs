//! Tone descriptors for generation and monitoring

use serde::{Deserialize, Serialize};

use crate::errors::{CallControlError, Result};
use crate::types::DigitMode;

/// Named tones the provider knows how to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToneMode {
    Beep,
    Billing,
    Busy,
    Ringback,
}

/// One custom tone: up to two frequencies played with a cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomTone {
    pub low_hz: u32,
    pub high_hz: Option<u32>,
    pub cadence_on_ms: u32,
    pub cadence_off_ms: u32,
    /// 0 to 0xFFFF
    pub volume: u32,
}

impl CustomTone {
    pub fn single(hz: u32, cadence_on_ms: u32, cadence_off_ms: u32) -> Self {
        Self {
            low_hz: hz,
            high_hz: None,
            cadence_on_ms,
            cadence_off_ms,
            volume: 0xFFFF,
        }
    }

    pub fn dual(low_hz: u32, high_hz: u32, cadence_on_ms: u32, cadence_off_ms: u32) -> Self {
        Self {
            low_hz,
            high_hz: Some(high_hz),
            cadence_on_ms,
            cadence_off_ms,
            volume: 0xFFFF,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.low_hz == 0 || self.high_hz == Some(0) {
            return Err(CallControlError::invalid_parameter("tone frequency must be non-zero"));
        }
        if self.volume > 0xFFFF {
            return Err(CallControlError::invalid_parameter(format!(
                "tone volume {} exceeds 0xFFFF",
                self.volume
            )));
        }
        if self.cadence_on_ms == 0 {
            return Err(CallControlError::invalid_parameter("tone cadence on-time must be non-zero"));
        }
        Ok(())
    }
}

/// What to generate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToneSpec {
    Mode(ToneMode),
    Custom(Vec<CustomTone>),
}

impl ToneSpec {
    pub fn validate(&self) -> Result<()> {
        match self {
            ToneSpec::Mode(_) => Ok(()),
            ToneSpec::Custom(tones) if tones.is_empty() => {
                Err(CallControlError::invalid_parameter("custom tone list is empty"))
            }
            ToneSpec::Custom(tones) => tones.iter().try_for_each(CustomTone::validate),
        }
    }
}

/// A pattern to watch for while tone monitoring.
///
/// `id` is chosen by the application and echoed back in detections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorTone {
    pub id: u32,
    /// One to three frequencies, in Hz
    pub frequencies: Vec<u32>,
    /// Minimum duration before the tone is reported
    pub duration_ms: u32,
}

impl MonitorTone {
    pub fn new(id: u32, frequencies: impl Into<Vec<u32>>, duration_ms: u32) -> Self {
        Self {
            id,
            frequencies: frequencies.into(),
            duration_ms,
        }
    }
}

pub(crate) fn validate_monitor_tones(tones: &[MonitorTone]) -> Result<()> {
    if tones.is_empty() {
        return Err(CallControlError::invalid_parameter("tone monitor list is empty"));
    }
    for tone in tones {
        if tone.frequencies.is_empty() || tone.frequencies.len() > 3 {
            return Err(CallControlError::invalid_parameter(format!(
                "tone {} must list one to three frequencies",
                tone.id
            )));
        }
        if tone.frequencies.contains(&0) {
            return Err(CallControlError::invalid_parameter(format!(
                "tone {} has a zero frequency",
                tone.id
            )));
        }
    }
    let mut ids: Vec<u32> = tones.iter().map(|t| t.id).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != tones.len() {
        return Err(CallControlError::invalid_parameter("tone monitor ids must be unique"));
    }
    Ok(())
}

/// Check a digit string before asking the provider to generate it
pub(crate) fn validate_generated_digits(mode: DigitMode, digits: &str) -> Result<()> {
    if digits.is_empty() {
        return Err(CallControlError::invalid_parameter("nothing to generate"));
    }
    // ',' inserts a pause
    match digits.chars().find(|d| *d != ',' && !mode.accepts(*d)) {
        Some(bad) => Err(CallControlError::invalid_parameter(format!(
            "digit {:?} cannot be generated in {:?} mode",
            bad, mode
        ))),
        None => Ok(()),
    }
}
