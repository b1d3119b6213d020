//! Digit gathering
//!
//! A gather is a bounded collection of detected digits with two core-owned
//! timers. The machine itself is pure: it is fed digits and the current time
//! and reports when it terminates. [`GatherSession`] wraps it for the
//! operation manager and drives the timers from a tokio task.
//!
//! ```text
//!   Idle ──arm──► Armed ──digit──► Collecting ──┐
//!                   │                  │  ▲     │ digit (resets inter-digit timer)
//!                   │                  │  └─────┘
//!                   ▼                  ▼
//!              FirstTimeout     MaxDigits | TerminatorDigit | InterDigitTimeout
//!
//!   cancel from Idle/Armed/Collecting ──► Cancelled
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::GatherDefaults;
use crate::errors::{CallControlError, Result};
use crate::types::{CallId, DigitMode, DigitModes, OperationId};

/// Parameters of one digit gather
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitGatherParams {
    /// Digit modes that count towards the gather
    pub modes: DigitModes,
    /// Stop after this many digits; zero for no limit
    pub max_digits: usize,
    /// Any of these digits ends the gather and is included in the result
    pub terminators: String,
    /// Zero disables the timer
    pub first_digit_timeout: Duration,
    /// Zero disables the timer
    pub inter_digit_timeout: Duration,
}

impl DigitGatherParams {
    pub fn new(max_digits: usize) -> Self {
        Self {
            modes: DigitModes::from([DigitMode::Dtmf]),
            max_digits,
            terminators: String::new(),
            first_digit_timeout: Duration::ZERO,
            inter_digit_timeout: Duration::ZERO,
        }
    }

    /// Build parameters from the configured defaults
    pub fn from_defaults(defaults: &GatherDefaults, max_digits: usize) -> Self {
        Self {
            modes: DigitModes::from([DigitMode::Dtmf]),
            max_digits,
            terminators: defaults.terminators.clone(),
            first_digit_timeout: defaults.first_digit_timeout(),
            inter_digit_timeout: defaults.inter_digit_timeout(),
        }
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = DigitMode>) -> Self {
        self.modes = modes.into_iter().collect();
        self
    }

    pub fn with_terminators(mut self, terminators: impl Into<String>) -> Self {
        self.terminators = terminators.into();
        self
    }

    pub fn with_first_digit_timeout(mut self, timeout: Duration) -> Self {
        self.first_digit_timeout = timeout;
        self
    }

    pub fn with_inter_digit_timeout(mut self, timeout: Duration) -> Self {
        self.inter_digit_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.modes.is_empty() {
            return Err(CallControlError::invalid_parameter("digit gather needs at least one digit mode"));
        }
        if self.max_digits == 0
            && self.terminators.is_empty()
            && self.first_digit_timeout.is_zero()
            && self.inter_digit_timeout.is_zero()
        {
            return Err(CallControlError::invalid_parameter(
                "digit gather has no termination condition",
            ));
        }
        if let Some(bad) = self
            .terminators
            .chars()
            .find(|d| !self.modes.iter().any(|mode| mode.accepts(*d)))
        {
            return Err(CallControlError::invalid_parameter(format!(
                "terminator {:?} cannot be detected in modes {:?}",
                bad, self.modes
            )));
        }
        Ok(())
    }

    fn is_terminator(&self, digit: char) -> bool {
        self.terminators.contains(digit)
    }
}

/// Why a gather ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatherReason {
    MaxDigits,
    TerminatorDigit,
    FirstTimeout,
    InterDigitTimeout,
    Cancelled,
}

impl GatherReason {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatherReason::FirstTimeout | GatherReason::InterDigitTimeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherState {
    Idle,
    Armed,
    Collecting,
    Terminated(GatherReason),
}

/// Collected digits and the reason collection stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitGatherResult {
    pub digits: String,
    pub reason: GatherReason,
}

impl DigitGatherResult {
    /// Turn a timer expiry into a [`CallControlError::Timeout`].
    ///
    /// Cancellation is left to the caller to inspect through `reason`.
    pub fn ensure_complete(self) -> Result<Self> {
        if self.reason.is_timeout() {
            return Err(CallControlError::Timeout {
                reason: self.reason,
                digits: self.digits,
            });
        }
        Ok(self)
    }
}

/// The gather state machine
#[derive(Debug)]
pub struct DigitGatherer {
    params: DigitGatherParams,
    state: GatherState,
    digits: String,
    deadline: Option<Instant>,
}

impl DigitGatherer {
    pub fn new(params: DigitGatherParams) -> Self {
        Self {
            params,
            state: GatherState::Idle,
            digits: String::new(),
            deadline: None,
        }
    }

    pub fn state(&self) -> GatherState {
        self.state
    }

    pub fn digits(&self) -> &str {
        &self.digits
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, GatherState::Terminated(_))
    }

    /// Time at which the running timer expires, if any
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            GatherState::Armed | GatherState::Collecting => self.deadline,
            _ => None,
        }
    }

    /// Start waiting for the first digit
    pub fn arm(&mut self, now: Instant) {
        if self.state != GatherState::Idle {
            return;
        }
        self.state = GatherState::Armed;
        self.deadline = timer(now, self.params.first_digit_timeout);
    }

    /// Feed one detected digit.
    ///
    /// Digits in modes outside the gather's set, and digits arriving when the
    /// machine is not armed, are ignored.
    pub fn on_digit(&mut self, digit: char, mode: DigitMode, now: Instant) -> Option<DigitGatherResult> {
        if !matches!(self.state, GatherState::Armed | GatherState::Collecting) {
            return None;
        }
        if !self.params.modes.contains(&mode) || !mode.accepts(digit) {
            trace!(digit = %digit, ?mode, "digit outside gather modes");
            return None;
        }

        self.state = GatherState::Collecting;
        self.digits.push(digit);

        if self.params.is_terminator(digit) {
            return Some(self.terminate(GatherReason::TerminatorDigit));
        }
        if self.params.max_digits > 0 && self.digits.chars().count() >= self.params.max_digits {
            return Some(self.terminate(GatherReason::MaxDigits));
        }

        self.deadline = timer(now, self.params.inter_digit_timeout);
        None
    }

    /// Check the running timer against `now`
    pub fn on_deadline(&mut self, now: Instant) -> Option<DigitGatherResult> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let reason = match self.state {
            GatherState::Armed => GatherReason::FirstTimeout,
            _ => GatherReason::InterDigitTimeout,
        };
        Some(self.terminate(reason))
    }

    /// Stop the gather, keeping the digits collected so far
    pub fn cancel(&mut self) -> Option<DigitGatherResult> {
        if self.is_terminated() {
            return None;
        }
        Some(self.terminate(GatherReason::Cancelled))
    }

    fn terminate(&mut self, reason: GatherReason) -> DigitGatherResult {
        self.state = GatherState::Terminated(reason);
        self.deadline = None;
        DigitGatherResult {
            digits: self.digits.clone(),
            reason,
        }
    }
}

fn timer(now: Instant, timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(now + timeout)
    }
}

/// A running gather bound to an operation
pub struct GatherSession {
    pub(crate) op: OperationId,
    pub(crate) call: CallId,
    machine: Mutex<DigitGatherer>,
    wake: Notify,
}

impl GatherSession {
    /// Create a session that is already armed
    pub(crate) fn new(op: OperationId, call: CallId, params: DigitGatherParams) -> Arc<Self> {
        let mut machine = DigitGatherer::new(params);
        machine.arm(Instant::now());
        Arc::new(Self {
            op,
            call,
            machine: Mutex::new(machine),
            wake: Notify::new(),
        })
    }

    pub(crate) fn on_digit(&self, digit: char, mode: DigitMode) -> Option<DigitGatherResult> {
        let result = self.machine.lock().on_digit(digit, mode, Instant::now());
        // the timer task re-reads the deadline or exits
        self.wake.notify_one();
        result
    }

    pub(crate) fn cancel(&self) -> Option<DigitGatherResult> {
        let result = self.machine.lock().cancel();
        self.wake.notify_one();
        result
    }

    /// Drive the timers until the gather terminates.
    ///
    /// `on_expired` runs at most once, when a timer ends the gather.
    pub(crate) fn spawn_timer<F>(self: &Arc<Self>, on_expired: F)
    where
        F: FnOnce(DigitGatherResult) + Send + 'static,
    {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let machine = session.machine.lock();
                    if machine.is_terminated() {
                        return;
                    }
                    machine.deadline()
                };

                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {
                                let expired = session.machine.lock().on_deadline(Instant::now());
                                if let Some(result) = expired {
                                    debug!(op = %session.op, call = %session.call, reason = ?result.reason, "digit gather timer expired");
                                    on_expired(result);
                                    return;
                                }
                            }
                            _ = session.wake.notified() => {}
                        }
                    }
                    None => session.wake.notified().await,
                }
            }
        });
    }
}

impl std::fmt::Debug for GatherSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatherSession")
            .field("op", &self.op)
            .field("call", &self.call)
            .field("state", &self.machine.lock().state())
            .finish()
    }
}
