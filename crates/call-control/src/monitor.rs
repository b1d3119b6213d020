//! Digit and tone monitoring subscriptions
//!
//! Monitoring is open ended: a subscription yields one event per detection
//! until it is cancelled or the call disconnects. Several subscriptions may
//! watch the same call; the provider is always told the union of what they
//! ask for.
//!
//! Once cancellation is observed a subscription yields nothing more, even
//! for detections that were already queued.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::provider::ProviderBoundary;
use crate::registry::CallRegistry;
use crate::tone::MonitorTone;
use crate::types::{CallId, DigitMode, DigitModes, SubscriptionId};

/// A digit seen while digit monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitDetected {
    pub call: CallId,
    pub digit: char,
    pub mode: DigitMode,
    pub detected_at: DateTime<Utc>,
}

/// A monitored tone pattern matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToneDetected {
    pub call: CallId,
    pub tone: MonitorTone,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorKind {
    Digits,
    Tones,
}

/// Registry side of a subscription
pub(crate) struct Registration<E, F> {
    pub(crate) id: SubscriptionId,
    pub(crate) filter: F,
    sender: mpsc::UnboundedSender<E>,
    cancelled: Arc<AtomicBool>,
}

pub(crate) type DigitRegistration = Registration<DigitDetected, DigitModes>;
pub(crate) type ToneRegistration = Registration<ToneDetected, Vec<MonitorTone>>;

impl<E, F> Registration<E, F> {
    pub(crate) fn deliver(&self, event: E) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        // a closed receiver is cleaned up by the subscription's Drop
        let _ = self.sender.send(event);
    }

    /// Stop delivery; the subscription sees `None` from now on
    pub(crate) fn close(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// A monitoring subscription on one call.
///
/// Dropping the subscription cancels it.
pub struct Subscription<E> {
    id: SubscriptionId,
    call: CallId,
    kind: MonitorKind,
    rx: mpsc::UnboundedReceiver<E>,
    cancelled: Arc<AtomicBool>,
    registry: Arc<CallRegistry>,
    provider: Arc<dyn ProviderBoundary>,
}

pub type DigitMonitor = Subscription<DigitDetected>;
pub type ToneMonitor = Subscription<ToneDetected>;

/// Create a registration and the subscription that reads from it
pub(crate) fn subscription<E, F>(
    id: SubscriptionId,
    call: CallId,
    kind: MonitorKind,
    filter: F,
    registry: Arc<CallRegistry>,
    provider: Arc<dyn ProviderBoundary>,
) -> (Registration<E, F>, Subscription<E>) {
    let (sender, rx) = mpsc::unbounded_channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let registration = Registration {
        id,
        filter,
        sender,
        cancelled: Arc::clone(&cancelled),
    };
    let subscription = Subscription {
        id,
        call,
        kind,
        rx,
        cancelled,
        registry,
        provider,
    };
    (registration, subscription)
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn call(&self) -> CallId {
        self.call
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Next detection, or `None` once cancelled or the call is gone
    pub async fn recv(&mut self) -> Option<E> {
        if self.is_cancelled() {
            return None;
        }
        let event = self.rx.recv().await?;
        if self.is_cancelled() {
            return None;
        }
        Some(event)
    }

    /// Stop monitoring and tell the provider what is still watched
    pub async fn cancel(&self) -> Result<()> {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.registry.remove_monitor(self.call, self.kind, self.id) {
            self.registry.sync_monitoring(self.call, self.provider.as_ref()).await?;
        }
        debug!(call = %self.call, subscription = %self.id, "monitoring cancelled");
        Ok(())
    }
}

impl<E> Stream for Subscription<E> {
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        let this = self.get_mut();
        if this.is_cancelled() {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(_)) if this.is_cancelled() => Poll::Ready(None),
            other => other,
        }
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.registry.remove_monitor(self.call, self.kind, self.id) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let registry = Arc::clone(&self.registry);
            let provider = Arc::clone(&self.provider);
            let call = self.call;
            runtime.spawn(async move {
                if let Err(e) = registry.sync_monitoring(call, provider.as_ref()).await {
                    warn!(call = %call, error = %e, "failed to narrow monitoring after drop");
                }
            });
        }
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("call", &self.call)
            .field("kind", &self.kind)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
