//! Pending operations and the handles callers hold on them

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{LinkedCalls, OperationKind, OperationManager, OperationOutput, OperationRequest};
use crate::errors::{CallControlError, Result};
use crate::gather::GatherSession;
use crate::types::{CallId, OperationId};

enum Slot {
    Pending,
    Ready(Result<OperationOutput>),
    Taken,
}

/// One outstanding request
pub(crate) struct PendingOperation {
    pub(crate) id: OperationId,
    pub(crate) request: OperationRequest,
    pub(crate) linked: LinkedCalls,
    pub(crate) submitted_at: DateTime<Utc>,
    pub(crate) gather: Option<Arc<GatherSession>>,
    cancelled: AtomicBool,
    slot: Mutex<Slot>,
    ready: Notify,
}

impl PendingOperation {
    pub(crate) fn new(
        id: OperationId,
        request: OperationRequest,
        linked: LinkedCalls,
        gather: Option<Arc<GatherSession>>,
    ) -> Self {
        Self {
            id,
            request,
            linked,
            submitted_at: Utc::now(),
            gather,
            cancelled: AtomicBool::new(false),
            slot: Mutex::new(Slot::Pending),
            ready: Notify::new(),
        }
    }

    pub(crate) fn kind(&self) -> OperationKind {
        self.request.kind
    }

    pub(crate) fn call(&self) -> CallId {
        self.request.call
    }

    /// Every call the operation touches
    pub(crate) fn calls(&self) -> Vec<CallId> {
        let mut calls = vec![self.request.call];
        calls.extend(self.request.related_call());
        calls.extend(self.linked.iter());
        calls
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Store the result and wake waiters. Only the manager calls this, once.
    pub(crate) fn resolve(&self, outcome: Result<OperationOutput>) {
        *self.slot.lock() = Slot::Ready(outcome);
        self.ready.notify_waiters();
    }

    pub(crate) fn is_resolved(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    /// `None` while pending
    fn take(&self) -> Option<Result<OperationOutput>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
            Slot::Ready(outcome) => Some(outcome),
            Slot::Taken => Some(Err(CallControlError::ResultAlreadyTaken(self.id))),
        }
    }
}

/// Result of polling a handle
#[derive(Debug)]
pub enum OperationPoll<T> {
    Pending,
    Ready(Result<T>),
}

impl<T> OperationPoll<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, OperationPoll::Pending)
    }
}

/// What a cancel request achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The operation was resolved as cancelled
    Cancelled,
    /// The operation had already resolved; its result is unchanged
    AlreadyResolved,
}

/// Handle on a submitted operation.
///
/// The result can be retrieved once, with [`poll`](Self::poll) or
/// [`wait`](Self::wait). Dropping the handle does not cancel the operation.
pub struct OperationHandle<T> {
    op: Arc<PendingOperation>,
    manager: Arc<OperationManager>,
    _output: PhantomData<fn() -> T>,
}

impl<T> OperationHandle<T>
where
    T: TryFrom<OperationOutput, Error = CallControlError>,
{
    pub(crate) fn new(op: Arc<PendingOperation>, manager: Arc<OperationManager>) -> Self {
        Self {
            op,
            manager,
            _output: PhantomData,
        }
    }

    pub fn id(&self) -> OperationId {
        self.op.id
    }

    pub fn kind(&self) -> OperationKind {
        self.op.kind()
    }

    pub fn call(&self) -> CallId {
        self.op.call()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.op.submitted_at
    }

    pub fn is_resolved(&self) -> bool {
        self.op.is_resolved()
    }

    /// Take the result if the operation has resolved.
    ///
    /// Polling again after a `Ready` fails with
    /// [`CallControlError::ResultAlreadyTaken`].
    pub fn poll(&self) -> Result<OperationPoll<T>> {
        match self.op.take() {
            None => Ok(OperationPoll::Pending),
            Some(Err(CallControlError::ResultAlreadyTaken(id))) => Err(CallControlError::ResultAlreadyTaken(id)),
            Some(outcome) => Ok(OperationPoll::Ready(outcome.and_then(T::try_from))),
        }
    }

    /// Wait for the operation to resolve
    pub async fn wait(self) -> Result<T> {
        loop {
            let notified = self.op.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.op.take() {
                return outcome.and_then(T::try_from);
            }
            notified.as_mut().await;
        }
    }

    /// Cancel the operation if it is still pending
    pub async fn cancel(&self) -> CancelOutcome {
        self.manager.cancel(&self.op).await
    }
}

impl<T> std::fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.op.id)
            .field("kind", &self.op.kind())
            .field("call", &self.op.call())
            .field("cancelled", &self.op.is_cancelled())
            .finish()
    }
}
