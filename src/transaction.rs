//! Transaction bookkeeping shared between a session and the requests enrolled in it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::request::ErasedRequest;

/// Tracks the lifecycle of one `BEGIN ... COMMIT|ROLLBACK` block.
///
/// A session holds at most one of these at a time (see `SessionInner::transaction`). It is
/// shared (`Arc`) with every request enrolled in the transaction so that a request's completion
/// handler can flip `canceled` without reaching back into the session.
pub(crate) struct TransactionState {
    /// Set the first time a transactional request causes a `BEGIN` to be enqueued.
    pub(crate) begin_scheduled: AtomicBool,
    /// Set once the enqueued `BEGIN` request's thunk has actually written the wire frame.
    pub(crate) started: AtomicBool,
    /// Set once any member request fails, or the session starts a rollback. Once set, `commit()`
    /// degrades to `ROLLBACK` and new transactional enqueues are rejected.
    pub(crate) canceled: AtomicBool,
    members: Mutex<Vec<Arc<dyn ErasedRequest>>>,
}

impl TransactionState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            begin_scheduled: AtomicBool::new(false),
            started: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            members: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_canceled(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn add_member(&self, request: Arc<dyn ErasedRequest>) {
        self.members.lock().push(request);
    }

    /// Drains the member list. Used by `rollback()` to find still-queued requests that must be
    /// failed before the `ROLLBACK` itself is enqueued.
    pub(crate) fn take_members(&self) -> Vec<Arc<dyn ErasedRequest>> {
        std::mem::take(&mut *self.members.lock())
    }
}
