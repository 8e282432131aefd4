//! The request-pipeline core shared by both protocols.
//!
//! A `Session<P>` owns nothing about bytes on the wire beyond `P: ProtocolOps`, the small encoder
//! seam in `ops.rs`. Everything else here -- the enqueue algorithm, pipelining, transactions,
//! deferred close -- is protocol-agnostic and lives in one place instead of being duplicated (or
//! inherited) per backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Error;
use crate::future::{DbFuture, DbSessionFuture};
use crate::ops::ProtocolOps;
use crate::request::{
    Action, DefaultResultSetHandler, DefaultUpdateHandler, ErasedRequest, QueryEventHandler,
    RequestKind, TypedRequest,
};
use crate::transaction::TransactionState;
use crate::value::{ResultSet, UpdateResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct SessionInner {
    queue: VecDeque<Arc<dyn ErasedRequest>>,
    active: Option<Arc<dyn ErasedRequest>>,
    transaction: Option<Arc<TransactionState>>,
    /// Set once a promotion walk reaches the end of the queue with every member pipelinable: a
    /// newly enqueued pipelinable request can have its thunk run immediately instead of waiting
    /// to become active.
    pipelining_mode: bool,
    /// Set once `close(false)` (deferred close) or `close(true)` (immediate close) has been
    /// requested. Further enqueues are rejected with `Error::SessionClosed`.
    close_requested: bool,
}

/// The generic request-pipeline core. `P` supplies the wire encoding; the driver loop in
/// `transport.rs` supplies decoded responses by calling the `on_*` methods below.
pub struct Session<P: ProtocolOps> {
    id: u64,
    inner: Mutex<SessionInner>,
    ops: Mutex<P>,
    outbound: UnboundedSender<BytesMut>,
    pipelining_enabled: AtomicBool,
    transport_closed: AtomicBool,
    /// Set once, right after construction, so methods that only borrow `&self` can still hand a
    /// `'static` callback (e.g. a future's cancel hook) a way to reach back into the session.
    self_weak: OnceLock<Weak<Session<P>>>,
}

impl<P: ProtocolOps + 'static> Session<P> {
    pub(crate) fn new(ops: P, outbound: UnboundedSender<BytesMut>) -> Arc<Self> {
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            inner: Mutex::new(SessionInner {
                queue: VecDeque::new(),
                active: None,
                transaction: None,
                pipelining_mode: false,
                close_requested: false,
            }),
            ops: Mutex::new(ops),
            outbound,
            pipelining_enabled: AtomicBool::new(true),
            transport_closed: AtomicBool::new(false),
            self_weak: OnceLock::new(),
        });
        let _ = session.self_weak.set(Arc::downgrade(&session));
        session
    }

    /// A callback for a non-transactional request's cancel hook: wakes the pipeline back up if
    /// cancelling left nothing active (the cancelled entry itself is skipped lazily, on pop, by
    /// `promote_locked`).
    fn nudge_on_cancel(&self) -> Arc<dyn Fn() + Send + Sync> {
        let weak = self.self_weak.get().cloned();
        Arc::new(move || {
            if let Some(session) = weak.as_ref().and_then(Weak::upgrade) {
                let mut inner = session.inner.lock();
                if inner.active.is_none() {
                    session.promote_locked(&mut inner);
                }
            }
        })
    }

    /// The deferred close's cancel hook: "unclose" the session by clearing `close_requested` and
    /// dropping the close request itself. Deliberately does *not* re-promote the queue -- per the
    /// resolved ambiguity around racing an unclose against an in-flight completion, the normal
    /// promote-on-completion path (or the next enqueue) is left as the sole driver of queue
    /// advancement.
    fn unclose_on_cancel(&self) -> Arc<dyn Fn() + Send + Sync> {
        let weak = self.self_weak.get().cloned();
        Arc::new(move || {
            if let Some(session) = weak.as_ref().and_then(Weak::upgrade) {
                let mut inner = session.inner.lock();
                inner.close_requested = false;
                inner.queue.retain(|r| r.kind() != RequestKind::Close);
                if inner
                    .active
                    .as_ref()
                    .is_some_and(|r| r.kind() == RequestKind::Close)
                {
                    inner.active = None;
                }
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_pipelining_enabled(&self, enabled: bool) {
        self.pipelining_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn pipelining_enabled(&self) -> bool {
        self.pipelining_enabled.load(Ordering::SeqCst)
    }

    /// "isClosed is true whenever closeRequest is non-null OR the transport reports itself
    /// closing" (§4.2) -- it reflects the *intent* to close, not whether the drain has finished,
    /// so it flips true the instant `close` is called rather than once the queue empties out.
    pub fn is_closed(&self) -> bool {
        self.transport_closed.load(Ordering::SeqCst) || self.inner.lock().close_requested
    }

    /// Whether the close sequence has fully drained: the close request has been requested *and*
    /// there is nothing left for the driver loop to do (no active round trip, nothing queued
    /// behind it). Distinct from the public [`Self::is_closed`], which reports the moment closing
    /// was *requested* -- this is what `transport::drive` waits for before dropping the socket.
    pub(crate) fn is_drained(&self) -> bool {
        if self.transport_closed.load(Ordering::SeqCst) {
            return true;
        }
        let inner = self.inner.lock();
        inner.close_requested && inner.queue.is_empty() && inner.active.is_none()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.inner.lock().transaction.is_some()
    }

    // ---- public request surface -------------------------------------------------------------

    pub fn execute_query(&self, sql: impl Into<String>) -> DbSessionFuture<ResultSet> {
        self.execute_query_with(sql, DefaultResultSetHandler::default(), ResultSet::default())
    }

    pub fn execute_query_with<T, H>(&self, sql: impl Into<String>, handler: H, accumulator: T) -> DbSessionFuture<T>
    where
        T: Clone + Send + 'static,
        H: QueryEventHandler<T> + 'static,
    {
        self.enqueue_transactional(RequestKind::Query, Action::Query(sql.into()), true, true, accumulator, Box::new(handler))
    }

    pub fn execute_update(&self, sql: impl Into<String>) -> DbSessionFuture<UpdateResult> {
        self.enqueue_transactional(
            RequestKind::Update,
            Action::Query(sql.into()),
            true,
            true,
            UpdateResult::default(),
            Box::new(DefaultUpdateHandler),
        )
    }

    pub fn begin_transaction(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.transaction.is_some() {
            return Err(Error::AlreadyInTransaction);
        }
        inner.transaction = Some(TransactionState::new());
        Ok(())
    }

    pub fn commit(&self) -> DbSessionFuture<UpdateResult> {
        let mut inner = self.inner.lock();
        let txn = match inner.transaction.clone() {
            Some(t) => t,
            None => return DbSessionFuture::new(DbFuture::ready(Ok(UpdateResult::default())), self.id),
        };
        if !txn.begin_scheduled.load(Ordering::SeqCst) {
            inner.transaction = None;
            return DbSessionFuture::new(DbFuture::ready(Ok(UpdateResult::default())), self.id);
        }
        let (req, fut) = TypedRequest::new(
            RequestKind::Commit,
            Action::Commit,
            false,
            false,
            Some(txn),
            UpdateResult::default(),
            Box::new(DefaultUpdateHandler),
            // A transaction member's cancel hook is always rejected before `on_cancel_accepted`
            // runs (see `TypedRequest::new`'s `transaction_for_cancel` check), so there is nothing
            // for Commit to wire in here.
            None,
        );
        self.enqueue_locked(&mut inner, req);
        inner.transaction = None;
        drop(inner);
        DbSessionFuture::new(fut, self.id)
    }

    pub fn rollback(&self) -> DbSessionFuture<UpdateResult> {
        let mut inner = self.inner.lock();
        let txn = match inner.transaction.clone() {
            Some(t) => t,
            None => return DbSessionFuture::new(DbFuture::ready(Ok(UpdateResult::default())), self.id),
        };
        if !txn.begin_scheduled.load(Ordering::SeqCst) {
            inner.transaction = None;
            return DbSessionFuture::new(DbFuture::ready(Ok(UpdateResult::default())), self.id);
        }
        txn.mark_canceled();
        for member in txn.take_members() {
            // A member only ever becomes `active` after `execute_one` has run it (see
            // `promote_locked`), so "not executed" also means "not active" -- removing it from
            // the queue here can never strand `inner.active` on a failed request that still needs
            // promoting.
            if !member.is_executed() {
                remove_from_queue(&mut inner.queue, &member);
                member.fail(Error::TransactionFailed);
            }
        }
        let (req, fut) = TypedRequest::new(
            RequestKind::Rollback,
            Action::Rollback,
            false,
            false,
            Some(txn),
            UpdateResult::default(),
            Box::new(DefaultUpdateHandler),
            None,
        );
        self.enqueue_locked(&mut inner, req);
        inner.transaction = None;
        drop(inner);
        DbSessionFuture::new(fut, self.id)
    }

    /// `immediate = true` drops any still-queued, not-yet-executed requests and sends
    /// `Terminate` right away. `immediate = false` (deferred close) lets already-enqueued work
    /// drain first; new enqueues are rejected from this point on either way.
    pub fn close(&self, immediate: bool) -> DbSessionFuture<UpdateResult> {
        let mut inner = self.inner.lock();
        if inner.close_requested {
            // A close is already in flight (its own `Terminate` request may still be sitting
            // unpromoted in the queue) -- draining again here would fail that request out from
            // under the first caller. Per-call completion isn't tracked, so every repeat close
            // just hands back an already-ready future instead.
            drop(inner);
            return DbSessionFuture::new(DbFuture::ready(Ok(UpdateResult::default())), self.id);
        }
        inner.close_requested = true;
        if immediate {
            for req in inner.queue.drain(..) {
                req.fail(Error::SessionClosed);
            }
        }
        let (req, fut) = TypedRequest::new(
            RequestKind::Close,
            Action::Terminate,
            false,
            false,
            None,
            UpdateResult::default(),
            Box::new(DefaultUpdateHandler),
            Some(self.unclose_on_cancel()),
        );
        // A close bypasses the closed-session enqueue rejection deliberately: it's how the
        // session actually tears itself down.
        inner.queue.push_back(req);
        if inner.active.is_none() {
            self.promote_locked(&mut inner);
        }
        drop(inner);
        DbSessionFuture::new(fut, self.id)
    }

    /// Reopens a session that was deferred-closed but has not yet sent `Terminate` (the close
    /// request is still queued). Rejects once the close has actually executed.
    pub fn unclose(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let close_is_pending = inner
            .queue
            .iter()
            .chain(inner.active.iter())
            .any(|r| r.kind() == RequestKind::Close && !r.is_executed());
        if !close_is_pending {
            return Err(Error::SessionClosed);
        }
        inner.close_requested = false;
        inner.queue.retain(|r| r.kind() != RequestKind::Close);
        if let Some(active) = &inner.active {
            if active.kind() == RequestKind::Close {
                inner.active = None;
            }
        }
        Ok(())
    }

    // ---- enqueue / pipelining / promotion -----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn enqueue_transactional<T>(
        &self,
        kind: RequestKind,
        action: Action,
        pipelinable: bool,
        removable: bool,
        accumulator: T,
        handler: Box<dyn QueryEventHandler<T>>,
    ) -> DbSessionFuture<T>
    where
        T: Clone + Send + 'static,
    {
        let mut inner = self.inner.lock();
        let txn = inner.transaction.clone();
        if let Some(txn) = &txn {
            if txn.is_canceled() {
                drop(inner);
                return DbSessionFuture::new(DbFuture::ready(Err(Error::TransactionFailed)), self.id);
            }
            if !txn.begin_scheduled.swap(true, Ordering::SeqCst) {
                let (begin_req, _begin_fut) = TypedRequest::new(
                    RequestKind::Begin,
                    Action::Begin,
                    true,
                    true,
                    Some(txn.clone()),
                    UpdateResult::default(),
                    Box::new(DefaultUpdateHandler),
                    None,
                );
                self.enqueue_locked(&mut inner, begin_req);
            }
        }
        // `nudge_on_cancel` only ever fires for a non-transactional request: a transaction member
        // is rejected by `transaction_for_cancel` in `TypedRequest::new`'s cancel hook before
        // `on_cancel_accepted` is reached, so wiring it in unconditionally here is harmless for
        // members and required for standalone queries/updates (§4.2 cancellation).
        let (req, fut): (Arc<TypedRequest<T>>, DbFuture<T>) = TypedRequest::new(
            kind,
            action,
            pipelinable,
            removable,
            txn.clone(),
            accumulator,
            handler,
            Some(self.nudge_on_cancel()),
        );
        if let Some(txn) = &txn {
            txn.add_member(req.clone());
        }
        self.enqueue_locked(&mut inner, req);
        drop(inner);
        DbSessionFuture::new(fut, self.id)
    }

    fn enqueue_locked(&self, inner: &mut SessionInner, req: Arc<dyn ErasedRequest>) {
        if inner.close_requested {
            req.fail(Error::SessionClosed);
            return;
        }
        if self.pipelining_enabled.load(Ordering::SeqCst) && inner.pipelining_mode && req.pipelinable() {
            self.execute_one(&req);
            inner.queue.push_back(req);
            return;
        }
        inner.queue.push_back(req);
        if inner.active.is_none() {
            self.promote_locked(inner);
        }
    }

    /// Writes `req`'s frame to the wire, failing it (and letting the caller re-promote) if
    /// encoding itself errors out. Returns whether the request settled synchronously.
    fn execute_one(&self, req: &Arc<dyn ErasedRequest>) -> bool {
        if req.is_cancelled() {
            req.mark_executed();
            return true;
        }
        let mut out = BytesMut::new();
        let result = {
            let mut ops = self.ops.lock();
            req.execute(&mut *ops, &mut out)
        };
        match result {
            Ok(()) => {
                let _ = self.outbound.send(out);
                false
            }
            Err(e) => {
                req.fail(e);
                true
            }
        }
    }

    /// Promotes the next request(s) from the queue into the active slot, eagerly executing a run
    /// of pipelinable successors so they are already in flight by the time their turn comes.
    fn promote_locked(&self, inner: &mut SessionInner) {
        loop {
            let Some(next) = inner.queue.pop_front() else {
                inner.active = None;
                return;
            };
            if next.is_cancelled() && !next.is_executed() {
                continue;
            }
            if !next.is_executed() && self.execute_one(&next) {
                // Settled synchronously with an error; move on to the next queued request.
                continue;
            }
            let pipelinable = next.pipelinable();
            inner.active = Some(next);
            if pipelinable {
                let mut reached_end = true;
                for candidate in inner.queue.iter() {
                    if !candidate.pipelinable() {
                        reached_end = false;
                        break;
                    }
                    if !candidate.is_executed() && !candidate.is_cancelled() {
                        self.execute_one(candidate);
                    }
                }
                inner.pipelining_mode = reached_end;
            } else {
                inner.pipelining_mode = false;
            }
            return;
        }
    }

    /// Sends a frame built outside the request queue, e.g. the handshake/login exchange that
    /// happens before any `Request` exists to own it.
    pub(crate) fn send_raw(&self, bytes: BytesMut) {
        let _ = self.outbound.send(bytes);
    }

    /// Gives protocol-handler code (e.g. the MySQL login step, which needs the stored
    /// credentials) access to the protocol-specific encoder state without exposing it publicly.
    pub(crate) fn with_ops<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.ops.lock())
    }

    // ---- driven by the protocol handler on decoded responses ----------------------------------

    /// Returns the currently active request, if any, so the protocol handler can feed it
    /// streaming callbacks.
    pub(crate) fn active_request(&self) -> Option<Arc<dyn ErasedRequest>> {
        self.inner.lock().active.clone()
    }

    /// Called once the active request's response has been fully consumed (success or error
    /// already delivered to it by the caller). Advances the pipeline.
    pub(crate) fn on_active_settled(&self) {
        let mut inner = self.inner.lock();
        let was_close = inner
            .active
            .as_ref()
            .map(|r| r.kind() == RequestKind::Close)
            .unwrap_or(false);
        self.promote_locked(&mut inner);
        if was_close {
            self.transport_closed.store(true, Ordering::SeqCst);
        }
    }

    /// Fails the active request and every still-queued request; used when the transport itself
    /// dies (read error, EOF, decode failure).
    pub(crate) fn fail_all(&self, err_factory: impl Fn() -> Error) {
        let mut inner = self.inner.lock();
        if let Some(active) = inner.active.take() {
            active.fail(err_factory());
        }
        for req in inner.queue.drain(..) {
            req.fail(err_factory());
        }
        self.transport_closed.store(true, Ordering::SeqCst);
    }
}

fn remove_from_queue(queue: &mut VecDeque<Arc<dyn ErasedRequest>>, target: &Arc<dyn ErasedRequest>) {
    if let Some(pos) = queue.iter().position(|r| Arc::ptr_eq(r, target)) {
        queue.remove(pos);
    }
}

#[cfg(test)]
mod tests;
