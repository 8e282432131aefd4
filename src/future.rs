//! The future/listener primitive that carries results and cancellation between the I/O driver
//! loop and user code.
//!
//! [`DbFuture<T>`] is intentionally not built on top of `tokio::sync::oneshot`: it needs
//! `get`/`get_timeout` blocking semantics *and* listener fan-out *and* `.await` support, all
//! against the same piece of shared state, with idempotent settling. It is the one piece of this
//! crate with no analogue in the teacher codebase's own (synchronous, in-process) request
//! handling — here it is the seam between the single-threaded driver task and arbitrary caller
//! threads/tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

type Listener<T> = Box<dyn FnOnce(&Result<T, Error>) + Send>;

enum State<T> {
    Pending {
        listeners: Vec<Listener<T>>,
        waker: Option<Waker>,
    },
    Done(Result<T, Error>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
    cancelled: AtomicBool,
}

/// A value that will eventually hold a `Result<T, Error>`, deliverable either by blocking
/// (`get`/`get_timeout`), by listener callback, or by `.await`.
///
/// Exactly one terminal transition ever happens: [`DbFuturePromise::set_result`] or
/// [`DbFuturePromise::set_error`], whichever wins the race, settles the future. Anything
/// attempted afterwards returns [`Error::AlreadySettled`] to the caller that lost the race.
pub struct DbFuture<T> {
    shared: Arc<Shared<T>>,
    /// Invoked when `cancel` is called on a future that has not yet settled. Returns `true` if
    /// cancellation should be honored (causing the future to settle with `Error::Cancelled`).
    do_cancel: Arc<dyn Fn(bool) -> bool + Send + Sync>,
}

/// The producer side of a [`DbFuture`]. The driver loop holds this and settles it exactly once.
pub struct DbFuturePromise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> DbFuture<T> {
    /// Construct a linked future/promise pair. `do_cancel` implements the subclass hook from the
    /// specification: it decides whether an un-settled future may be cancelled.
    pub fn new_pair(
        do_cancel: impl Fn(bool) -> bool + Send + Sync + 'static,
    ) -> (Self, DbFuturePromise<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending {
                listeners: Vec::new(),
                waker: None,
            }),
            settled: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        (
            DbFuture {
                shared: shared.clone(),
                do_cancel: Arc::new(do_cancel),
            },
            DbFuturePromise { shared },
        )
    }

    /// A future that is already settled. Useful for "no server round-trip needed" fast paths
    /// (e.g. `rollback()` with no pending BEGIN).
    pub fn ready(value: Result<T, Error>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Done(value)),
            settled: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        DbFuture {
            shared,
            do_cancel: Arc::new(|_| false),
        }
    }

    /// Blocks the calling thread until the future settles.
    pub fn get(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        let mut guard = self.shared.state.lock();
        loop {
            match &*guard {
                State::Done(_) => break,
                State::Pending { .. } => self.shared.settled.wait(&mut guard),
            }
        }
        match &*guard {
            State::Done(r) => r.clone(),
            State::Pending { .. } => unreachable!(),
        }
    }

    /// Blocks the calling thread until the future settles or `timeout` elapses.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, Error>
    where
        T: Clone,
    {
        let mut guard = self.shared.state.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match &*guard {
                State::Done(r) => return r.clone(),
                State::Pending { .. } => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let remaining = deadline - now;
                    let result = self.shared.settled.wait_for(&mut guard, remaining);
                    if result.timed_out() {
                        if let State::Done(r) = &*guard {
                            return r.clone();
                        }
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }

    /// Registers a listener invoked exactly once with the final result. If the future has
    /// already settled, the listener is invoked synchronously, on the calling thread, before this
    /// call returns.
    pub fn add_listener(&self, listener: impl FnOnce(&Result<T, Error>) + Send + 'static) {
        let mut guard = self.shared.state.lock();
        match &mut *guard {
            State::Done(r) => {
                let r = clone_result(r);
                drop(guard);
                listener(&r);
            }
            State::Pending { listeners, .. } => listeners.push(Box::new(listener)),
        }
    }

    /// Attempts to cancel the future. Returns whether cancellation took effect.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        {
            let guard = self.shared.state.lock();
            if matches!(&*guard, State::Done(_)) {
                return false;
            }
        }
        if !(self.do_cancel)(may_interrupt) {
            return false;
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
        settle(&self.shared, Err(Error::Cancelled));
        true
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Done(_))
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl<T> Clone for DbFuture<T> {
    fn clone(&self) -> Self {
        DbFuture {
            shared: self.shared.clone(),
            do_cancel: self.do_cancel.clone(),
        }
    }
}

impl<T: Clone> Future for DbFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.shared.state.lock();
        match &mut *guard {
            State::Done(r) => Poll::Ready(clone_result(r)),
            State::Pending { waker, .. } => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> DbFuturePromise<T> {
    /// Settles the future with a successful value. Idempotent against double-settling: a second
    /// call returns `Err(Error::AlreadySettled)` rather than panicking, since losing this race is
    /// a recoverable programming error, not a crash.
    pub fn set_result(&self, value: T) -> Result<(), Error> {
        settle(&self.shared, Ok(value))
    }

    /// Settles the future with an error.
    pub fn set_error(&self, error: Error) -> Result<(), Error> {
        settle(&self.shared, Err(error))
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.state.lock(), State::Done(_))
    }
}

fn settle<T>(shared: &Arc<Shared<T>>, result: Result<T, Error>) -> Result<(), Error> {
    let (listeners, waker) = {
        let mut guard = shared.state.lock();
        if matches!(&*guard, State::Done(_)) {
            return Err(Error::AlreadySettled);
        }
        match std::mem::replace(&mut *guard, State::Done(result)) {
            State::Pending { listeners, waker } => (listeners, waker),
            State::Done(_) => unreachable!("checked above"),
        }
    };
    shared.settled.notify_all();
    if let Some(waker) = waker {
        waker.wake();
    }
    let guard = shared.state.lock();
    let State::Done(result) = &*guard else {
        unreachable!("just settled above")
    };
    for listener in listeners {
        listener(result);
    }
    Ok(())
}

fn clone_result<T: Clone>(r: &Result<T, Error>) -> Result<T, Error> {
    match r {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(clone_error(e)),
    }
}

fn clone_error(e: &Error) -> Error {
    // `Error` is not `Clone` (it wraps `std::io::Error` and friends); downstream listeners only
    // need the textual/variant shape, so settle on a lossless-enough re-derivation for the common
    // terminal kinds and fall back to a formatted protocol error otherwise.
    match e {
        Error::SessionClosed => Error::SessionClosed,
        Error::AlreadySettled => Error::AlreadySettled,
        Error::TransactionFailed => Error::TransactionFailed,
        Error::Cancelled => Error::Cancelled,
        Error::Timeout => Error::Timeout,
        Error::AlreadyInTransaction => Error::AlreadyInTransaction,
        Error::Auth(m) => Error::Auth(m.clone()),
        Error::Server { code, message } => Error::Server {
            code: code.clone(),
            message: message.clone(),
        },
        other => Error::Protocol(crate::error::ProtocolError::Invariant(other.to_string())),
    }
}

/// A [`DbFuture`] that additionally remembers which session produced it, so callers can route
/// cancellation or logging back to the owning connection.
pub struct DbSessionFuture<T> {
    inner: DbFuture<T>,
    session_id: u64,
}

impl<T> DbSessionFuture<T> {
    pub fn new(inner: DbFuture<T>, session_id: u64) -> Self {
        Self { inner, session_id }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn get(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        self.inner.get()
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<T, Error>
    where
        T: Clone,
    {
        self.inner.get_timeout(timeout)
    }

    pub fn add_listener(&self, listener: impl FnOnce(&Result<T, Error>) + Send + 'static) {
        self.inner.add_listener(listener)
    }

    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.inner.cancel(may_interrupt)
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}

impl<T: Clone> Future for DbSessionFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `inner` is not structurally pinned (it is `Unpin` -- `DbFuture` holds only
        // `Arc`s), so projecting a plain `&mut` out of the pinned self is sound.
        let this = unsafe { self.get_unchecked_mut() };
        Pin::new(&mut this.inner).poll(cx)
    }
}
