//! Requests: the unit of work a session enqueues, pipelines, executes and settles.
//!
//! The original design let a request be parameterized over an arbitrary result type and an
//! arbitrary accumulator, with the session queue holding a heterogeneous mix of them. A FIFO
//! queue needs a single concrete element type, so here that generality is pushed down into
//! `TypedRequest<T>` (still fully generic over its accumulator) and type-erased behind the
//! object-safe `ErasedRequest` trait the session actually queues. The six request shapes the
//! specification calls out as a closed sum type are named by `RequestKind`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::Error;
use crate::future::{DbFuture, DbFuturePromise};
use crate::ops::ProtocolOps;
use crate::transaction::TransactionState;
use crate::value::{Field, ResultSet, UpdateResult, Value};

/// The closed set of operations a request can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Query,
    Update,
    Begin,
    Commit,
    Rollback,
    Close,
}

impl RequestKind {
    pub(crate) fn is_pipelinable_by_default(self) -> bool {
        matches!(self, RequestKind::Query | RequestKind::Update)
    }
}

/// What a request's thunk actually writes to the wire. Distinct from `RequestKind` only in that
/// `Query` and `Update` share an encoding (both are just "run this SQL").
pub(crate) enum Action {
    Query(String),
    Begin,
    Commit,
    Rollback,
    Terminate,
}

/// Receives the stream of callbacks a query's response produces, mutating an accumulator of type
/// `T` as it goes. `DefaultResultSetHandler` is the handler used by the convenience
/// `execute_query(sql)` entry point; callers may supply their own to stream into something else
/// entirely (a running aggregate, a channel, ...).
pub trait QueryEventHandler<T>: Send {
    fn start_fields(&mut self, _acc: &mut T) {}
    fn field(&mut self, _acc: &mut T, _field: Field) {}
    fn end_fields(&mut self, _acc: &mut T) {}
    fn start_results(&mut self, _acc: &mut T) {}
    fn start_row(&mut self, _acc: &mut T) {}
    fn value(&mut self, _acc: &mut T, _value: Value) {}
    fn end_row(&mut self, _acc: &mut T) {}
    fn end_results(&mut self, _acc: &mut T) {}
    fn exception(&mut self, _acc: &mut T, _err: &Error) {}
}

/// Builds a [`ResultSet`] out of the raw callback stream. This is what `execute_query` uses when
/// the caller doesn't supply their own handler.
#[derive(Default)]
pub struct DefaultResultSetHandler {
    current_row: Option<Vec<Value>>,
}

impl QueryEventHandler<ResultSet> for DefaultResultSetHandler {
    fn field(&mut self, acc: &mut ResultSet, field: Field) {
        acc.fields.push(field);
    }

    fn start_row(&mut self, _acc: &mut ResultSet) {
        self.current_row = Some(Vec::new());
    }

    fn value(&mut self, _acc: &mut ResultSet, value: Value) {
        if let Some(row) = self.current_row.as_mut() {
            row.push(value);
        }
    }

    fn end_row(&mut self, acc: &mut ResultSet) {
        if let Some(values) = self.current_row.take() {
            acc.rows.push(crate::value::Row { values });
        }
    }
}

/// Builds an [`UpdateResult`] from the command-complete tail of a response. Neither MySQL's OK
/// packet nor PostgreSQL's `CommandComplete` stream field/row callbacks for DML, so this handler
/// only needs `end_results`; the affected-row count and insert id are threaded in by the
/// protocol handler directly onto the accumulator before calling it, not via callbacks.
#[derive(Default)]
pub struct DefaultUpdateHandler;

impl QueryEventHandler<UpdateResult> for DefaultUpdateHandler {}

/// Type-erased operations the session core and protocol handlers need, independent of a
/// request's accumulator type.
pub(crate) trait ErasedRequest: Send + Sync {
    fn kind(&self) -> RequestKind;
    fn pipelinable(&self) -> bool;
    fn removable(&self) -> bool;
    fn is_executed(&self) -> bool;
    fn mark_executed(&self);
    fn is_cancelled(&self) -> bool;
    fn transaction(&self) -> Option<Arc<TransactionState>>;

    /// Writes this request's wire frame via `ops`, marking it executed. Returns `Err` if encoding
    /// failed, in which case the caller is responsible for calling `fail`.
    fn execute(&self, ops: &mut dyn ProtocolOps, out: &mut BytesMut) -> Result<(), Error>;

    /// Settles the request's future with `err` (idempotent: a second call is a no-op). Also
    /// marks the owning transaction, if any, as canceled.
    fn fail(&self, err: Error);

    fn start_fields(&self);
    fn field(&self, field: Field);
    fn end_fields(&self);
    fn start_results(&self);
    fn start_row(&self);
    fn value(&self, value: Value);
    fn end_row(&self);
    /// Ends the streaming phase and settles the future with the accumulator built so far.
    fn end_results(&self);
    /// Settles a non-query request (`Update`/`Begin`/`Commit`/`Rollback`/`Close`) successfully,
    /// recording `rows_affected`/`last_insert_id` when the protocol reports one.
    fn complete(&self, rows_affected: u64, last_insert_id: Option<u64>);
}

struct RequestCore {
    kind: RequestKind,
    action: Action,
    pipelinable: bool,
    removable: bool,
    executed: Arc<AtomicBool>,
    transaction: Option<Arc<TransactionState>>,
}

/// A request parameterized over its result/accumulator type `T`.
///
/// `T` is `ResultSet` for `execute_query`'s default path, `UpdateResult` for
/// `execute_update`/`Begin`/`Commit`/`Rollback`/`Close`, or anything a caller's own
/// `QueryEventHandler<T>` accumulates into.
pub(crate) struct TypedRequest<T> {
    core: RequestCore,
    future: DbFuture<T>,
    promise: DbFuturePromise<T>,
    accumulator: Mutex<Option<T>>,
    handler: Mutex<Box<dyn QueryEventHandler<T>>>,
}

impl<T: Clone + Send + 'static> TypedRequest<T> {
    /// `on_cancel_accepted`, if given, runs after a cancellation is accepted but before
    /// `do_cancel` reports `true` to the caller -- the session uses it to drop the request from
    /// the queue's effective membership and wake the pipeline back up (a cancelled, unexecuted
    /// request otherwise sits inert until something else happens to re-promote).
    pub(crate) fn new(
        kind: RequestKind,
        action: Action,
        pipelinable: bool,
        removable: bool,
        transaction: Option<Arc<TransactionState>>,
        accumulator: T,
        handler: Box<dyn QueryEventHandler<T>>,
        on_cancel_accepted: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> (Arc<Self>, DbFuture<T>) {
        let transaction_for_cancel = transaction.clone();
        let executed = Arc::new(AtomicBool::new(false));
        let executed_for_cancel = executed.clone();
        let (future, promise) = DbFuture::new_pair(move |_may_interrupt| {
            // A request already handed to the wire cannot be interrupted -- there is no
            // "attention" signal this crate sends to either backend (see the Non-goals). A
            // request enrolled in a transaction is also rejected here even when still queued:
            // transaction-member cancellation is transitive and handled entirely by
            // `Session::rollback`, not by cancelling individual members.
            if executed_for_cancel.load(Ordering::SeqCst) {
                return false;
            }
            if transaction_for_cancel.is_some() {
                return false;
            }
            if let Some(on_cancel_accepted) = &on_cancel_accepted {
                on_cancel_accepted();
            }
            true
        });
        let request = Arc::new(Self {
            core: RequestCore {
                kind,
                action,
                pipelinable,
                removable,
                executed,
                transaction,
            },
            future: future.clone(),
            promise,
            accumulator: Mutex::new(Some(accumulator)),
            handler: Mutex::new(handler),
        });
        (request, future)
    }

    fn settle_ok(&self) {
        if let Some(acc) = self.accumulator.lock().take() {
            let _ = self.promise.set_result(acc);
        }
    }
}

impl<T: Clone + Send + 'static> ErasedRequest for TypedRequest<T> {
    fn kind(&self) -> RequestKind {
        self.core.kind
    }

    fn pipelinable(&self) -> bool {
        self.core.pipelinable
    }

    fn removable(&self) -> bool {
        self.core.removable
    }

    fn is_executed(&self) -> bool {
        self.core.executed.load(Ordering::SeqCst)
    }

    fn mark_executed(&self) {
        self.core.executed.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.future.is_cancelled()
    }

    fn transaction(&self) -> Option<Arc<TransactionState>> {
        self.core.transaction.clone()
    }

    fn execute(&self, ops: &mut dyn ProtocolOps, out: &mut BytesMut) -> Result<(), Error> {
        let result = match &self.core.action {
            Action::Query(sql) => ops.encode_query(sql, out),
            Action::Begin => {
                let res = ops.encode_begin(out);
                if res.is_ok() {
                    if let Some(txn) = &self.core.transaction {
                        txn.started.store(true, Ordering::SeqCst);
                    }
                }
                res
            }
            Action::Commit => {
                if self
                    .core
                    .transaction
                    .as_ref()
                    .is_some_and(|t| t.is_canceled())
                {
                    ops.encode_rollback(out)
                } else {
                    ops.encode_commit(out)
                }
            }
            Action::Rollback => ops.encode_rollback(out),
            Action::Terminate => ops.encode_terminate(out),
        };
        self.mark_executed();
        result
    }

    fn fail(&self, err: Error) {
        if let Some(txn) = &self.core.transaction {
            txn.mark_canceled();
        }
        let mut handler = self.handler.lock();
        if let Some(mut acc) = self.accumulator.lock().take() {
            handler.exception(&mut acc, &err);
        }
        let _ = self.promise.set_error(err);
    }

    fn start_fields(&self) {
        let mut handler = self.handler.lock();
        if let Some(acc) = self.accumulator.lock().as_mut() {
            handler.start_fields(acc);
        }
    }

    fn field(&self, field: Field) {
        let mut handler = self.handler.lock();
        if let Some(acc) = self.accumulator.lock().as_mut() {
            handler.field(acc, field);
        }
    }

    fn end_fields(&self) {
        let mut handler = self.handler.lock();
        if let Some(acc) = self.accumulator.lock().as_mut() {
            handler.end_fields(acc);
        }
    }

    fn start_results(&self) {
        let mut handler = self.handler.lock();
        if let Some(acc) = self.accumulator.lock().as_mut() {
            handler.start_results(acc);
        }
    }

    fn start_row(&self) {
        let mut handler = self.handler.lock();
        if let Some(acc) = self.accumulator.lock().as_mut() {
            handler.start_row(acc);
        }
    }

    fn value(&self, value: Value) {
        let mut handler = self.handler.lock();
        if let Some(acc) = self.accumulator.lock().as_mut() {
            handler.value(acc, value);
        }
    }

    fn end_row(&self) {
        let mut handler = self.handler.lock();
        if let Some(acc) = self.accumulator.lock().as_mut() {
            handler.end_row(acc);
        }
    }

    fn end_results(&self) {
        {
            let mut handler = self.handler.lock();
            if let Some(acc) = self.accumulator.lock().as_mut() {
                handler.end_results(acc);
            }
        }
        self.settle_ok();
    }

    fn complete(&self, rows_affected: u64, last_insert_id: Option<u64>) {
        // Requests whose accumulator is `UpdateResult` get the counts written in; requests whose
        // accumulator is `()` (Begin/Commit/Rollback/Close) simply settle.
        if let Some(acc) = self.accumulator.lock().as_mut() {
            if let Some(update) = (acc as &mut dyn std::any::Any).downcast_mut::<UpdateResult>() {
                update.rows_affected = rows_affected;
                update.last_insert_id = last_insert_id;
            }
        }
        self.settle_ok();
    }
}
