//! Exercises the request-pipeline core directly, with a [`MockOps`] standing in for real wire
//! encoding so frame order can be asserted without a socket.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::*;

/// Records each encoded frame as a readable tag instead of real protocol bytes, and lets a test
/// flip `fail_next_query` to exercise the "thunk settles synchronously" enqueue branch.
#[derive(Default)]
struct MockOps {
    fail_next_query: bool,
}

impl ProtocolOps for MockOps {
    fn encode_begin(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        out.extend_from_slice(b"BEGIN");
        Ok(())
    }

    fn encode_commit(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        out.extend_from_slice(b"COMMIT");
        Ok(())
    }

    fn encode_rollback(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        out.extend_from_slice(b"ROLLBACK");
        Ok(())
    }

    fn encode_query(&mut self, sql: &str, out: &mut BytesMut) -> Result<(), Error> {
        if self.fail_next_query {
            self.fail_next_query = false;
            return Err(Error::unexpected_message("mock query failure"));
        }
        out.extend_from_slice(sql.as_bytes());
        Ok(())
    }

    fn encode_terminate(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        out.extend_from_slice(b"TERMINATE");
        Ok(())
    }
}

fn new_session() -> (Arc<Session<MockOps>>, UnboundedReceiver<BytesMut>) {
    let _ = env_logger::try_init();
    let (tx, rx) = mpsc::unbounded_channel();
    (Session::new(MockOps::default(), tx), rx)
}

fn drain_frames(rx: &mut UnboundedReceiver<BytesMut>) -> Vec<String> {
    let mut frames = Vec::new();
    while let Ok(bytes) = rx.try_recv() {
        frames.push(String::from_utf8(bytes.to_vec()).unwrap());
    }
    frames
}

#[test]
fn pipelined_updates_preserve_issue_order() {
    let (session, mut rx) = new_session();
    let futures: Vec<_> = (1..=5)
        .map(|i| session.execute_update(format!("INSERT {i}")))
        .collect();

    // The first update becomes active and is written immediately; once it is active and
    // pipelinable, `promote_locked`'s forward walk writes every pipelinable successor's frame
    // too, so all five should already be on the wire before any response arrives.
    assert_eq!(
        drain_frames(&mut rx),
        vec!["INSERT 1", "INSERT 2", "INSERT 3", "INSERT 4", "INSERT 5"]
    );

    for fut in &futures {
        assert!(!fut.is_done());
    }

    for i in 1..=5 {
        session.active_request().unwrap().complete(1, None);
        session.on_active_settled();
        assert_eq!(futures[i - 1].get().unwrap().rows_affected, 1);
    }
}

#[test]
fn transaction_begin_is_enqueued_once() {
    let (session, mut rx) = new_session();
    session.begin_transaction().unwrap();
    let first = session.execute_update("INSERT a");
    let second = session.execute_update("INSERT b");

    // BEGIN precedes both statements; pipelining means all three land on the wire up front.
    assert_eq!(drain_frames(&mut rx), vec!["BEGIN", "INSERT a", "INSERT b"]);

    session.active_request().unwrap().complete(0, None); // BEGIN settles
    session.on_active_settled();
    session.active_request().unwrap().complete(1, None); // INSERT a settles
    session.on_active_settled();
    session.active_request().unwrap().complete(1, None); // INSERT b settles
    session.on_active_settled();

    assert_eq!(first.get().unwrap().rows_affected, 1);
    assert_eq!(second.get().unwrap().rows_affected, 1);

    let commit = session.commit();
    assert_eq!(drain_frames(&mut rx), vec!["COMMIT"]);
    session.active_request().unwrap().complete(0, None);
    session.on_active_settled();
    assert!(commit.get().is_ok());
}

#[test]
fn begin_then_rollback_with_no_members_round_trips_both() {
    let (session, mut rx) = new_session();
    session.begin_transaction().unwrap();
    let rollback = session.rollback();
    // BEGIN was scheduled (`begin_transaction` alone does not schedule it, only a transactional
    // enqueue does) -- with nothing ever enqueued, `begin_scheduled` is still false, so rollback
    // completes immediately with no server round trip at all.
    assert!(drain_frames(&mut rx).is_empty());
    assert!(rollback.get().is_ok());
    assert!(!session.is_in_transaction());
}

#[test]
fn failed_member_forces_commit_to_degrade_to_rollback() {
    let (session, mut rx) = new_session();
    session.begin_transaction().unwrap();
    let bad = session.execute_update("BAD SQL");
    drain_frames(&mut rx); // BEGIN, BAD SQL

    session.active_request().unwrap().complete(0, None); // BEGIN settles
    session.on_active_settled();
    session.active_request().unwrap().fail(Error::Server {
        code: "42601".into(),
        message: "syntax error".into(),
    });
    session.on_active_settled();
    assert!(matches!(bad.get(), Err(Error::Server { .. })));

    let also_bad = session.execute_update("SELECT 1");
    assert!(matches!(also_bad.get(), Err(Error::TransactionFailed)));

    let commit = session.commit();
    assert_eq!(drain_frames(&mut rx), vec!["ROLLBACK"]);
    session.active_request().unwrap().complete(0, None);
    session.on_active_settled();
    assert!(commit.get().is_ok());
}

#[test]
fn rollback_cancels_outstanding_members() {
    let (session, mut rx) = new_session();
    // Disabling the toggle keeps a request enqueued behind BEGIN from being eagerly pipelined,
    // so it is still genuinely un-executed (not merely un-settled) when rollback runs.
    session.set_pipelining_enabled(false);
    session.begin_transaction().unwrap();
    let member = session.execute_update("INSERT c");
    assert_eq!(drain_frames(&mut rx), vec!["BEGIN"]);

    // `member` never made it to the wire, so rollback removes it from the queue outright and
    // fails its future locally -- no server round trip for it at all.
    let rollback = session.rollback();
    assert!(matches!(member.get(), Err(Error::TransactionFailed)));
    assert!(drain_frames(&mut rx).is_empty());

    // ROLLBACK itself waits behind BEGIN, which is still the active request.
    session.active_request().unwrap().complete(0, None); // BEGIN settles
    session.on_active_settled();
    assert_eq!(drain_frames(&mut rx), vec!["ROLLBACK"]);

    session.active_request().unwrap().complete(0, None);
    session.on_active_settled();
    assert!(rollback.get().is_ok());
}

#[test]
fn cancel_after_pipelined_execution_is_rejected() {
    let (session, mut rx) = new_session();
    let first = session.execute_update("INSERT first");
    let second = session.execute_update("INSERT second");
    assert_eq!(drain_frames(&mut rx), vec!["INSERT first", "INSERT second"]);

    // Both already pipelined onto the wire -- cancelling a request that has already executed must
    // be rejected, matching "cannot cancel an in-flight server round trip".
    assert!(!second.cancel(false));

    session.active_request().unwrap().complete(1, None);
    session.on_active_settled();
    assert_eq!(first.get().unwrap().rows_affected, 1);
}

#[test]
fn cancel_unexecuted_request_is_accepted_and_promotes() {
    let (session, mut rx) = new_session();
    session.set_pipelining_enabled(false);
    let first = session.execute_update("INSERT first");
    let second = session.execute_update("INSERT second");
    // Pipelining disabled: only the active request's frame is on the wire.
    assert_eq!(drain_frames(&mut rx), vec!["INSERT first"]);

    assert!(second.cancel(false));
    assert!(matches!(second.get(), Err(Error::Cancelled)));

    session.active_request().unwrap().complete(1, None);
    session.on_active_settled();
    assert!(drain_frames(&mut rx).is_empty()); // cancelled request is skipped, not written
    assert!(first.get().is_ok());
}

#[test]
fn enqueue_error_settles_synchronously_and_promotes_next() {
    let (session, mut rx) = new_session();
    session.set_pipelining_enabled(false);
    session.with_ops(|ops| ops.fail_next_query = true);
    let bad = session.execute_update("BAD");
    let good = session.execute_update("GOOD");

    // `bad`'s thunk fails during `promote_locked`'s initial execute; the loop moves on to `good`
    // without any external trigger.
    assert_eq!(drain_frames(&mut rx), vec!["GOOD"]);
    assert!(bad.is_done());
    assert!(matches!(bad.get(), Err(_)));

    session.active_request().unwrap().complete(1, None);
    session.on_active_settled();
    assert!(good.get().is_ok());
}

#[test]
fn immediate_close_is_idempotent_and_fails_pending_work() {
    let (session, mut rx) = new_session();
    session.set_pipelining_enabled(false);
    let active = session.execute_update("ACTIVE");
    let queued = session.execute_update("STILL QUEUED");
    assert_eq!(drain_frames(&mut rx), vec!["ACTIVE"]);

    // `isClosed` flips true the instant close is requested, well before the in-flight `active`
    // request has a chance to settle.
    let close1 = session.close(true);
    assert!(matches!(queued.get(), Err(Error::SessionClosed)));
    assert!(session.is_closed());
    assert!(!active.is_done());

    // A second immediate close while the first is still draining must not re-drain the queue --
    // that queue now holds close1's own not-yet-promoted `Terminate` request, and draining it
    // again would fail that request out from under the first caller. It settles immediately as a
    // no-op instead.
    let close2 = session.close(true);
    assert!(session.is_closed());
    assert!(close2.get().is_ok());

    session.active_request().unwrap().complete(1, None); // "ACTIVE" finally settles
    session.on_active_settled();
    assert!(active.get().is_ok());
    assert_eq!(drain_frames(&mut rx), vec!["TERMINATE"]);

    session.active_request().unwrap().complete(0, None); // close1's TERMINATE settles
    session.on_active_settled();

    assert!(close1.get().is_ok());
    assert!(session.is_closed());
}

#[test]
fn deferred_close_then_cancel_unlcoses_the_session() {
    let (session, mut rx) = new_session();
    session.set_pipelining_enabled(false);
    // An active request ahead of the close keeps the close request genuinely queued and
    // unexecuted -- cancelling an already-executed request is always rejected, so this is the
    // only way to actually exercise `unclose_on_cancel` rather than the executed-request guard.
    let active = session.execute_update("ACTIVE");
    assert_eq!(drain_frames(&mut rx), vec!["ACTIVE"]);

    let close_fut = session.close(false);
    assert!(session.is_closed());

    assert!(close_fut.cancel(false));
    assert!(!session.is_closed());

    // The session accepts new work again, queued behind the still-active request.
    let fut = session.execute_update("INSERT after unclose");
    session.active_request().unwrap().complete(1, None); // ACTIVE settles
    session.on_active_settled();
    assert_eq!(drain_frames(&mut rx), vec!["INSERT after unclose"]);

    session.active_request().unwrap().complete(1, None);
    session.on_active_settled();
    assert!(fut.get().is_ok());
    assert!(active.get().is_ok());
}

#[test]
fn enqueue_after_close_is_rejected() {
    let (session, _rx) = new_session();
    session.close(true);
    let fut = session.execute_update("TOO LATE");
    assert!(matches!(fut.get(), Err(Error::SessionClosed)));
}

#[test]
fn fail_all_settles_active_and_queued_requests() {
    let (session, mut rx) = new_session();
    session.set_pipelining_enabled(false);
    let active = session.execute_update("ACTIVE");
    let queued = session.execute_update("QUEUED");
    drain_frames(&mut rx);

    session.fail_all(|| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")));
    assert!(matches!(active.get(), Err(Error::Io(_))));
    assert!(matches!(queued.get(), Err(Error::Io(_))));
    assert!(session.is_closed());
}
