//! Connection managers (§4.5): own the outbound connector and credentials, track the set of
//! live sessions, and mint new ones. One implementation per protocol variant, sharing the
//! `Config` builder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;
use crate::error::Error;
use crate::future::{DbFuture, DbSessionFuture};
use crate::mysql::{MySqlHandler, MySqlOps};
use crate::ops::ProtocolOps;
use crate::postgres::{self, PgHandler, PgOps};
use crate::session::Session;
use crate::transport::{self, ProtocolDriver};
use crate::value::{ResultSet, UpdateResult};

/// A live session plus the user-facing facade the specification calls `Connection`.
pub struct Connection<P: ProtocolOps + 'static> {
    session: Arc<Session<P>>,
}

impl<P: ProtocolOps + 'static> Connection<P> {
    pub fn execute_query(&self, sql: impl Into<String>) -> DbSessionFuture<ResultSet> {
        self.session.execute_query(sql)
    }

    pub fn execute_query_with<T, H>(&self, sql: impl Into<String>, handler: H, accumulator: T) -> DbSessionFuture<T>
    where
        T: Clone + Send + 'static,
        H: crate::request::QueryEventHandler<T> + 'static,
    {
        self.session.execute_query_with(sql, handler, accumulator)
    }

    pub fn execute_update(&self, sql: impl Into<String>) -> DbSessionFuture<UpdateResult> {
        self.session.execute_update(sql)
    }

    pub fn begin_transaction(&self) -> Result<(), Error> {
        self.session.begin_transaction()
    }

    pub fn commit(&self) -> DbSessionFuture<UpdateResult> {
        self.session.commit()
    }

    pub fn rollback(&self) -> DbSessionFuture<UpdateResult> {
        self.session.rollback()
    }

    pub fn close(&self, immediate: bool) -> DbSessionFuture<UpdateResult> {
        self.session.close(immediate)
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.session.is_in_transaction()
    }

    pub fn set_pipelining_enabled(&self, enabled: bool) {
        self.session.set_pipelining_enabled(enabled)
    }
}

impl<P: ProtocolOps + 'static> Clone for Connection<P> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}

pub type MySqlConnection = Connection<MySqlOps>;
pub type PgConnection = Connection<PgOps>;

/// Spawns the transport driver task for a freshly-connected `stream`, registers the session
/// (weakly -- the manager tracks liveness, the caller's `Connection` owns it) and deregisters it
/// once the driver loop exits.
fn spawn_session<P, D>(
    stream: TcpStream,
    ops: P,
    driver: D,
    sessions: Arc<DashMap<u64, Weak<Session<P>>>>,
    after_open: impl FnOnce(&Arc<Session<P>>),
) -> Arc<Session<P>>
where
    P: ProtocolOps + 'static,
    D: ProtocolDriver<P>,
{
    let (tx, rx) = mpsc::unbounded_channel::<BytesMut>();
    let session = Session::new(ops, tx);
    sessions.insert(session.id(), Arc::downgrade(&session));
    after_open(&session);
    let drive_session = session.clone();
    let id = session.id();
    tokio::spawn(async move {
        transport::drive(stream, drive_session, driver, rx).await;
        sessions.remove(&id);
    });
    session
}

macro_rules! connection_manager {
    ($name:ident, $ops:ty, $handler:ty, $new_ops:expr, $after_open:expr) => {
        pub struct $name {
            config: Config,
            sessions: Arc<DashMap<u64, Weak<Session<$ops>>>>,
            closed: AtomicBool,
        }

        impl $name {
            pub fn new(config: Config) -> Arc<Self> {
                Arc::new(Self {
                    config,
                    sessions: Arc::new(DashMap::new()),
                    closed: AtomicBool::new(false),
                })
            }

            /// Opens a new session. Cancelling the returned future before the TCP connection
            /// completes tears the socket down immediately (§4.5).
            pub fn connect(self: &Arc<Self>) -> DbFuture<Connection<$ops>> {
                if self.closed.load(Ordering::SeqCst) {
                    return DbFuture::ready(Err(Error::SessionClosed));
                }
                let (abort_tx, abort_rx) = oneshot::channel::<()>();
                let abort_tx = Arc::new(Mutex::new(Some(abort_tx)));
                let abort_tx_for_cancel = abort_tx.clone();
                let (future, promise) = DbFuture::new_pair(move |_may_interrupt| {
                    if let Some(tx) = abort_tx_for_cancel.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    true
                });

                let config = self.config.clone();
                let sessions = self.sessions.clone();
                let (connect_future, connect_promise) = DbFuture::<()>::new_pair(|_| false);
                tokio::spawn(async move {
                    let addr = format!("{}:{}", config.host, config.port);
                    let connected = tokio::select! {
                        biased;
                        _ = abort_rx => {
                            let _ = promise.set_error(Error::Cancelled);
                            return;
                        }
                        result = TcpStream::connect(&addr) => result,
                    };
                    let stream = match connected {
                        Ok(s) => s,
                        Err(e) => {
                            let _ = promise.set_error(Error::Io(e));
                            return;
                        }
                    };
                    let ops = $new_ops(&config);
                    let handler = <$handler>::new(connect_promise);
                    let session = spawn_session(stream, ops, handler, sessions, |session| {
                        $after_open(session, &config)
                    });
                    connect_future.add_listener(move |result| match result {
                        Ok(()) => {
                            let _ = promise.set_result(Connection { session });
                        }
                        Err(_) => {
                            // The error already reached the connect-future via the handler; a
                            // clone would require `Error: Clone`, so hand back a fresh
                            // `SessionClosed` to whichever side lost the settle race.
                            let _ = promise.set_error(Error::SessionClosed);
                        }
                    });
                });
                future
            }

            /// Closes every currently-live session. Deferred manager close is unspecified by the
            /// source (§9 Open Questions); this implementation stops accepting new `connect()`
            /// calls immediately and asks every live session to close with the same `immediate`
            /// flag, without waiting for them to drain.
            pub fn close(&self, immediate: bool) -> DbFuture<()> {
                self.closed.store(true, Ordering::SeqCst);
                for entry in self.sessions.iter() {
                    if let Some(session) = entry.value().upgrade() {
                        session.close(immediate);
                    }
                }
                DbFuture::ready(Ok(()))
            }

            pub fn live_session_count(&self) -> usize {
                self.sessions.len()
            }
        }
    };
}

connection_manager!(
    MySqlConnectionManager,
    MySqlOps,
    MySqlHandler,
    |config: &Config| MySqlOps::new(config.username.clone(), config.password.clone().into_bytes(), Some(config.database.clone())),
    |session: &Arc<Session<MySqlOps>>, config: &Config| {
        session.set_pipelining_enabled(config.pipelining);
    }
);

connection_manager!(
    PgConnectionManager,
    PgOps,
    PgHandler,
    |config: &Config| PgOps::new(config.username.clone(), config.password.clone(), config.database.clone()),
    |session: &Arc<Session<PgOps>>, config: &Config| {
        session.set_pipelining_enabled(config.pipelining);
        let mut out = BytesMut::new();
        postgres::encode_startup(&config.username, &config.database, &mut out);
        session.send_raw(out);
    }
);
