//! An async, non-blocking MySQL/PostgreSQL client built around a future/listener request
//! pipeline instead of a runtime-specific `async fn` per call.
//!
//! A [`Session`] (reached through a [`manager::Connection`]) accepts queries, updates and
//! transaction control without blocking the calling thread: each call returns a
//! [`future::DbSessionFuture`] that settles once the server responds, whether the caller waits on
//! it with `.get()`, registers a listener, or `.await`s it. One background task per session
//! (`transport::drive`) owns the socket and feeds decoded wire messages back into the pipeline.

mod config;
mod error;
mod future;
mod manager;
mod mysql;
mod ops;
mod postgres;
mod request;
mod session;
mod transaction;
mod transport;
mod types;
mod value;

pub use config::{Config, Protocol};
pub use error::{ConfigError, Error, ProtocolError};
pub use future::{DbFuture, DbFuturePromise, DbSessionFuture};
pub use manager::{Connection, MySqlConnection, MySqlConnectionManager, PgConnection, PgConnectionManager};
pub use request::QueryEventHandler;
pub use session::Session;
pub use types::SqlType;
pub use value::{Field, ResultSet, Row, UpdateResult, Value};
