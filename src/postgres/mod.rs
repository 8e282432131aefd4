//! PostgreSQL frontend/backend protocol v3.0: framing, MD5 authentication, the extended-query
//! frame sequence, and the protocol handler that drives a [`crate::session::Session`].

mod auth;
mod codec;
mod handler;
mod messages;
mod ops;

pub(crate) use handler::PgHandler;
pub(crate) use messages::encode_startup;
pub(crate) use ops::PgOps;
