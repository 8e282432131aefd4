//! Crate-wide error taxonomy.
//!
//! Mirrors the layering used throughout the protocol and session code: a root [`Error`] enum
//! with `#[from]` conversions from a handful of focused sub-error enums, so call sites can use
//! `?` freely while callers that care can still match on the precise kind.

use std::fmt;

/// Top level error type returned from every public entry point in this crate.
#[derive(thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("operation attempted on a closed session")]
    SessionClosed,

    #[error("future was already settled")]
    AlreadySettled,

    #[error("transaction has failed and rejects further operations")]
    TransactionFailed,

    #[error("future was cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("begin_transaction called while already in a transaction")]
    AlreadyInTransaction,
}

impl Error {
    pub(crate) fn unexpected_message(what: &str) -> Self {
        Error::Protocol(ProtocolError::UnexpectedMessage(what.to_string()))
    }
}

/// Errors raised while parsing a connection URL or assembling a [`crate::Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("connection url is missing a scheme, expected `dbwire:<mysql|postgres>://...`")]
    MissingScheme,
    #[error("unknown protocol {0:?}, expected `mysql` or `postgres`")]
    UnknownProtocol(String),
    #[error("connection url is missing a host")]
    MissingHost,
    #[error("connection url is malformed: {0}")]
    Malformed(String),
    #[error("missing username")]
    MissingUserName,
    #[error("missing password")]
    MissingPassword,
}

/// Errors raised by the codec / protocol-handler layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unexpected message in current state: {0}")]
    UnexpectedMessage(String),
    #[error("unsupported column type: {0}")]
    UnsupportedColumnType(String),
    #[error("authentication method not supported: {0}")]
    AuthMethodNotSupported(String),
    #[error("length-encoded integer has its top bit set, which is reserved")]
    InvalidLengthEncodedInteger,
    #[error("decoder invariant violated: {0}")]
    Invariant(String),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
