//! The capability seam between the session core and a protocol's wire encoding.
//!
//! The original design abstracted an entire session behind a base class that each protocol
//! subclassed. Here the session core is a single generic `Session<P>` and `P` only needs to
//! supply this small, object-safe set of frame encoders — a trait, not a base class, so adding a
//! third protocol never touches `session.rs`.

use bytes::BytesMut;

use crate::error::Error;

/// Encodes the handful of frame shapes the session core needs to drive a request queue.
///
/// Every method appends to `out` rather than returning owned bytes, so a single reusable buffer
/// can be shared across a whole pipelined burst.
pub trait ProtocolOps: Send {
    fn encode_begin(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn encode_commit(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn encode_rollback(&mut self, out: &mut BytesMut) -> Result<(), Error>;
    fn encode_query(&mut self, sql: &str, out: &mut BytesMut) -> Result<(), Error>;
    fn encode_terminate(&mut self, out: &mut BytesMut) -> Result<(), Error>;
}
