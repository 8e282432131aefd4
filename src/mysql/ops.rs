//! The MySQL `ProtocolOps` capability: everything the session core needs to write a frame.

use bytes::{BufMut, BytesMut};

use crate::error::Error;
use crate::mysql::codec::write_packet;
use crate::ops::ProtocolOps;

/// COM_QUERY: a single-statement text-protocol query, used for user SQL as well as the
/// transaction keywords (MySQL has no prepared `BEGIN`/`COMMIT`/`ROLLBACK` worth caching).
const COM_QUERY: u8 = 0x03;
/// COM_QUIT: tells the server this connection is going away.
const COM_QUIT: u8 = 0x01;

pub struct MySqlOps {
    pub(crate) username: String,
    pub(crate) password: Vec<u8>,
    pub(crate) database: Option<String>,
}

impl MySqlOps {
    pub(crate) fn new(username: String, password: Vec<u8>, database: Option<String>) -> Self {
        Self {
            username,
            password,
            database,
        }
    }
}

impl ProtocolOps for MySqlOps {
    fn encode_begin(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.encode_query("BEGIN", out)
    }

    fn encode_commit(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.encode_query("COMMIT", out)
    }

    fn encode_rollback(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        self.encode_query("ROLLBACK", out)
    }

    fn encode_query(&mut self, sql: &str, out: &mut BytesMut) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(sql.len() + 1);
        payload.put_u8(COM_QUERY);
        payload.put_slice(sql.as_bytes());
        // Every command packet starts a fresh sequence at 0; MySQL does not carry sequence ids
        // across independent commands the way a single multi-packet round trip does.
        write_packet(0, &payload, out)
    }

    fn encode_terminate(&mut self, out: &mut BytesMut) -> Result<(), Error> {
        write_packet(0, &[COM_QUIT], out)
    }
}
