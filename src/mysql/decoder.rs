//! The MySQL response decoder state machine (§4.3): `CONNECTING → RESPONSE → FIELD →
//! FIELD_EOF → ROW → RESPONSE → ...`.
//!
//! One packet in, at most one decoded message out; the driver loop keeps calling
//! [`Decoder::decode_one`] until it returns `Ok(None)` (buffer holds only a partial packet).

use bytes::BytesMut;

use crate::error::Error;
use crate::mysql::codec::try_read_packet;
use crate::mysql::messages::{
    parse_column_definition, parse_generic_response, parse_handshake, GenericResponse, Handshake,
};
use crate::value::Field;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EofKind {
    Field,
    Row,
}

pub(crate) enum Decoded {
    Greeting(Handshake),
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
    },
    Err {
        code: String,
        message: String,
    },
    ResultSetHeader {
        column_count: u64,
    },
    Field(Field),
    Eof(EofKind),
    /// A row's raw payload, not yet narrowed to typed [`crate::value::Value`]s -- that requires
    /// knowing the active request's field list, which the decoder does not track.
    Row(BytesMut),
}

enum State {
    Connecting,
    Response,
    Field { remaining: u64 },
    FieldEof,
    Row,
}

/// Per-session decoder state. Lives for the lifetime of the connection, not one packet.
pub(crate) struct Decoder {
    state: State,
}

impl Decoder {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Connecting,
        }
    }

    /// Strips and decodes exactly one packet from `buf`, if a complete one is buffered.
    pub(crate) fn decode_one(&mut self, buf: &mut BytesMut) -> Result<Option<Decoded>, Error> {
        let Some((_seq, payload)) = try_read_packet(buf) else {
            return Ok(None);
        };
        match self.state {
            State::Connecting => {
                let greeting = parse_handshake(payload)?;
                self.state = State::Response;
                Ok(Some(Decoded::Greeting(greeting)))
            }
            State::Response => self.decode_response(payload),
            State::Field { remaining } => self.decode_field(payload, remaining),
            State::FieldEof => self.decode_field_eof(payload),
            State::Row => self.decode_row(payload),
        }
    }

    fn decode_response(&mut self, payload: BytesMut) -> Result<Option<Decoded>, Error> {
        match parse_generic_response(payload)? {
            GenericResponse::Ok {
                affected_rows,
                last_insert_id,
            } => Ok(Some(Decoded::Ok {
                affected_rows,
                last_insert_id,
            })),
            GenericResponse::Err { code, message } => Ok(Some(Decoded::Err { code, message })),
            GenericResponse::ResultSetHeader { column_count } => {
                self.state = if column_count == 0 {
                    State::FieldEof
                } else {
                    State::Field {
                        remaining: column_count,
                    }
                };
                Ok(Some(Decoded::ResultSetHeader { column_count }))
            }
        }
    }

    fn decode_field(&mut self, payload: BytesMut, remaining: u64) -> Result<Option<Decoded>, Error> {
        let field = parse_column_definition(payload)?;
        self.state = if remaining > 1 {
            State::Field {
                remaining: remaining - 1,
            }
        } else {
            State::FieldEof
        };
        Ok(Some(Decoded::Field(field)))
    }

    fn decode_field_eof(&mut self, payload: BytesMut) -> Result<Option<Decoded>, Error> {
        self.expect_eof_marker(&payload)?;
        self.state = State::Row;
        Ok(Some(Decoded::Eof(EofKind::Field)))
    }

    fn decode_row(&mut self, payload: BytesMut) -> Result<Option<Decoded>, Error> {
        if payload.first() == Some(&0xFE) {
            self.state = State::Response;
            return Ok(Some(Decoded::Eof(EofKind::Row)));
        }
        Ok(Some(Decoded::Row(payload)))
    }

    fn expect_eof_marker(&self, payload: &BytesMut) -> Result<(), Error> {
        if payload.first() != Some(&0xFE) {
            return Err(Error::Protocol(crate::error::ProtocolError::Invariant(
                "expected EOF marker (0xFE) while transitioning out of FIELD state".into(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bytes::BufMut;

    use super::*;
    use crate::mysql::codec::write_packet;

    fn push_packet(wire: &mut BytesMut, seq: u8, payload: &[u8]) {
        write_packet(seq, payload, wire).unwrap();
    }

    fn greeting_payload() -> BytesMut {
        let mut p = BytesMut::new();
        p.put_u8(10); // protocol version
        p.put_slice(b"5.7.0\0");
        p.put_u32_le(1); // connection id
        p.put_slice(b"AUTHDAT1"); // auth-plugin-data part 1
        p.put_u8(0); // filler
        p.put_u16_le(0); // caps_lower: no CLIENT_SECURE_CONNECTION, keep this simple
        p.put_u8(0x2D); // charset
        p.put_u16_le(2); // status flags
        p.put_u16_le(0); // caps_upper
        p.put_u8(0); // auth_plugin_data_len
        p.put_bytes(0, 10); // reserved
        p.put_slice(b"mysql_native_password\0");
        p
    }

    fn column_def_payload(name: &str, type_id: u8) -> BytesMut {
        let mut p = BytesMut::new();
        for _ in 0..4 {
            p.put_u8(0); // catalog/schema/table/org_table, all empty
        }
        p.put_u8(name.len() as u8);
        p.put_slice(name.as_bytes());
        p.put_u8(0); // org_name, empty
        p.put_u8(0x0C); // fixed-length fields marker
        p.put_u16_le(0x21); // charset
        p.put_u32_le(10); // column length
        p.put_u8(type_id);
        p.put_u16_le(0); // flags
        p.put_u8(0); // decimals
        p.put_u16_le(0); // filler
        p
    }

    #[test]
    fn decodes_a_greeting_then_falls_through_to_response_state() {
        let mut decoder = Decoder::new();
        let mut wire = BytesMut::new();
        push_packet(&mut wire, 0, &greeting_payload());

        match decoder.decode_one(&mut wire).unwrap().unwrap() {
            Decoded::Greeting(h) => {
                assert_eq!(h.auth_plugin_data, b"AUTHDAT1");
                assert_eq!(h.auth_plugin_name, "mysql_native_password");
            }
            _ => panic!("expected a greeting"),
        }
        assert!(wire.is_empty());

        // Still in RESPONSE state, so a bare OK packet decodes as Decoded::Ok next.
        let mut wire = BytesMut::new();
        push_packet(&mut wire, 1, &[0x00, 0x00, 0x00]);
        assert!(matches!(
            decoder.decode_one(&mut wire).unwrap().unwrap(),
            Decoded::Ok { affected_rows: 0, last_insert_id: 0 }
        ));
    }

    #[test]
    fn walks_a_full_result_set_through_every_state() {
        let mut decoder = Decoder::new();
        let mut wire = BytesMut::new();
        push_packet(&mut wire, 0, &greeting_payload());
        decoder.decode_one(&mut wire).unwrap();

        let mut wire = BytesMut::new();
        push_packet(&mut wire, 1, &[0x02]); // two columns
        assert!(matches!(
            decoder.decode_one(&mut wire).unwrap().unwrap(),
            Decoded::ResultSetHeader { column_count: 2 }
        ));

        let mut wire = BytesMut::new();
        push_packet(&mut wire, 2, &column_def_payload("id", 0x03));
        match decoder.decode_one(&mut wire).unwrap().unwrap() {
            Decoded::Field(f) => assert_eq!(f.name, "id"),
            _ => panic!("expected a field"),
        }

        let mut wire = BytesMut::new();
        push_packet(&mut wire, 3, &column_def_payload("name", 0xFD));
        assert!(matches!(decoder.decode_one(&mut wire).unwrap().unwrap(), Decoded::Field(_)));

        // The second field's column count hit zero, so the next packet is the field-terminating
        // EOF rather than a third column definition.
        let mut wire = BytesMut::new();
        push_packet(&mut wire, 4, &[0xFE, 0, 0, 0, 0]);
        assert!(matches!(
            decoder.decode_one(&mut wire).unwrap().unwrap(),
            Decoded::Eof(EofKind::Field)
        ));

        let mut wire = BytesMut::new();
        push_packet(&mut wire, 5, b"\x011");
        assert!(matches!(decoder.decode_one(&mut wire).unwrap().unwrap(), Decoded::Row(_)));

        let mut wire = BytesMut::new();
        push_packet(&mut wire, 6, &[0xFE, 0, 0, 0, 0]);
        assert!(matches!(
            decoder.decode_one(&mut wire).unwrap().unwrap(),
            Decoded::Eof(EofKind::Row)
        ));

        // Back in RESPONSE state: a second query's OK packet decodes cleanly.
        let mut wire = BytesMut::new();
        push_packet(&mut wire, 7, &[0x00, 0x01, 0x00]);
        assert!(matches!(
            decoder.decode_one(&mut wire).unwrap().unwrap(),
            Decoded::Ok { affected_rows: 1, .. }
        ));
    }

    #[test]
    fn malformed_packet_surfaces_a_protocol_error() {
        let mut decoder = Decoder::new();
        let mut wire = BytesMut::new();
        push_packet(&mut wire, 0, &[]); // empty handshake payload
        assert!(decoder.decode_one(&mut wire).is_err());
    }

    #[test]
    fn decode_one_returns_none_on_a_partial_packet() {
        let mut decoder = Decoder::new();
        let mut wire = BytesMut::from(&[5, 0, 0, 0][..]); // header claims 5 bytes, none supplied
        assert!(decoder.decode_one(&mut wire).unwrap().is_none());
        assert_eq!(wire.len(), 4); // nothing was consumed
    }
}
