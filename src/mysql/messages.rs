//! MySQL packet payload shapes: the handshake, OK/ERR packets, column definitions and row values.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, ProtocolError};
use crate::mysql::codec::{read_lenenc_int, read_lenenc_string, read_null_terminated_string};
use crate::types::SqlType;
use crate::value::{Field, Value};

pub(crate) const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub(crate) const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub(crate) const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub(crate) const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub(crate) const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;

/// Charset id for `utf8mb4_general_ci`, the only charset this client negotiates.
const CLIENT_CHARSET: u8 = 0x2D;

pub(crate) struct Handshake {
    pub(crate) auth_plugin_data: Vec<u8>,
    pub(crate) auth_plugin_name: String,
}

/// Assembles the protocol-41 client authentication response (§4.3 Login).
///
/// The source spec describes this as capability flags / max-packet / charset / filler /
/// username / challenge response / database, with the response length folded in as a one-byte
/// prefix the way `CLIENT_SECURE_CONNECTION` responses are framed on the wire (rather than a
/// trailing filler byte, which would leave the server unable to find the response's end).
pub(crate) fn build_login_packet(
    username: &str,
    password: &[u8],
    database: Option<&str>,
    challenge: &[u8],
) -> BytesMut {
    let mut capabilities = CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
    if database.is_some() {
        capabilities |= CLIENT_CONNECT_WITH_DB;
    }

    let mut out = BytesMut::new();
    out.put_u16_le((capabilities & 0xFFFF) as u16);
    out.put_u16_le(((capabilities >> 16) & 0xFFFF) as u16);
    out.put_u32_le(0x00FF_FFFF);
    out.put_u8(CLIENT_CHARSET);
    out.put_bytes(0, 23);
    out.put_slice(username.as_bytes());
    out.put_u8(0);
    if password.is_empty() {
        out.put_u8(0);
    } else {
        let scramble = crate::mysql::auth::scramble(password, challenge);
        out.put_u8(scramble.len() as u8);
        out.put_slice(&scramble);
    }
    if let Some(db) = database {
        out.put_slice(db.as_bytes());
        out.put_u8(0);
    }
    out
}

pub(crate) fn parse_handshake(mut payload: BytesMut) -> Result<Handshake, Error> {
    if payload.is_empty() {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "empty handshake packet".into(),
        )));
    }
    let protocol_version = payload.get_u8();
    if protocol_version != 10 {
        return Err(Error::Protocol(ProtocolError::UnexpectedMessage(format!(
            "unsupported handshake protocol version {protocol_version}"
        ))));
    }
    let _server_version = read_null_terminated_string(&mut payload).ok_or_else(|| {
        Error::Protocol(ProtocolError::MalformedFrame("missing server version".into()))
    })?;
    if payload.len() < 4 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "missing connection id".into(),
        )));
    }
    let _connection_id = payload.get_u32_le();
    if payload.len() < 8 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "missing auth-plugin-data part 1".into(),
        )));
    }
    let mut auth_plugin_data = payload.split_to(8).to_vec();
    payload.advance(1); // filler

    if payload.len() < 2 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "missing capability flags (lower)".into(),
        )));
    }
    let caps_lower = payload.get_u16_le() as u32;
    let mut auth_plugin_data_len = 0u8;
    let mut caps_upper = 0u32;
    if !payload.is_empty() {
        let _charset = payload.get_u8();
        let _status_flags = payload.get_u16_le();
        caps_upper = payload.get_u16_le() as u32;
        auth_plugin_data_len = payload.get_u8();
        payload.advance(10); // reserved
        let capabilities = caps_lower | (caps_upper << 16);
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let part2_len = (auth_plugin_data_len as usize).saturating_sub(8).max(12);
            if payload.len() >= part2_len {
                auth_plugin_data.extend_from_slice(&payload.split_to(part2_len));
                // Drop the NUL terminator that follows part 2, if present.
                if !payload.is_empty() && payload[0] == 0 {
                    payload.advance(1);
                }
            }
        }
        let _ = caps_upper;
    }

    let auth_plugin_name = if payload.is_empty() {
        "mysql_native_password".to_string()
    } else {
        read_null_terminated_string(&mut payload).unwrap_or_else(|| "mysql_native_password".to_string())
    };

    Ok(Handshake {
        auth_plugin_data,
        auth_plugin_name,
    })
}

pub(crate) enum GenericResponse {
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
    },
    Err {
        code: String,
        message: String,
    },
    /// The payload is a length-encoded column count: the start of a result set.
    ResultSetHeader {
        column_count: u64,
    },
}

pub(crate) fn parse_generic_response(mut payload: BytesMut) -> Result<GenericResponse, Error> {
    if payload.is_empty() {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "empty response packet".into(),
        )));
    }
    match payload[0] {
        0x00 => {
            payload.advance(1);
            let affected_rows = read_lenenc_int(&mut payload)?.unwrap_or(0);
            let last_insert_id = read_lenenc_int(&mut payload)?.unwrap_or(0);
            Ok(GenericResponse::Ok {
                affected_rows,
                last_insert_id,
            })
        }
        0xFF => {
            payload.advance(1);
            if payload.len() < 2 {
                return Err(Error::Protocol(ProtocolError::MalformedFrame(
                    "truncated error packet".into(),
                )));
            }
            let code = payload.get_u16_le().to_string();
            // Optional SQL state marker '#' + 5 bytes, present on 4.1+ servers.
            if !payload.is_empty() && payload[0] == b'#' {
                payload.advance(1);
                if payload.len() >= 5 {
                    payload.advance(5);
                }
            }
            let message = String::from_utf8_lossy(&payload).to_string();
            Ok(GenericResponse::Err { code, message })
        }
        _ => {
            let mut probe = &payload[..];
            let column_count = read_lenenc_int(&mut probe)?.ok_or_else(|| {
                Error::Protocol(ProtocolError::MalformedFrame(
                    "truncated result set header".into(),
                ))
            })?;
            Ok(GenericResponse::ResultSetHeader { column_count })
        }
    }
}

/// Parses a `COLUMN_DEFINITION41` packet into a [`Field`].
pub(crate) fn parse_column_definition(mut payload: BytesMut) -> Result<Field, Error> {
    for _ in 0..4 {
        read_lenenc_string(&mut payload)?;
    }
    let name = read_lenenc_string(&mut payload)?
        .ok_or_else(|| Error::Protocol(ProtocolError::MalformedFrame("missing column name".into())))?;
    read_lenenc_string(&mut payload)?; // org_name
    if payload.len() < 1 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "truncated column definition".into(),
        )));
    }
    let _fixed_len = read_lenenc_int(&mut payload)?;
    if payload.len() < 2 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "missing column charset".into(),
        )));
    }
    let _charset = payload.get_u16_le();
    if payload.len() < 4 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "missing column length".into(),
        )));
    }
    let _column_length = payload.get_u32_le();
    let type_id = if payload.is_empty() {
        0xFD
    } else {
        payload.get_u8()
    };
    Ok(Field {
        name,
        sql_type: sql_type_from_column_type(type_id),
    })
}

fn sql_type_from_column_type(id: u8) -> SqlType {
    match id {
        0x01 => SqlType::TinyInt,
        0x02 => SqlType::SmallInt,
        0x09 => SqlType::MediumInt,
        0x03 => SqlType::Int,
        0x08 => SqlType::BigInt,
        0x00 | 0xF6 => SqlType::Decimal,
        0x04 => SqlType::Float,
        0x05 => SqlType::Double,
        0x0A => SqlType::Date,
        0xFE => SqlType::Char,
        0xFD | 0xFC | 0xFB => SqlType::VarChar,
        _ => SqlType::Unknown,
    }
}

/// Decodes one text-protocol row value for the given column type. The text protocol represents
/// every value (including numerics) as a length-encoded string; this narrows it per `sql_type`.
///
/// Per the resolved Open Question on unsupported column types, a type this client does not
/// narrow (`SqlType::Unknown`) fails loudly rather than silently falling back to a string -- a
/// wrong-looking value is worse than an explicit, catchable decode error for a database client.
pub(crate) fn decode_text_value(raw: Option<String>, sql_type: SqlType) -> Result<Value, Error> {
    let Some(text) = raw else {
        return Ok(Value::Null);
    };
    Ok(match sql_type {
        SqlType::TinyInt
        | SqlType::SmallInt
        | SqlType::MediumInt
        | SqlType::Int
        | SqlType::BigInt => text.parse::<i64>().map(Value::I64).unwrap_or(Value::Str(text)),
        SqlType::Float | SqlType::Double | SqlType::Decimal => {
            text.parse::<f64>().map(Value::F64).unwrap_or(Value::Str(text))
        }
        SqlType::Boolean => match text.as_str() {
            "0" => Value::Bool(false),
            "1" => Value::Bool(true),
            _ => Value::Str(text),
        },
        SqlType::Char | SqlType::VarChar => Value::Str(text),
        SqlType::Date => Value::Str(text),
        SqlType::Unknown => {
            return Err(Error::Protocol(ProtocolError::UnsupportedColumnType(format!(
                "{sql_type:?}"
            ))))
        }
    })
}

/// Decodes a full text-protocol row given the field list built from the preceding
/// `COLUMN_DEFINITION41` packets.
pub(crate) fn decode_row_values(mut payload: BytesMut, fields: &[Field]) -> Result<Vec<Value>, Error> {
    let mut values = Vec::with_capacity(fields.len());
    for field in fields {
        if payload.first() == Some(&0xFB) {
            payload.advance(1);
            values.push(Value::Null);
            continue;
        }
        let raw = read_lenenc_string(&mut payload)?.ok_or_else(|| {
            Error::Protocol(ProtocolError::MalformedFrame(
                "truncated row value".into(),
            ))
        })?;
        values.push(decode_text_value(Some(raw), field.sql_type)?);
    }
    Ok(values)
}
