//! PostgreSQL message payload shapes: startup, the extended-query frame sequence, and backend
//! response parsing (row description, data rows, command tags, errors).

use bytes::{Buf, BufMut, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, ProtocolError};
use crate::postgres::codec::{put_cstr, read_cstr, write_message, write_untagged};
use crate::types::SqlType;
use crate::value::{Field, Value};

const PROTOCOL_VERSION_3_0: i32 = 196_608;

pub(crate) const TAG_AUTHENTICATION: u8 = b'R';
pub(crate) const TAG_BACKEND_KEY_DATA: u8 = b'K';
pub(crate) const TAG_PARAMETER_STATUS: u8 = b'S';
pub(crate) const TAG_ROW_DESCRIPTION: u8 = b'T';
pub(crate) const TAG_DATA_ROW: u8 = b'D';
pub(crate) const TAG_COMMAND_COMPLETE: u8 = b'C';
pub(crate) const TAG_ERROR_RESPONSE: u8 = b'E';
pub(crate) const TAG_READY_FOR_QUERY: u8 = b'Z';

const AUTH_OK: i32 = 0;
const AUTH_MD5_PASSWORD: i32 = 5;

pub(crate) enum AuthMessage {
    Ok,
    Md5 { salt: [u8; 4] },
    Unsupported(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransactionStatus {
    Idle,
    InTransaction,
    Error,
}

// ---- frontend message builders -----------------------------------------------------------

pub(crate) fn encode_startup(user: &str, database: &str, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION_3_0);
    put_cstr(&mut body, "user");
    put_cstr(&mut body, user);
    put_cstr(&mut body, "database");
    put_cstr(&mut body, database);
    put_cstr(&mut body, "client_encoding");
    put_cstr(&mut body, "UNICODE");
    put_cstr(&mut body, "DateStyle");
    put_cstr(&mut body, "ISO");
    body.put_u8(0);
    write_untagged(&body, out);
}

pub(crate) fn encode_password(password: &[u8], out: &mut BytesMut) {
    let mut body = BytesMut::with_capacity(password.len() + 1);
    body.put_slice(password);
    body.put_u8(0);
    write_message(b'p', &body, out);
}

pub(crate) fn encode_parse(statement_name: &str, sql: &str, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    put_cstr(&mut body, statement_name);
    put_cstr(&mut body, sql);
    body.put_i16(0); // no explicit parameter types
    write_message(b'P', &body, out);
}

pub(crate) fn encode_bind(portal: &str, statement_name: &str, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    put_cstr(&mut body, portal);
    put_cstr(&mut body, statement_name);
    body.put_i16(0); // parameter format codes: none, no bind parameters used
    body.put_i16(0); // parameter values: none
    body.put_i16(1); // one result-format code, applying to every column
    body.put_i16(0); // text format
    write_message(b'B', &body, out);
}

pub(crate) fn encode_describe(target: u8, name: &str, out: &mut BytesMut) {
    let mut body = BytesMut::with_capacity(name.len() + 2);
    body.put_u8(target);
    put_cstr(&mut body, name);
    write_message(b'D', &body, out);
}

pub(crate) fn encode_execute(portal: &str, max_rows: i32, out: &mut BytesMut) {
    let mut body = BytesMut::new();
    put_cstr(&mut body, portal);
    body.put_i32(max_rows);
    write_message(b'E', &body, out);
}

pub(crate) fn encode_sync(out: &mut BytesMut) {
    write_message(b'S', &[], out);
}

pub(crate) fn encode_terminate(out: &mut BytesMut) {
    write_message(b'X', &[], out);
}

// ---- backend message parsing --------------------------------------------------------------

pub(crate) fn parse_authentication(mut payload: BytesMut) -> Result<AuthMessage, Error> {
    if payload.len() < 4 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "truncated authentication message".into(),
        )));
    }
    let kind = payload.get_i32();
    match kind {
        AUTH_OK => Ok(AuthMessage::Ok),
        AUTH_MD5_PASSWORD => {
            if payload.len() < 4 {
                return Err(Error::Protocol(ProtocolError::MalformedFrame(
                    "missing md5 salt".into(),
                )));
            }
            let mut salt = [0u8; 4];
            payload.copy_to_slice(&mut salt);
            Ok(AuthMessage::Md5 { salt })
        }
        other => Ok(AuthMessage::Unsupported(other)),
    }
}

pub(crate) fn parse_backend_key_data(mut payload: BytesMut) -> Result<(i32, i32), Error> {
    if payload.len() < 8 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "truncated BackendKeyData".into(),
        )));
    }
    Ok((payload.get_i32(), payload.get_i32()))
}

pub(crate) fn parse_parameter_status(mut payload: BytesMut) -> Result<(String, String), Error> {
    let name = read_cstr(&mut payload)
        .ok_or_else(|| Error::Protocol(ProtocolError::MalformedFrame("missing parameter name".into())))?;
    let value = read_cstr(&mut payload)
        .ok_or_else(|| Error::Protocol(ProtocolError::MalformedFrame("missing parameter value".into())))?;
    Ok((name, value))
}

pub(crate) fn parse_row_description(mut payload: BytesMut) -> Result<Vec<Field>, Error> {
    if payload.len() < 2 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "truncated RowDescription".into(),
        )));
    }
    let count = payload.get_i16();
    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let name = read_cstr(&mut payload).ok_or_else(|| {
            Error::Protocol(ProtocolError::MalformedFrame("missing field name".into()))
        })?;
        if payload.len() < 18 {
            return Err(Error::Protocol(ProtocolError::MalformedFrame(
                "truncated field descriptor".into(),
            )));
        }
        let _table_oid = payload.get_i32();
        let _column_attr = payload.get_i16();
        let type_oid = payload.get_i32();
        let _type_size = payload.get_i16();
        let _type_modifier = payload.get_i32();
        let _format_code = payload.get_i16();
        fields.push(Field {
            name,
            sql_type: sql_type_from_oid(type_oid),
        });
    }
    Ok(fields)
}

pub(crate) fn parse_data_row(mut payload: BytesMut) -> Result<Vec<Option<BytesMut>>, Error> {
    if payload.len() < 2 {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "truncated DataRow".into(),
        )));
    }
    let count = payload.get_i16();
    let mut values = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if payload.len() < 4 {
            return Err(Error::Protocol(ProtocolError::MalformedFrame(
                "truncated DataRow column length".into(),
            )));
        }
        let len = payload.get_i32();
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if payload.len() < len {
            return Err(Error::Protocol(ProtocolError::MalformedFrame(
                "truncated DataRow column value".into(),
            )));
        }
        values.push(Some(payload.split_to(len)));
    }
    Ok(values)
}

pub(crate) fn parse_error_response(mut payload: BytesMut) -> Result<(String, String), Error> {
    let mut code = String::from("XX000");
    let mut message = String::new();
    loop {
        if payload.is_empty() {
            break;
        }
        let field_type = payload.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstr(&mut payload).unwrap_or_default();
        match field_type {
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
    }
    Ok((code, message))
}

pub(crate) fn parse_ready_for_query(payload: BytesMut) -> Result<TransactionStatus, Error> {
    match payload.first() {
        Some(b'I') => Ok(TransactionStatus::Idle),
        Some(b'T') => Ok(TransactionStatus::InTransaction),
        Some(b'E') => Ok(TransactionStatus::Error),
        _ => Err(Error::Protocol(ProtocolError::MalformedFrame(
            "unknown transaction status in ReadyForQuery".into(),
        ))),
    }
}

/// A parsed `CommandComplete` tag, e.g. `"INSERT 0 5"` or `"BEGIN"`.
pub(crate) struct CommandTag {
    pub(crate) command: String,
    pub(crate) rows: Option<u64>,
}

static COMMAND_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w+)\s*(\d*)\s*(\d*)").unwrap());

pub(crate) fn parse_command_complete(payload: BytesMut) -> Result<CommandTag, Error> {
    let mut payload = payload;
    let tag = read_cstr(&mut payload).unwrap_or_default();
    let caps = COMMAND_TAG_RE.captures(&tag).ok_or_else(|| {
        Error::Protocol(ProtocolError::MalformedFrame(format!(
            "unparseable command tag {tag:?}"
        )))
    })?;
    let command = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
    let second = caps.get(2).map(|m| m.as_str()).filter(|s| !s.is_empty());
    let third = caps.get(3).map(|m| m.as_str()).filter(|s| !s.is_empty());
    let rows = if command.eq_ignore_ascii_case("INSERT") {
        third.and_then(|s| s.parse::<u64>().ok())
    } else {
        second.and_then(|s| s.parse::<u64>().ok())
    };
    Ok(CommandTag { command, rows })
}

fn sql_type_from_oid(oid: i32) -> SqlType {
    match oid {
        16 => SqlType::Boolean,
        18 | 1042 => SqlType::Char,
        20 => SqlType::BigInt,
        21 => SqlType::SmallInt,
        23 => SqlType::Int,
        25 | 1043 => SqlType::VarChar,
        700 => SqlType::Float,
        701 => SqlType::Double,
        1082 => SqlType::Date,
        1700 => SqlType::Decimal,
        _ => SqlType::Unknown,
    }
}

/// Decodes one column value. `format` is the format code negotiated in `Bind` (this client
/// always binds a single text-format result, per the specification's minimum-binary-decoding
/// scope); the binary branch exists only for the one case the specification calls out.
pub(crate) fn decode_value(raw: Option<BytesMut>, sql_type: SqlType, format: i16) -> Result<Value, Error> {
    let Some(bytes) = raw else {
        return Ok(Value::Null);
    };
    if format == 1 {
        return decode_binary_value(&bytes, sql_type);
    }
    let text = String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::Protocol(ProtocolError::MalformedFrame(e.to_string())))?;
    Ok(match sql_type {
        SqlType::SmallInt | SqlType::Int | SqlType::BigInt => {
            text.parse::<i64>().map(Value::I64).unwrap_or(Value::Str(text))
        }
        SqlType::Float | SqlType::Double | SqlType::Decimal => {
            text.parse::<f64>().map(Value::F64).unwrap_or(Value::Str(text))
        }
        SqlType::Boolean => match text.as_str() {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => Value::Str(text),
        },
        _ => Value::Str(text),
    })
}

fn decode_binary_value(bytes: &[u8], sql_type: SqlType) -> Result<Value, Error> {
    match sql_type {
        SqlType::Int if bytes.len() == 4 => {
            Ok(Value::I64(i32::from_be_bytes(bytes.try_into().unwrap()) as i64))
        }
        _ => Err(Error::Protocol(ProtocolError::UnsupportedColumnType(format!(
            "binary format for {sql_type:?}"
        )))),
    }
}
