//! Drives the PostgreSQL authentication → extended-query protocol state machine against a
//! [`Session`], converting decoded backend messages into calls on the active request (§4.4).

use std::collections::HashMap;

use bytes::BytesMut;

use crate::error::Error;
use crate::future::DbFuturePromise;
use crate::postgres::auth::md5_password;
use crate::postgres::codec::try_read_message;
use crate::postgres::messages::{
    decode_value, encode_password, parse_authentication, parse_backend_key_data,
    parse_command_complete, parse_data_row, parse_error_response, parse_parameter_status,
    parse_ready_for_query, parse_row_description, AuthMessage, TransactionStatus, TAG_AUTHENTICATION,
    TAG_BACKEND_KEY_DATA, TAG_COMMAND_COMPLETE, TAG_DATA_ROW, TAG_ERROR_RESPONSE,
    TAG_PARAMETER_STATUS, TAG_READY_FOR_QUERY, TAG_ROW_DESCRIPTION,
};
use crate::postgres::ops::PgOps;
use crate::session::Session;
use crate::transport::ProtocolDriver;
use crate::value::Field;

/// Drives one PostgreSQL session. Owns the connection-level metadata the specification's data
/// model assigns to a session (backend pid/secret, negotiated parameters) but which this crate's
/// protocol-neutral `Session<P>` has no field for -- it belongs to the postgres-specific half of
/// the handshake, so it lives here instead.
pub(crate) struct PgHandler {
    fields: Vec<Field>,
    connect_promise: Option<DbFuturePromise<()>>,
    backend_pid: Option<i32>,
    backend_secret: Option<i32>,
    parameters: HashMap<String, String>,
}

impl PgHandler {
    pub(crate) fn new(connect_promise: DbFuturePromise<()>) -> Self {
        Self {
            fields: Vec::new(),
            connect_promise: Some(connect_promise),
            backend_pid: None,
            backend_secret: None,
            parameters: HashMap::new(),
        }
    }

    /// The backend's `(process id, secret key)` pair from `BackendKeyData`, needed to issue a
    /// `CancelRequest` on a second connection. Cancel requests are a non-goal of this crate, but
    /// the identifiers are still part of the session's data model (§3), so they are retained.
    pub(crate) fn backend_key(&self) -> Option<(i32, i32)> {
        self.backend_pid.zip(self.backend_secret)
    }

    pub(crate) fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    fn dispatch(&mut self, tag: u8, payload: BytesMut, session: &Session<PgOps>) -> Result<(), Error> {
        match tag {
            TAG_AUTHENTICATION => self.on_authentication(payload, session),
            TAG_BACKEND_KEY_DATA => {
                let (pid, secret) = parse_backend_key_data(payload)?;
                self.backend_pid = Some(pid);
                self.backend_secret = Some(secret);
                Ok(())
            }
            TAG_PARAMETER_STATUS => {
                let (name, value) = parse_parameter_status(payload)?;
                self.parameters.insert(name, value);
                Ok(())
            }
            TAG_ROW_DESCRIPTION => {
                self.fields = parse_row_description(payload)?;
                if let Some(active) = session.active_request() {
                    active.start_fields();
                    for field in &self.fields {
                        active.field(field.clone());
                    }
                    active.end_fields();
                    active.start_results();
                }
                Ok(())
            }
            TAG_DATA_ROW => {
                let raw_values = parse_data_row(payload)?;
                let mut values = Vec::with_capacity(raw_values.len());
                for (raw, field) in raw_values.into_iter().zip(self.fields.iter()) {
                    values.push(decode_value(raw, field.sql_type, 0)?);
                }
                if let Some(active) = session.active_request() {
                    active.start_row();
                    for value in values {
                        active.value(value);
                    }
                    active.end_row();
                }
                Ok(())
            }
            TAG_COMMAND_COMPLETE => {
                let tag = parse_command_complete(payload)?;
                if let Some(active) = session.active_request() {
                    match tag.command.to_ascii_uppercase().as_str() {
                        "SELECT" => active.end_results(),
                        "BEGIN" | "COMMIT" | "ROLLBACK" => active.complete(0, None),
                        _ => active.complete(tag.rows.unwrap_or(0), None),
                    }
                }
                Ok(())
            }
            TAG_ERROR_RESPONSE => {
                let (code, message) = parse_error_response(payload)?;
                let err = Error::Server { code, message };
                if let Some(promise) = self.connect_promise.take() {
                    let _ = promise.set_error(err);
                    return Ok(());
                }
                if let Some(active) = session.active_request() {
                    active.fail(err);
                }
                Ok(())
            }
            TAG_READY_FOR_QUERY => {
                let status = parse_ready_for_query(payload)?;
                if let Some(promise) = self.connect_promise.take() {
                    let _ = promise.set_result(());
                    return Ok(());
                }
                if status == TransactionStatus::Error {
                    log::debug!("session {}: ready-for-query reports server-side transaction error", session.id());
                }
                session.on_active_settled();
                Ok(())
            }
            other => {
                // ParseComplete/BindComplete/ParameterDescription/NoticeResponse/... carry no
                // information the session core needs; every extended-query round trip elicits
                // exactly one ReadyForQuery regardless, so it is safe to ignore these in between.
                log::trace!("session: ignoring backend message tag {other:#x}");
                Ok(())
            }
        }
    }

    fn on_authentication(&mut self, payload: BytesMut, session: &Session<PgOps>) -> Result<(), Error> {
        match parse_authentication(payload)? {
            AuthMessage::Ok => Ok(()),
            AuthMessage::Md5 { salt } => {
                let response = session.with_ops(|ops| md5_password(&ops.username, &ops.password, &salt));
                let mut out = BytesMut::new();
                encode_password(response.as_bytes(), &mut out);
                session.send_raw(out);
                Ok(())
            }
            AuthMessage::Unsupported(method) => {
                let err = Error::Protocol(crate::error::ProtocolError::AuthMethodNotSupported(method.to_string()));
                if let Some(promise) = self.connect_promise.take() {
                    let _ = promise.set_error(err);
                    return Ok(());
                }
                Err(err)
            }
        }
    }
}

impl ProtocolDriver<PgOps> for PgHandler {
    fn on_bytes(&mut self, buf: &mut BytesMut, session: &Session<PgOps>) -> Result<(), Error> {
        while let Some((tag, payload)) = try_read_message(buf) {
            self.dispatch(tag, payload, session)?;
        }
        Ok(())
    }
}
