//! Drives the MySQL handshake → login → query-execution state machine against a [`Session`],
//! converting [`Decoded`] wire messages into calls on the active request.

use bytes::BytesMut;

use crate::error::Error;
use crate::future::DbFuturePromise;
use crate::mysql::codec::write_packet;
use crate::mysql::decoder::{Decoded, Decoder, EofKind};
use crate::mysql::messages::{build_login_packet, decode_row_values};
use crate::mysql::ops::MySqlOps;
use crate::session::Session;
use crate::transport::ProtocolDriver;
use crate::value::Field;

/// Drives one MySQL session. Holds the decoder's state machine plus the field list accreted
/// between `ResultSetHeader` and the row stream, since the decoder itself only tracks framing,
/// not which columns are active.
pub(crate) struct MySqlHandler {
    decoder: Decoder,
    fields: Vec<Field>,
    connect_promise: Option<DbFuturePromise<()>>,
}

impl MySqlHandler {
    pub(crate) fn new(connect_promise: DbFuturePromise<()>) -> Self {
        Self {
            decoder: Decoder::new(),
            fields: Vec::new(),
            connect_promise: Some(connect_promise),
        }
    }

    fn dispatch(&mut self, decoded: Decoded, session: &Session<MySqlOps>) -> Result<(), Error> {
        match decoded {
            Decoded::Greeting(greeting) => {
                let login = session
                    .with_ops(|ops| build_login_packet(&ops.username, &ops.password, ops.database.as_deref(), &greeting.auth_plugin_data));
                let mut out = BytesMut::new();
                write_packet(1, &login, &mut out)?;
                session.send_raw(out);
                Ok(())
            }
            Decoded::Ok {
                affected_rows,
                last_insert_id,
            } => {
                self.complete_ok(session, affected_rows, last_insert_id);
                Ok(())
            }
            Decoded::Err { code, message } => {
                self.complete_err(session, Error::Server { code, message });
                Ok(())
            }
            Decoded::ResultSetHeader { .. } => {
                self.fields.clear();
                if let Some(active) = session.active_request() {
                    active.start_fields();
                }
                Ok(())
            }
            Decoded::Field(field) => {
                if let Some(active) = session.active_request() {
                    active.field(field.clone());
                }
                self.fields.push(field);
                Ok(())
            }
            Decoded::Eof(EofKind::Field) => {
                if let Some(active) = session.active_request() {
                    active.end_fields();
                    active.start_results();
                }
                Ok(())
            }
            Decoded::Row(payload) => {
                let values = decode_row_values(payload, &self.fields)?;
                if let Some(active) = session.active_request() {
                    active.start_row();
                    for value in values {
                        active.value(value);
                    }
                    active.end_row();
                }
                Ok(())
            }
            Decoded::Eof(EofKind::Row) => {
                if let Some(active) = session.active_request() {
                    active.end_results();
                }
                session.on_active_settled();
                Ok(())
            }
        }
    }

    fn complete_ok(&mut self, session: &Session<MySqlOps>, affected_rows: u64, last_insert_id: u64) {
        if let Some(promise) = self.connect_promise.take() {
            let _ = promise.set_result(());
            return;
        }
        if let Some(active) = session.active_request() {
            let insert_id = if last_insert_id == 0 { None } else { Some(last_insert_id) };
            active.complete(affected_rows, insert_id);
        }
        session.on_active_settled();
    }

    fn complete_err(&mut self, session: &Session<MySqlOps>, err: Error) {
        if let Some(promise) = self.connect_promise.take() {
            let _ = promise.set_error(err);
            return;
        }
        if let Some(active) = session.active_request() {
            active.fail(err);
        }
        session.on_active_settled();
    }
}

impl ProtocolDriver<MySqlOps> for MySqlHandler {
    fn on_bytes(&mut self, buf: &mut BytesMut, session: &Session<MySqlOps>) -> Result<(), Error> {
        while let Some(decoded) = self.decoder.decode_one(buf)? {
            self.dispatch(decoded, session)?;
        }
        Ok(())
    }
}
