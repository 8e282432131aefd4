//! The byte-transport driver: a single task per session that owns the socket, forwards encoded
//! frames from the session core to the wire, and feeds bytes read off the wire to a protocol's
//! decoder.
//!
//! This plays the role the specification calls "session_opened / message_received /
//! session_closed / exception_caught" -- here expressed as a plain `tokio::select!` loop rather
//! than a Netty-style upstream handler chain, since a single-connection client has no pipeline of
//! handlers to dispatch through.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::ops::ProtocolOps;
use crate::session::Session;

const READ_CHUNK: usize = 8 * 1024;

/// Decodes bytes read off the wire and dispatches complete messages against `session`.
///
/// Implemented once per protocol (`mysql::handler`, `postgres::handler`). `on_bytes` must consume
/// as many complete frames as `buf` holds and leave any trailing partial frame in place.
pub(crate) trait ProtocolDriver<P: ProtocolOps>: Send + 'static {
    fn on_bytes(&mut self, buf: &mut BytesMut, session: &Session<P>) -> Result<(), crate::error::Error>;
}

pub(crate) async fn drive<P, D>(
    stream: TcpStream,
    session: Arc<Session<P>>,
    mut driver: D,
    mut outbound: UnboundedReceiver<BytesMut>,
) where
    P: ProtocolOps + 'static,
    D: ProtocolDriver<P>,
{
    let (mut read_half, mut write_half) = stream.into_split();
    let mut inbuf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        tokio::select! {
            biased;

            frame = outbound.recv() => {
                match frame {
                    Some(bytes) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            log::warn!("session {}: write error: {e}", session.id());
                            session.fail_all(|| crate::error::Error::Io(std::io::Error::new(e.kind(), e.to_string())));
                            break;
                        }
                    }
                    None => {
                        // Sender side gone: the session has been dropped entirely.
                        break;
                    }
                }
            }

            read = read_half.read_buf(&mut inbuf) => {
                match read {
                    Ok(0) => {
                        log::debug!("session {}: transport closed by peer", session.id());
                        session.fail_all(|| crate::error::Error::SessionClosed);
                        break;
                    }
                    Ok(_) => {
                        if let Err(e) = driver.on_bytes(&mut inbuf, &session) {
                            log::warn!("session {}: protocol error: {e}", session.id());
                            session.fail_all(|| crate::error::Error::unexpected_message(&e.to_string()));
                            break;
                        }
                        if session.is_drained() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("session {}: read error: {e}", session.id());
                        session.fail_all(|| crate::error::Error::Io(std::io::Error::new(e.kind(), e.to_string())));
                        break;
                    }
                }
            }
        }
    }
}
