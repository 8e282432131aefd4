//! MySQL packet framing and the length-encoded integer/string wire encodings.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, ProtocolError};

/// Maximum payload length a single MySQL packet can carry before the "more packets follow"
/// split-packet convention kicks in. This crate does not implement payload splitting: queries
/// and rows large enough to need it are out of scope.
pub(crate) const MAX_PACKET_PAYLOAD: usize = 0x00FF_FFFF;

/// Strips one framed packet (3-byte little-endian length + 1-byte sequence id + payload) off the
/// front of `buf` if a complete one is available, returning `(sequence_id, payload)`.
pub(crate) fn try_read_packet(buf: &mut BytesMut) -> Option<(u8, BytesMut)> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    let mut header = buf.split_to(4);
    let seq = header.split_off(3)[0];
    let _ = header;
    Some((seq, buf.split_to(len)))
}

/// Appends a packet header followed by `payload` to `out`.
pub(crate) fn write_packet(seq: u8, payload: &[u8], out: &mut BytesMut) -> Result<(), Error> {
    if payload.len() > MAX_PACKET_PAYLOAD {
        return Err(Error::Protocol(ProtocolError::MalformedFrame(
            "payload exceeds the unsplit packet limit".into(),
        )));
    }
    let len = payload.len() as u32;
    out.put_u8((len & 0xFF) as u8);
    out.put_u8(((len >> 8) & 0xFF) as u8);
    out.put_u8(((len >> 16) & 0xFF) as u8);
    out.put_u8(seq);
    out.put_slice(payload);
    Ok(())
}

/// Reads a MySQL length-encoded integer. Returns `None` if `buf` doesn't yet hold a complete one.
pub(crate) fn read_lenenc_int(buf: &mut impl Buf) -> Result<Option<u64>, Error> {
    if !buf.has_remaining() {
        return Ok(None);
    }
    let first = buf.chunk()[0];
    match first {
        0xFB => {
            buf.advance(1);
            Ok(Some(u64::MAX)) // NULL sentinel; callers must check for 0xFB before calling this.
        }
        0xFC => {
            if buf.remaining() < 3 {
                return Ok(None);
            }
            buf.advance(1);
            Ok(Some(buf.get_u16_le() as u64))
        }
        0xFD => {
            if buf.remaining() < 4 {
                return Ok(None);
            }
            buf.advance(1);
            let mut bytes = [0u8; 4];
            buf.copy_to_slice(&mut bytes[..3]);
            Ok(Some(u32::from_le_bytes(bytes) as u64))
        }
        0xFE => {
            if buf.remaining() < 9 {
                return Ok(None);
            }
            buf.advance(1);
            Ok(Some(buf.get_u64_le()))
        }
        0xFF => Err(Error::Protocol(ProtocolError::InvalidLengthEncodedInteger)),
        small => {
            buf.advance(1);
            Ok(Some(small as u64))
        }
    }
}

pub(crate) fn write_lenenc_int(value: u64, out: &mut BytesMut) {
    if value < 251 {
        out.put_u8(value as u8);
    } else if value < 0x10000 {
        out.put_u8(0xFC);
        out.put_u16_le(value as u16);
    } else if value < 0x1000000 {
        out.put_u8(0xFD);
        out.put_slice(&value.to_le_bytes()[..3]);
    } else {
        out.put_u8(0xFE);
        out.put_u64_le(value);
    }
}

/// Reads a length-encoded string (length-encoded integer length prefix, then that many bytes).
pub(crate) fn read_lenenc_string(buf: &mut BytesMut) -> Result<Option<String>, Error> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] == 0xFB {
        buf.advance(1);
        return Ok(Some(String::new()));
    }
    let mut probe = &buf[..];
    let len = match read_lenenc_int(&mut probe)? {
        Some(v) => v as usize,
        None => return Ok(None),
    };
    let consumed = buf.len() - probe.len();
    if buf.len() < consumed + len {
        return Ok(None);
    }
    buf.advance(consumed);
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|e| Error::Protocol(ProtocolError::MalformedFrame(e.to_string())))
}

pub(crate) fn write_lenenc_string(s: &str, out: &mut BytesMut) {
    write_lenenc_int(s.len() as u64, out);
    out.put_slice(s.as_bytes());
}

/// Reads a NUL-terminated string, consuming the terminator.
pub(crate) fn read_null_terminated_string(buf: &mut BytesMut) -> Option<String> {
    let pos = buf.iter().position(|&b| b == 0)?;
    let bytes = buf.split_to(pos);
    buf.advance(1);
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_round_trips_through_write_and_read() {
        let mut wire = BytesMut::new();
        write_packet(7, b"select 1", &mut wire).unwrap();
        assert_eq!(&wire[..3], &[8, 0, 0]);
        assert_eq!(wire[3], 7);

        let (seq, payload) = try_read_packet(&mut wire).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(&payload[..], b"select 1");
        assert!(wire.is_empty());
    }

    #[test]
    fn try_read_packet_waits_for_a_full_header_and_payload() {
        let mut wire = BytesMut::from(&[3, 0, 0][..]); // header only, no seq byte yet
        assert!(try_read_packet(&mut wire).is_none());

        let mut wire = BytesMut::new();
        write_packet(0, b"abc", &mut wire).unwrap();
        wire.truncate(wire.len() - 1); // drop the last payload byte
        assert!(try_read_packet(&mut wire).is_none());
    }

    #[test]
    fn write_packet_rejects_oversized_payload() {
        let oversized = vec![0u8; MAX_PACKET_PAYLOAD + 1];
        let mut out = BytesMut::new();
        assert!(write_packet(0, &oversized, &mut out).is_err());
    }

    #[test]
    fn lenenc_int_round_trips_across_every_width_boundary() {
        for value in [0u64, 250, 251, 0xFFFF, 0x10000, 0xFFFFFF, 0x1000000, u64::MAX] {
            let mut out = BytesMut::new();
            write_lenenc_int(value, &mut out);
            let mut buf = &out[..];
            assert_eq!(read_lenenc_int(&mut buf).unwrap(), Some(value));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn lenenc_int_reports_incomplete_buffers_as_none_not_error() {
        // 0xFC prefix promises a u16 tail; give it only one of the two bytes.
        let mut buf = &[0xFC, 0x01][..];
        assert_eq!(read_lenenc_int(&mut buf).unwrap(), None);
    }

    #[test]
    fn lenenc_int_0xff_is_rejected() {
        let mut buf = &[0xFF][..];
        assert!(read_lenenc_int(&mut buf).is_err());
    }

    #[test]
    fn lenenc_string_round_trips() {
        let mut out = BytesMut::new();
        write_lenenc_string("hello world", &mut out);
        let parsed = read_lenenc_string(&mut out).unwrap().unwrap();
        assert_eq!(parsed, "hello world");
        assert!(out.is_empty());
    }

    #[test]
    fn lenenc_string_null_sentinel_decodes_to_empty_string() {
        let mut buf = BytesMut::from(&[0xFBu8][..]);
        assert_eq!(read_lenenc_string(&mut buf).unwrap(), Some(String::new()));
    }

    #[test]
    fn lenenc_string_waits_for_full_payload() {
        let mut out = BytesMut::new();
        write_lenenc_string("longer than a byte", &mut out);
        out.truncate(out.len() - 2);
        assert_eq!(read_lenenc_string(&mut out).unwrap(), None);
    }

    #[test]
    fn null_terminated_string_stops_at_the_nul_and_consumes_it() {
        let mut buf = BytesMut::from(&b"root\x00trailing"[..]);
        let s = read_null_terminated_string(&mut buf).unwrap();
        assert_eq!(s, "root");
        assert_eq!(&buf[..], b"trailing");
    }

    #[test]
    fn null_terminated_string_without_a_terminator_is_none() {
        let mut buf = BytesMut::from(&b"no terminator here"[..]);
        assert!(read_null_terminated_string(&mut buf).is_none());
    }
}
