//! # RESP2 Encoding and Incremental Decoding
//!
//! Purpose: Produce bit-exact request frames and turn a raw inbound byte
//! stream into complete reply values, one at a time.
//!
//! ## Design Principles
//! 1. **No Partial Consumption**: `decode` leaves the buffer untouched until
//!    a full reply is available, so a short read never loses framing.
//! 2. **Buffer Reuse**: Encoding appends into a caller-provided buffer.
//! 3. **Fail Fast**: Malformed framing is an error, not a guess.

use std::io::Write;

use bytes::BytesMut;
use thiserror::Error;

use crate::value::RespValue;

const CRLF: &[u8] = b"\r\n";

/// Wire-level framing failures. All of them are fatal to the stream: once
/// framing is lost the request/reply alignment cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown reply type marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("reply line is not terminated by CRLF")]
    MissingTerminator,
    #[error("invalid integer in reply header")]
    BadInteger,
}

/// Encodes a request as a RESP2 array of bulk strings into `out`.
///
/// Frame layout: `*<argc>\r\n` followed by `$<len>\r\n<arg>\r\n` per
/// argument. The caller guarantees at least one argument.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    // Writes into a Vec cannot fail.
    let _ = write!(out, "*{}\r\n", args.len());
    for arg in args {
        let _ = write!(out, "${}\r\n", arg.len());
        out.extend_from_slice(arg);
        out.extend_from_slice(CRLF);
    }
}

/// Decodes one complete reply from the front of `buf`, if available.
///
/// Returns `Ok(None)` when the buffer holds only a partial frame; in that
/// case nothing is consumed and the caller should read more bytes first.
pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>, WireError> {
    match scan(&buf[..])? {
        Some((value, used)) => {
            let _ = buf.split_to(used);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Scans one reply starting at the front of `input` without consuming it.
fn scan(input: &[u8]) -> Result<Option<(RespValue, usize)>, WireError> {
    let (line, consumed) = match scan_line(input)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(WireError::MissingTerminator);
    }

    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(line[1..].to_vec()), consumed))),
        b'-' => Ok(Some((RespValue::Error(line[1..].to_vec()), consumed))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(&line[1..])?), consumed))),
        b'$' => scan_bulk(input, parse_i64(&line[1..])?, consumed),
        b'*' => scan_array(input, parse_i64(&line[1..])?, consumed),
        other => Err(WireError::UnknownMarker(other)),
    }
}

fn scan_bulk(
    input: &[u8],
    len: i64,
    header: usize,
) -> Result<Option<(RespValue, usize)>, WireError> {
    if len < 0 {
        return Ok(Some((RespValue::Bulk(None), header)));
    }

    let len = len as usize;
    let total = header + len + CRLF.len();
    if input.len() < total {
        return Ok(None);
    }
    if &input[header + len..total] != CRLF {
        return Err(WireError::MissingTerminator);
    }
    let data = input[header..header + len].to_vec();
    Ok(Some((RespValue::Bulk(Some(data)), total)))
}

fn scan_array(
    input: &[u8],
    len: i64,
    header: usize,
) -> Result<Option<(RespValue, usize)>, WireError> {
    // A null array (*-1) is reported as a null bulk: callers treat both as
    // "no value" and the distinction does not survive this client anyway.
    if len < 0 {
        return Ok(Some((RespValue::Bulk(None), header)));
    }

    let mut items = Vec::with_capacity(len as usize);
    let mut offset = header;
    for _ in 0..len {
        match scan(&input[offset..])? {
            Some((value, used)) => {
                items.push(value);
                offset += used;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), offset)))
}

fn scan_line(input: &[u8]) -> Result<Option<(&[u8], usize)>, WireError> {
    match input.windows(2).position(|pair| pair == CRLF) {
        Some(end) => Ok(Some((&input[..end], end + CRLF.len()))),
        None => Ok(None),
    }
}

fn parse_i64(data: &[u8]) -> Result<i64, WireError> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or(WireError::BadInteger)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<RespValue> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(value) = decode(&mut buf).expect("decode") {
            out.push(value);
        }
        assert!(buf.is_empty(), "decoder left {} bytes behind", buf.len());
        out
    }

    #[test]
    fn encodes_exact_frame() {
        let mut buf = Vec::new();
        encode_command(&[b"SET", b"a", b"b"], &mut buf);
        assert_eq!(&buf, b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n");
    }

    #[test]
    fn decodes_scalar_replies() {
        assert_eq!(decode_all(b"+OK\r\n"), vec![RespValue::Simple(b"OK".to_vec())]);
        assert_eq!(
            decode_all(b"-ERR bad\r\n"),
            vec![RespValue::Error(b"ERR bad".to_vec())]
        );
        assert_eq!(decode_all(b":-42\r\n"), vec![RespValue::Integer(-42)]);
        assert_eq!(
            decode_all(b"$5\r\nhello\r\n"),
            vec![RespValue::Bulk(Some(b"hello".to_vec()))]
        );
        assert_eq!(decode_all(b"$-1\r\n"), vec![RespValue::Bulk(None)]);
    }

    #[test]
    fn decodes_nested_array() {
        let replies = decode_all(b"*2\r\n$3\r\nfoo\r\n*1\r\n:7\r\n");
        assert_eq!(
            replies,
            vec![RespValue::Array(vec![
                RespValue::Bulk(Some(b"foo".to_vec())),
                RespValue::Array(vec![RespValue::Integer(7)]),
            ])]
        );
    }

    #[test]
    fn partial_frames_are_not_consumed() {
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert_eq!(decode(&mut buf).expect("decode"), None);
        assert_eq!(&buf[..], b"$5\r\nhel");

        buf.extend_from_slice(b"lo\r\n:1\r\n");
        assert_eq!(
            decode(&mut buf).expect("decode"),
            Some(RespValue::Bulk(Some(b"hello".to_vec())))
        );
        assert_eq!(decode(&mut buf).expect("decode"), Some(RespValue::Integer(1)));
    }

    #[test]
    fn rejects_garbage_marker() {
        let mut buf = BytesMut::from(&b"!oops\r\n"[..]);
        assert_eq!(decode(&mut buf), Err(WireError::UnknownMarker(b'!')));
    }

    #[test]
    fn rejects_bulk_without_terminator() {
        let mut buf = BytesMut::from(&b"$3\r\nabcXX"[..]);
        assert_eq!(decode(&mut buf), Err(WireError::MissingTerminator));
    }
}
