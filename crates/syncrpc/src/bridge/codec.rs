//! CRLF framing for worker communication.
//!
//! One frame per exchange: UTF-8 text terminated by `\r\n`. The payload is either
//! the literal liveness probe or a JSON request. serde_json already escapes CR and
//! LF inside strings, so a terminator can only appear at the end of a frame. U+2028
//! and U+2029 are escaped as well because frames get embedded in relay command lines.

use std::io;

use serde::Serialize;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{PING, Request, Response};

pub const TERMINATOR: &[u8] = b"\r\n";

/// Complete liveness probe frame.
pub const PING_FRAME: &str = "ping\r\n";

/// Frames above this size are rejected instead of buffered forever.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    Request(Request),
    /// Terminated frame whose payload is not a valid request. The connection is
    /// still in sync, so the worker answers with a failed response.
    Invalid(String),
}

/// Replace U+2028/U+2029 with their JSON escapes.
///
/// Only valid on JSON text: the raw code points can only occur inside string
/// literals, where the escape decodes back to the same character.
pub fn escape_line_separators(json: String) -> String {
    if !json.contains(['\u{2028}', '\u{2029}']) {
        return json;
    }
    json.replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

fn to_escaped_json<T: Serialize>(item: &T) -> io::Result<String> {
    let json =
        serde_json::to_string(item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let json_len = json.len();
    tracing::trace!(json_size_bytes = json_len, "Encoding frame");
    if json_len > 100_000 {
        tracing::debug!(
            json_size_bytes = json_len,
            json_size_kb = json_len / 1024,
            "Large frame being encoded"
        );
    }
    Ok(escape_line_separators(json))
}

/// Encode a request as a complete CRLF-terminated frame.
pub fn encode_frame(request: &Request) -> io::Result<String> {
    let mut frame = to_escaped_json(request)?;
    frame.push_str("\r\n");
    Ok(frame)
}

/// Encode a direct response. Not terminated: the worker closes the connection
/// after writing it.
pub fn encode_response(response: &Response) -> io::Result<Vec<u8>> {
    to_escaped_json(response).map(String::into_bytes)
}

fn parse_frame(payload: &[u8]) -> Frame {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text.trim(),
        Err(e) => return Frame::Invalid(format!("frame is not UTF-8: {e}")),
    };
    if text == PING {
        return Frame::Ping;
    }
    match serde_json::from_str::<Request>(text) {
        Ok(request) => Frame::Request(request),
        Err(e) => Frame::Invalid(format!("malformed request: {e}")),
    }
}

/// Codec splitting a byte stream on CRLF and parsing each frame.
pub struct FrameCodec {
    /// Bytes already searched for a terminator, so partial frames are not rescanned.
    scanned: usize,
    max_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            scanned: 0,
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Back up one byte in case the previous chunk ended between CR and LF.
        let start = self.scanned.saturating_sub(1);
        let found = src[start..]
            .windows(TERMINATOR.len())
            .position(|window| window == TERMINATOR);

        match found {
            Some(offset) => {
                let end = start + offset;
                let frame = src.split_to(end + TERMINATOR.len());
                self.scanned = 0;
                Ok(Some(parse_frame(&frame[..end])))
            }
            None if src.len() > self.max_length => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame exceeds {} bytes without a terminator",
                    self.max_length
                ),
            )),
            None => {
                self.scanned = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a frame",
            )),
        }
    }
}

impl Encoder<Request> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = encode_frame(&item)?;
        dst.reserve(frame.len());
        dst.put_slice(frame.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Handle, RequestBody};
    use serde_json::json;

    fn invoke(argument: serde_json::Value) -> Request {
        Request::new(RequestBody::Invoke {
            handle: Handle::new(0),
            argument,
        })
    }

    #[test]
    fn decodes_ping() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(PING_FRAME);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Ping));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_terminator_across_chunks() {
        let mut codec = FrameCodec::new();
        let req = invoke(json!({"x": 1}));
        let frame = encode_frame(&req).unwrap();
        let (head, tail) = frame.split_at(frame.len() - 1);

        let mut buf = BytesMut::from(head);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(tail.as_bytes());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Request(req)));
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut codec = FrameCodec::new();
        let first = invoke(json!(1));
        let second = invoke(json!(2));

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Request(first)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Request(second)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn malformed_json_is_invalid_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from("{\"kind\":\r\n");
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Invalid(reason)) => assert!(reason.starts_with("malformed request")),
            other => panic!("expected invalid frame, got {other:?}"),
        }
    }

    #[test]
    fn line_separators_are_escaped_and_restored() {
        let text = "a\u{2028}b\u{2029}c";
        let req = invoke(json!({ "text": text }));
        let frame = encode_frame(&req).unwrap();

        assert!(!frame.contains('\u{2028}'));
        assert!(!frame.contains('\u{2029}'));
        assert!(frame.contains("\\u2028"));
        assert!(frame.ends_with("\r\n"));

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(frame.as_str());
        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Request(decoded)) => assert_eq!(decoded, req),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn response_encoding_escapes_separators() {
        let resp = Response::success(None, json!("x\u{2028}y"));
        let bytes = encode_response(&resp).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\\u2028"));
        assert!(!text.ends_with("\r\n"));
        let decoded: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from("ping");
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::with_max_length(8);
        let mut buf = BytesMut::from("0123456789");
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
