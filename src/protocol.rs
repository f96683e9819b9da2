//! Wire framing and event decoding.
//!
//! A frame is one MIME-style header block terminated by a blank line, plus an
//! optional body whose length is given by a `Content-Length` header. The
//! [`FrameParser`] is incremental: feed it socket reads with
//! [`add_data`](FrameParser::add_data) and pull complete frames with
//! [`parse_frame`](FrameParser::parse_frame). [`decode_frame`] then classifies
//! a frame by Content-Type into a synchronous reply or an asynchronous event,
//! producing the unified [`Event`] representation.

use crate::buffer::FrameBuffer;
use crate::constants::{
    CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_COMMAND_REPLY, CONTENT_TYPE_DISCONNECT_NOTICE,
    CONTENT_TYPE_EVENT_JSON, CONTENT_TYPE_EVENT_PLAIN, ERROR_MARKER, ERROR_PREFIX_LEN,
    HEADER_TERMINATOR, MAX_FRAME_SIZE,
};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::headers::{normalize_key, EventHeader};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;

/// One parsed wire frame: normalized header keys, raw (undecoded) values,
/// optional body.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug)]
enum ParseState {
    Headers,
    Body {
        headers: HashMap<String, String>,
        length: usize,
    },
}

/// Incremental frame parser over an accumulation buffer.
///
/// The same logic parses both the outer stream and, reentrantly, the nested
/// frame carried inside a `text/event-plain` body.
pub(crate) struct FrameParser {
    buffer: FrameBuffer,
    state: ParseState,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buffer: FrameBuffer::new(),
            state: ParseState::Headers,
        }
    }

    /// Append raw bytes from the stream.
    pub fn add_data(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        self.buffer.check_size_limit()
    }

    /// Try to pull one complete frame out of the buffered data.
    ///
    /// `Ok(None)` means more bytes are needed. Errors are fatal: a malformed
    /// header line or an unusable Content-Length leaves the stream position
    /// untrustworthy.
    pub fn parse_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                ParseState::Headers => {
                    let Some(raw) = self.buffer.take_until(HEADER_TERMINATOR.as_bytes()) else {
                        return Ok(None);
                    };
                    let text = String::from_utf8(raw)
                        .map_err(|_| Error::framing("invalid UTF-8 in header block"))?;
                    let headers = parse_header_block(&text)?;

                    match content_length(&headers)? {
                        Some(length) if length > 0 => {
                            self.state = ParseState::Body { headers, length };
                        }
                        _ => {
                            self.state = ParseState::Headers;
                            return Ok(Some(Frame {
                                headers,
                                body: None,
                            }));
                        }
                    }
                }
                ParseState::Body { length, .. } => {
                    let Some(raw) = self.buffer.take_bytes(*length) else {
                        return Ok(None);
                    };
                    let body = String::from_utf8(raw)
                        .map_err(|_| Error::framing("invalid UTF-8 in frame body"))?;
                    let ParseState::Body { headers, .. } =
                        std::mem::replace(&mut self.state, ParseState::Headers)
                    else {
                        unreachable!("state checked above");
                    };
                    return Ok(Some(Frame {
                        headers,
                        body: Some(body),
                    }));
                }
            }
        }
    }
}

/// Parse `Name: value` lines. Keys are normalized, values kept raw.
fn parse_header_block(text: &str) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.find(':') else {
            return Err(Error::framing(format!("header line without colon: {line:?}")));
        };
        let key = normalize_key(line[..colon].trim());
        let value = line[colon + 1..].trim().to_string();
        headers.insert(key, value);
    }
    Ok(headers)
}

/// Body length from the (normalized) Content-Length header.
///
/// Absent or empty means no body. A non-numeric or oversized value is a
/// fatal framing error.
fn content_length(headers: &HashMap<String, String>) -> Result<Option<usize>> {
    let Some(value) = headers.get(EventHeader::ContentLength.as_str()) else {
        return Ok(None);
    };
    if value.is_empty() {
        return Ok(None);
    }
    let length: usize = value
        .parse()
        .map_err(|_| Error::framing(format!("unparsable Content-Length: {value:?}")))?;
    if length > MAX_FRAME_SIZE {
        return Err(Error::framing(format!(
            "Content-Length {} exceeds frame limit {}",
            length, MAX_FRAME_SIZE
        )));
    }
    Ok(Some(length))
}

/// Decoded frame classification: which delivery path it belongs on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decoded {
    /// command/reply or api/response — resolves the pending synchronous waiter.
    Sync(Event),
    /// Server-pushed event (plain, JSON, or a disconnect notice).
    Async(Event),
}

/// Classify a frame by Content-Type and build the unified [`Event`].
///
/// A `-ERR` reply decodes to a *recoverable* [`Error::Protocol`]; any other
/// error out of here is fatal (see [`Error::is_fatal`]).
pub(crate) fn decode_frame(frame: Frame) -> Result<Decoded> {
    let content_type = frame
        .headers
        .get(EventHeader::ContentType.as_str())
        .map(|v| v.as_str())
        .unwrap_or("");

    match content_type {
        CONTENT_TYPE_COMMAND_REPLY => {
            let Some(reply) = frame.headers.get(EventHeader::ReplyText.as_str()) else {
                return Err(Error::framing("command/reply frame without Reply-Text"));
            };
            if reply.starts_with(ERROR_MARKER) {
                return Err(Error::protocol(after_error_prefix(reply)));
            }
            // The connect response on outbound sockets arrives with every
            // value percent-encoded; the switch signals it by an escaped
            // Reply-Text.
            let decode = reply.starts_with('%');
            let body = frame.body.unwrap_or_default();
            Ok(Decoded::Sync(Event::new(
                decode_values(frame.headers, decode),
                body,
            )))
        }
        CONTENT_TYPE_API_RESPONSE => {
            let body = frame.body.unwrap_or_default();
            if body.starts_with(ERROR_MARKER) {
                return Err(Error::protocol(after_error_prefix(&body)));
            }
            Ok(Decoded::Sync(Event::new(
                decode_values(frame.headers, false),
                body,
            )))
        }
        CONTENT_TYPE_EVENT_PLAIN => {
            // The body is itself a complete frame: reenter the frame parser
            // scoped to the body bytes.
            let body = frame.body.unwrap_or_default();
            let mut nested = FrameParser::new();
            nested.add_data(body.as_bytes())?;
            let Some(inner) = nested.parse_frame()? else {
                return Err(Error::framing("incomplete nested frame in plain event"));
            };
            Ok(Decoded::Async(Event::new(
                decode_values(inner.headers, true),
                inner.body.unwrap_or_default(),
            )))
        }
        CONTENT_TYPE_EVENT_JSON => {
            let body = frame.body.unwrap_or_default();
            let parsed: HashMap<String, serde_json::Value> = serde_json::from_str(&body)?;
            let mut headers = HashMap::new();
            let mut event_body = String::new();
            for (key, value) in parsed {
                if key == "_body" {
                    event_body = match value {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        _ => String::new(),
                    };
                    continue;
                }
                let text = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                headers.insert(normalize_key(&key), text);
            }
            Ok(Decoded::Async(Event::new(headers, event_body)))
        }
        CONTENT_TYPE_DISCONNECT_NOTICE => {
            let body = frame.body.unwrap_or_default();
            Ok(Decoded::Async(Event::new(
                decode_values(frame.headers, false),
                body,
            )))
        }
        other => Err(Error::UnsupportedContentType {
            content_type: other.to_string(),
        }),
    }
}

/// Reply text after the fixed `-ERR ` prefix, empty if the reply is shorter.
fn after_error_prefix(text: &str) -> String {
    text.get(ERROR_PREFIX_LEN..).unwrap_or("").to_string()
}

/// Optionally percent-decode every header value. A value that fails to
/// decode is kept as-is rather than discarded.
fn decode_values(headers: HashMap<String, String>, decode: bool) -> HashMap<String, String> {
    if !decode {
        return headers;
    }
    headers
        .into_iter()
        .map(|(key, value)| {
            let decoded = percent_decode_str(&value)
                .decode_utf8()
                .map(|s| s.into_owned())
                .unwrap_or(value);
            (key, decoded)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(data: &[u8]) -> Result<Option<Frame>> {
        let mut parser = FrameParser::new();
        parser.add_data(data)?;
        parser.parse_frame()
    }

    #[test]
    fn parses_bare_header_block() {
        let frame = parse_all(b"Content-Type: auth/request\n\n").unwrap().unwrap();
        assert_eq!(frame.headers["Content-Type"], "auth/request");
        assert!(frame.body.is_none());
    }

    #[test]
    fn parses_body_by_content_length() {
        let frame = parse_all(b"Content-Type: api/response\nContent-Length: 2\n\nOK")
            .unwrap()
            .unwrap();
        assert_eq!(frame.body.as_deref(), Some("OK"));
    }

    #[test]
    fn content_length_zero_means_no_body() {
        let frame = parse_all(b"Content-Type: command/reply\nContent-Length: 0\n\n")
            .unwrap()
            .unwrap();
        assert!(frame.body.is_none());
    }

    #[test]
    fn content_length_case_insensitive() {
        let frame = parse_all(b"content-type: api/response\ncontent-length: 2\n\nhi")
            .unwrap()
            .unwrap();
        assert_eq!(frame.body.as_deref(), Some("hi"));
        // keys exposed in normalized casing
        assert_eq!(frame.headers["Content-Type"], "api/response");
    }

    #[test]
    fn incomplete_frame_returns_none() {
        assert!(parse_all(b"Content-Type: api/response\nContent-Length: 10\n\nfour")
            .unwrap()
            .is_none());
        assert!(parse_all(b"Content-Type: partial").unwrap().is_none());
    }

    #[test]
    fn split_delivery_reassembles() {
        let mut parser = FrameParser::new();
        let wire = b"Content-Type: api/response\nContent-Length: 5\n\nhello";
        for chunk in wire.chunks(3) {
            parser.add_data(chunk).unwrap();
        }
        let frame = parser.parse_frame().unwrap().unwrap();
        assert_eq!(frame.body.as_deref(), Some("hello"));
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut parser = FrameParser::new();
        parser
            .add_data(b"Content-Type: auth/request\n\nContent-Type: api/response\nContent-Length: 2\n\nOK")
            .unwrap();
        let first = parser.parse_frame().unwrap().unwrap();
        assert_eq!(first.headers["Content-Type"], "auth/request");
        let second = parser.parse_frame().unwrap().unwrap();
        assert_eq!(second.body.as_deref(), Some("OK"));
        assert!(parser.parse_frame().unwrap().is_none());
    }

    #[test]
    fn non_numeric_content_length_is_fatal() {
        let err = parse_all(b"Content-Type: api/response\nContent-Length: abc\n\n").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::Framing { .. }));
    }

    #[test]
    fn oversized_content_length_is_fatal() {
        let wire = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n",
            MAX_FRAME_SIZE + 1
        );
        assert!(parse_all(wire.as_bytes()).is_err());
    }

    #[test]
    fn header_line_without_colon_is_fatal() {
        let err = parse_all(b"Content-Type: auth/request\ngarbage line\n\n").unwrap_err();
        assert!(matches!(err, Error::Framing { .. }));
    }

    #[test]
    fn crlf_line_endings_tolerated_within_lf_framing() {
        let frame = parse_all(b"Content-Type: auth/request\r\nSome-Header: v\n\n")
            .unwrap()
            .unwrap();
        assert_eq!(frame.headers["Some-Header"], "v");
    }

    // --- decoder ---

    fn decode(data: &[u8]) -> Result<Decoded> {
        decode_frame(parse_all(data).unwrap().unwrap())
    }

    #[test]
    fn command_reply_ok_is_sync() {
        let decoded = decode(b"Content-Type: command/reply\nReply-Text: +OK accepted\n\n").unwrap();
        let Decoded::Sync(event) = decoded else {
            panic!("expected sync reply");
        };
        assert_eq!(event.reply_text(), Some("+OK accepted"));
    }

    #[test]
    fn command_reply_err_is_recoverable_protocol_error() {
        let err = decode(b"Content-Type: command/reply\nReply-Text: -ERR no such channel\n\n")
            .unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(err, Error::Protocol { ref message } if message == "no such channel"));
    }

    #[test]
    fn command_reply_short_error_yields_empty_message() {
        let err = decode(b"Content-Type: command/reply\nReply-Text: -ERR\n\n").unwrap_err();
        assert!(matches!(err, Error::Protocol { ref message } if message.is_empty()));
    }

    #[test]
    fn command_reply_missing_reply_text_is_fatal() {
        let err = decode(b"Content-Type: command/reply\n\n").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn command_reply_percent_escaped_values_decoded() {
        // An escaped Reply-Text (leading %) flips on percent-decoding for
        // the whole header block, as on outbound connect responses.
        let decoded = decode(
            b"Content-Type: command/reply\nReply-Text: %2BOK\nChannel-Name: sofia%2Finternal%2F1000\n\n",
        )
        .unwrap();
        let Decoded::Sync(event) = decoded else {
            panic!("expected sync reply");
        };
        assert_eq!(event.get("Reply-Text"), "+OK");
        assert_eq!(event.get("Channel-Name"), "sofia/internal/1000");
    }

    #[test]
    fn api_response_ok_carries_body() {
        let decoded =
            decode(b"Content-Type: api/response\nContent-Length: 2\n\nOK").unwrap();
        let Decoded::Sync(event) = decoded else {
            panic!("expected sync reply");
        };
        assert_eq!(event.body(), "OK");
    }

    #[test]
    fn api_response_err_is_recoverable() {
        let err = decode(b"Content-Type: api/response\nContent-Length: 20\n\n-ERR invalid command")
            .unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(err, Error::Protocol { ref message } if message == "invalid command"));
    }

    #[test]
    fn plain_event_parses_nested_frame() {
        let body = "Hello: 1\n\n";
        let wire = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let Decoded::Async(event) = decode(wire.as_bytes()).unwrap() else {
            panic!("expected async event");
        };
        assert_eq!(event.get("Hello"), "1");
        assert_eq!(event.body(), "");
    }

    #[test]
    fn plain_event_with_nested_body() {
        let inner_body = "+OK result\n";
        let body = format!(
            "Event-Name: BACKGROUND_JOB\nJob-UUID: abc-123\nContent-Length: {}\n\n{}",
            inner_body.len(),
            inner_body
        );
        let wire = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let Decoded::Async(event) = decode(wire.as_bytes()).unwrap() else {
            panic!("expected async event");
        };
        assert_eq!(event.event_name(), Some("BACKGROUND_JOB"));
        assert_eq!(event.job_uuid(), Some("abc-123"));
        assert_eq!(event.body(), inner_body);
    }

    #[test]
    fn plain_event_headers_percent_decoded() {
        let body = "Event-Name: HEARTBEAT\nUp-Time: 0%20years%2C%200%20days\n\n";
        let wire = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let Decoded::Async(event) = decode(wire.as_bytes()).unwrap() else {
            panic!("expected async event");
        };
        assert_eq!(event.get("Up-Time"), "0 years, 0 days");
    }

    #[test]
    fn plain_event_invalid_percent_value_kept_raw() {
        let body = "Bad-Value: %ZZnope\n\n";
        let wire = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let Decoded::Async(event) = decode(wire.as_bytes()).unwrap() else {
            panic!("expected async event");
        };
        assert_eq!(event.get("Bad-Value"), "%ZZnope");
    }

    #[test]
    fn plain_event_truncated_nested_frame_is_fatal() {
        let body = "Hello: 1\n"; // no terminating blank line
        let wire = format!(
            "Content-Type: text/event-plain\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let err = decode(wire.as_bytes()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn json_event_normalizes_keys_and_extracts_body() {
        let body = r#"{"Event-Name":"CHANNEL_HANGUP","job-uuid":"j-1","_body":"payload"}"#;
        let wire = format!(
            "Content-Type: text/event-json\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let Decoded::Async(event) = decode(wire.as_bytes()).unwrap() else {
            panic!("expected async event");
        };
        assert_eq!(event.event_name(), Some("CHANNEL_HANGUP"));
        assert_eq!(event.job_uuid(), Some("j-1"));
        assert_eq!(event.body(), "payload");
        assert_eq!(event.header("_body"), None);
    }

    #[test]
    fn json_event_variable_keys_match_plain_encoding() {
        // The invariant: the same header must normalize identically from
        // both encodings.
        let body = r#"{"variable_sip_call_id":"abc@host"}"#;
        let wire = format!(
            "Content-Type: text/event-json\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let Decoded::Async(event) = decode(wire.as_bytes()).unwrap() else {
            panic!("expected async event");
        };
        assert_eq!(event.get("Variable_sip_call_id"), "abc@host");
    }

    #[test]
    fn json_event_scalar_values_stringified() {
        let body = r#"{"Event-Sequence":5102,"Answered":true}"#;
        let wire = format!(
            "Content-Type: text/event-json\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let Decoded::Async(event) = decode(wire.as_bytes()).unwrap() else {
            panic!("expected async event");
        };
        assert_eq!(event.get_int("Event-Sequence").unwrap(), 5102);
        assert_eq!(event.get("Answered"), "true");
    }

    #[test]
    fn json_event_non_scalar_body_is_empty() {
        let body = r#"{"Event-Name":"CUSTOM","_body":{"nested":1}}"#;
        let wire = format!(
            "Content-Type: text/event-json\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let Decoded::Async(event) = decode(wire.as_bytes()).unwrap() else {
            panic!("expected async event");
        };
        assert_eq!(event.body(), "");
        assert_eq!(event.header("_body"), None);
    }

    #[test]
    fn json_event_unparsable_body_is_fatal() {
        let body = "not json at all";
        let wire = format!(
            "Content-Type: text/event-json\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        let err = decode(wire.as_bytes()).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn disconnect_notice_is_async_event() {
        let decoded = decode(
            b"Content-Type: text/disconnect-notice\nContent-Disposition: disconnect\n\n",
        )
        .unwrap();
        let Decoded::Async(event) = decoded else {
            panic!("expected async event");
        };
        assert_eq!(event.get("Content-Disposition"), "disconnect");
    }

    #[test]
    fn unknown_content_type_is_fatal() {
        let err = decode(b"Content-Type: text/event-xml\nContent-Length: 0\n\n").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::UnsupportedContentType { ref content_type } if content_type == "text/event-xml"
        ));
    }

    #[test]
    fn missing_content_type_is_fatal() {
        let err = decode(b"Reply-Text: +OK\n\n").unwrap_err();
        assert!(matches!(err, Error::UnsupportedContentType { .. }));
    }
}
