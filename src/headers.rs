//! Header-key normalization and typed header names.
//!
//! The switch is inconsistent about header casing between its plain and JSON
//! encodings (`Job-UUID` on the wire, `Job-Uuid` after normalization,
//! `variable_sip_call_id` vs `Variable_sip_call_id`, ...). Every decoded
//! frame runs its keys through [`normalize_key`] so downstream lookups use
//! one fixed casing convention regardless of the source encoding.

/// Canonicalize a header key.
///
/// The rules, applied left to right:
///
/// 1. Keys beginning with `_` are internal markers and left untouched.
/// 2. Keys whose second through ninth bytes are `ariable_` (matching a
///    `[Vv]ariable_` prefix) are lower-cased wholesale with the first byte
///    forced to `V`: `variable_SIP_Call_ID` → `Variable_sip_call_id`.
/// 3. Otherwise lower-case the key, then upper-case the first character and
///    every character following a `-` or `_`: `job-uuid` → `Job-Uuid`.
///
/// Idempotent: `normalize_key(normalize_key(k)) == normalize_key(k)`.
pub fn normalize_key(key: &str) -> String {
    if key.is_empty() || key.starts_with('_') {
        return key.to_string();
    }
    let mut out = key.to_ascii_lowercase().into_bytes();
    if key.len() > 9 && &key.as_bytes()[1..9] == b"ariable_" {
        out[0] = b'V';
    } else {
        let mut upper = true;
        for b in out.iter_mut() {
            if upper {
                b.make_ascii_uppercase();
                upper = false;
            } else if *b == b'-' || *b == b'_' {
                upper = true;
            }
        }
    }
    // ASCII-only transforms preserve UTF-8 validity.
    String::from_utf8(out).unwrap_or_else(|_| key.to_string())
}

/// Error returned when parsing an unrecognized header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventHeaderError(pub String);

impl std::fmt::Display for ParseEventHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event header: {}", self.0)
    }
}

impl std::error::Error for ParseEventHeaderError {}

wire_name_enum! {
    error_type: ParseEventHeaderError,
    /// Well-known header names in their post-normalization casing.
    ///
    /// These are the names as they appear in a decoded [`Event`](crate::Event)
    /// (note `Job-Uuid`, not the wire's `Job-UUID`). Use with
    /// [`Event::get()`](crate::Event::get) for typo-proof lookups.
    pub enum EventHeader {
        ContentType => "Content-Type",
        ContentLength => "Content-Length",
        ContentDisposition => "Content-Disposition",
        ReplyText => "Reply-Text",
        EventName => "Event-Name",
        EventSubclass => "Event-Subclass",
        JobUuid => "Job-Uuid",
        UniqueId => "Unique-Id",
        CallerUniqueId => "Caller-Unique-Id",
        ChannelName => "Channel-Name",
        Application => "Application",
        ApplicationResponse => "Application-Response",
        HangupCause => "Hangup-Cause",
    }
}
