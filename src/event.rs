//! The unified event value produced by the decoder.

use crate::error::{Error, Result};
use crate::headers::EventHeader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One decoded protocol frame: a command reply, an api response, or an
/// asynchronous event.
///
/// Header keys are canonicalized by
/// [`normalize_key`](crate::headers::normalize_key) at decode time for both
/// the plain-text and JSON encodings, so lookups never depend on which
/// encoding the switch chose (`Job-Uuid`, `Variable_sip_call_id`, ...).
/// JSON values that are not strings are converted to their text form.
///
/// Events are constructed by the connection's demux task and immutable once
/// delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    headers: HashMap<String, String>,
    body: String,
}

impl Event {
    pub(crate) fn new(headers: HashMap<String, String>, body: String) -> Self {
        Self { headers, body }
    }

    /// Header value for `key`, or `""` if absent. Never fails.
    ///
    /// Keys are the normalized forms; [`EventHeader`] variants can be passed
    /// directly:
    ///
    /// ```
    /// # use eventsocket::{Event, EventHeader};
    /// # let event = Event::default();
    /// let name = event.get(EventHeader::EventName);
    /// let custom = event.get("Variable_sip_call_id");
    /// ```
    pub fn get(&self, key: impl AsRef<str>) -> &str {
        self.headers
            .get(key.as_ref())
            .map(|v| v.as_str())
            .unwrap_or("")
    }

    /// Header value for `key`, or `None` if absent.
    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        self.headers.get(key.as_ref()).map(|v| v.as_str())
    }

    /// Header value parsed as a base-10 integer.
    ///
    /// Fails with [`Error::Conversion`] if the header is absent or not
    /// numeric.
    pub fn get_int(&self, key: impl AsRef<str>) -> Result<i64> {
        let key = key.as_ref();
        match self.headers.get(key) {
            Some(value) => value.parse().map_err(|_| Error::Conversion {
                key: key.to_string(),
                value: Some(value.clone()),
            }),
            None => Err(Error::Conversion {
                key: key.to_string(),
                value: None,
            }),
        }
    }

    /// All headers, keyed by normalized name.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Raw body payload, empty if the frame carried none.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// `Event-Name` header (`CHANNEL_ANSWER`, `BACKGROUND_JOB`, ...).
    pub fn event_name(&self) -> Option<&str> {
        self.header(EventHeader::EventName)
    }

    /// `Unique-Id` header, falling back to `Caller-Unique-Id`.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(EventHeader::UniqueId)
            .or_else(|| self.header(EventHeader::CallerUniqueId))
    }

    /// `Job-Uuid` header correlating `bgapi` results.
    pub fn job_uuid(&self) -> Option<&str> {
        self.header(EventHeader::JobUuid)
    }

    /// Raw `Reply-Text` header on command replies.
    pub fn reply_text(&self) -> Option<&str> {
        self.header(EventHeader::ReplyText)
    }
}

/// Diagnostic dump: headers in lexicographic key order, then the body if
/// present. Not part of the wire protocol.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.headers.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        for key in keys {
            writeln!(f, "{}: {}", key, self.headers[key])?;
        }
        if !self.body.is_empty() {
            writeln!(f, "BODY: {}", self.body)?;
        }
        Ok(())
    }
}
