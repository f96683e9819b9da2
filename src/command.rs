//! Outbound command encoding.
//!
//! Commands are line-delimited; every user-supplied piece is checked for raw
//! CR/LF before a single byte is written, since an embedded newline would let
//! a caller inject arbitrary protocol commands.

use crate::constants::COMMAND_TERMINATOR;
use crate::error::Result;

/// Reject strings that would break the line framing.
pub(crate) fn validate_no_newlines(s: &str, context: &str) -> Result<()> {
    if s.contains('\r') || s.contains('\n') {
        return Err(crate::error::Error::invalid_command(context));
    }
    Ok(())
}

/// Encode a bare command line (`api status`, `events plain ALL`, ...),
/// terminated by two CRLFs.
pub(crate) fn encode_command(command: &str) -> Result<String> {
    validate_no_newlines(command, "command")?;
    Ok(format!("{command}{COMMAND_TERMINATOR}"))
}

/// A `sendmsg` block: the generic field-based format used to issue
/// call-control directives.
///
/// Fields with empty values are omitted from the wire entirely — presence is
/// the protocol's boolean signal, so callers can populate a fixed field set
/// and leave unset ones empty. The payload is appended only when a non-empty
/// `content-length` field (lower-case key, as the switch expects) was set.
///
/// ```
/// use eventsocket::Msg;
///
/// let msg = Msg::new()
///     .field("call-command", "execute")
///     .field("execute-app-name", "playback")
///     .field("execute-app-arg", "/tmp/test.wav");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Msg {
    fields: Vec<(String, String)>,
    uuid: Option<String>,
    payload: Option<String>,
}

impl Msg {
    /// An empty message block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `key: value` field. Empty values are kept here but omitted
    /// from the encoded block.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Target a specific call leg (inbound mode, several calls on one
    /// connection).
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Trailing application payload; only written when a `content-length`
    /// field was set.
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// `call-command: execute` specialization. `event-lock` is present only
    /// when `lock` is requested — omission, not `false`, is the off signal.
    pub fn execute(app_name: &str, app_arg: &str, lock: bool) -> Self {
        Msg::new()
            .field("call-command", "execute")
            .field("execute-app-name", app_name)
            .field("execute-app-arg", app_arg)
            .field("event-lock", if lock { "true" } else { "" })
    }

    /// Validate every user-supplied part, then produce the wire block.
    pub(crate) fn to_wire(&self) -> Result<String> {
        let mut out = String::from("sendmsg");
        if let Some(uuid) = &self.uuid {
            validate_no_newlines(uuid, "sendmsg uuid")?;
            out.push(' ');
            out.push_str(uuid);
        }
        out.push('\n');

        let mut content_length_set = false;
        for (key, value) in &self.fields {
            validate_no_newlines(key, "sendmsg field key")?;
            validate_no_newlines(value, "sendmsg field value")?;
            if value.is_empty() {
                continue;
            }
            if key == "content-length" {
                content_length_set = true;
            }
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');

        if content_length_set {
            if let Some(payload) = self.payload.as_deref() {
                out.push_str(payload);
            }
        }
        Ok(out)
    }
}
