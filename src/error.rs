//! Error types for the event socket protocol

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes of an event socket session.
///
/// Errors split into two families, distinguished by [`Error::is_fatal`]:
///
/// - **Fatal** errors terminate the connection. The stream can no longer be
///   trusted to be at a frame boundary (framing/transport failures) or the
///   session is gone entirely. The demux task delivers a fatal error at most
///   once: to the pending command waiter if there is one, otherwise onto the
///   event channel if it has room. It then flips the shared status to
///   disconnected; the status watch, not the error delivery, is the
///   authoritative closure signal for every handle.
/// - **Recoverable** errors (`Protocol`, `InvalidCommand`, `Conversion`) are
///   returned to the one caller whose request caused them; the connection
///   keeps running.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Stream read/write failure. Fatal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed header block, unparsable Content-Length, or an oversized
    /// frame. Fatal: the stream position is no longer at a frame boundary.
    #[error("framing error: {message}")]
    Framing { message: String },

    /// The switch answered a command with `-ERR ...`. Recoverable: the
    /// message carries the reply text after the error-code prefix.
    #[error("{message}")]
    Protocol { message: String },

    /// A frame arrived with a Content-Type this crate does not speak.
    /// Fatal: stream synchronization cannot be trusted past it.
    #[error("unsupported content type: {content_type}")]
    UnsupportedContentType { content_type: String },

    /// The client handshake did not see the expected `auth/request` banner.
    #[error("handshake error: {message}")]
    Handshake { message: String },

    /// The switch rejected the credentials during the client handshake.
    #[error("authentication rejected: {reply_text}")]
    AuthRejected { reply_text: String },

    /// A command, sendmsg field, or UUID contained a raw CR or LF.
    /// Rejected before any bytes hit the wire; the connection stays usable.
    #[error("invalid command: {context} must not contain CR or LF")]
    InvalidCommand { context: String },

    /// `Event::get_int` on a header that is absent or not a base-10 integer.
    #[error("header {key:?} is not an integer (value: {value:?})")]
    Conversion { key: String, value: Option<String> },

    /// A `text/event-json` body failed to parse. Fatal.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stream closed (EOF) or the demux task has already shut down.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    pub(crate) fn framing(message: impl Into<String>) -> Self {
        Error::Framing {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn handshake(message: impl Into<String>) -> Self {
        Error::Handshake {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_command(context: impl Into<String>) -> Self {
        Error::InvalidCommand {
            context: context.into(),
        }
    }

    /// Whether this error terminates the connection.
    ///
    /// The demux loop keeps running after a recoverable error (a `-ERR`
    /// reply belongs to exactly one caller); anything else tears the
    /// session down.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Protocol { .. } | Error::InvalidCommand { .. } | Error::Conversion { .. }
        )
    }
}
