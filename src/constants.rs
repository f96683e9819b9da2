//! Protocol constants and configuration defaults

/// Default FreeSWITCH ESL port for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Socket buffer size for reading from the TCP stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 64 * 1024;

/// Maximum single frame size (8MB) - validates Content-Length header.
/// No legitimate ESL frame should exceed this (largest is sofia status ~1-2MB).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Maximum total parse buffer size (16MB) - safety limit to prevent runaway
/// memory. Holds two max frames plus overhead.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default capacity of the async-event delivery channel. Small on purpose:
/// a full queue backpressures the demux task instead of dropping events.
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 16;

/// Inbound frames: header block terminator
pub const HEADER_TERMINATOR: &str = "\n\n";
/// Outbound commands: command terminator (two CRLFs after the command text)
pub const COMMAND_TERMINATOR: &str = "\r\n\r\n";

/// Content-Type header values dispatched on by the event decoder
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Reply-Text value the switch sends on accepted credentials
pub const AUTH_ACCEPTED_REPLY: &str = "+OK accepted";

/// Error marker prefix on Reply-Text / api response bodies (`-ERR ...`)
pub const ERROR_MARKER: &str = "-E";
/// Length of the full error code prefix (`-ERR `) stripped from messages
pub const ERROR_PREFIX_LEN: usize = 5;
