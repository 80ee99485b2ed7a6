//! Protocol constants and configuration values

/// Default switch event socket port for dial-out connections
pub const DEFAULT_DIAL_OUT_PORT: u16 = 8021;

/// Default listening port for dial-in connections (the switch dials in,
/// one connection per call)
pub const DEFAULT_DIAL_IN_PORT: u16 = 8084;

/// Socket buffer size for reading from the TCP stream (64KB) - standard TCP receive window
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum single frame size (8MB) - validates the content-length header
/// No legitimate frame should exceed this (largest is sofia status ~1-2MB)
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Maximum inbound buffer size (16MB) - safety limit to prevent runaway memory
/// Should hold 2 max frames + overhead. Indicates a bug if exceeded.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Frame terminators
pub const HEADER_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\n";

/// content_type values with protocol-level meaning
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Framing header names, in the normalized form used by
/// [`HeaderMap`](crate::HeaderMap) (lowercase, `-` folded to `_`).
pub const HEADER_CONTENT_TYPE: &str = "content_type";
/// Framing header: content block length in bytes.
pub const HEADER_CONTENT_LENGTH: &str = "content_length";
/// Framing header: command reply status text (`+OK …` / `-ERR …`).
pub const HEADER_REPLY_TEXT: &str = "reply_text";
/// Content field identifying an event frame.
pub const HEADER_EVENT_NAME: &str = "event_name";

/// Terminal status line of tabular API responses
pub const TABLE_END_MARKER: &str = "+OK";

/// TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
