//! Protocol constants and configuration values

/// Default port the IVR server listens on for outbound socket connections
pub const DEFAULT_LISTEN_PORT: u16 = 8084;

/// Socket buffer size for reading from the TCP stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Buffer allocation size (64KB) - used for both initial allocation and growth increments
pub const BUF_CHUNK: usize = 64 * 1024;

/// Maximum single message size (8MB) - validates Content-Length header
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Maximum total buffer size (16MB) - safety limit to prevent runaway memory
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol message terminators
pub const HEADER_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\n";

/// Content-Type header values
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_TEXT_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Protocol framing header names.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";

/// Marker FreeSWITCH puts in `Reply-Text` when it rejects a command.
/// Matched case-insensitively (`-ERR`, `-Err`).
pub const REPLY_ERROR_MARKER: &str = "-ERR";

/// JSON event key carrying the event body.
pub const JSON_BODY_KEY: &str = "_body";

/// Event name synthesized for disconnect notices.
pub const EVENT_NAME_HANGUP: &str = "HANGUP";

/// Events subscribed to right after `connect`.
pub const SUBSCRIBED_EVENTS: &str = "PLAYBACK_START PLAYBACK_STOP DTMF CHANNEL_ANSWER";

/// Command reply timeout in milliseconds
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 3000;

/// Delay after answering before the root node hands over, in milliseconds
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 1000;

/// Root directory prompt phrase files resolve under
pub const DEFAULT_SOUND_ROOT: &str = "/opt/Dev/IVR/sound/";

/// Capacity of the per-call pending DTMF queue
pub const DTMF_QUEUE_CAPACITY: usize = 20;

/// Shortest call-flow file polling period, in milliseconds
pub const MIN_RELOAD_INTERVAL_MS: u64 = 100;

/// Node the interpreter starts a new call on
pub const DEFAULT_START_NODE: &str = "root";

/// Reserved recovery node for timeouts
pub const NO_INPUT_NODE: &str = "NoInput";

/// Reserved recovery node for invalid input
pub const NO_MATCH_NODE: &str = "NoMatch";

/// Call metadata keys captured on `CHANNEL_ANSWER`
pub const PARAM_ANI: &str = "ANI";
pub const PARAM_DNIS: &str = "DNIS";
pub const PARAM_CALL_ID: &str = "callId";
pub const PARAM_CONN_ID: &str = "connId";
