//! Error types for the event socket engine, the call-flow interpreter and
//! call-flow loading.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the event socket engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EslError {
    /// Socket read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or unexpected protocol state. Fatal to the connection.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A header line could not be parsed.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// A `text/event-json` body was not a JSON object.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No reply arrived within the command timeout.
    #[error("command '{command}' timed out after {timeout_ms}ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    /// The switch replied with an error marker.
    #[error("command rejected: {reply_text}")]
    CommandRejected { reply_text: String },

    /// The engine was stopped before the command was sent.
    #[error("not connected")]
    NotConnected,

    /// The connection closed while a reply was pending.
    #[error("connection closed")]
    ConnectionClosed,
}

impl EslError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        EslError::ProtocolError {
            message: message.into(),
        }
    }

    /// `true` for [`EslError::CommandTimeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, EslError::CommandTimeout { .. })
    }
}

/// Result alias for engine operations.
pub type EslResult<T> = Result<T, EslError>;

/// Errors that halt the call-flow of a single call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IvrError {
    /// The call ended while a node was running, or a node was entered after hangup.
    #[error("channel hung up")]
    ChannelHangup,

    /// The call-flow references a node that does not exist.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A prompt-collect node references a grammar that does not exist.
    #[error("grammar '{grammar}' referenced by node '{node}' not found")]
    GrammarNotFound { grammar: String, node: String },

    /// A command issued by a node failed.
    #[error(transparent)]
    Esl(#[from] EslError),
}

/// Result alias for interpreter operations.
pub type IvrResult<T> = Result<T, IvrError>;

/// Errors raised while loading a call-flow definition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("cannot read call-flow file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed call-flow document: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("grammar '{grammar}' has an invalid pattern: {source}")]
    InvalidPattern {
        grammar: String,
        #[source]
        source: regex::Error,
    },
}
