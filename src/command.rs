//! Command wire formatting and reply handling

use crate::{
    constants::{HEADER_REPLY_TEXT, HEADER_TERMINATOR, LINE_TERMINATOR},
    error::{EslError, EslResult},
    headers::EventHeader,
};
use std::collections::HashMap;

/// Validate that a user-provided string contains no newline characters.
///
/// ESL commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// Reply to a command
#[derive(Debug, Clone, PartialEq)]
pub struct EslResponse {
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl EslResponse {
    pub fn new(headers: HashMap<String, String>, body: Option<String>) -> Self {
        Self { headers, body }
    }

    /// Reply body, if the reply carried a Content-Length.
    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
    }

    /// Look up a reply header by name.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// All reply headers.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Raw `Reply-Text` header value (e.g. `+OK`).
    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// `Channel-Unique-ID` carried by the `connect` reply.
    ///
    /// Looked up case-insensitively; FreeSWITCH versions disagree on `-ID`/`-Id`.
    pub fn channel_unique_id(&self) -> Option<&str> {
        let name = EventHeader::ChannelUniqueId.as_str();
        self.header(name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.as_str())
            })
            .filter(|v| !v.is_empty())
    }

    /// The value a command resolves to: the channel id when the reply carries
    /// one, otherwise the reply text.
    pub fn value(&self) -> String {
        self.channel_unique_id()
            .or_else(|| self.reply_text())
            .unwrap_or_default()
            .to_string()
    }
}

/// Builder for commands carrying headers.
///
/// Headers are written in insertion order.
///
/// ```
/// use freeswitch_ivr_tokio::CommandBuilder;
///
/// let cmd = CommandBuilder::new("sendmsg")
///     .header("call-command", "execute").unwrap()
///     .header("execute-app-name", "answer").unwrap()
///     .build();
/// assert_eq!(cmd, "sendmsg\ncall-command: execute\nexecute-app-name: answer\n\n");
/// ```
#[derive(Debug)]
pub struct CommandBuilder {
    command: String,
    headers: Vec<(String, String)>,
}

impl CommandBuilder {
    /// Start building a command with the given command line.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
        }
    }

    /// Append a header.
    ///
    /// Returns an error if the name or value contains newline characters.
    pub fn header(mut self, name: &str, value: &str) -> EslResult<Self> {
        validate_no_newlines(name, "header name")?;
        validate_no_newlines(value, "header value")?;
        self.headers
            .push((name.to_string(), value.to_string()));
        Ok(self)
    }

    /// Build the command string
    pub fn build(self) -> String {
        use std::fmt::Write;
        let mut result = self.command;
        result.push_str(LINE_TERMINATOR);

        for (key, value) in &self.headers {
            let _ = write!(result, "{}: {}{}", key, value, LINE_TERMINATOR);
        }

        result.push_str(LINE_TERMINATOR);
        result
    }
}

/// Commands the IVR sends over an outbound socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EslCommand {
    /// Attach to the session; the reply carries the channel data
    Connect,
    /// Subscribe to events
    Events { format: String, events: String },
    /// Execute a dialplan application on the attached channel
    Execute { app: String, args: Option<String> },
    /// Caller-supplied command line, sent as-is
    Raw(String),
}

impl EslCommand {
    /// Format a simple command with optional arguments
    fn format_simple_command(cmd: &str, args: &[&str]) -> String {
        let mut result = String::from(cmd);
        for arg in args {
            result.push(' ');
            result.push_str(arg);
        }
        result.push_str(HEADER_TERMINATOR);
        result
    }

    /// Short form used in logs and timeout errors.
    pub fn summary(&self) -> String {
        match self {
            EslCommand::Connect => "connect".to_string(),
            EslCommand::Events { format, events } => format!("event {} {}", format, events),
            EslCommand::Execute { app, .. } => app.clone(),
            EslCommand::Raw(raw) => raw
                .trim()
                .to_string(),
        }
    }

    /// Validate all user-supplied fields, then convert to wire format.
    pub fn to_wire_format(&self) -> EslResult<String> {
        match self {
            EslCommand::Connect => Ok(Self::format_simple_command("connect", &[])),
            EslCommand::Events { format, events } => {
                validate_no_newlines(format, "event format")?;
                validate_no_newlines(events, "event list")?;
                Ok(Self::format_simple_command("event", &[format, events]))
            }
            EslCommand::Execute { app, args } => {
                let mut builder = CommandBuilder::new("sendmsg")
                    .header("call-command", "execute")?
                    .header("execute-app-name", app)?;
                if let Some(args) = args.as_deref() {
                    if !args.is_empty() {
                        builder = builder.header("execute-app-arg", args)?;
                    }
                }
                Ok(builder
                    .header("event-lock", "true")?
                    .build())
            }
            EslCommand::Raw(raw) => {
                let line = raw.trim_end_matches(['\n', '\r']);
                if line.is_empty() {
                    return Err(EslError::protocol_error("empty command"));
                }
                Ok(format!("{}{}", line, HEADER_TERMINATOR))
            }
        }
    }
}
