//! ESL protocol parsing and message classification

use crate::{
    buffer::EslBuffer,
    command::EslResponse,
    constants::{
        CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_COMMAND_REPLY, CONTENT_TYPE_DISCONNECT_NOTICE,
        CONTENT_TYPE_TEXT_EVENT_JSON, CONTENT_TYPE_TEXT_EVENT_PLAIN, EVENT_NAME_HANGUP,
        HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_REPLY_TEXT, HEADER_TERMINATOR,
        JSON_BODY_KEY, MAX_MESSAGE_SIZE, REPLY_ERROR_MARKER,
    },
    error::{EslError, EslResult},
    event::EslEvent,
    headers::EventHeader,
};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;

/// ESL message types, keyed by `Content-Type`
#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    /// Reply to a command (`connect`, `event`, `sendmsg`)
    CommandReply,
    /// API response (never requested by the IVR)
    ApiResponse,
    /// Event in plain text format
    EventPlain,
    /// Event in JSON format
    EventJson,
    /// Disconnect notice
    Disconnect,
    /// Unknown or missing content type
    Unknown(String),
}

impl MessageType {
    /// Parse message type from Content-Type header
    pub fn from_content_type(content_type: &str) -> Self {
        match content_type {
            CONTENT_TYPE_COMMAND_REPLY => MessageType::CommandReply,
            CONTENT_TYPE_API_RESPONSE => MessageType::ApiResponse,
            CONTENT_TYPE_TEXT_EVENT_PLAIN => MessageType::EventPlain,
            CONTENT_TYPE_TEXT_EVENT_JSON => MessageType::EventJson,
            CONTENT_TYPE_DISCONNECT_NOTICE => MessageType::Disconnect,
            _ => MessageType::Unknown(content_type.to_string()),
        }
    }
}

/// Parsed ESL message
#[derive(Debug, Clone)]
pub struct EslMessage {
    /// Message type
    pub message_type: MessageType,
    /// Message headers, percent-decoded
    pub headers: HashMap<String, String>,
    /// Message body (optional)
    pub body: Option<String>,
}

impl EslMessage {
    /// Create new message
    pub fn new(
        message_type: MessageType,
        headers: HashMap<String, String>,
        body: Option<String>,
    ) -> Self {
        Self {
            message_type,
            headers,
            body,
        }
    }

    /// Convert to EslResponse
    pub fn into_response(self) -> EslResponse {
        EslResponse::new(self.headers, self.body)
    }
}

/// What the reader loop does with a classified message.
#[derive(Debug)]
pub enum Inbound {
    /// Deliver to the pending command slot.
    Reply(EslResult<EslResponse>),
    /// Dispatch to the session.
    Event(EslEvent),
    /// Dispatch to the session, then stop reading.
    Disconnect(EslEvent),
    /// Nothing to do.
    Ignored(MessageType),
}

/// Parser state for handling incomplete messages
#[derive(Debug)]
enum ParseState {
    WaitingForHeaders,
    WaitingForBody {
        message_type: MessageType,
        headers: HashMap<String, String>,
        body_length: usize,
    },
}

/// ESL protocol parser
pub struct EslParser {
    buffer: EslBuffer,
    state: ParseState,
}

impl EslParser {
    /// Create new parser
    pub fn new() -> Self {
        Self {
            buffer: EslBuffer::new(),
            state: ParseState::WaitingForHeaders,
        }
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> EslResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()?;
        Ok(())
    }

    /// Try to parse a complete message from the buffer
    pub fn parse_message(&mut self) -> EslResult<Option<EslMessage>> {
        match &self.state {
            ParseState::WaitingForHeaders => {
                let terminator = HEADER_TERMINATOR.as_bytes();

                let Some(headers_data) = self
                    .buffer
                    .extract_until_pattern(terminator)
                else {
                    return Ok(None);
                };
                self.buffer
                    .compact();

                let headers_str = String::from_utf8(headers_data)
                    .map_err(|_| EslError::protocol_error("Invalid UTF-8 in headers"))?;
                let headers = parse_headers(&headers_str)?;

                let message_type = headers
                    .get(HEADER_CONTENT_TYPE)
                    .map(|ct| MessageType::from_content_type(ct))
                    .unwrap_or_else(|| MessageType::Unknown(String::new()));

                let length = match headers.get(HEADER_CONTENT_LENGTH) {
                    Some(length_str) => length_str
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| EslError::InvalidHeader {
                            header: format!("Content-Length: {}", length_str),
                        })?,
                    None => 0,
                };

                if length > MAX_MESSAGE_SIZE {
                    return Err(EslError::protocol_error(format!(
                        "Message too large: Content-Length {} exceeds limit {}",
                        length, MAX_MESSAGE_SIZE
                    )));
                }

                if length == 0 {
                    return Ok(Some(EslMessage::new(message_type, headers, None)));
                }

                self.state = ParseState::WaitingForBody {
                    message_type,
                    headers,
                    body_length: length,
                };
                self.parse_message()
            }
            ParseState::WaitingForBody { body_length, .. } => {
                let Some(body_data) = self
                    .buffer
                    .extract_bytes(*body_length)
                else {
                    return Ok(None);
                };
                self.buffer
                    .compact();

                let body = String::from_utf8(body_data)
                    .map_err(|_| EslError::protocol_error("Invalid UTF-8 in body"))?;

                let ParseState::WaitingForBody {
                    message_type,
                    headers,
                    ..
                } = std::mem::replace(&mut self.state, ParseState::WaitingForHeaders)
                else {
                    unreachable!("state checked above");
                };
                Ok(Some(EslMessage::new(message_type, headers, Some(body))))
            }
        }
    }
}

impl Default for EslParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `Name: value` lines, percent-decoding values.
///
/// Values that are not valid percent-encoded UTF-8 are kept raw. `+` is left
/// alone: FreeSWITCH encodes spaces as `%20`, and `+OK` must survive.
fn parse_headers(headers_str: &str) -> EslResult<HashMap<String, String>> {
    let mut headers = HashMap::new();

    for line in headers_str.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(colon_pos) = line.find(':') else {
            return Err(EslError::InvalidHeader {
                header: line.to_string(),
            });
        };
        let key = line[..colon_pos]
            .trim()
            .to_string();
        let raw_value = line[colon_pos + 1..].trim();
        let value = percent_decode_str(raw_value)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| raw_value.to_string());
        headers.insert(key, value);
    }

    Ok(headers)
}

/// `true` if a `Reply-Text` carries the switch's error marker.
pub fn is_error_reply(reply_text: &str) -> bool {
    reply_text
        .to_ascii_uppercase()
        .contains(REPLY_ERROR_MARKER)
}

/// Decide what the reader loop does with a message.
///
/// Only `text/event-json` bodies can fail to decode; that failure is a
/// protocol error and ends the connection.
pub fn classify(message: EslMessage) -> EslResult<Inbound> {
    match message.message_type {
        MessageType::CommandReply => {
            let reply_text = message
                .headers
                .get(HEADER_REPLY_TEXT)
                .cloned()
                .unwrap_or_default();
            if is_error_reply(&reply_text) {
                return Ok(Inbound::Reply(Err(EslError::CommandRejected { reply_text })));
            }
            Ok(Inbound::Reply(Ok(message.into_response())))
        }
        MessageType::EventJson => parse_json_event(message).map(Inbound::Event),
        MessageType::Disconnect => Ok(Inbound::Disconnect(disconnect_event(message))),
        other => Ok(Inbound::Ignored(other)),
    }
}

/// Build an event from a `text/event-json` message.
///
/// Envelope headers are kept, then every top-level string member of the body
/// object becomes a header. Non-string members are dropped. `_body` becomes
/// the event body.
fn parse_json_event(message: EslMessage) -> EslResult<EslEvent> {
    let body = message
        .body
        .ok_or_else(|| EslError::protocol_error("JSON event missing body"))?;

    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&body)?;

    let mut event = EslEvent::new();
    for (key, value) in message.headers {
        event.set_header(key, value);
    }
    for (key, value) in object {
        if let serde_json::Value::String(s) = value {
            event.set_header(key, s);
        }
    }

    if let Some(inner_body) = event.del_header(JSON_BODY_KEY) {
        event.set_body(inner_body);
    }

    Ok(event)
}

/// Synthesize the `HANGUP` event for a disconnect notice.
fn disconnect_event(message: EslMessage) -> EslEvent {
    let mut event = EslEvent::new();
    for (key, value) in message.headers {
        event.set_header(key, value);
    }
    if let Some(body) = message.body {
        event.set_body(body);
    }

    let session_uuid = event
        .header_ignore_case(EventHeader::ControlledSessionUuid)
        .unwrap_or_default()
        .to_string();
    event.set_header(EventHeader::EventName.as_str(), EVENT_NAME_HANGUP);
    event.set_header(EventHeader::ChannelCallUuid.as_str(), session_uuid);
    event
}
