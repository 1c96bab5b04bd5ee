//! ESL event types and structures

use crate::headers::EventHeader;
use std::collections::HashMap;
use std::fmt;

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

define_header_enum! {
    error_type: ParseEventTypeError,
    /// Event names the IVR reacts to.
    ///
    /// `Hangup` never appears on the wire; the parser synthesizes it from a
    /// `text/disconnect-notice`.
    pub enum EslEventType {
        ChannelAnswer => "CHANNEL_ANSWER",
        ChannelHangup => "CHANNEL_HANGUP",
        ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
        Dtmf => "DTMF",
        PlaybackStart => "PLAYBACK_START",
        PlaybackStop => "PLAYBACK_STOP",
        Hangup => "HANGUP",
    }
}

/// ESL Event structure containing headers and optional body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EslEvent {
    headers: HashMap<String, String>,
    body: Option<String>,
}

impl EslEvent {
    /// Create a new empty event
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an event carrying only an `Event-Name` header
    pub fn with_type(event_type: EslEventType) -> Self {
        let mut event = Self::new();
        event.set_header(EventHeader::EventName.as_str(), event_type.as_str());
        event
    }

    /// Parsed `Event-Name`, if it is one the IVR knows.
    pub fn event_type(&self) -> Option<EslEventType> {
        self.event_name()?
            .parse()
            .ok()
    }

    /// Raw `Event-Name` header.
    pub fn event_name(&self) -> Option<&str> {
        self.header(EventHeader::EventName)
    }

    /// Check whether this event matches the given type.
    pub fn is_event_type(&self, event_type: EslEventType) -> bool {
        self.event_type() == Some(event_type)
    }

    /// Look up a header by name (case-sensitive).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// Look up a header, falling back to a case-insensitive scan.
    ///
    /// FreeSWITCH is not consistent about casing on some framing headers
    /// (`Controlled-Session-UUID`, `Channel-Unique-ID`).
    pub fn header_ignore_case(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.header(name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.as_str())
            })
    }

    /// All headers as a map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Set or overwrite a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .insert(name.into(), value.into());
    }

    /// Remove a header, returning its value if it existed.
    pub fn del_header(&mut self, name: &str) -> Option<String> {
        self.headers
            .remove(name)
    }

    /// Event body.
    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
    }

    /// Set the event body.
    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = Some(body.into());
    }

    /// `Channel-Call-UUID`, the id events are correlated to a session by.
    pub fn channel_call_uuid(&self) -> Option<&str> {
        self.header(EventHeader::ChannelCallUuid)
    }

    /// `Unique-ID` of the channel leg.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(EventHeader::UniqueId)
    }

    /// `DTMF-Digit` on `DTMF` events.
    pub fn dtmf_digit(&self) -> Option<&str> {
        self.header(EventHeader::DtmfDigit)
    }

    /// Calling number (`Caller-Orig-Caller-ID-Number`).
    pub fn ani(&self) -> Option<&str> {
        self.header(EventHeader::CallerOrigCallerIdNumber)
    }

    /// Dialed number (`Caller-Destination-Number`).
    pub fn dnis(&self) -> Option<&str> {
        self.header(EventHeader::CallerDestinationNumber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_from_name() {
        let mut event = EslEvent::new();
        event.set_header("Event-Name", "PLAYBACK_STOP");
        assert_eq!(event.event_type(), Some(EslEventType::PlaybackStop));
        assert!(event.is_event_type(EslEventType::PlaybackStop));

        event.set_header("Event-Name", "HEARTBEAT");
        assert_eq!(event.event_type(), None);
        assert_eq!(event.event_name(), Some("HEARTBEAT"));
    }

    #[test]
    fn test_with_type_sets_event_name() {
        let event = EslEvent::with_type(EslEventType::Hangup);
        assert_eq!(event.event_name(), Some("HANGUP"));
        assert!(event
            .body()
            .is_none());
    }

    #[test]
    fn test_header_ignore_case() {
        let mut event = EslEvent::new();
        event.set_header("Controlled-Session-Uuid", "abc");
        assert_eq!(event.header("Controlled-Session-UUID"), None);
        assert_eq!(
            event.header_ignore_case(EventHeader::ControlledSessionUuid),
            Some("abc")
        );
    }

    #[test]
    fn test_del_header() {
        let mut event = EslEvent::new();
        event.set_header("Foo", "bar");
        event.set_header("Baz", "qux");

        assert_eq!(event.del_header("Foo"), Some("bar".to_string()));
        assert!(event
            .header("Foo")
            .is_none());
        assert_eq!(event.header("Baz"), Some("qux"));
        assert_eq!(event.del_header("Foo"), None);
    }

    #[test]
    fn test_call_accessors() {
        let mut event = EslEvent::with_type(EslEventType::ChannelAnswer);
        event.set_header("Channel-Call-UUID", "call-1");
        event.set_header("Unique-ID", "leg-1");
        event.set_header("Caller-Orig-Caller-ID-Number", "5551000");
        event.set_header("Caller-Destination-Number", "8000");

        assert_eq!(event.channel_call_uuid(), Some("call-1"));
        assert_eq!(event.unique_id(), Some("leg-1"));
        assert_eq!(event.ani(), Some("5551000"));
        assert_eq!(event.dnis(), Some("8000"));
        assert_eq!(event.dtmf_digit(), None);
    }
}
