//! Typed event header names used by the IVR engine.

/// Error returned when parsing an unrecognized event header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventHeaderError(pub String);

impl std::fmt::Display for ParseEventHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event header: {}", self.0)
    }
}

impl std::error::Error for ParseEventHeaderError {}

define_header_enum! {
    error_type: ParseEventHeaderError,
    /// Header names the call session and engine read from events and replies.
    ///
    /// Use with [`EslEvent::header()`](crate::EslEvent::header) for
    /// type-safe lookups.
    pub enum EventHeader {
        EventName => "Event-Name",
        UniqueId => "Unique-ID",
        ChannelCallUuid => "Channel-Call-UUID",
        ChannelUniqueId => "Channel-Unique-ID",
        ControlledSessionUuid => "Controlled-Session-UUID",
        DtmfDigit => "DTMF-Digit",
        CallerOrigCallerIdNumber => "Caller-Orig-Caller-ID-Number",
        CallerDestinationNumber => "Caller-Destination-Number",
        ContentDisposition => "Content-Disposition",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_name() {
        assert_eq!(EventHeader::ChannelCallUuid.to_string(), "Channel-Call-UUID");
        assert_eq!(EventHeader::DtmfDigit.to_string(), "DTMF-Digit");
        assert_eq!(
            EventHeader::CallerOrigCallerIdNumber.to_string(),
            "Caller-Orig-Caller-ID-Number"
        );
    }

    #[test]
    fn from_str_case_insensitive() {
        assert_eq!(
            "controlled-session-uuid".parse::<EventHeader>(),
            Ok(EventHeader::ControlledSessionUuid)
        );
        assert_eq!(
            "Channel-Unique-Id".parse::<EventHeader>(),
            Ok(EventHeader::ChannelUniqueId)
        );
    }

    #[test]
    fn from_str_unknown() {
        let err = "X-Custom-Not-In-Enum"
            .parse::<EventHeader>()
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown event header: X-Custom-Not-In-Enum");
    }
}
