//! Envelope schema: protocol versions, message types, wire property names.

use bytes::Bytes;

use crate::transport::Destination;

// Property names are protocol-stable; changing them breaks interop.
pub const PROPERTY_PROTOCOL_VERSION: &str = "ArgusMessagingProtocol";
pub const PROPERTY_MESSAGE_TYPE: &str = "MessageType";
pub const PROPERTY_RESPONSE_ID: &str = "ResponseID";
pub const PROPERTY_FRAGMENT_INDEX: &str = "FragmentIndex";
pub const PROPERTY_FRAGMENTS_TOTAL: &str = "FragmentsTotal";
pub const PROPERTY_DATA_CHECKSUM_MD5: &str = "DataChecksumMD5";
pub const PROPERTY_REQ_TIMEOUT: &str = "ReqTimeout";

/// Protocol revision negotiated per envelope.
///
/// V2 adds fragmentation, exception carriage, and the channel-upload
/// handshake; V1 interoperates with V2 senders on the remaining subset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "13.10.1",
            ProtocolVersion::V2 => "16",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "13.10.1" => Some(ProtocolVersion::V1),
            "16" => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    pub fn supports_fragmentation(self) -> bool {
        matches!(self, ProtocolVersion::V2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Signal,
    SignalFragment,
    EndOfFragmentedMessage,
    SignalResponse,
    StreamClosed,
    ExtendWait,
    Exception,
    ChannelRequest,
    ChannelSetup,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Signal => "Signal",
            MessageType::SignalFragment => "SignalFragment",
            MessageType::EndOfFragmentedMessage => "EndOfFragmentedMessage",
            MessageType::SignalResponse => "SignalResponse",
            MessageType::StreamClosed => "StreamClosed",
            MessageType::ExtendWait => "ExtendWait",
            MessageType::Exception => "Exception",
            MessageType::ChannelRequest => "ChannelRequest",
            MessageType::ChannelSetup => "ChannelSetup",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Signal" => Some(MessageType::Signal),
            "SignalFragment" => Some(MessageType::SignalFragment),
            "EndOfFragmentedMessage" => Some(MessageType::EndOfFragmentedMessage),
            "SignalResponse" => Some(MessageType::SignalResponse),
            "StreamClosed" => Some(MessageType::StreamClosed),
            "ExtendWait" => Some(MessageType::ExtendWait),
            "Exception" => Some(MessageType::Exception),
            "ChannelRequest" => Some(MessageType::ChannelRequest),
            "ChannelSetup" => Some(MessageType::ChannelSetup),
            _ => None,
        }
    }

    /// Whether this type exists in the given protocol revision.
    pub fn in_version(self, version: ProtocolVersion) -> bool {
        match self {
            MessageType::Signal
            | MessageType::SignalResponse
            | MessageType::StreamClosed
            | MessageType::ExtendWait => true,
            MessageType::SignalFragment
            | MessageType::EndOfFragmentedMessage
            | MessageType::Exception
            | MessageType::ChannelRequest
            | MessageType::ChannelSetup => version.supports_fragmentation(),
        }
    }
}

/// Payload carried by an envelope: bytes for data, text for control.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
}

impl Body {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// The framed unit of the session protocol.
///
/// The call id doubles as the transport correlation id; the response id
/// groups fragments of one response within a call.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub version: ProtocolVersion,
    pub message_type: MessageType,
    pub call_id: String,
    pub response_id: Option<String>,
    pub reply_to: Option<Destination>,
    pub fragment_index: Option<i32>,
    pub fragments_total: Option<i32>,
    pub checksum_md5: Option<String>,
    pub req_timeout_millis: Option<u64>,
    pub body: Body,
}

impl Envelope {
    pub fn new(version: ProtocolVersion, message_type: MessageType, call_id: impl Into<String>) -> Self {
        Self {
            version,
            message_type,
            call_id: call_id.into(),
            response_id: None,
            reply_to: None,
            fragment_index: None,
            fragments_total: None,
            checksum_md5: None,
            req_timeout_millis: None,
            body: Body::Empty,
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Body::Bytes(body);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Text(text.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_response_id(mut self, response_id: impl Into<String>) -> Self {
        self.response_id = Some(response_id.into());
        self
    }

    pub fn with_req_timeout(mut self, deadline_millis: u64) -> Self {
        self.req_timeout_millis = Some(deadline_millis);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tokens_round_trip() {
        for v in [ProtocolVersion::V1, ProtocolVersion::V2] {
            assert_eq!(ProtocolVersion::parse(v.as_str()), Some(v));
        }
        assert_eq!(ProtocolVersion::parse("17"), None);
    }

    #[test]
    fn type_tokens_round_trip() {
        let all = [
            MessageType::Signal,
            MessageType::SignalFragment,
            MessageType::EndOfFragmentedMessage,
            MessageType::SignalResponse,
            MessageType::StreamClosed,
            MessageType::ExtendWait,
            MessageType::Exception,
            MessageType::ChannelRequest,
            MessageType::ChannelSetup,
        ];
        for t in all {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("Bogus"), None);
    }

    #[test]
    fn v1_excludes_fragmentation_subset() {
        assert!(MessageType::Signal.in_version(ProtocolVersion::V1));
        assert!(MessageType::ExtendWait.in_version(ProtocolVersion::V1));
        assert!(!MessageType::SignalFragment.in_version(ProtocolVersion::V1));
        assert!(!MessageType::Exception.in_version(ProtocolVersion::V1));
        assert!(!MessageType::ChannelRequest.in_version(ProtocolVersion::V1));
        assert!(MessageType::Exception.in_version(ProtocolVersion::V2));
    }
}
