//! Envelope framing onto transport messages.
//!
//! Decoding is deliberately permissive in one direction only: a message
//! without the protocol-version property, or with a message type unknown to
//! that version, is foreign traffic on a shared destination and is dropped
//! silently. Protocol errors never fail the session.

use crate::transport::{MessageBody, PropertyValue, TransportMessage};
use crate::wire::envelope::{
    Body, Envelope, MessageType, PROPERTY_DATA_CHECKSUM_MD5, PROPERTY_FRAGMENT_INDEX,
    PROPERTY_FRAGMENTS_TOTAL, PROPERTY_MESSAGE_TYPE, PROPERTY_PROTOCOL_VERSION,
    PROPERTY_REQ_TIMEOUT, PROPERTY_RESPONSE_ID, ProtocolVersion,
};

pub fn encode_envelope(envelope: &Envelope) -> TransportMessage {
    let mut msg = TransportMessage {
        correlation_id: Some(envelope.call_id.clone()),
        reply_to: envelope.reply_to.clone(),
        ..TransportMessage::default()
    };
    msg.properties.insert(
        PROPERTY_PROTOCOL_VERSION.to_string(),
        PropertyValue::Text(envelope.version.as_str().to_string()),
    );
    msg.properties.insert(
        PROPERTY_MESSAGE_TYPE.to_string(),
        PropertyValue::Text(envelope.message_type.as_str().to_string()),
    );
    if let Some(response_id) = &envelope.response_id {
        msg.properties.insert(
            PROPERTY_RESPONSE_ID.to_string(),
            PropertyValue::Text(response_id.clone()),
        );
    }
    if let Some(index) = envelope.fragment_index {
        msg.properties.insert(
            PROPERTY_FRAGMENT_INDEX.to_string(),
            PropertyValue::Int(index),
        );
    }
    if let Some(total) = envelope.fragments_total {
        msg.properties.insert(
            PROPERTY_FRAGMENTS_TOTAL.to_string(),
            PropertyValue::Int(total),
        );
    }
    if let Some(checksum) = &envelope.checksum_md5 {
        msg.properties.insert(
            PROPERTY_DATA_CHECKSUM_MD5.to_string(),
            PropertyValue::Text(checksum.clone()),
        );
    }
    if let Some(deadline) = envelope.req_timeout_millis {
        msg.properties.insert(
            PROPERTY_REQ_TIMEOUT.to_string(),
            PropertyValue::Long(deadline as i64),
        );
    }
    msg.body = match &envelope.body {
        Body::Empty => MessageBody::Empty,
        Body::Bytes(bytes) => MessageBody::Bytes(bytes.clone()),
        Body::Text(text) => MessageBody::Text(text.clone()),
    };
    msg
}

/// Decode a transport message, or `None` if it is not ours to handle.
pub fn decode_envelope(msg: &TransportMessage) -> Option<Envelope> {
    let version = ProtocolVersion::parse(msg.text_property(PROPERTY_PROTOCOL_VERSION)?)?;
    let message_type = MessageType::parse(msg.text_property(PROPERTY_MESSAGE_TYPE)?)?;
    if !message_type.in_version(version) {
        tracing::debug!(
            "dropping {} envelope not defined for protocol {}",
            message_type.as_str(),
            version.as_str()
        );
        return None;
    }
    let call_id = msg.correlation_id.clone()?;
    if call_id.is_empty() {
        return None;
    }

    let body = match &msg.body {
        MessageBody::Empty => Body::Empty,
        MessageBody::Bytes(bytes) => Body::Bytes(bytes.clone()),
        MessageBody::Text(text) => Body::Text(text.clone()),
    };

    Some(Envelope {
        version,
        message_type,
        call_id,
        response_id: msg
            .text_property(PROPERTY_RESPONSE_ID)
            .map(str::to_string),
        reply_to: msg.reply_to.clone(),
        fragment_index: msg.int_property(PROPERTY_FRAGMENT_INDEX),
        fragments_total: msg.int_property(PROPERTY_FRAGMENTS_TOTAL),
        checksum_md5: msg
            .text_property(PROPERTY_DATA_CHECKSUM_MD5)
            .map(str::to_string),
        req_timeout_millis: msg
            .long_property(PROPERTY_REQ_TIMEOUT)
            .and_then(|v| u64::try_from(v).ok()),
        body,
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::transport::Destination;

    fn signal_envelope() -> Envelope {
        Envelope::new(ProtocolVersion::V2, MessageType::Signal, "call-1")
            .with_body(Bytes::from_static(b"payload"))
            .with_reply_to(Destination::temporary("tmp-r"))
            .with_req_timeout(12_345)
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = signal_envelope();
        let msg = encode_envelope(&envelope);
        let decoded = decode_envelope(&msg).expect("decodes");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn fragment_properties_round_trip() {
        let mut envelope =
            Envelope::new(ProtocolVersion::V2, MessageType::SignalFragment, "call-1")
                .with_body(Bytes::from_static(b"frag"))
                .with_response_id("resp-1");
        envelope.fragment_index = Some(3);
        let msg = encode_envelope(&envelope);
        let decoded = decode_envelope(&msg).unwrap();
        assert_eq!(decoded.fragment_index, Some(3));
        assert_eq!(decoded.response_id.as_deref(), Some("resp-1"));
    }

    #[test]
    fn missing_version_is_dropped() {
        let mut msg = encode_envelope(&signal_envelope());
        msg.properties.remove(PROPERTY_PROTOCOL_VERSION);
        assert_eq!(decode_envelope(&msg), None);
    }

    #[test]
    fn missing_type_is_dropped() {
        let mut msg = encode_envelope(&signal_envelope());
        msg.properties.remove(PROPERTY_MESSAGE_TYPE);
        assert_eq!(decode_envelope(&msg), None);
    }

    #[test]
    fn unknown_type_is_dropped() {
        let mut msg = encode_envelope(&signal_envelope());
        msg.properties.insert(
            PROPERTY_MESSAGE_TYPE.to_string(),
            PropertyValue::Text("NotAType".into()),
        );
        assert_eq!(decode_envelope(&msg), None);
    }

    #[test]
    fn v1_receiver_drops_fragment_envelopes() {
        let mut envelope =
            Envelope::new(ProtocolVersion::V2, MessageType::SignalFragment, "call-1")
                .with_response_id("resp-1");
        envelope.fragment_index = Some(0);
        let mut msg = encode_envelope(&envelope);
        // a V1 sender tag on a fragment type is not a valid combination
        msg.properties.insert(
            PROPERTY_PROTOCOL_VERSION.to_string(),
            PropertyValue::Text(ProtocolVersion::V1.as_str().into()),
        );
        assert_eq!(decode_envelope(&msg), None);
    }

    #[test]
    fn unknown_properties_survive_encode_decode() {
        let mut msg = encode_envelope(&signal_envelope());
        msg.properties.insert(
            "VendorExtension".to_string(),
            PropertyValue::Text("kept".into()),
        );
        // decode reads only known properties; the message itself is untouched
        assert!(decode_envelope(&msg).is_some());
        assert_eq!(
            msg.text_property("VendorExtension"),
            Some("kept")
        );
    }
}
