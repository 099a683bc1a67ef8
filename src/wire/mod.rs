//! Wire protocol: versioned envelopes, transport-message framing,
//! fragmentation, and the exception payload carried by error envelopes.

pub mod codec;
pub mod envelope;
pub mod exception;
pub mod fragment;

pub use codec::{decode_envelope, encode_envelope};
pub use envelope::{
    Body, Envelope, MessageType, PROPERTY_DATA_CHECKSUM_MD5, PROPERTY_FRAGMENT_INDEX,
    PROPERTY_FRAGMENTS_TOTAL, PROPERTY_MESSAGE_TYPE, PROPERTY_PROTOCOL_VERSION,
    PROPERTY_REQ_TIMEOUT, PROPERTY_RESPONSE_ID, ProtocolVersion,
};
pub use exception::ExceptionPayload;
pub use fragment::{FragmentAssembler, FragmentError, md5_hex, split};
