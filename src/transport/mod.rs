//! Transport abstraction: the only surface the runtime requires of a broker
//! client library, plus the session binding that hides disconnects.

pub mod binding;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

pub use binding::{BindingConfig, SessionBinding};
pub use memory::{MemoryBroker, MemoryConnection};

/// Errors raised by a broker client or the session binding.
///
/// Cloneable so a single failure can be surfaced to every affected call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("no connections configured")]
    NoConnections,

    #[error("connection unavailable: {0}")]
    Disconnected(String),

    #[error("destination lookup failed: {0}")]
    Lookup(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive setup failed: {0}")]
    Receive(String),

    #[error("reconnect timed out after {0} ms")]
    ReconnectTimeout(u64),
}

/// A named or temporary destination on the broker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    name: String,
    temporary: bool,
}

impl Destination {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temporary: false,
        }
    }

    pub fn temporary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            temporary: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

/// Typed message property, mirroring the property model of queue brokers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    Int(i32),
    Long(i64),
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            PropertyValue::Long(v) => Some(*v),
            PropertyValue::Int(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

/// Message body: bytes for data envelopes, text for control envelopes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MessageBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
}

/// The framed unit exchanged with the broker.
///
/// Unknown properties are preserved on pass-through; the runtime only reads
/// the ones it understands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransportMessage {
    pub correlation_id: Option<String>,
    pub reply_to: Option<Destination>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub body: MessageBody,
}

impl TransportMessage {
    pub fn text_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(PropertyValue::as_text)
    }

    pub fn int_property(&self, key: &str) -> Option<i32> {
        self.properties.get(key).and_then(PropertyValue::as_int)
    }

    pub fn long_property(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(PropertyValue::as_long)
    }
}

/// Delivery settings applied to every send from one binding.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SendOptions {
    pub persistent: bool,
    pub priority: u8,
    pub time_to_live_millis: u64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            priority: 4,
            time_to_live_millis: 0,
        }
    }
}

/// Callback invoked for every message arriving on a receiver.
pub type MessageListener = Arc<dyn Fn(TransportMessage) + Send + Sync>;

/// A logical connection to one broker endpoint.
pub trait Connection: Send + Sync {
    fn create_session(&self, transacted: bool) -> Result<Arc<dyn BrokerSession>, TransportError>;

    fn is_connected(&self) -> bool;

    /// Human-readable endpoint label for logs.
    fn label(&self) -> String;
}

/// A broker session: destination lookup and sender/receiver construction.
pub trait BrokerSession: Send + Sync {
    fn lookup_destination(&self, name: &str) -> Result<Destination, TransportError>;

    fn create_temporary_destination(&self) -> Result<Destination, TransportError>;

    fn create_sender(&self, destination: &Destination) -> Result<Arc<dyn Sender>, TransportError>;

    fn create_receiver(
        &self,
        destination: &Destination,
        listener: MessageListener,
    ) -> Result<Arc<dyn Receiver>, TransportError>;

    fn close(&self);
}

impl std::fmt::Debug for dyn BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BrokerSession")
    }
}

/// Sends messages. The destination given at creation is the default; sends
/// may address any destination (reply queues vary per call).
pub trait Sender: Send + Sync {
    fn send(
        &self,
        to: &Destination,
        message: TransportMessage,
        options: SendOptions,
    ) -> Result<(), TransportError>;

    fn close(&self);
}

/// A subscription delivering messages to its listener until closed.
pub trait Receiver: Send + Sync {
    fn close(&self);
}
