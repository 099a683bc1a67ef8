#![forbid(unsafe_code)]

//! Request/response and streaming-response messaging over a
//! message-oriented transport.
//!
//! A client signals a typed message; one or more servers receive it, process
//! it through a user-supplied [`api::RequestSink`], and stream back zero or
//! more responses terminated by an end-of-stream marker or an error. The
//! runtime copes with transport size limits (fragmentation), slow handlers
//! (keep-alive deadline extension), broker disconnects (invalidation,
//! reconnect, failback), and many concurrent multiplexed calls on a small
//! set of shared transport connections.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod time;
pub mod transport;
pub mod wire;

pub use error::{CallError, CodecError, Error};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main seams at the crate root for convenience
pub use crate::api::{Message, MessageCodec, RequestContext, RequestListener, RequestSink};
pub use crate::client::{RequestClient, RequestHandler};
pub use crate::config::{ClientConfig, Config, ServerConfig};
pub use crate::server::{ServerProxy, ServerProxyHandle};
pub use crate::time::{TimeSource, WallClock, wall_clock};
pub use crate::transport::{
    Connection, Destination, SendOptions, TransportError, TransportMessage,
};
pub use crate::wire::{Envelope, MessageType, ProtocolVersion};
