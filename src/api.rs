//! Public seams between the runtime and user code.
//!
//! A client signals a [`Message`] into a [`RequestSink`]; the sink streams
//! responses back through the [`RequestContext`] it was handed. On the client
//! the context is a `RequestHandler`; on the server it is a response context
//! bound to the caller's reply destination.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{CallError, CodecError};

/// A user message moved through the runtime.
///
/// The call id ties every response envelope back to the originating signal;
/// it is treated as an opaque identifier and never parsed.
pub trait Message: Clone + Send + 'static {
    fn call_id(&self) -> &str;

    /// Creation time, epoch millis.
    fn message_timestamp(&self) -> u64;
}

/// Payload codec seam: serialize user messages to the bytes the transport
/// carries and back. Implementations are registered once per client/server
/// pair and must agree on the format.
pub trait MessageCodec<M>: Send + Sync + 'static {
    fn encode(&self, msg: &M) -> Result<Bytes, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<M, CodecError>;
}

/// Per-call response channel.
///
/// `end_of_stream` and `notify_error` are terminal: the first one wins and
/// later calls are no-ops. A closed context accepts no further responses.
pub trait RequestContext<M>: Send + Sync {
    /// Queue or forward one response. Returns false if the call is closed.
    fn add_response(&self, msg: M) -> bool;

    /// Extend the call deadline to at least `until_millis`. Returns false if
    /// the call is closed or does not accept keep-alive.
    fn keep_alive(&self, until_millis: u64) -> bool;

    /// Terminate the response stream normally.
    fn end_of_stream(&self);

    /// Terminate the response stream with an error.
    fn notify_error(&self, err: CallError);

    /// Observe that the call is being torn down without further traffic.
    fn notify_close(&self);

    fn is_closed(&self) -> bool;
}

/// User-supplied server-side processor.
///
/// Must return promptly; long-running work continues on other threads using
/// the context. A returned error crosses the wire as an exception envelope.
pub trait RequestSink<M>: Send + Sync {
    fn signal(
        &self,
        msg: M,
        ctx: Arc<dyn RequestContext<M>>,
        max_wait_millis: u64,
    ) -> Result<(), CallError>;
}

/// Observer for call lifecycle events on the client.
pub trait RequestListener: Send + Sync {
    /// The call closed (end of stream, error, or expiry).
    fn on_close(&self, call_id: &str);

    /// The call timed out unexpectedly (e.g. an abandoned channel upload).
    fn on_timeout(&self) {}
}
