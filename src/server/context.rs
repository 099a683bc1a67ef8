//! Server-side per-call response context.
//!
//! The handle a user sink streams responses through. Responses above the
//! size limit are fragmented under a fresh response id; end-of-stream and
//! error are a terminal pair where the first one wins. A transport failure
//! is terminal too: the sink observes it as `add_response` returning false.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use uuid::Uuid;

use crate::api::{MessageCodec, RequestContext};
use crate::error::CallError;
use crate::time::TimeSource;
use crate::transport::{Destination, SessionBinding, TransportError};
use crate::wire::encode_envelope;
use crate::wire::envelope::{Envelope, MessageType, ProtocolVersion};
use crate::wire::exception::ExceptionPayload;
use crate::wire::fragment::{md5_hex, split};

pub struct ServerResponseContext<M, C> {
    call_id: String,
    reply_to: Destination,
    version: ProtocolVersion,
    binding: Arc<SessionBinding>,
    codec: Arc<C>,
    max_fragment_size: usize,
    time: Arc<dyn TimeSource>,
    closed: AtomicBool,
    deadline: AtomicU64,
    last_sent: AtomicU64,
    _marker: PhantomData<fn() -> M>,
}

impl<M, C> ServerResponseContext<M, C>
where
    C: MessageCodec<M>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: impl Into<String>,
        reply_to: Destination,
        version: ProtocolVersion,
        deadline_millis: u64,
        binding: Arc<SessionBinding>,
        codec: Arc<C>,
        max_fragment_size: usize,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let now = time.now_millis();
        Self {
            call_id: call_id.into(),
            reply_to,
            version,
            binding,
            codec,
            max_fragment_size,
            time,
            closed: AtomicBool::new(false),
            deadline: AtomicU64::new(deadline_millis),
            last_sent: AtomicU64::new(now),
            _marker: PhantomData,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn deadline_millis(&self) -> u64 {
        self.deadline.load(Ordering::SeqCst)
    }

    /// When this context last put anything on the wire; the watchdog skips
    /// contexts whose sink keeps them alive on its own.
    pub fn last_sent_millis(&self) -> u64 {
        self.last_sent.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let result = self.binding.send_to(&self.reply_to, encode_envelope(envelope));
        match result {
            Ok(()) => {
                self.last_sent
                    .store(self.time.now_millis(), Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                // terminal: the binding has already been invalidated
                tracing::warn!(
                    "response send failed for call {}, closing context: {err}",
                    self.call_id
                );
                self.closed.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn send_fragmented(&self, payload: bytes::Bytes) -> Result<(), TransportError> {
        let response_id = Uuid::new_v4().to_string();
        let digest = md5_hex(&payload);
        let slices = split(&payload, self.max_fragment_size);
        let total = slices.len();
        for (index, slice) in slices.into_iter().enumerate() {
            let mut envelope =
                Envelope::new(self.version, MessageType::SignalFragment, &self.call_id)
                    .with_body(slice)
                    .with_response_id(&response_id);
            envelope.fragment_index = Some(index as i32);
            self.send(&envelope)?;
        }
        let mut trailer = Envelope::new(
            self.version,
            MessageType::EndOfFragmentedMessage,
            &self.call_id,
        )
        .with_response_id(&response_id);
        trailer.fragments_total = Some(total as i32);
        trailer.checksum_md5 = Some(digest);
        self.send(&trailer)
    }

    /// Terminal transition; true for the caller that won it.
    fn transition_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl<M, C> RequestContext<M> for ServerResponseContext<M, C>
where
    M: Send + 'static,
    C: MessageCodec<M>,
{
    fn add_response(&self, msg: M) -> bool {
        if self.is_closed() {
            tracing::debug!("add_response rejected for closed call {}", self.call_id);
            return false;
        }
        let payload = match self.codec.encode(&msg) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("cannot encode response for call {}: {err}", self.call_id);
                return false;
            }
        };
        let result = if payload.len() <= self.max_fragment_size {
            let envelope = Envelope::new(self.version, MessageType::SignalResponse, &self.call_id)
                .with_body(payload);
            self.send(&envelope)
        } else if self.version.supports_fragmentation() {
            self.send_fragmented(payload)
        } else {
            tracing::warn!(
                "response of {} bytes cannot cross a {} byte limit on protocol {}",
                payload.len(),
                self.max_fragment_size,
                self.version.as_str()
            );
            return false;
        };
        result.is_ok()
    }

    fn keep_alive(&self, until_millis: u64) -> bool {
        if self.is_closed() {
            return false;
        }
        self.deadline.fetch_max(until_millis, Ordering::SeqCst);
        let envelope = Envelope::new(self.version, MessageType::ExtendWait, &self.call_id)
            .with_req_timeout(until_millis);
        self.send(&envelope).is_ok()
    }

    fn end_of_stream(&self) {
        if !self.transition_closed() {
            return;
        }
        tracing::debug!(">> end_of_stream [call_id={}]", self.call_id);
        let envelope = Envelope::new(self.version, MessageType::StreamClosed, &self.call_id);
        if let Err(err) = self
            .binding
            .send_to(&self.reply_to, encode_envelope(&envelope))
        {
            tracing::warn!("end-of-stream send failed for call {}: {err}", self.call_id);
        }
    }

    fn notify_error(&self, err: CallError) {
        if !self.transition_closed() {
            return;
        }
        tracing::debug!(">> notify_error [call_id={} err={err}]", self.call_id);
        if !self.version.supports_fragmentation() {
            // V1 has no exception carriage; closing the stream is all we can do
            let envelope = Envelope::new(self.version, MessageType::StreamClosed, &self.call_id);
            let _ = self
                .binding
                .send_to(&self.reply_to, encode_envelope(&envelope));
            return;
        }
        let payload = ExceptionPayload::from_call_error(&err);
        match payload.encode() {
            Ok(bytes) => {
                let envelope = Envelope::new(self.version, MessageType::Exception, &self.call_id)
                    .with_body(bytes.into());
                if let Err(err) = self
                    .binding
                    .send_to(&self.reply_to, encode_envelope(&envelope))
                {
                    tracing::warn!("exception send failed for call {}: {err}", self.call_id);
                }
            }
            Err(err) => {
                tracing::error!("cannot encode exception payload: {err}");
            }
        }
    }

    fn notify_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        if self.time.now_millis() > self.deadline.load(Ordering::SeqCst) {
            self.closed.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }
}
