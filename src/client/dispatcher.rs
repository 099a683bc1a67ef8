//! Client-side envelope routing: one receiver on one temporary reply
//! destination serves every outstanding call.
//!
//! Incoming envelopes are routed to the owning request context by call id;
//! fragmented responses are buffered per handler and committed on their
//! terminator. A reaper thread unregisters expired handlers, abandons stale
//! channel uploads, and drives failback/reconnect on the reply binding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver as ChannelReceiver, Sender as ChannelSender};

use crate::api::{Message, MessageCodec, RequestContext};
use crate::error::CallError;
use crate::time::TimeSource;
use crate::transport::{
    Destination, MessageListener, SessionBinding, TransportError, TransportMessage,
};
use crate::wire::envelope::{Envelope, MessageType, ProtocolVersion};
use crate::wire::exception::ExceptionPayload;
use crate::wire::fragment::{FragmentAssembler, md5_hex, split};
use crate::wire::{decode_envelope, encode_envelope};

/// Deadline stamped on each uploaded fragment.
const UPLOAD_FRAGMENT_TIMEOUT_MILLIS: u64 = 10_000;

#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    pub reaper_interval_millis: u64,
    pub max_reconnect_millis: u64,
}

struct HandlerEntry<M> {
    context: Arc<dyn RequestContext<M>>,
    fragments: FragmentAssembler,
}

/// A signal payload awaiting its channel-setup reply.
pub struct PendingUpload<M> {
    pub context: Arc<dyn RequestContext<M>>,
    pub payload: Bytes,
    pub version: ProtocolVersion,
    pub max_fragment_size: usize,
    pub deadline_millis: u64,
    /// Binding the fragments are sent through.
    pub request_binding: Arc<SessionBinding>,
}

struct DispatcherInner<M, C> {
    binding: Arc<SessionBinding>,
    codec: Arc<C>,
    time: Arc<dyn TimeSource>,
    config: DispatcherConfig,
    handlers: Mutex<HashMap<String, HandlerEntry<M>>>,
    uploads: Mutex<HashMap<String, PendingUpload<M>>>,
    listener: Mutex<Option<MessageListener>>,
    shutdown: AtomicBool,
}

pub struct ClientDispatcher<M, C> {
    inner: Arc<DispatcherInner<M, C>>,
    stop_tx: ChannelSender<()>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<M, C> ClientDispatcher<M, C>
where
    M: Message,
    C: MessageCodec<M>,
{
    /// Bind the reply receiver and start the reaper thread.
    pub fn start(
        binding: Arc<SessionBinding>,
        codec: Arc<C>,
        time: Arc<dyn TimeSource>,
        config: DispatcherConfig,
    ) -> Result<Self, TransportError> {
        let inner = Arc::new(DispatcherInner {
            binding,
            codec,
            time,
            config,
            handlers: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        // the listener holds only a weak reference: handlers point at the
        // dispatcher, never the other way around
        let weak = Arc::downgrade(&inner);
        let listener: MessageListener = Arc::new(move |msg| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(msg);
            }
        });
        *inner.listener.lock().unwrap() = Some(Arc::clone(&listener));
        inner.binding.receiver(listener)?;

        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
        let reaper_inner = Arc::clone(&inner);
        let reaper = thread::spawn(move || run_reaper_loop(reaper_inner, stop_rx));

        Ok(Self {
            inner,
            stop_tx,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// The temporary destination servers reply to.
    pub fn reply_destination(&self) -> Result<Destination, TransportError> {
        self.inner.binding.destination()
    }

    pub fn register(&self, call_id: &str, context: Arc<dyn RequestContext<M>>) {
        self.inner.handlers.lock().unwrap().insert(
            call_id.to_string(),
            HandlerEntry {
                context,
                fragments: FragmentAssembler::new(),
            },
        );
    }

    /// Remove a call; its close listener fires once outside the registry
    /// lock.
    pub fn unregister(&self, call_id: &str) {
        let removed = self.inner.handlers.lock().unwrap().remove(call_id);
        self.inner.uploads.lock().unwrap().remove(call_id);
        if let Some(entry) = removed {
            entry.context.notify_close();
        }
    }

    pub fn registered_count(&self) -> usize {
        self.inner.handlers.lock().unwrap().len()
    }

    pub fn add_pending_upload(&self, call_id: &str, upload: PendingUpload<M>) {
        self.inner
            .uploads
            .lock()
            .unwrap()
            .insert(call_id.to_string(), upload);
    }

    /// Close every registered call with end-of-stream and stop the reaper.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.binding.close();
        let _ = self.stop_tx.try_send(());
        if let Some(join) = self.reaper.lock().unwrap().take() {
            let _ = join.join();
        }

        let drained: Vec<HandlerEntry<M>> = {
            let mut handlers = self.inner.handlers.lock().unwrap();
            handlers.drain().map(|(_, entry)| entry).collect()
        };
        self.inner.uploads.lock().unwrap().clear();
        for entry in drained {
            entry.context.end_of_stream();
        }
    }
}

impl<M, C> DispatcherInner<M, C>
where
    M: Message,
    C: MessageCodec<M>,
{
    fn on_message(&self, msg: TransportMessage) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let Some(envelope) = decode_envelope(&msg) else {
            return;
        };
        if envelope.message_type == MessageType::ChannelSetup {
            self.handle_channel_setup(envelope);
            return;
        }
        // context methods may run user listeners; resolve the context and
        // drop the registry lock before touching it
        let Some(context) = self.open_context(&envelope.call_id) else {
            return;
        };
        match envelope.message_type {
            MessageType::SignalResponse => {
                if let Some(bytes) = envelope.body.as_bytes() {
                    self.deliver_response(&context, &envelope.call_id, bytes.clone());
                }
            }
            MessageType::SignalFragment => self.buffer_fragment(&envelope),
            MessageType::EndOfFragmentedMessage => {
                if let Some(bytes) = self.commit_fragments(&envelope) {
                    self.deliver_response(&context, &envelope.call_id, bytes);
                }
            }
            MessageType::ExtendWait => {
                if let Some(until) = envelope.req_timeout_millis {
                    context.keep_alive(until);
                }
            }
            MessageType::StreamClosed => {
                context.end_of_stream();
            }
            MessageType::Exception => {
                context.notify_error(decode_exception(&envelope));
            }
            _ => {
                tracing::debug!(
                    "dropping unexpected {} envelope on reply destination",
                    envelope.message_type.as_str()
                );
            }
        }
    }

    fn open_context(&self, call_id: &str) -> Option<Arc<dyn RequestContext<M>>> {
        let context = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(call_id) {
                Some(entry) => Arc::clone(&entry.context),
                None => {
                    tracing::debug!("dropping envelope for unknown call {call_id}");
                    return None;
                }
            }
        };
        if context.is_closed() {
            tracing::debug!("dropping envelope for closed call {call_id}");
            return None;
        }
        Some(context)
    }

    fn buffer_fragment(&self, envelope: &Envelope) {
        let (Some(response_id), Some(index)) =
            (envelope.response_id.as_deref(), envelope.fragment_index)
        else {
            tracing::debug!("dropping fragment without response id or index");
            return;
        };
        let data = envelope.body.as_bytes().cloned().unwrap_or_default();
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(entry) = handlers.get_mut(&envelope.call_id)
            && let Err(err) = entry.fragments.add(response_id, index, data)
        {
            tracing::warn!("dropping invalid fragment: {err}");
        }
    }

    fn commit_fragments(&self, envelope: &Envelope) -> Option<Bytes> {
        let (Some(response_id), Some(total), Some(checksum)) = (
            envelope.response_id.as_deref(),
            envelope.fragments_total,
            envelope.checksum_md5.as_deref(),
        ) else {
            tracing::debug!("dropping fragment terminator without properties");
            return None;
        };
        let mut handlers = self.handlers.lock().unwrap();
        let entry = handlers.get_mut(&envelope.call_id)?;
        match entry.fragments.reassemble(response_id, total, checksum) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(
                    "rejecting fragmented response for call {}: {err}",
                    envelope.call_id
                );
                None
            }
        }
    }

    fn deliver_response(&self, context: &Arc<dyn RequestContext<M>>, call_id: &str, bytes: Bytes) {
        match self.codec.decode(&bytes) {
            Ok(msg) => {
                context.add_response(msg);
            }
            Err(err) => {
                tracing::warn!("dropping undecodable response for call {call_id}: {err}");
            }
        }
    }

    fn handle_channel_setup(&self, envelope: Envelope) {
        let Some(upload) = self.uploads.lock().unwrap().remove(&envelope.call_id) else {
            tracing::debug!("channel setup for unknown call {}", envelope.call_id);
            return;
        };
        let Some(channel) = envelope.reply_to else {
            tracing::warn!("channel setup without channel destination");
            return;
        };
        let call_id = envelope.call_id;
        let time = Arc::clone(&self.time);
        thread::spawn(move || run_channel_upload(upload, channel, call_id, time));
    }

    /// One reaper pass: failback, liveness, expired handlers, stale uploads.
    fn maintenance(&self) {
        self.binding.check_failback();
        self.check_connection();

        // expiry checks run handler close-listeners; keep them off the lock
        let tracked: Vec<(String, Arc<dyn RequestContext<M>>)> = {
            let handlers = self.handlers.lock().unwrap();
            handlers
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.context)))
                .collect()
        };
        for (call_id, context) in tracked {
            if context.is_closed() {
                let removed = self.handlers.lock().unwrap().remove(&call_id);
                if let Some(entry) = removed {
                    entry.context.notify_close();
                }
            }
        }

        let now = self.time.now_millis();
        let mut uploads = self.uploads.lock().unwrap();
        uploads.retain(|call_id, upload| {
            if now > upload.deadline_millis {
                tracing::warn!("abandoning channel upload for call {call_id}: no setup reply");
                false
            } else {
                true
            }
        });
    }

    fn check_connection(&self) {
        if !self.binding.has_session() {
            return;
        }
        let Ok(connection) = self.binding.connection() else {
            return;
        };
        if connection.is_connected() {
            return;
        }
        tracing::warn!("reply connection lost, reconnecting");
        self.binding.invalidate();
        let listener = self.listener.lock().unwrap().clone();
        if let Err(err) = self
            .binding
            .reconnect(self.config.max_reconnect_millis, listener)
        {
            tracing::error!("reply binding reconnect failed: {err}");
        }
    }
}

fn run_reaper_loop<M, C>(inner: Arc<DispatcherInner<M, C>>, stop_rx: ChannelReceiver<()>)
where
    M: Message,
    C: MessageCodec<M>,
{
    loop {
        crossbeam::select! {
            recv(stop_rx) -> _ => break,
            recv(crossbeam::channel::after(Duration::from_millis(
                inner.config.reaper_interval_millis,
            ))) -> _ => {
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                inner.maintenance();
            }
        }
    }
}

fn decode_exception(envelope: &Envelope) -> CallError {
    match envelope.body.as_bytes() {
        Some(bytes) => match ExceptionPayload::decode(bytes) {
            Ok(payload) => payload.into_call_error(),
            Err(err) => {
                tracing::warn!("undecodable exception payload: {err}");
                CallError::remote("UnknownError", "undecodable exception payload")
            }
        },
        None => CallError::remote("UnknownError", "empty exception payload"),
    }
}

/// Fragment an oversized signal payload onto the server-allocated channel
/// destination, trailing with the total count and digest.
fn run_channel_upload<M: Message>(
    upload: PendingUpload<M>,
    channel: Destination,
    call_id: String,
    time: Arc<dyn TimeSource>,
) {
    let digest = md5_hex(&upload.payload);
    let slices = split(&upload.payload, upload.max_fragment_size);
    let total = slices.len();

    for (index, slice) in slices.into_iter().enumerate() {
        let mut envelope = Envelope::new(upload.version, MessageType::SignalFragment, &call_id)
            .with_body(slice)
            .with_req_timeout(time.now_millis() + UPLOAD_FRAGMENT_TIMEOUT_MILLIS);
        envelope.fragment_index = Some(index as i32);
        if let Err(err) = upload
            .request_binding
            .send_to(&channel, encode_envelope(&envelope))
        {
            tracing::warn!("channel upload failed for call {call_id}: {err}");
            upload.context.notify_error(err.into());
            return;
        }
    }

    let mut trailer = Envelope::new(upload.version, MessageType::StreamClosed, &call_id)
        .with_text("channel end");
    trailer.fragments_total = Some(total as i32);
    trailer.checksum_md5 = Some(digest);
    if let Err(err) = upload
        .request_binding
        .send_to(&channel, encode_envelope(&trailer))
    {
        tracing::warn!("channel upload trailer failed for call {call_id}: {err}");
        upload.context.notify_error(err.into());
    }
}
