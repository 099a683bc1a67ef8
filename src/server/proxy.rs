//! Server proxy: subscribes to the server destination, turns inbound
//! envelopes into sink invocations on a worker pool, and streams the
//! resulting context activity back to each caller's reply destination.
//!
//! The receiver thread only decodes and hands off; sink invocations run on
//! workers, and an independent watchdog emits keep-alives for running
//! sinks, reaps expired contexts, and discards stale channel uploads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver as ChannelReceiver, Sender as ChannelSender};

use crate::api::{Message, MessageCodec, RequestContext, RequestSink};
use crate::config::ServerConfig;
use crate::error::Error;
use crate::server::context::ServerResponseContext;
use crate::time::TimeSource;
use crate::transport::{
    BindingConfig, Connection, Destination, MessageListener, Receiver, SessionBinding,
    TransportMessage,
};
use crate::wire::encode_envelope;
use crate::wire::envelope::{Envelope, MessageType, ProtocolVersion};
use crate::wire::exception::ExceptionPayload;
use crate::wire::fragment::FragmentAssembler;
use crate::wire::decode_envelope;

struct Job<M, C> {
    msg: M,
    ctx: Arc<ServerResponseContext<M, C>>,
    max_wait_millis: u64,
}

/// A channel upload in progress: fragments arriving on a dedicated
/// temporary destination until the closing trailer commits them.
struct ChannelUpload {
    client_reply_to: Destination,
    version: ProtocolVersion,
    deadline_millis: u64,
    last_activity_millis: u64,
    fragments: FragmentAssembler,
    receiver: Arc<dyn Receiver>,
}

/// A fragmented signal arriving directly on the server destination.
struct SignalAssembly {
    reply_to: Option<Destination>,
    version: ProtocolVersion,
    deadline_millis: u64,
    fragments: FragmentAssembler,
}

pub struct ServerProxy<M, C, S> {
    connections: Vec<Arc<dyn Connection>>,
    sink: Arc<S>,
    codec: Arc<C>,
    config: ServerConfig,
    time: Arc<dyn TimeSource>,
    _marker: std::marker::PhantomData<fn() -> M>,
}

pub struct ServerProxyHandle<M, C, S> {
    inner: Arc<ProxyInner<M, C, S>>,
    stop_tx: ChannelSender<()>,
    watchdog: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

struct ProxyInner<M, C, S> {
    binding: Arc<SessionBinding>,
    sink: Arc<S>,
    codec: Arc<C>,
    config: ServerConfig,
    time: Arc<dyn TimeSource>,
    jobs: ChannelSender<Job<M, C>>,
    contexts: Mutex<HashMap<String, Arc<ServerResponseContext<M, C>>>>,
    channels: Mutex<HashMap<String, ChannelUpload>>,
    assemblies: Mutex<HashMap<String, SignalAssembly>>,
    listener: Mutex<Option<MessageListener>>,
    shutdown: AtomicBool,
}

impl<M, C, S> ServerProxy<M, C, S>
where
    M: Message,
    C: MessageCodec<M>,
    S: RequestSink<M> + Send + Sync + 'static,
{
    pub fn new(
        connections: Vec<Arc<dyn Connection>>,
        sink: Arc<S>,
        codec: Arc<C>,
        config: ServerConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            connections,
            sink,
            codec,
            config,
            time,
            _marker: std::marker::PhantomData,
        }
    }

    /// Subscribe to the server destination and start workers and watchdog.
    pub fn start(self) -> Result<ServerProxyHandle<M, C, S>, Error> {
        let binding = Arc::new(SessionBinding::new(
            self.connections,
            BindingConfig {
                destination_name: self.config.destination_name.clone(),
                temporary: false,
                transacted: self.config.transacted,
                failback_interval_millis: self.config.failback_interval_millis,
                send_options: self.config.send_options,
            },
            Arc::clone(&self.time),
        ));

        let (jobs_tx, jobs_rx) = crossbeam::channel::unbounded::<Job<M, C>>();
        let inner = Arc::new(ProxyInner {
            binding,
            sink: self.sink,
            codec: self.codec,
            config: self.config,
            time: self.time,
            jobs: jobs_tx,
            contexts: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            assemblies: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let listener: MessageListener = Arc::new(move |msg| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(msg);
            }
        });
        *inner.listener.lock().unwrap() = Some(Arc::clone(&listener));
        inner.binding.receiver(listener)?;
        tracing::info!(
            "server proxy listening on {}",
            inner.config.destination_name
        );

        let mut workers = Vec::with_capacity(inner.config.worker_threads.max(1));
        for _ in 0..inner.config.worker_threads.max(1) {
            let worker_inner = Arc::clone(&inner);
            let worker_rx = jobs_rx.clone();
            workers.push(thread::spawn(move || run_worker_loop(worker_inner, worker_rx)));
        }

        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
        let watchdog_inner = Arc::clone(&inner);
        let watchdog = thread::spawn(move || run_watchdog_loop(watchdog_inner, stop_rx));

        Ok(ServerProxyHandle {
            inner,
            stop_tx,
            watchdog,
            workers,
        })
    }
}

impl<M, C, S> ServerProxyHandle<M, C, S>
where
    M: Message,
    C: MessageCodec<M>,
{
    /// Stop the component. Open contexts are marked closed so in-flight
    /// sinks observe `add_response` returning false.
    pub fn shutdown(self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.binding.close();
        let _ = self.stop_tx.try_send(());
        let _ = self.watchdog.join();
        for worker in self.workers {
            let _ = worker.join();
        }

        let contexts: Vec<_> = {
            let mut contexts = self.inner.contexts.lock().unwrap();
            contexts.drain().map(|(_, ctx)| ctx).collect()
        };
        for ctx in contexts {
            ctx.notify_close();
        }
        let mut channels = self.inner.channels.lock().unwrap();
        for (_, upload) in channels.drain() {
            upload.receiver.close();
        }
    }
}

impl<M, C, S> ProxyInner<M, C, S>
where
    M: Message,
    C: MessageCodec<M>,
    S: RequestSink<M> + Send + Sync + 'static,
{
    /// Receiver-thread entry for the server destination.
    fn on_message(&self, msg: TransportMessage) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let Some(envelope) = decode_envelope(&msg) else {
            return;
        };
        match envelope.message_type {
            MessageType::Signal => self.handle_signal_envelope(envelope),
            MessageType::ChannelRequest => self.handle_channel_request(envelope),
            MessageType::SignalFragment => self.handle_signal_fragment(envelope),
            MessageType::EndOfFragmentedMessage => self.handle_signal_terminator(envelope),
            MessageType::StreamClosed => {
                // upload channels share this listener; their trailer is a
                // StreamClosed carrying the fragment total and digest
                let known = self
                    .channels
                    .lock()
                    .unwrap()
                    .contains_key(&envelope.call_id);
                if known {
                    self.handle_channel_close(envelope);
                } else {
                    tracing::debug!(
                        "dropping stream-closed for unknown call {}",
                        envelope.call_id
                    );
                }
            }
            _ => {
                tracing::debug!(
                    "dropping {} envelope on server destination",
                    envelope.message_type.as_str()
                );
            }
        }
    }

    fn handle_signal_envelope(&self, envelope: Envelope) {
        let Some(reply_to) = envelope.reply_to.clone() else {
            tracing::debug!("dropping signal without reply destination");
            return;
        };
        let Some(deadline) = envelope.req_timeout_millis else {
            tracing::debug!("dropping signal without request timeout");
            return;
        };
        let Some(payload) = envelope.body.as_bytes().cloned() else {
            tracing::debug!("dropping signal without payload");
            return;
        };
        self.dispatch_signal(
            envelope.call_id,
            payload,
            reply_to,
            deadline,
            envelope.version,
        );
    }

    /// Decode the payload, build the per-call context, and hand the sink
    /// invocation to the worker pool. Never blocks the receiver thread.
    fn dispatch_signal(
        &self,
        call_id: String,
        payload: Bytes,
        reply_to: Destination,
        deadline_millis: u64,
        version: ProtocolVersion,
    ) {
        let msg = match self.codec.decode(&payload) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!("cannot decode signal for call {call_id}: {err}");
                self.send_decode_failure(&call_id, &reply_to, version, &err.to_string());
                return;
            }
        };

        let ctx = Arc::new(ServerResponseContext::new(
            call_id.clone(),
            reply_to,
            version,
            deadline_millis,
            Arc::clone(&self.binding),
            Arc::clone(&self.codec),
            self.config.max_message_size,
            Arc::clone(&self.time),
        ));
        self.contexts
            .lock()
            .unwrap()
            .insert(call_id.clone(), Arc::clone(&ctx));

        let max_wait = deadline_millis.saturating_sub(self.time.now_millis());
        if self
            .jobs
            .send(Job {
                msg,
                ctx: Arc::clone(&ctx),
                max_wait_millis: max_wait,
            })
            .is_err()
        {
            tracing::warn!("worker pool gone, dropping call {call_id}");
            self.contexts.lock().unwrap().remove(&call_id);
        }
    }

    fn send_decode_failure(
        &self,
        call_id: &str,
        reply_to: &Destination,
        version: ProtocolVersion,
        reason: &str,
    ) {
        if !version.supports_fragmentation() {
            return;
        }
        let payload = ExceptionPayload::new("DecodeError", reason);
        let Ok(bytes) = payload.encode() else {
            return;
        };
        let envelope =
            Envelope::new(version, MessageType::Exception, call_id).with_body(bytes.into());
        if let Err(err) = self.binding.send_to(reply_to, encode_envelope(&envelope)) {
            tracing::warn!("cannot report decode failure for call {call_id}: {err}");
        }
    }

    /// Allocate a temporary channel destination and tell the client to
    /// upload there.
    fn handle_channel_request(&self, envelope: Envelope) {
        let Some(client_reply_to) = envelope.reply_to.clone() else {
            tracing::debug!("dropping channel request without reply destination");
            return;
        };
        let deadline = envelope
            .req_timeout_millis
            .unwrap_or_else(|| self.time.now_millis() + self.config.channel_inactivity_timeout_millis);

        let channel_result = self.binding.session().and_then(|session| {
            let destination = session.create_temporary_destination()?;
            let listener = self.listener.lock().unwrap().clone();
            let listener = match listener {
                Some(listener) => listener,
                None => return Err(crate::transport::TransportError::Closed),
            };
            let receiver = session.create_receiver(&destination, listener)?;
            Ok((destination, receiver))
        });
        let (channel_destination, receiver) = match channel_result {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(
                    "cannot allocate upload channel for call {}: {err}",
                    envelope.call_id
                );
                return;
            }
        };

        let now = self.time.now_millis();
        self.channels.lock().unwrap().insert(
            envelope.call_id.clone(),
            ChannelUpload {
                client_reply_to: client_reply_to.clone(),
                version: envelope.version,
                deadline_millis: deadline,
                last_activity_millis: now,
                fragments: FragmentAssembler::new(),
                receiver,
            },
        );

        let setup = Envelope::new(envelope.version, MessageType::ChannelSetup, &envelope.call_id)
            .with_text("channel setup")
            .with_reply_to(channel_destination);
        if let Err(err) = self
            .binding
            .send_to(&client_reply_to, encode_envelope(&setup))
        {
            tracing::warn!("channel setup send failed for call {}: {err}", envelope.call_id);
            if let Some(upload) = self.channels.lock().unwrap().remove(&envelope.call_id) {
                upload.receiver.close();
            }
        }
    }

    /// Fragment arriving on the server destination or an upload channel;
    /// both route here by call id.
    fn handle_signal_fragment(&self, envelope: Envelope) {
        let Some(index) = envelope.fragment_index else {
            tracing::debug!("dropping fragment without index");
            return;
        };
        let data = envelope.body.as_bytes().cloned().unwrap_or_default();

        let mut channels = self.channels.lock().unwrap();
        if let Some(upload) = channels.get_mut(&envelope.call_id) {
            upload.last_activity_millis = self.time.now_millis();
            if let Some(deadline) = envelope.req_timeout_millis {
                upload.deadline_millis = upload.deadline_millis.max(deadline);
            }
            if let Err(err) = upload.fragments.add(&envelope.call_id, index, data) {
                tracing::warn!("dropping invalid upload fragment: {err}");
            }
            return;
        }
        drop(channels);

        let mut assemblies = self.assemblies.lock().unwrap();
        let assembly = assemblies
            .entry(envelope.call_id.clone())
            .or_insert_with(|| SignalAssembly {
                reply_to: None,
                version: envelope.version,
                deadline_millis: envelope
                    .req_timeout_millis
                    .unwrap_or_else(|| self.time.now_millis() + 10_000),
                fragments: FragmentAssembler::new(),
            });
        if assembly.reply_to.is_none() {
            assembly.reply_to = envelope.reply_to.clone();
        }
        if let Some(deadline) = envelope.req_timeout_millis {
            assembly.deadline_millis = assembly.deadline_millis.max(deadline);
        }
        let key = envelope
            .response_id
            .clone()
            .unwrap_or_else(|| envelope.call_id.clone());
        if let Err(err) = assembly.fragments.add(&key, index, data) {
            tracing::warn!("dropping invalid signal fragment: {err}");
        }
    }

    /// Terminator for a fragmented signal on the server destination.
    fn handle_signal_terminator(&self, envelope: Envelope) {
        let (Some(total), Some(checksum)) =
            (envelope.fragments_total, envelope.checksum_md5.as_deref())
        else {
            tracing::debug!("dropping fragment terminator without properties");
            return;
        };
        let Some(mut assembly) = self.assemblies.lock().unwrap().remove(&envelope.call_id) else {
            tracing::debug!(
                "dropping terminator for unknown fragmented signal {}",
                envelope.call_id
            );
            return;
        };
        let key = envelope
            .response_id
            .clone()
            .unwrap_or_else(|| envelope.call_id.clone());
        match assembly.fragments.reassemble(&key, total, checksum) {
            Ok(payload) => {
                let Some(reply_to) = assembly.reply_to else {
                    tracing::debug!("fragmented signal {} has no reply destination", envelope.call_id);
                    return;
                };
                self.dispatch_signal(
                    envelope.call_id,
                    payload,
                    reply_to,
                    assembly.deadline_millis,
                    assembly.version,
                );
            }
            Err(err) => {
                tracing::warn!(
                    "rejecting fragmented signal for call {}: {err}",
                    envelope.call_id
                );
            }
        }
    }

    /// Trailer or fragments arriving on a dedicated upload channel route
    /// through the shared listener as well; the trailer is a StreamClosed
    /// carrying the fragment total and digest.
    fn handle_channel_close(&self, envelope: Envelope) {
        let Some(mut upload) = self.channels.lock().unwrap().remove(&envelope.call_id) else {
            tracing::debug!("dropping channel close for unknown call {}", envelope.call_id);
            return;
        };
        upload.receiver.close();
        let (Some(total), Some(checksum)) =
            (envelope.fragments_total, envelope.checksum_md5.as_deref())
        else {
            tracing::warn!(
                "channel close without fragment total or digest for call {}",
                envelope.call_id
            );
            return;
        };
        match upload.fragments.reassemble(&envelope.call_id, total, checksum) {
            Ok(payload) => {
                self.dispatch_signal(
                    envelope.call_id,
                    payload,
                    upload.client_reply_to,
                    upload.deadline_millis,
                    upload.version,
                );
            }
            Err(err) => {
                tracing::warn!(
                    "discarding channel upload for call {}: {err}",
                    envelope.call_id
                );
            }
        }
    }

    /// One watchdog pass: keep-alives, expired contexts, stale channels.
    fn watchdog_pass(&self, tick_millis: u64) {
        self.binding.check_failback();
        self.check_connection();

        let now = self.time.now_millis();
        let keep_alive = self.config.keep_alive_interval_millis;
        let open: Vec<Arc<ServerResponseContext<M, C>>> = {
            let mut contexts = self.contexts.lock().unwrap();
            contexts.retain(|_, ctx| !ctx.is_closed());
            contexts.values().map(Arc::clone).collect()
        };
        for ctx in open {
            // emit early enough that the client never waits a full interval
            if now.saturating_sub(ctx.last_sent_millis()) + tick_millis >= keep_alive {
                ctx.keep_alive(now + keep_alive);
            }
        }

        let stale: Vec<(String, ChannelUpload)> = {
            let mut channels = self.channels.lock().unwrap();
            let timeout = self.config.channel_inactivity_timeout_millis;
            let dead: Vec<String> = channels
                .iter()
                .filter(|(_, upload)| now.saturating_sub(upload.last_activity_millis) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            dead.into_iter()
                .filter_map(|id| channels.remove(&id).map(|u| (id, u)))
                .collect()
        };
        for (call_id, upload) in stale {
            tracing::warn!("discarding inactive channel upload for call {call_id}");
            upload.receiver.close();
        }

        self.assemblies
            .lock()
            .unwrap()
            .retain(|_, assembly| now <= assembly.deadline_millis);
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
        tracing::warn!("server connection lost, reconnecting");
        self.binding.invalidate();
        let listener = self.listener.lock().unwrap().clone();
        if let Err(err) = self
            .binding
            .reconnect(self.config.max_reconnect_millis, listener)
        {
            tracing::error!("server binding reconnect failed: {err}");
        }
    }
}

fn run_worker_loop<M, C, S>(inner: Arc<ProxyInner<M, C, S>>, jobs: ChannelReceiver<Job<M, C>>)
where
    M: Message,
    C: MessageCodec<M>,
    S: RequestSink<M> + Send + Sync + 'static,
{
    loop {
        crossbeam::select! {
            recv(jobs) -> job => {
                let Ok(job) = job else { break };
                let ctx = Arc::clone(&job.ctx) as Arc<dyn RequestContext<M>>;
                if let Err(err) = inner.sink.signal(job.msg, ctx, job.max_wait_millis) {
                    job.ctx.notify_error(err);
                }
            }
            recv(crossbeam::channel::after(Duration::from_millis(100))) -> _ => {
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
}

fn run_watchdog_loop<M, C, S>(inner: Arc<ProxyInner<M, C, S>>, stop_rx: ChannelReceiver<()>)
where
    M: Message,
    C: MessageCodec<M>,
    S: RequestSink<M> + Send + Sync + 'static,
{
    let tick = (inner.config.keep_alive_interval_millis / 2).clamp(50, 1_000);
    loop {
        crossbeam::select! {
            recv(stop_rx) -> _ => break,
            recv(crossbeam::channel::after(Duration::from_millis(tick))) -> _ => {
                if inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                inner.watchdog_pass(tick);
            }
        }
    }
}
