//! Transport-backed request sink: the client component that puts signals on
//! the wire and wires their handlers into the dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::api::{Message, MessageCodec, RequestContext, RequestSink};
use crate::client::dispatcher::{ClientDispatcher, DispatcherConfig, PendingUpload};
use crate::client::handler::RequestHandler;
use crate::config::ClientConfig;
use crate::error::{CallError, Error};
use crate::time::TimeSource;
use crate::transport::{BindingConfig, Connection, SessionBinding};
use crate::wire::envelope::{Envelope, MessageType, ProtocolVersion};
use crate::wire::encode_envelope;

/// Client endpoint for one server destination.
///
/// Holds a binding for outgoing signals and a second, temporary binding the
/// dispatcher consumes replies on. Payloads above the configured size limit
/// are moved through the channel-upload handshake instead of a single
/// signal envelope.
pub struct RequestClient<M, C> {
    config: ClientConfig,
    version: ProtocolVersion,
    request_binding: Arc<SessionBinding>,
    dispatcher: ClientDispatcher<M, C>,
    codec: Arc<C>,
    time: Arc<dyn TimeSource>,
    closed: AtomicBool,
}

impl<M, C> RequestClient<M, C>
where
    M: Message,
    C: MessageCodec<M>,
{
    pub fn start(
        connections: Vec<Arc<dyn Connection>>,
        codec: Arc<C>,
        config: ClientConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, Error> {
        let request_binding = Arc::new(SessionBinding::new(
            connections.clone(),
            BindingConfig {
                destination_name: config.destination_name.clone(),
                temporary: false,
                transacted: config.transacted,
                failback_interval_millis: config.failback_interval_millis,
                send_options: config.send_options,
            },
            Arc::clone(&time),
        ));
        let reply_binding = Arc::new(SessionBinding::new(
            connections,
            BindingConfig::temporary(),
            Arc::clone(&time),
        ));
        let dispatcher = ClientDispatcher::start(
            reply_binding,
            Arc::clone(&codec),
            Arc::clone(&time),
            DispatcherConfig {
                reaper_interval_millis: config.reaper_interval_millis,
                max_reconnect_millis: config.max_reconnect_millis,
            },
        )?;
        let version = config.protocol.into();
        Ok(Self {
            config,
            version,
            request_binding,
            dispatcher,
            codec,
            time,
            closed: AtomicBool::new(false),
        })
    }

    /// Signal `msg` and return the handler tracking its responses.
    pub fn signal(
        &self,
        msg: M,
        allow_keep_alive: bool,
        max_wait_millis: u64,
    ) -> Result<Arc<RequestHandler<M>>, Error> {
        let handler = Arc::new(RequestHandler::with_time(
            allow_keep_alive,
            msg.call_id(),
            max_wait_millis,
            Arc::clone(&self.time),
        ));
        RequestSink::signal(
            self,
            msg,
            Arc::clone(&handler) as Arc<dyn RequestContext<M>>,
            max_wait_millis,
        )?;
        Ok(handler)
    }

    /// Calls currently tracked by the dispatcher.
    pub fn outstanding_calls(&self) -> usize {
        self.dispatcher.registered_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the component: every registered handler closes with
    /// end-of-stream and pending waiters return normally.
    pub fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping request client for {}", self.config.destination_name);
        self.dispatcher.shutdown();
        self.request_binding.close();
    }
}

impl<M, C> RequestSink<M> for RequestClient<M, C>
where
    M: Message,
    C: MessageCodec<M>,
{
    fn signal(
        &self,
        msg: M,
        ctx: Arc<dyn RequestContext<M>>,
        max_wait_millis: u64,
    ) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::Closed);
        }
        if msg.call_id().is_empty() {
            return Err(CallError::InvalidSignal("call id must not be empty".into()));
        }
        if max_wait_millis == 0 {
            return Err(CallError::InvalidSignal("max wait must be positive".into()));
        }

        let call_id = msg.call_id().to_string();
        let payload = self.codec.encode(&msg)?;
        let deadline = self.time.now_millis() + max_wait_millis;
        let reply_to = self.dispatcher.reply_destination().map_err(CallError::from)?;

        self.dispatcher.register(&call_id, Arc::clone(&ctx));

        let result = if payload.len() <= self.config.max_message_size {
            let envelope = Envelope::new(self.version, MessageType::Signal, &call_id)
                .with_body(payload)
                .with_reply_to(reply_to)
                .with_req_timeout(deadline);
            self.request_binding
                .send(encode_envelope(&envelope))
                .map_err(CallError::from)
        } else if self.version.supports_fragmentation() {
            self.dispatcher.add_pending_upload(
                &call_id,
                PendingUpload {
                    context: Arc::clone(&ctx),
                    payload,
                    version: self.version,
                    max_fragment_size: self.config.max_message_size,
                    deadline_millis: deadline,
                    request_binding: Arc::clone(&self.request_binding),
                },
            );
            let envelope = Envelope::new(self.version, MessageType::ChannelRequest, &call_id)
                .with_text("channel request")
                .with_reply_to(reply_to)
                .with_req_timeout(deadline);
            self.request_binding
                .send(encode_envelope(&envelope))
                .map_err(CallError::from)
        } else {
            Err(CallError::MessageTooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            })
        };

        if result.is_err() {
            self.dispatcher.unregister(&call_id);
        }
        result
    }
}
