//! Session binding: one logical binding to a transport connection.
//!
//! Callers see a valid (connection, session, destination, sender, receiver)
//! tuple; disconnects are hidden behind invalidation, reconnect, and
//! failback to the primary connection. Handles are constructed lazily and
//! cached until invalidated.
//!
//! Concurrency invariants: at most one thread invalidates at a time, at most
//! one thread reconnects at a time, and the two never interleave. The state
//! mutex is held only to read or replace cached handles, never across a
//! blocking send.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::time::TimeSource;
use crate::transport::{
    BrokerSession, Connection, Destination, MessageListener, Receiver, SendOptions, Sender,
    TransportError, TransportMessage,
};

const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct BindingConfig {
    /// Destination to bind; ignored when `temporary` is set.
    pub destination_name: String,
    /// Create a session-scoped temporary destination instead of looking up
    /// the named one.
    pub temporary: bool,
    pub transacted: bool,
    /// Zero disables failback.
    pub failback_interval_millis: u64,
    pub send_options: SendOptions,
}

impl BindingConfig {
    pub fn named(destination_name: impl Into<String>) -> Self {
        Self {
            destination_name: destination_name.into(),
            temporary: false,
            transacted: false,
            failback_interval_millis: 0,
            send_options: SendOptions::default(),
        }
    }

    pub fn temporary() -> Self {
        Self {
            destination_name: String::new(),
            temporary: true,
            transacted: false,
            failback_interval_millis: 0,
            send_options: SendOptions::default(),
        }
    }
}

#[derive(Default)]
struct CachedHandles {
    connection: Option<Arc<dyn Connection>>,
    session: Option<Arc<dyn BrokerSession>>,
    destination: Option<Destination>,
    sender: Option<Arc<dyn Sender>>,
    receiver: Option<Arc<dyn Receiver>>,
}

pub struct SessionBinding {
    connections: Vec<Arc<dyn Connection>>,
    config: BindingConfig,
    time: Arc<dyn TimeSource>,

    state: Mutex<CachedHandles>,
    pointer: AtomicUsize,
    last_failback_millis: AtomicU64,
    closed: AtomicBool,
    invalidating: AtomicBool,
    reconnecting: Mutex<Option<ThreadId>>,
}

impl SessionBinding {
    pub fn new(
        connections: Vec<Arc<dyn Connection>>,
        config: BindingConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            connections,
            config,
            time,
            state: Mutex::new(CachedHandles::default()),
            pointer: AtomicUsize::new(0),
            last_failback_millis: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            invalidating: AtomicBool::new(false),
            reconnecting: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_invalidating(&self) -> bool {
        self.invalidating.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.lock().unwrap().is_some()
    }

    pub fn has_session(&self) -> bool {
        self.state.lock().unwrap().session.is_some()
    }

    pub fn send_options(&self) -> SendOptions {
        self.config.send_options
    }

    /// Active connection, selecting the next candidate round-robin when none
    /// is bound. Selection restarts the failback timer.
    pub fn connection(&self) -> Result<Arc<dyn Connection>, TransportError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = &state.connection {
            return Ok(Arc::clone(conn));
        }
        if self.connections.is_empty() {
            return Err(TransportError::NoConnections);
        }
        let index = self.pointer.load(Ordering::SeqCst) % self.connections.len();
        self.pointer
            .store((index + 1) % self.connections.len(), Ordering::SeqCst);
        let conn = Arc::clone(&self.connections[index]);
        self.last_failback_millis
            .store(self.time.now_millis(), Ordering::SeqCst);
        tracing::info!("using connection {}", conn.label());
        state.connection = Some(Arc::clone(&conn));
        Ok(conn)
    }

    pub fn session(&self) -> Result<Arc<dyn BrokerSession>, TransportError> {
        self.ensure_open()?;
        if let Some(session) = self.state.lock().unwrap().session.clone() {
            return Ok(session);
        }
        let conn = self.connection()?;
        let mut state = self.state.lock().unwrap();
        if let Some(session) = &state.session {
            return Ok(Arc::clone(session));
        }
        let session = conn.create_session(self.config.transacted)?;
        state.session = Some(Arc::clone(&session));
        Ok(session)
    }

    pub fn destination(&self) -> Result<Destination, TransportError> {
        self.ensure_open()?;
        if let Some(dest) = self.state.lock().unwrap().destination.clone() {
            return Ok(dest);
        }
        let session = self.session()?;
        let mut state = self.state.lock().unwrap();
        if let Some(dest) = &state.destination {
            return Ok(dest.clone());
        }
        let dest = if self.config.temporary {
            session.create_temporary_destination()?
        } else {
            session.lookup_destination(&self.config.destination_name)?
        };
        state.destination = Some(dest.clone());
        Ok(dest)
    }

    pub fn sender(&self) -> Result<Arc<dyn Sender>, TransportError> {
        self.ensure_open()?;
        if let Some(sender) = self.state.lock().unwrap().sender.clone() {
            return Ok(sender);
        }
        let session = self.session()?;
        let destination = self.destination()?;
        let mut state = self.state.lock().unwrap();
        if let Some(sender) = &state.sender {
            return Ok(Arc::clone(sender));
        }
        let sender = session.create_sender(&destination)?;
        state.sender = Some(Arc::clone(&sender));
        Ok(sender)
    }

    pub fn receiver(&self, listener: MessageListener) -> Result<Arc<dyn Receiver>, TransportError> {
        self.ensure_open()?;
        if let Some(receiver) = self.state.lock().unwrap().receiver.clone() {
            return Ok(receiver);
        }
        let session = self.session()?;
        let destination = self.destination()?;
        let mut state = self.state.lock().unwrap();
        if let Some(receiver) = &state.receiver {
            return Ok(Arc::clone(receiver));
        }
        let receiver = session.create_receiver(&destination, listener)?;
        state.receiver = Some(Arc::clone(&receiver));
        Ok(receiver)
    }

    /// Send to this binding's own destination.
    pub fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        let destination = self.destination()?;
        self.send_to(&destination, message)
    }

    /// Send to an explicit destination (reply queues vary per call).
    ///
    /// The sender handle is resolved under the state lock, the send itself
    /// runs outside it. Failures invalidate the binding unless it is a
    /// temporary one.
    pub fn send_to(
        &self,
        destination: &Destination,
        message: TransportMessage,
    ) -> Result<(), TransportError> {
        let sender = self.sender()?;
        match sender.send(destination, message, self.config.send_options) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!("send to {} failed: {err}", destination.name());
                if !self.config.temporary {
                    self.invalidate();
                }
                Err(err)
            }
        }
    }

    /// Tear down all cached handles. Idempotent; skipped while another
    /// thread is reconnecting.
    pub fn invalidate(&self) {
        {
            let reconnecting = self.reconnecting.lock().unwrap();
            if let Some(owner) = *reconnecting
                && owner != thread::current().id()
            {
                return;
            }
        }
        if self
            .invalidating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!("invalidating binding for {}", self.describe_destination());
        self.close_all_resources();
        self.invalidating.store(false, Ordering::SeqCst);
    }

    /// Rebuild the binding against a (possibly different) candidate
    /// connection, retrying until success or `max_reconnect_millis` elapses.
    /// On final failure the binding transitions to the stopped state.
    ///
    /// At most one thread reconnects; concurrent callers return immediately.
    pub fn reconnect(
        &self,
        max_reconnect_millis: u64,
        listener: Option<MessageListener>,
    ) -> Result<(), TransportError> {
        {
            let mut reconnecting = self.reconnecting.lock().unwrap();
            if reconnecting.is_some() {
                return Ok(());
            }
            *reconnecting = Some(thread::current().id());
        }
        let result = self.reconnect_loop(max_reconnect_millis, listener);
        *self.reconnecting.lock().unwrap() = None;
        result
    }

    fn reconnect_loop(
        &self,
        max_reconnect_millis: u64,
        listener: Option<MessageListener>,
    ) -> Result<(), TransportError> {
        let deadline = self.time.now_millis() + max_reconnect_millis;
        while !self.is_closed() && self.time.now_millis() < deadline {
            let attempt = match &listener {
                Some(listener) => self.receiver(Arc::clone(listener)).map(|_| ()),
                None => self.sender().map(|_| ()),
            };
            match attempt {
                Ok(()) => {
                    tracing::info!("reconnected binding for {}", self.describe_destination());
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!("reconnect attempt failed: {err}");
                    self.close_all_resources();
                }
            }
            thread::sleep(RECONNECT_RETRY_DELAY);
        }
        tracing::warn!(
            "reconnect gave up for {}, stopping binding",
            self.describe_destination()
        );
        self.close();
        Err(TransportError::ReconnectTimeout(max_reconnect_millis))
    }

    /// Revert to the primary connection once the failback interval elapsed.
    ///
    /// The interval timer gates attempts: it restarts on every connection
    /// selection and on every failback attempt, successful or not.
    pub fn check_failback(&self) {
        if self.config.failback_interval_millis == 0 || self.connections.len() < 2 {
            return;
        }
        let on_primary = {
            let state = self.state.lock().unwrap();
            match &state.connection {
                Some(active) => Arc::ptr_eq(active, &self.connections[0]),
                None => return,
            }
        };
        if on_primary {
            return;
        }
        let now = self.time.now_millis();
        let last = self.last_failback_millis.load(Ordering::SeqCst);
        if now > last + self.config.failback_interval_millis {
            tracing::warn!(
                "attempting failback to primary connection {}",
                self.connections[0].label()
            );
            self.pointer.store(0, Ordering::SeqCst);
            self.last_failback_millis.store(now, Ordering::SeqCst);
            self.invalidate();
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_all_resources();
    }

    fn close_all_resources(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(receiver) = state.receiver.take() {
            receiver.close();
        }
        if let Some(sender) = state.sender.take() {
            sender.close();
        }
        if let Some(session) = state.session.take() {
            session.close();
        }
        state.destination = None;
        state.connection = None;
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn describe_destination(&self) -> &str {
        if self.config.temporary {
            "<temporary>"
        } else {
            &self.config.destination_name
        }
    }
}
