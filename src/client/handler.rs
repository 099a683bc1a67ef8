//! Client-side per-call state: response buffering, deadline tracking with
//! keep-alive extension, and blocking retrieval.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::{Message, RequestContext, RequestListener, RequestSink};
use crate::error::CallError;
use crate::time::{TimeSource, wall_clock};

/// Every accepted response implicitly keeps the call alive this long.
pub const KEEPALIVE_PERIOD_MILLIS: u64 = 10_000;

struct HandlerState<M> {
    responses: VecDeque<M>,
    error: Option<CallError>,
    closed: bool,
    /// Absolute deadline, epoch millis. Extensions never shorten it.
    deadline: u64,
}

/// Tracks the responses of one outstanding call.
///
/// The dispatcher writes into the handler from its receiver thread while
/// user threads block on the retrieval methods; all state sits behind one
/// mutex with a condvar for wakeups. Once closed a handler accepts no new
/// responses, and a recorded error makes every later retrieval return it.
pub struct RequestHandler<M> {
    allow_keep_alive: bool,
    call_id: String,
    time: Arc<dyn TimeSource>,
    state: Mutex<HandlerState<M>>,
    wakeup: Condvar,
    listeners: Mutex<Vec<Arc<dyn RequestListener>>>,
    close_notified: AtomicBool,
}

impl<M> std::fmt::Debug for RequestHandler<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl<M: Message> RequestHandler<M> {
    pub fn new(allow_keep_alive: bool, call_id: impl Into<String>, max_wait_millis: u64) -> Self {
        Self::with_time(allow_keep_alive, call_id, max_wait_millis, wall_clock())
    }

    pub fn with_time(
        allow_keep_alive: bool,
        call_id: impl Into<String>,
        max_wait_millis: u64,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let deadline = time.now_millis().saturating_add(max_wait_millis);
        Self {
            allow_keep_alive,
            call_id: call_id.into(),
            time,
            state: Mutex::new(HandlerState {
                responses: VecDeque::new(),
                error: None,
                closed: false,
                deadline,
            }),
            wakeup: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            close_notified: AtomicBool::new(false),
        }
    }

    /// Create a handler for `msg` and hand the pair to `sink`.
    pub fn signal(
        sink: &dyn RequestSink<M>,
        msg: M,
        allow_keep_alive: bool,
        max_wait_millis: u64,
    ) -> Result<Arc<Self>, CallError> {
        let handler = Arc::new(Self::new(allow_keep_alive, msg.call_id(), max_wait_millis));
        tracing::debug!(
            ">> signal [call_id={} allow_keep_alive={allow_keep_alive} max_wait={max_wait_millis}]",
            handler.call_id
        );
        sink.signal(msg, Arc::clone(&handler) as Arc<dyn RequestContext<M>>, max_wait_millis)?;
        Ok(handler)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn add_listener(&self, listener: Arc<dyn RequestListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn RequestListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn has_received_error(&self) -> bool {
        self.state.lock().unwrap().error.is_some()
    }

    /// Close this handler. Further responses are ignored; waiters wake.
    pub fn close(&self) {
        let was_closed = {
            let mut state = self.state.lock().unwrap();
            let was = state.closed;
            state.closed = true;
            self.wakeup.notify_all();
            was
        };
        if !was_closed {
            tracing::debug!("# close [call_id={}]", self.call_id);
        }
        self.fire_close_listeners();
    }

    /// Tell listeners the call timed out unexpectedly.
    pub fn notify_timeout(&self) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_timeout();
        }
    }

    /// Drain the responses received so far without waiting.
    pub fn get_responses_no_wait(&self) -> Result<Vec<M>, CallError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        Ok(state.responses.drain(..).collect())
    }

    /// Next response, waiting up to `max_wait_millis`. `None` on timeout or
    /// end-of-stream with an empty queue.
    pub fn get_next_response(&self, max_wait_millis: u64) -> Result<Option<M>, CallError> {
        let wait_deadline = self.time.now_millis().saturating_add(max_wait_millis);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            if let Some(msg) = state.responses.pop_front() {
                return Ok(Some(msg));
            }
            if state.closed {
                return Ok(None);
            }
            let now = self.time.now_millis();
            if now > state.deadline {
                self.expire(state);
                return Ok(None);
            }
            if now >= wait_deadline {
                return Ok(None);
            }
            let deadline = state.deadline;
            state = self.wait(state, wait_deadline.min(deadline.saturating_add(1)) - now);
        }
    }

    /// Next response, waiting as long as the call stays open. Keep-alives
    /// can make this wait indefinitely.
    pub fn get_next_response_blocking(&self) -> Result<Option<M>, CallError> {
        loop {
            if let Some(msg) = self.get_next_response(1_000)? {
                return Ok(Some(msg));
            }
            if self.is_closed() {
                return Ok(None);
            }
        }
    }

    /// Responses collected until `max_results` are available, the call
    /// closes, or `max_wait_millis` elapses, whichever happens first.
    pub fn get_responses(
        &self,
        max_wait_millis: u64,
        max_results: usize,
    ) -> Result<Vec<M>, CallError> {
        let wait_deadline = self.time.now_millis().saturating_add(max_wait_millis);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            if state.responses.len() >= max_results || state.closed {
                return Ok(state.responses.drain(..).collect());
            }
            let now = self.time.now_millis();
            if now > state.deadline {
                let drained = state.responses.drain(..).collect();
                self.expire(state);
                return Ok(drained);
            }
            if now >= wait_deadline {
                return Ok(state.responses.drain(..).collect());
            }
            let deadline = state.deadline;
            state = self.wait(state, wait_deadline.min(deadline.saturating_add(1)) - now);
        }
    }

    /// True when the call closed (end of stream, error, or expiry) before
    /// `max_wait_millis` elapsed. Keep-alives may push the close past the
    /// wait bound, in which case this returns false at the bound.
    pub fn wait_for_end_of_stream(&self, max_wait_millis: u64) -> bool {
        let wait_deadline = self.time.now_millis().saturating_add(max_wait_millis);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return true;
            }
            let now = self.time.now_millis();
            if now > state.deadline {
                self.expire(state);
                return true;
            }
            if now >= wait_deadline {
                return false;
            }
            let deadline = state.deadline;
            state = self.wait(state, wait_deadline.min(deadline.saturating_add(1)) - now);
        }
    }

    fn wait<'a>(
        &self,
        state: MutexGuard<'a, HandlerState<M>>,
        millis: u64,
    ) -> MutexGuard<'a, HandlerState<M>> {
        let (state, _) = self
            .wakeup
            .wait_timeout(state, Duration::from_millis(millis.max(1)))
            .unwrap();
        state
    }

    /// Close while holding the state lock, then notify listeners outside it.
    fn expire(&self, mut state: MutexGuard<'_, HandlerState<M>>) {
        state.closed = true;
        self.wakeup.notify_all();
        drop(state);
        tracing::debug!("# expired [call_id={}]", self.call_id);
        self.fire_close_listeners();
    }

    fn fire_close_listeners(&self) {
        if self
            .close_notified
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_close(&self.call_id);
        }
    }
}

impl<M: Message> RequestContext<M> for RequestHandler<M> {
    fn add_response(&self, msg: M) -> bool {
        if self.is_closed() {
            tracing::debug!("<< add_response rejected [call_id={}]", self.call_id);
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.responses.push_back(msg);
        // every response is an implicit keep-alive
        if self.allow_keep_alive {
            let until = self.time.now_millis() + KEEPALIVE_PERIOD_MILLIS;
            if until > state.deadline {
                state.deadline = until;
            }
        }
        self.wakeup.notify_all();
        true
    }

    fn keep_alive(&self, until_millis: u64) -> bool {
        if self.is_closed() || !self.allow_keep_alive {
            tracing::debug!(
                "<< keep_alive rejected [call_id={} until={until_millis}]",
                self.call_id
            );
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if until_millis > state.deadline {
            tracing::debug!(
                "keeping call open [call_id={} until={until_millis}]",
                self.call_id
            );
            state.deadline = until_millis;
        }
        self.wakeup.notify_all();
        true
    }

    fn end_of_stream(&self) {
        tracing::debug!("<< end_of_stream [call_id={}]", self.call_id);
        self.close();
    }

    fn notify_error(&self, err: CallError) {
        tracing::debug!("<< notify_error [call_id={} err={err}]", self.call_id);
        {
            let mut state = self.state.lock().unwrap();
            if state.error.is_none() {
                state.error = Some(err);
            }
            self.wakeup.notify_all();
        }
        self.close();
    }

    fn notify_close(&self) {
        tracing::debug!("<< notify_close [call_id={}]", self.call_id);
        self.fire_close_listeners();
    }

    fn is_closed(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.closed && self.time.now_millis() > state.deadline {
            self.expire(state);
            return true;
        }
        state.closed
    }
}
