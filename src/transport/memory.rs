//! In-memory broker: the reference transport and the test vehicle.
//!
//! Messages sent to a destination are delivered, on a dedicated delivery
//! thread, to every active receiver registered for that destination name.
//! Connections can be forced into a failed state to drive invalidation and
//! reconnect paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver as ChannelReceiver, Sender as ChannelSender};
use uuid::Uuid;

use crate::transport::{
    BrokerSession, Connection, Destination, MessageListener, Receiver, SendOptions, Sender,
    TransportError, TransportMessage,
};

struct Delivery {
    destination: String,
    message: TransportMessage,
}

struct Subscription {
    listener: MessageListener,
    active: Arc<AtomicBool>,
}

struct BrokerCore {
    routes: Mutex<HashMap<String, Vec<Subscription>>>,
    deliveries: ChannelSender<Delivery>,
    stopped: AtomicBool,
}

impl BrokerCore {
    fn route(&self, delivery: Delivery) {
        // snapshot under the lock, invoke outside it: listeners may register
        // new receivers (channel setup) or send replies
        let listeners: Vec<MessageListener> = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&delivery.destination) {
                Some(subs) => {
                    subs.retain(|s| s.active.load(Ordering::SeqCst));
                    subs.iter().map(|s| Arc::clone(&s.listener)).collect()
                }
                None => Vec::new(),
            }
        };
        for listener in listeners {
            listener(delivery.message.clone());
        }
    }
}

/// Broker owning the delivery thread; connections are created from it.
pub struct MemoryBroker {
    core: Arc<BrokerCore>,
    delivery_thread: JoinHandle<()>,
}

impl MemoryBroker {
    pub fn start() -> Self {
        let (tx, rx) = crossbeam::channel::unbounded::<Delivery>();
        let core = Arc::new(BrokerCore {
            routes: Mutex::new(HashMap::new()),
            deliveries: tx,
            stopped: AtomicBool::new(false),
        });
        let loop_core = Arc::clone(&core);
        let delivery_thread = thread::spawn(move || run_delivery_loop(loop_core, rx));
        Self {
            core,
            delivery_thread,
        }
    }

    pub fn connect(&self, label: &str) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            core: Arc::clone(&self.core),
            label: label.to_string(),
            connected: Arc::new(AtomicBool::new(true)),
            receiver_flags: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn shutdown(self) {
        self.core.stopped.store(true, Ordering::SeqCst);
        let _ = self.delivery_thread.join();
    }
}

fn run_delivery_loop(core: Arc<BrokerCore>, rx: ChannelReceiver<Delivery>) {
    loop {
        if core.stopped.load(Ordering::SeqCst) {
            break;
        }
        crossbeam::select! {
            recv(rx) -> delivery => {
                match delivery {
                    Ok(delivery) => core.route(delivery),
                    Err(_) => break,
                }
            }
            recv(crossbeam::channel::after(Duration::from_millis(20))) -> _ => {}
        }
    }
}

/// One logical connection to the in-memory broker.
pub struct MemoryConnection {
    core: Arc<BrokerCore>,
    label: String,
    connected: Arc<AtomicBool>,
    receiver_flags: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl MemoryConnection {
    /// Sever the connection: further session work fails and every receiver
    /// created through it stops delivering.
    pub fn fail(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for flag in self.receiver_flags.lock().unwrap().drain(..) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Restore a previously failed connection.
    pub fn restore(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Disconnected(self.label.clone()))
        }
    }
}

impl Connection for MemoryConnection {
    fn create_session(
        &self,
        transacted: bool,
    ) -> Result<Arc<dyn BrokerSession>, TransportError> {
        let _ = transacted;
        self.ensure_connected()?;
        Ok(Arc::new(MemorySession {
            core: Arc::clone(&self.core),
            label: self.label.clone(),
            connected: Arc::clone(&self.connected),
            receiver_flags: Arc::clone(&self.receiver_flags),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn label(&self) -> String {
        self.label.clone()
    }
}

struct MemorySession {
    core: Arc<BrokerCore>,
    label: String,
    connected: Arc<AtomicBool>,
    receiver_flags: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl MemorySession {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Disconnected(self.label.clone()))
        }
    }
}

impl BrokerSession for MemorySession {
    fn lookup_destination(&self, name: &str) -> Result<Destination, TransportError> {
        self.ensure_connected()?;
        if name.is_empty() {
            return Err(TransportError::Lookup("empty destination name".into()));
        }
        Ok(Destination::named(name))
    }

    fn create_temporary_destination(&self) -> Result<Destination, TransportError> {
        self.ensure_connected()?;
        Ok(Destination::temporary(format!("tmp-{}", Uuid::new_v4())))
    }

    fn create_sender(&self, destination: &Destination) -> Result<Arc<dyn Sender>, TransportError> {
        self.ensure_connected()?;
        let _ = destination;
        Ok(Arc::new(MemorySender {
            core: Arc::clone(&self.core),
            label: self.label.clone(),
            connected: Arc::clone(&self.connected),
        }))
    }

    fn create_receiver(
        &self,
        destination: &Destination,
        listener: MessageListener,
    ) -> Result<Arc<dyn Receiver>, TransportError> {
        self.ensure_connected()?;
        let active = Arc::new(AtomicBool::new(true));
        self.core
            .routes
            .lock()
            .unwrap()
            .entry(destination.name().to_string())
            .or_default()
            .push(Subscription {
                listener,
                active: Arc::clone(&active),
            });
        self.receiver_flags.lock().unwrap().push(Arc::clone(&active));
        Ok(Arc::new(MemoryReceiver { active }))
    }

    fn close(&self) {}
}

struct MemorySender {
    core: Arc<BrokerCore>,
    label: String,
    connected: Arc<AtomicBool>,
}

impl Sender for MemorySender {
    fn send(
        &self,
        to: &Destination,
        message: TransportMessage,
        _options: SendOptions,
    ) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected(self.label.clone()));
        }
        if self.core.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Send("broker stopped".into()));
        }
        self.core
            .deliveries
            .send(Delivery {
                destination: to.name().to_string(),
                message,
            })
            .map_err(|_| TransportError::Send("broker stopped".into()))
    }

    fn close(&self) {}
}

struct MemoryReceiver {
    active: Arc<AtomicBool>,
}

impl Receiver for MemoryReceiver {
    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn wait_until(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn delivers_to_registered_receiver() {
        let broker = MemoryBroker::start();
        let conn = broker.connect("a");
        let session = conn.create_session(false).unwrap();
        let dest = session.lookup_destination("q").unwrap();

        let seen: Arc<Mutex<Vec<TransportMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _receiver = session
            .create_receiver(
                &dest,
                Arc::new(move |msg| sink.lock().unwrap().push(msg)),
            )
            .unwrap();

        let sender = session.create_sender(&dest).unwrap();
        let mut msg = TransportMessage::default();
        msg.correlation_id = Some("c1".into());
        sender.send(&dest, msg, SendOptions::default()).unwrap();

        assert!(wait_until(|| !seen.lock().unwrap().is_empty()));
        assert_eq!(
            seen.lock().unwrap()[0].correlation_id.as_deref(),
            Some("c1")
        );
        broker.shutdown();
    }

    #[test]
    fn closed_receiver_stops_delivering() {
        let broker = MemoryBroker::start();
        let conn = broker.connect("a");
        let session = conn.create_session(false).unwrap();
        let dest = session.lookup_destination("q").unwrap();

        let seen: Arc<Mutex<Vec<TransportMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let receiver = session
            .create_receiver(
                &dest,
                Arc::new(move |msg| sink.lock().unwrap().push(msg)),
            )
            .unwrap();
        receiver.close();

        let sender = session.create_sender(&dest).unwrap();
        sender
            .send(&dest, TransportMessage::default(), SendOptions::default())
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(seen.lock().unwrap().is_empty());
        broker.shutdown();
    }

    #[test]
    fn failed_connection_rejects_sessions() {
        let broker = MemoryBroker::start();
        let conn = broker.connect("a");
        conn.fail();
        assert!(matches!(
            conn.create_session(false),
            Err(TransportError::Disconnected(_))
        ));
        conn.restore();
        assert!(conn.create_session(false).is_ok());
        broker.shutdown();
    }

    #[test]
    fn temporary_destinations_are_unique() {
        let broker = MemoryBroker::start();
        let conn = broker.connect("a");
        let session = conn.create_session(false).unwrap();
        let a = session.create_temporary_destination().unwrap();
        let b = session.create_temporary_destination().unwrap();
        assert_ne!(a, b);
        assert!(a.is_temporary());
        broker.shutdown();
    }
}
