//! In-process broker.
//!
//! Mirrors the parts of an AMQP broker the RPC client relies on: named queues on the default exchange,
//! broker-named exclusive queues removed together with their connection, per-message expiration, and
//! silently dropped unroutable messages. The worker side of a conversation uses [MemoryBroker::declare_queue],
//! [MemoryBroker::consumer] and [MemoryBroker::publish] directly.
//!
//! Failures can be injected to exercise reconnection: see [MemoryBroker::sever_connections],
//! [MemoryBroker::inject_fault], [MemoryBroker::fail_next_publishes] and [MemoryBroker::set_refuse_connections].
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::{sync::Notify, time::Instant};
use uuid::Uuid;

use crate::{
    broker::{Broker, BrokerConnection},
    message::{Delivery, Message},
};

const EXCLUSIVE_QUEUE_PREFIX: &str = "amq.gen-";

/// Fault to return from the next delivery round of any connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection breaks. The connection is closed by the broker
    Transport,
    /// Non-transport failure. The connection stays open
    Unexpected,
}

struct Enqueued {
    message: Message,
    expires_at: Option<Instant>,
}

impl Enqueued {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |deadline| deadline <= now)
    }
}

struct Queue {
    messages: VecDeque<Enqueued>,
    /// Connection owning an exclusive queue
    exclusive_owner: Option<u64>,
    notify: Arc<Notify>,
}

impl Queue {
    fn new(exclusive_owner: Option<u64>) -> Self {
        Self {
            messages: VecDeque::new(),
            exclusive_owner,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Pop next non-expired message
    fn pop(&mut self, queue_name: &str) -> Option<Message> {
        let now = Instant::now();

        while let Some(enqueued) = self.messages.pop_front() {
            if enqueued.is_expired(now) {
                trace!("Dropping expired message in `{queue_name}`");
                continue;
            }

            return Some(enqueued.message);
        }

        None
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    live_connections: HashSet<u64>,
    next_connection_id: u64,
    connects_total: u64,
    refuse_connections: bool,
    pending_fault: Option<Fault>,
    publish_failures: usize,
}

impl BrokerState {
    fn enqueue(&mut self, destination: &str, message: Message) -> bool {
        let Some(queue) = self.queues.get_mut(destination) else {
            debug!("Dropping unroutable message to `{destination}`");
            return false;
        };

        let expires_at = message
            .properties
            .expiration
            .and_then(|ttl| Instant::now().checked_add(ttl));

        queue.messages.push_back(Enqueued {
            message,
            expires_at,
        });
        queue.notify.notify_one();

        true
    }

    fn drop_connection(&mut self, connection_id: u64) {
        if !self.live_connections.remove(&connection_id) {
            return;
        }

        debug!("Closing connection {connection_id}");

        self.queues.retain(|name, queue| {
            let owned = queue.exclusive_owner == Some(connection_id);

            if owned {
                trace!("Deleting exclusive queue `{name}`");
                // Wake consumers to let them see the queue is gone
                queue.notify.notify_waiters();
            }

            !owned
        });
    }

    fn check_alive(&self, connection_id: u64) -> crate::Result<()> {
        if self.live_connections.contains(&connection_id) {
            Ok(())
        } else {
            Err(crate::Error::Transport(format!(
                "Connection {connection_id} is closed"
            )))
        }
    }
}

/// In-process message broker. Cloning returns a handle to the same broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a shared named queue. Does nothing if the queue already exists
    pub fn declare_queue(&self, name: &str) {
        self.state()
            .queues
            .entry(name.to_owned())
            .or_insert_with(|| Queue::new(None));
    }

    /// Publish a message into the `destination` queue.
    /// Returns `false` if there is no such queue and the message was dropped
    pub fn publish(&self, destination: &str, message: Message) -> bool {
        self.state().enqueue(destination, message)
    }

    /// Make a consumer of a named queue
    pub fn consumer(&self, queue: &str) -> QueueConsumer {
        QueueConsumer {
            queue: queue.to_owned(),
            broker: self.clone(),
        }
    }

    /// Number of messages waiting in the `queue`. `None` if there is no such queue
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(|q| q.messages.len())
    }

    /// If the queue exists
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Number of open connections
    pub fn live_connections(&self) -> usize {
        self.state().live_connections.len()
    }

    /// Number of successful connection attempts since the broker start
    pub fn connects_total(&self) -> u64 {
        self.state().connects_total
    }

    /// Forcefully close every open connection
    pub fn sever_connections(&self) {
        let mut state = self.state();
        let connections: Vec<u64> = state.live_connections.iter().copied().collect();

        warn!("Severing {} connection(s)", connections.len());

        for connection_id in connections {
            state.drop_connection(connection_id);
        }
    }

    /// Fail next delivery round of any connection with a `fault`
    pub fn inject_fault(&self, fault: Fault) {
        self.state().pending_fault = Some(fault);
    }

    /// Fail next `count` connection publishes with a transport error, closing the publishing connection
    pub fn fail_next_publishes(&self, count: usize) {
        self.state().publish_failures = count;
    }

    /// Refuse new connections
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, endpoint: &str) -> crate::Result<Box<dyn BrokerConnection>> {
        let mut state = self.state();

        if state.refuse_connections {
            return Err(crate::Error::Transport(format!(
                "Connection to `{endpoint}` refused"
            )));
        }

        state.next_connection_id += 1;
        state.connects_total += 1;

        let id = state.next_connection_id;
        state.live_connections.insert(id);

        debug!("New connection {id} to `{endpoint}`");

        Ok(Box::new(MemoryConnection {
            id,
            broker: self.clone(),
            consuming: Vec::new(),
        }))
    }
}

/// Client connection to a [MemoryBroker]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    /// Queues to deliver messages from
    consuming: Vec<String>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_reply_queue(&mut self) -> crate::Result<String> {
        let mut state = self.broker.state();
        state.check_alive(self.id)?;

        let name = format!("{EXCLUSIVE_QUEUE_PREFIX}{}", Uuid::new_v4().simple());
        state.queues.insert(name.clone(), Queue::new(Some(self.id)));

        trace!("Declared exclusive queue `{name}` for connection {}", self.id);
        Ok(name)
    }

    async fn consume(&mut self, queue: &str) -> crate::Result<()> {
        let state = self.broker.state();
        state.check_alive(self.id)?;

        match state.queues.get(queue) {
            Some(Queue {
                exclusive_owner: Some(owner),
                ..
            }) if *owner != self.id => Err(crate::Error::Transport(format!(
                "Queue `{queue}` is exclusive to another connection"
            ))),
            Some(_) => {
                self.consuming.push(queue.to_owned());
                Ok(())
            }
            None => Err(crate::Error::Transport(format!("No queue `{queue}`"))),
        }
    }

    async fn publish(&mut self, destination: &str, message: Message) -> crate::Result<()> {
        let mut state = self.broker.state();
        state.check_alive(self.id)?;

        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            state.drop_connection(self.id);

            return Err(crate::Error::Transport("Connection reset on publish".into()));
        }

        state.enqueue(destination, message);
        Ok(())
    }

    async fn drain_deliveries(&mut self) -> crate::Result<Vec<Delivery>> {
        let mut state = self.broker.state();
        state.check_alive(self.id)?;

        match state.pending_fault.take() {
            Some(Fault::Transport) => {
                state.drop_connection(self.id);
                return Err(crate::Error::Transport("Connection reset by broker".into()));
            }
            Some(Fault::Unexpected) => {
                return Err(crate::Error::Unexpected("Injected broker fault".into()));
            }
            None => {}
        }

        let mut deliveries = Vec::new();
        for name in &self.consuming {
            let Some(queue) = state.queues.get_mut(name) else {
                continue;
            };

            while let Some(message) = queue.pop(name) {
                deliveries.push(Delivery {
                    queue: name.clone(),
                    message,
                });
            }
        }

        Ok(deliveries)
    }

    async fn close(&mut self) {
        self.consuming.clear();
        self.broker.state().drop_connection(self.id);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.state().drop_connection(self.id);
    }
}

/// Worker-side consumer of a named queue
pub struct QueueConsumer {
    queue: String,
    broker: MemoryBroker,
}

impl QueueConsumer {
    /// Wait for the next message. Returns `None` if the queue was deleted
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            let notify = {
                let mut state = self.broker.state();
                let queue = state.queues.get_mut(&self.queue)?;

                if let Some(message) = queue.pop(&self.queue) {
                    return Some(message);
                }

                queue.notify.clone()
            };

            notify.notified().await;
        }
    }

    /// Take next message if there is one
    pub fn try_next(&mut self) -> Option<Message> {
        let mut state = self.broker.state();
        let queue = state.queues.get_mut(&self.queue)?;

        queue.pop(&self.queue)
    }
}
