use async_trait::async_trait;

use crate::message::{Delivery, Message};

/// Broker, which opens connections to a configured endpoint.
/// Used not only for the initial connection, but also to reconnect after a transport failure
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, endpoint: &str) -> crate::Result<Box<dyn BrokerConnection>>;
}

/// Single broker session.
/// Every method returns [crate::Error::Transport] if the session is no longer usable
#[async_trait]
pub trait BrokerConnection: Send {
    /// Declare an exclusive queue with a broker-allocated name.
    /// The queue lives as long as the connection does
    async fn declare_reply_queue(&mut self) -> crate::Result<String>;

    /// Start consuming messages from the `queue`
    async fn consume(&mut self, queue: &str) -> crate::Result<()>;

    /// Fire-and-forget publish into the `destination` queue
    async fn publish(&mut self, destination: &str, message: Message) -> crate::Result<()>;

    /// Single round of event delivery: returns messages received by the consumers since the last call.
    /// Must not wait for new messages to arrive
    async fn drain_deliveries(&mut self) -> crate::Result<Vec<Delivery>>;

    /// Close the session. Exclusive queues are deleted by the broker
    async fn close(&mut self);
}
