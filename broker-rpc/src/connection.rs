use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::lock::Mutex;
use log::{debug, info, trace, warn};

use crate::{
    broker::{Broker, BrokerConnection},
    message::{CorrelationId, Message},
    response_registry::ResponseRegistry,
};

/// Bounded publish retry. Every retry is preceded by a reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// If a failed `attempt` (1-based) can be retried
    fn should_retry(&self, attempt: u32, error: &crate::Error) -> bool {
        error.is_transport() && attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Disconnected,
    Connected,
    /// Connection failed, waiting for a new one
    Reconnecting,
    Closed,
}

/// Live broker session and the reply queue bound to it
struct Session {
    connection: Box<dyn BrokerConnection>,
    reply_queue: String,
}

/// Owner of a single broker connection and its reply queue.
/// Both the publishing path and the consumer loop use it under the same lock
pub struct ConnectionSupervisor {
    broker: Arc<dyn Broker>,
    endpoint: String,
    retry_policy: RetryPolicy,
    /// Registry to resolve incoming replies into
    registry: Arc<Mutex<ResponseRegistry>>,
    session: Option<Session>,
    state: ConnectionState,
}

impl ConnectionSupervisor {
    pub fn new(
        broker: Arc<dyn Broker>,
        endpoint: &str,
        retry_policy: RetryPolicy,
        registry: Arc<Mutex<ResponseRegistry>>,
    ) -> Self {
        Self {
            broker,
            endpoint: endpoint.to_owned(),
            retry_policy,
            registry,
            session: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Current reply queue name. Changes on every reconnect
    pub fn reply_channel(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|session| session.reply_queue.as_str())
    }

    /// Open a new connection with a new exclusive reply queue and start consuming it.
    /// Returns reply queue name
    pub async fn establish(&mut self) -> crate::Result<String> {
        trace!("Connecting to `{}`", self.endpoint);

        let mut connection = self.broker.connect(&self.endpoint).await?;
        let reply_queue = connection.declare_reply_queue().await?;
        connection.consume(&reply_queue).await?;

        info!(
            "Connected to `{}`. Reply queue: `{reply_queue}`",
            self.endpoint
        );

        self.session = Some(Session {
            connection,
            reply_queue: reply_queue.clone(),
        });
        self.state = ConnectionState::Connected;

        Ok(reply_queue)
    }

    /// Drop current connection and establish a new one
    pub async fn recover(&mut self) -> crate::Result<String> {
        self.state = ConnectionState::Reconnecting;

        if let Some(mut session) = self.session.take() {
            debug!("Discarding reply queue `{}`", session.reply_queue);
            session.connection.close().await;
        }

        self.establish().await
    }

    /// Publish a request into the `destination`.
    /// `ttl` sets broker-side expiration, so the request is dropped if no one picks it up in time
    pub async fn publish(
        &mut self,
        destination: &str,
        correlation_id: &CorrelationId,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> crate::Result<()> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self
                .try_publish(destination, correlation_id, payload.clone(), ttl)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if self.retry_policy.should_retry(attempt, &e) => {
                    warn!("Failed to publish {correlation_id}: {e}. Reconnecting");

                    self.recover().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_publish(
        &mut self,
        destination: &str,
        correlation_id: &CorrelationId,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> crate::Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(crate::Error::Transport("Not connected".into()));
        };

        let message = Message::request(
            payload,
            &session.reply_queue,
            correlation_id.clone(),
            ttl,
        );

        debug!("Publishing {correlation_id} into `{destination}`");
        session.connection.publish(destination, message).await
    }

    /// Single round of reply delivery. Returns number of replies received
    pub async fn pump(&mut self) -> crate::Result<usize> {
        let Some(session) = self.session.as_mut() else {
            return Err(crate::Error::Transport("Not connected".into()));
        };

        let deliveries = session.connection.drain_deliveries().await?;
        if deliveries.is_empty() {
            return Ok(0);
        }

        let mut registry = self.registry.lock().await;
        let mut resolved = 0;

        for delivery in deliveries {
            if delivery.queue != session.reply_queue {
                warn!(
                    "Ignoring delivery from a foreign queue `{}`",
                    delivery.queue
                );
                continue;
            }

            match delivery.message.properties.correlation_id {
                Some(id) => {
                    if registry.resolve(&id, delivery.message.payload) {
                        resolved += 1;
                    }
                }
                None => warn!("Dropping reply without a correlation id"),
            }
        }

        Ok(resolved)
    }

    /// Close the connection. Does nothing if already closed
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!("Closing connection to `{}`", self.endpoint);
            session.connection.close().await;
        }

        self.state = ConnectionState::Closed;
    }
}
