use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::lock::Mutex;
use log::{debug, info, trace, warn};

use crate::{
    broker::Broker,
    config::ClientConfig,
    connection::{ConnectionState, ConnectionSupervisor, RetryPolicy},
    consumer::{ConsumerHandle, ConsumerLoop},
    context::{CallingContext, ContextWatch},
    message::CorrelationId,
    response_registry::ResponseRegistry,
};

/// Client lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No request was sent yet
    Uninitialized,
    Connected,
    Reconnecting,
    /// Closed explicitly, or because the owning context has ended.
    /// A new request reconnects unless the client is disposed
    Closed,
    Disposed,
}

/// RPC client bound to a single calling context.
///
/// Owns a broker connection with its reply queue, and a consumer loop which resolves incoming replies.
/// The connection is established lazily on the first request, and re-established
/// if the consumer loop has exited
pub struct RpcClient {
    config: ClientConfig,
    /// Owning context
    owner: ContextWatch,
    /// Pending requests
    registry: Arc<Mutex<ResponseRegistry>>,
    /// Connection shared with the consumer loop
    supervisor: Arc<Mutex<ConnectionSupervisor>>,
    consumer: Mutex<Option<ConsumerHandle>>,
    disposed: AtomicBool,
}

impl RpcClient {
    /// Make a new client owned by the `context`.
    /// Returns an error if `config` is invalid
    pub fn new(
        broker: Arc<dyn Broker>,
        config: ClientConfig,
        context: &CallingContext,
    ) -> crate::Result<Self> {
        Self::with_owner(broker, config, context.watch())
    }

    pub(crate) fn with_owner(
        broker: Arc<dyn Broker>,
        config: ClientConfig,
        owner: ContextWatch,
    ) -> crate::Result<Self> {
        config.validate()?;

        let registry = Arc::new(Mutex::new(ResponseRegistry::new()));
        let supervisor = ConnectionSupervisor::new(
            broker,
            &config.endpoint,
            RetryPolicy::new(config.publish_attempts),
            registry.clone(),
        );

        Ok(Self {
            config,
            owner,
            registry,
            supervisor: Arc::new(Mutex::new(supervisor)),
            consumer: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    /// Publish a request without waiting for the reply.
    /// `timeout` becomes request broker-side expiration. `None` or zero means no expiration.
    /// Use [RpcClient::wait_response] with the returned id to receive the reply
    pub async fn send_request(
        &self,
        destination: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> crate::Result<CorrelationId> {
        self.check_usable()?;

        let id = CorrelationId::generate();
        self.registry.lock().await.create(id.clone());

        // Held until published, so `close()` can't run between the start and the publish
        let mut consumer = self.consumer.lock().await;
        self.ensure_running(&mut consumer).await;

        let result = self
            .supervisor
            .lock()
            .await
            .publish(destination, &id, payload.into(), effective_timeout(timeout))
            .await;

        drop(consumer);

        if let Err(e) = result {
            warn!("Failed to send {id} to `{destination}`: {e}");

            self.registry.lock().await.remove(&id);
            return Err(e);
        }

        trace!("Sent {id} to `{destination}`");
        Ok(id)
    }

    /// Wait for a reply to a request sent with [RpcClient::send_request].
    /// `None` or zero `timeout` waits indefinitely.
    ///
    /// A timed out request stays in the registry unless [ClientConfig::sweep_abandoned] is set.
    /// See [RpcClient::sweep_abandoned]
    pub async fn wait_response(
        &self,
        id: &CorrelationId,
        timeout: Option<Duration>,
    ) -> crate::Result<Bytes> {
        let waiter = self.registry.lock().await.take_waiter(id)?;

        let response = match effective_timeout(timeout) {
            Some(timeout) => match tokio::time::timeout(timeout, waiter).await {
                Ok(response) => response,
                Err(_) => {
                    debug!("Request {id} timed out after {timeout:?}");

                    if self.config.sweep_abandoned {
                        self.registry.lock().await.remove(id);
                    }

                    return Err(crate::Error::Timeout(id.clone()));
                }
            },
            None => waiter.await,
        };

        self.registry.lock().await.remove(id);

        response.map_err(|_| crate::Error::Unexpected(format!("Request {id} was dropped")))
    }

    /// Send a request and wait for the reply
    pub async fn call(
        &self,
        destination: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> crate::Result<Bytes> {
        let id = self.send_request(destination, payload, timeout).await?;

        self.wait_response(&id, timeout).await
    }

    /// Close the connection and stop the consumer loop.
    /// Doesn't reconnect if already closed. A later request reconnects
    pub async fn close(&self) {
        let mut consumer = self.consumer.lock().await;

        if let Some(handle) = consumer.take() {
            handle.stop().await;
        }

        self.supervisor.lock().await.close().await;
    }

    /// Close the client for good. Later requests fail with [crate::Error::Disposed]
    pub async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!("Disposing RPC client");
        }

        self.close().await;
    }

    pub async fn state(&self) -> ClientState {
        if self.disposed.load(Ordering::Acquire) {
            return ClientState::Disposed;
        }

        match self.supervisor.lock().await.state() {
            ConnectionState::Disconnected => ClientState::Uninitialized,
            ConnectionState::Connected => ClientState::Connected,
            ConnectionState::Reconnecting => ClientState::Reconnecting,
            ConnectionState::Closed => ClientState::Closed,
        }
    }

    /// Current reply queue
    pub async fn reply_channel(&self) -> Option<String> {
        self.supervisor
            .lock()
            .await
            .reply_channel()
            .map(str::to_owned)
    }

    /// Number of tracked requests, including timed out ones
    pub async fn pending_requests(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Remove requests whose callers stopped waiting
    pub async fn sweep_abandoned(&self) -> usize {
        self.registry.lock().await.sweep_abandoned()
    }

    /// If the consumer loop is running
    pub async fn is_consuming(&self) -> bool {
        self.consumer
            .lock()
            .await
            .as_ref()
            .map_or(false, ConsumerHandle::is_alive)
    }

    fn check_usable(&self) -> crate::Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(crate::Error::Disposed);
        }

        Ok(())
    }

    /// Connect and start a consumer loop if there is no live one.
    /// A failed connect is left for the publish retry to handle
    async fn ensure_running(&self, consumer: &mut Option<ConsumerHandle>) {
        if consumer.as_ref().map_or(false, ConsumerHandle::is_alive) {
            return;
        }

        if consumer.is_some() {
            info!("Consumer loop has exited. Restarting");
        }

        {
            let mut supervisor = self.supervisor.lock().await;

            if !supervisor.is_connected() {
                if let Err(e) = supervisor.establish().await {
                    warn!("Failed to connect: {e}");
                }
            }
        }

        *consumer = Some(
            ConsumerLoop::new(
                self.supervisor.clone(),
                self.loop_owner(),
                self.config.poll_interval(),
                self.config.recovery_backoff(),
            )
            .spawn(),
        );
    }

    /// Liveness for a new consumer loop. Once the owner has ended, the loop runs
    /// until the next `close()` or until the client is dropped
    fn loop_owner(&self) -> ContextWatch {
        if self.owner.is_alive() {
            self.owner.clone()
        } else {
            debug!("Owning context has ended. Consumer loop is bound to the client");
            ContextWatch::Root
        }
    }
}

/// Zero timeout means waiting indefinitely
fn effective_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|timeout| !timeout.is_zero())
}
