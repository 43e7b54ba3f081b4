use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use log::{debug, trace};

use crate::{
    broker::Broker,
    config::ClientConfig,
    context::{CallingContext, ContextId, ContextWatch},
    rpc::RpcClient,
};

struct Entry {
    owner: ContextWatch,
    client: Arc<RpcClient>,
}

/// Keeps exactly one [RpcClient] per calling context.
/// Clients are created on first use and forgotten once their context has ended
pub struct ClientRegistry {
    broker: Arc<dyn Broker>,
    config: ClientConfig,
    clients: Mutex<HashMap<ContextId, Entry>>,
}

impl ClientRegistry {
    /// Returns an error if `config` is invalid
    pub fn new(broker: Arc<dyn Broker>, config: ClientConfig) -> crate::Result<Self> {
        config.validate()?;

        Ok(Self {
            broker,
            config,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ContextId, Entry>> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        clients.retain(|id, entry| {
            let alive = entry.owner.is_alive();
            if !alive {
                debug!("Context {id} has ended. Forgetting its client");
            }

            alive
        });

        clients
    }

    /// Client of the `context`. Makes a new one if the context doesn't have a client yet
    pub fn client(&self, context: &CallingContext) -> crate::Result<Arc<RpcClient>> {
        let mut clients = self.clients();

        if let Some(entry) = clients.get(&context.id()) {
            return Ok(entry.client.clone());
        }

        trace!("Making a new client for {}", context.id());

        let client = Arc::new(RpcClient::new(
            self.broker.clone(),
            self.config.clone(),
            context,
        )?);

        clients.insert(
            context.id(),
            Entry {
                owner: context.watch(),
                client: client.clone(),
            },
        );

        Ok(client)
    }

    /// Make a call using the `context` client. See [RpcClient::call]
    pub async fn call(
        &self,
        context: &CallingContext,
        destination: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> crate::Result<Bytes> {
        let client = self.client(context)?;

        client.call(destination, payload, timeout).await
    }

    /// Close the client of the `context`. Clients of other contexts stay untouched
    pub async fn close(&self, context: &CallingContext) {
        let client = self
            .clients()
            .get(&context.id())
            .map(|entry| entry.client.clone());

        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Number of contexts with a client
    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }
}
