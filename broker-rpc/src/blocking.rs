//! Blocking calls from plain threads.
//!
//! Every thread gets its own [CallingContext] on first use, and so its own connection and consumer loop.
//! The context ends when the thread exits, which stops the loop.
//!
//! Calls are executed on a multi-threaded Tokio runtime. [BlockingRpc] methods must not be used
//! from inside the runtime.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::{
    client_registry::ClientRegistry,
    context::{CallingContext, ContextId},
};

thread_local! {
    static THREAD_CONTEXT: CallingContext = CallingContext::new();
}

/// Blocking facade over a [ClientRegistry]
#[derive(Clone)]
pub struct BlockingRpc {
    registry: Arc<ClientRegistry>,
    runtime: Handle,
}

impl BlockingRpc {
    /// `runtime` must be a handle of a multi-threaded runtime: consumer loops run on its workers
    /// while the calling thread is blocked
    pub fn new(registry: Arc<ClientRegistry>, runtime: Handle) -> Self {
        Self { registry, runtime }
    }

    /// Send a request and block until the reply arrives or the `timeout` elapses.
    /// `None` or zero `timeout` blocks indefinitely
    pub fn call(
        &self,
        destination: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> crate::Result<Bytes> {
        let payload = payload.into();

        THREAD_CONTEXT.with(|context| {
            self.runtime
                .block_on(self.registry.call(context, destination, payload, timeout))
        })
    }

    /// Close the current thread's client
    pub fn close(&self) {
        THREAD_CONTEXT.with(|context| self.runtime.block_on(self.registry.close(context)))
    }

    /// Context of the current thread
    pub fn context_id() -> ContextId {
        THREAD_CONTEXT.with(CallingContext::id)
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }
}
