/*!
Request/reply RPC over a publish/subscribe message broker.

The broker only delivers messages one way. The library:
- Publishes requests tagged with a fresh correlation id and a private reply queue;
- Runs a background consumer loop, which matches incoming replies to pending requests by correlation id;
- Reconnects on transport failures, getting a new reply queue, and retries a failed publish once;
- Keeps one client per calling context with [client_registry::ClientRegistry]. A client's consumer loop stops
  once its [context::CallingContext] is dropped;
- Provides blocking calls for plain threads with [blocking::BlockingRpc].

Brokers plug in through [broker::Broker]. [memory::MemoryBroker] is an in-process implementation.

# Examples

Async call:
```
use std::{sync::Arc, time::Duration};

use broker_rpc::{config::ClientConfig, context::CallingContext, memory::MemoryBroker, rpc::RpcClient};

async fn call(broker: MemoryBroker) {
    let context = CallingContext::new();
    let client = RpcClient::new(Arc::new(broker), ClientConfig::default(), &context).unwrap();

    match client.call("worker.echo", "ping", Some(Duration::from_secs(2))).await {
        Ok(reply) => println!("Reply: {reply:?}"),
        Err(broker_rpc::Error::Timeout(id)) => println!("No reply to {id}"),
        Err(e) => println!("Call failed: {e}"),
    }
}
```

Worker side using the in-process broker:
```
use broker_rpc::{memory::MemoryBroker, message::Message};

async fn serve(broker: MemoryBroker) {
    broker.declare_queue("worker.echo");
    let mut requests = broker.consumer("worker.echo");

    while let Some(request) = requests.next().await {
        if let Some(reply_to) = request.properties.reply_to.as_deref() {
            broker.publish(reply_to, Message::reply_to(&request, request.payload.clone()));
        }
    }
}
```

Blocking calls from threads:
```
use std::{sync::Arc, time::Duration};

use broker_rpc::{
    blocking::BlockingRpc, client_registry::ClientRegistry, config::ClientConfig, memory::MemoryBroker,
};

fn call(runtime: &tokio::runtime::Runtime, broker: MemoryBroker) {
    let registry = ClientRegistry::new(Arc::new(broker), ClientConfig::default()).unwrap();
    let rpc = BlockingRpc::new(Arc::new(registry), runtime.handle().clone());

    std::thread::spawn(move || {
        let reply = rpc.call("worker.echo", "ping", Some(Duration::from_secs(1)));
        println!("Reply: {reply:?}");
    });
}
```

See `tests/` for more examples.
*/

pub mod blocking;
pub mod broker;
pub mod client_registry;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
mod error;
pub mod memory;
pub mod message;
pub mod response_registry;
pub mod rpc;

pub use error::*;
