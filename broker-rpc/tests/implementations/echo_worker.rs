use std::time::Duration;

use broker_rpc::{memory::MemoryBroker, message::Message};
use bytes::Bytes;
use log::*;
use tokio::task::JoinHandle;

/// Worker, which replies to every request after a `delay`.
/// Reply payload is made by the `respond` function
pub struct EchoWorker {
    task: JoinHandle<()>,
}

impl EchoWorker {
    pub fn spawn<F>(broker: &MemoryBroker, queue: &str, delay: Duration, respond: F) -> Self
    where
        F: Fn(&Bytes) -> Bytes + Send + Sync + Copy + 'static,
    {
        broker.declare_queue(queue);

        let broker = broker.clone();
        let mut requests = broker.consumer(queue);

        let task = tokio::spawn(async move {
            while let Some(request) = requests.next().await {
                let Some(reply_to) = request.properties.reply_to.clone() else {
                    warn!("Request without a reply queue");
                    continue;
                };

                let broker = broker.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;

                    let reply = Message::reply_to(&request, respond(&request.payload));
                    if !broker.publish(&reply_to, reply) {
                        debug!("Reply queue `{reply_to}` is gone");
                    }
                });
            }
        });

        Self { task }
    }

    /// Replies with the request payload
    pub fn echo(broker: &MemoryBroker, queue: &str, delay: Duration) -> Self {
        Self::spawn(broker, queue, delay, |payload| payload.clone())
    }
}

impl Drop for EchoWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
