use broker_rpc::{memory::MemoryBroker, message::Message};
use tokio::sync::mpsc::{self, Receiver};

/// Worker, which takes requests but never replies
pub struct SilentWorker {
    received: Receiver<Message>,
}

impl SilentWorker {
    pub fn spawn(broker: &MemoryBroker, queue: &str) -> Self {
        broker.declare_queue(queue);

        let mut requests = broker.consumer(queue);
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            while let Some(request) = requests.next().await {
                if tx.send(request).await.is_err() {
                    return;
                }
            }
        });

        Self { received: rx }
    }

    /// Next request the worker has swallowed
    pub async fn next_request(&mut self) -> Option<Message> {
        self.received.recv().await
    }
}
