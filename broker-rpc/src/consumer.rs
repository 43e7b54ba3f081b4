use std::{sync::Arc, time::Duration};

use futures::lock::Mutex;
use log::{debug, error, info, trace, warn};
use tokio::{
    sync::oneshot::{self, Receiver, Sender},
    task::JoinHandle,
};

use crate::{connection::ConnectionSupervisor, context::ContextWatch};

/// Background task, which pumps replies from the broker into the response registry
/// and reconnects on failures
pub struct ConsumerLoop {
    supervisor: Arc<Mutex<ConnectionSupervisor>>,
    /// Owning context. The loop exits when it ends
    owner: ContextWatch,
    poll_interval: Duration,
    recovery_backoff: Duration,
}

impl ConsumerLoop {
    pub fn new(
        supervisor: Arc<Mutex<ConnectionSupervisor>>,
        owner: ContextWatch,
        poll_interval: Duration,
        recovery_backoff: Duration,
    ) -> Self {
        Self {
            supervisor,
            owner,
            poll_interval,
            recovery_backoff,
        }
    }

    /// Start the loop. Dropping the handle stops it
    pub fn spawn(self) -> ConsumerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();

        ConsumerHandle {
            stop: Some(stop_tx),
            task: tokio::spawn(self.run(stop_rx)),
        }
    }

    async fn run(self, mut stop: Receiver<()>) {
        debug!("Consumer loop started");

        loop {
            if !self.owner.is_alive() {
                info!("Owning context has ended. Stopping consumer loop");
                break;
            }

            let result = self.supervisor.lock().await.pump().await;

            let pause = match result {
                Ok(0) => self.poll_interval,
                Ok(resolved) => {
                    trace!("Received {resolved} replies");
                    self.poll_interval
                }
                Err(e) if e.is_transport() => {
                    warn!("Consumer transport failure: {e}. Reconnecting");
                    self.reconnect().await
                }
                Err(e) => {
                    error!(
                        "Unexpected consumer error: {e}. Reconnecting in {:?}",
                        self.recovery_backoff
                    );

                    if Self::pause(self.recovery_backoff, &mut stop).await {
                        break;
                    }

                    self.reconnect().await
                }
            };

            if Self::pause(pause, &mut stop).await {
                debug!("Consumer loop stop requested");
                break;
            }
        }

        self.supervisor.lock().await.close().await;
        debug!("Consumer loop stopped");
    }

    /// Force a reconnect. Returns a pause before the next cycle
    async fn reconnect(&self) -> Duration {
        match self.supervisor.lock().await.recover().await {
            Ok(reply_queue) => {
                info!("Reconnected. New reply queue: `{reply_queue}`");
                self.poll_interval
            }
            Err(e) => {
                error!(
                    "Failed to reconnect: {e}. Retrying in {:?}",
                    self.recovery_backoff
                );
                self.recovery_backoff
            }
        }
    }

    /// Sleep for `duration`. Returns `true` if the loop was asked to stop
    async fn pause(duration: Duration, stop: &mut Receiver<()>) -> bool {
        tokio::select! {
            _ = stop => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Handle of a running [ConsumerLoop]
pub struct ConsumerHandle {
    stop: Option<Sender<()>>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// If the loop still runs
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for it to close the connection
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        if let Err(e) = (&mut self.task).await {
            warn!("Consumer loop failed: {e}");
        }
    }
}
