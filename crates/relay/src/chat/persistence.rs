// Off-path message persistence: one FIFO queue, one writer task.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::metrics;
use crate::store::{ChatStore, NewMessage};

/// Cloneable handle for queueing message writes.
#[derive(Debug, Clone)]
pub struct MessageWriter {
    sender: mpsc::UnboundedSender<NewMessage>,
}

/// Owned by whoever runs the server; stops the writer task.
#[derive(Debug)]
pub struct WriterHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl MessageWriter {
    pub fn spawn(store: ChatStore) -> (Self, WriterHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_signal) = oneshot::channel();
        let task = tokio::spawn(run_writer(store, receiver, shutdown_signal));
        (Self { sender }, WriterHandle { shutdown, task })
    }

    /// Queue a write. Returns `false` once the writer has stopped accepting.
    pub fn submit(&self, message: NewMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

impl WriterHandle {
    /// Stop accepting writes, finish everything already queued, and wait up
    /// to `timeout` for that. Returns whether the queue drained in time.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let _ = self.shutdown.send(());
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => true,
            Ok(Err(join_error)) => {
                error!(?join_error, "message writer task failed");
                false
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "message writer did not drain in time");
                false
            }
        }
    }
}

async fn run_writer(
    store: ChatStore,
    mut receiver: mpsc::UnboundedReceiver<NewMessage>,
    mut shutdown_signal: oneshot::Receiver<()>,
) {
    let mut watching_shutdown = true;

    loop {
        tokio::select! {
            maybe_message = receiver.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };
                write_message(&store, message).await;
            }
            signal = &mut shutdown_signal, if watching_shutdown => {
                watching_shutdown = false;
                // A dropped handle is not a shutdown request.
                if signal.is_ok() {
                    receiver.close();
                }
            }
        }
    }

    debug!(backend = store.backend(), "message writer stopped");
}

async fn write_message(store: &ChatStore, message: NewMessage) {
    match store.create_message(&message).await {
        Ok(message_id) => {
            metrics::record_persistence(true);
            debug!(message_id, conversation_id = message.conversation_id, "chat message stored");
        }
        Err(write_error) => {
            metrics::record_persistence(false);
            error!(
                conversation_id = message.conversation_id,
                sent_to_id = message.sent_to_id,
                error = %format!("{write_error:#}"),
                "failed to store chat message"
            );
        }
    }
}
