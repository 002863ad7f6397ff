//! Message-passing front end to the single queue writer.
//!
//! Capture never touches the database directly: it sends a command to the
//! task that owns the [`SignatureQueue`] and awaits the commit result.

use super::models::PendingSignatureRecord;
use super::store::SignatureQueue;
use crate::{FieldSignError, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

/// Commands accepted by the queue owner.
#[derive(Debug)]
pub enum QueueCommand {
    Append {
        record: Box<PendingSignatureRecord>,
        reply: oneshot::Sender<Result<()>>,
    },
    Acknowledge {
        local_id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

impl QueueCommand {
    /// Execute against `queue` and answer the sender.
    ///
    /// Returns `false` for [`QueueCommand::Shutdown`].
    pub fn apply(self, queue: &mut SignatureQueue) -> bool {
        match self {
            QueueCommand::Append { record, reply } => {
                let result = queue.append(&record);
                // caller may have given up waiting
                let _ = reply.send(result);
                true
            }
            QueueCommand::Acknowledge { local_id, reply } => {
                let _ = reply.send(queue.acknowledge(&local_id));
                true
            }
            QueueCommand::Shutdown => false,
        }
    }
}

/// Cloneable handle for submitting work to the queue owner.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<QueueCommand>,
}

impl QueueHandle {
    /// Create a handle and the receiver the owning task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<QueueCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Append a record; resolves once it is durably stored.
    pub async fn append(&self, record: PendingSignatureRecord) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Append {
                record: Box::new(record),
                reply,
            })
            .await
            .map_err(|_| FieldSignError::ChannelClosed)?;
        rx.await.map_err(|_| FieldSignError::ChannelClosed)?
    }

    pub async fn acknowledge(&self, local_id: Uuid) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Acknowledge { local_id, reply })
            .await
            .map_err(|_| FieldSignError::ChannelClosed)?;
        rx.await.map_err(|_| FieldSignError::ChannelClosed)?
    }

    /// Ask the owner to stop after finishing its current step.
    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(QueueCommand::Shutdown)
            .await
            .map_err(|_| FieldSignError::ChannelClosed)
    }
}

/// Own `queue` and apply commands until shutdown or until every handle is
/// dropped. For hosts that capture without running a sync engine.
pub async fn serve(mut queue: SignatureQueue, mut rx: mpsc::Receiver<QueueCommand>) -> SignatureQueue {
    while let Some(command) = rx.recv().await {
        if !command.apply(&mut queue) {
            debug!("Queue writer shutting down");
            break;
        }
    }
    queue
}
