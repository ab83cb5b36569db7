//! Transactional message-store seam.
//!
//! The store owns persisted message state; the dispatch core only drives the
//! four work-state transitions below, each as a single attempt. Retries are
//! never layered on top here — the only retry path in the system is the
//! recovery-time re-enqueue for work that produced no output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::protocol::{MessageThread, WorkerConfig};
use crate::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    /// Enqueued, waiting for a worker.
    Pending,
    /// Claimed by a worker via `start_work`.
    InProgress,
    Complete,
    Aborted,
}

/// Persisted view of one message needing (or having received) a generated
/// response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub state: MessageState,
    /// Final generated text, present once complete.
    pub content: Option<String>,
    /// Abort reason, present once aborted.
    pub error: Option<String>,
    /// The conversation context assembled for generation.
    pub thread: MessageThread,
    /// The worker currently or last responsible for this message.
    pub worker_id: Option<String>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Transactionally claims a pending message for a worker and returns it
    /// with its assembled thread. Fails if the message is not dispatchable.
    async fn start_work(
        &self,
        message_id: &str,
        worker_id: &str,
        worker_config: &WorkerConfig,
    ) -> Result<Message, DispatchError>;

    /// Marks an in-progress message complete with its final text.
    async fn complete_work(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<Message, DispatchError>;

    /// Marks an in-progress message aborted with a reason.
    async fn abort_work(&self, message_id: &str, reason: &str) -> Result<(), DispatchError>;

    /// Rolls an in-progress message back to pending so another worker can
    /// claim it.
    async fn reset_work(&self, message_id: &str) -> Result<(), DispatchError>;

    /// Records that a worker connected with the given configuration.
    async fn record_connect(
        &self,
        worker_id: &str,
        worker_config: &WorkerConfig,
    ) -> Result<(), DispatchError>;
}
