//! Queue seams: the compatibility-scoped work queue, the connector that
//! hands out queue handles, and the per-message output channel.
//!
//! Each dispatch loop uses two queue handles: the connector's shared handle
//! for non-blocking operations (re-enqueue on failure) and one dedicated
//! handle, opened at connection entry and closed at teardown, for blocking
//! dequeues — so a long blocking pop never starves the other queue
//! operations the same loop needs.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::DispatchError;

/// A named durable FIFO. `dequeue` with `Duration::ZERO` blocks until an
/// item arrives; any other timeout yields `None` when it elapses.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, item: &str) -> Result<(), DispatchError>;

    async fn dequeue(&self, timeout: Duration)
        -> Result<Option<(String, String)>, DispatchError>;

    /// Releases any underlying connection. Must be safe to call more than
    /// once.
    async fn close(&self) -> Result<(), DispatchError>;
}

/// Hands out work-queue handles scoped to a compatibility fingerprint.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// The process-wide shared handle for non-blocking operations.
    fn shared(&self, compat_hash: &str) -> Arc<dyn WorkQueue>;

    /// Opens a dedicated handle for blocking dequeues, owned by one
    /// connection and closed at its teardown.
    async fn connect(&self, compat_hash: &str) -> Result<Arc<dyn WorkQueue>, DispatchError>;
}

/// Per-message output channel: serialized partial/final payloads with an
/// expiry, consumed by the client-facing stream.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn publish(
        &self,
        message_id: &str,
        payload: Bytes,
        expire: Duration,
    ) -> Result<(), DispatchError>;
}

struct MemoryQueueState {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl MemoryQueueState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }
}

type QueueTable = Arc<RwLock<HashMap<String, Arc<MemoryQueueState>>>>;

async fn state_for(table: &QueueTable, name: &str) -> Arc<MemoryQueueState> {
    if let Some(state) = table.read().await.get(name) {
        return state.clone();
    }
    let mut queues = table.write().await;
    queues
        .entry(name.to_owned())
        .or_insert_with(MemoryQueueState::new)
        .clone()
}

/// One handle onto an in-process FIFO. Handles from [`MemoryQueueHub`] with
/// the same name share state, mirroring multiple connections to one backing
/// queue.
pub struct MemoryQueue {
    name: String,
    table: QueueTable,
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, item: &str) -> Result<(), DispatchError> {
        let state = state_for(&self.table, &self.name).await;
        state.items.lock().await.push_back(item.to_owned());
        state.notify.notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        timeout: Duration,
    ) -> Result<Option<(String, String)>, DispatchError> {
        let state = state_for(&self.table, &self.name).await;
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        loop {
            let notified = state.notify.notified();
            if let Some(item) = state.items.lock().await.pop_front() {
                return Ok(Some((self.name.clone(), item)));
            }
            match deadline {
                None => notified.await,
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        let item = state.items.lock().await.pop_front();
                        return Ok(item.map(|item| (self.name.clone(), item)));
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// In-process queue hub: a FIFO per compatibility fingerprint plus the
/// per-message output buffers. Reference implementation of the queue seams
/// for tests and single-node embedding.
#[derive(Default)]
pub struct MemoryQueueHub {
    queues: QueueTable,
    outputs: RwLock<HashMap<String, Vec<(Bytes, Instant)>>>,
}

impl MemoryQueueHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue_len(&self, compat_hash: &str) -> usize {
        let state = state_for(&self.queues, compat_hash).await;
        let len = state.items.lock().await.len();
        len
    }

    /// Number of unexpired payloads currently buffered for a message.
    pub async fn output_len(&self, message_id: &str) -> usize {
        let outputs = self.outputs.read().await;
        let now = Instant::now();
        outputs
            .get(message_id)
            .map(|payloads| {
                payloads
                    .iter()
                    .filter(|(_, expires_at)| *expires_at > now)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drains the output channel of a message, dropping expired payloads.
    pub async fn take_output(&self, message_id: &str) -> Vec<Bytes> {
        let mut outputs = self.outputs.write().await;
        let now = Instant::now();
        outputs
            .remove(message_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(payload, _)| payload)
            .collect()
    }
}

#[async_trait]
impl QueueConnector for MemoryQueueHub {
    fn shared(&self, compat_hash: &str) -> Arc<dyn WorkQueue> {
        Arc::new(MemoryQueue {
            name: compat_hash.to_owned(),
            table: self.queues.clone(),
        })
    }

    async fn connect(&self, compat_hash: &str) -> Result<Arc<dyn WorkQueue>, DispatchError> {
        Ok(Arc::new(MemoryQueue {
            name: compat_hash.to_owned(),
            table: self.queues.clone(),
        }))
    }
}

#[async_trait]
impl OutputSink for MemoryQueueHub {
    async fn publish(
        &self,
        message_id: &str,
        payload: Bytes,
        expire: Duration,
    ) -> Result<(), DispatchError> {
        let mut outputs = self.outputs.write().await;
        outputs
            .entry(message_id.to_owned())
            .or_default()
            .push((payload, Instant::now() + expire));
        Ok(())
    }
}
