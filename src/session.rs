//! Worker-session records and the registry seam they live in.
//!
//! The registry is observability surface, not a correctness dependency: the
//! dispatch loop is the sole owner of a session record and the registry just
//! mirrors it for the administrative listing endpoint. Records are purged
//! wholesale at process start since any survivor is stale by definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::protocol::{WorkerConfig, WorkerMetrics};
use crate::DispatchError;

/// Ephemeral record of one connected worker. Created when the connection is
/// accepted, refreshed on metrics-bearing responses, deleted at teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSession {
    pub worker_id: String,
    pub config: WorkerConfig,
    pub requests_in_flight: usize,
    pub metrics: WorkerMetrics,
}

impl WorkerSession {
    pub fn new(worker_id: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            config,
            requests_in_flight: 0,
            metrics: WorkerMetrics::default(),
        }
    }
}

/// Key-value directory of active worker sessions, keyed by worker id.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    async fn put(&self, session: &WorkerSession) -> Result<(), DispatchError>;

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerSession>, DispatchError>;

    /// Idempotent: deleting an absent session is not an error.
    async fn delete(&self, worker_id: &str) -> Result<(), DispatchError>;

    async fn scan(&self) -> Result<Vec<WorkerSession>, DispatchError>;
}

/// Backs the administrative session-listing surface.
pub async fn list_sessions(
    registry: &dyn SessionRegistry,
) -> Result<Vec<WorkerSession>, DispatchError> {
    registry.scan().await
}

/// Startup sweep: purges every session record. Run before accepting
/// connections; individual delete failures are logged and skipped.
pub async fn clear_stale_sessions(registry: &dyn SessionRegistry) -> Result<usize, DispatchError> {
    let sessions = registry.scan().await?;
    let mut cleared = 0;
    for session in sessions {
        match registry.delete(&session.worker_id).await {
            Ok(()) => cleared += 1,
            Err(err) => {
                warn!(worker_id = %session.worker_id, error = %err, "failed to clear stale session");
            }
        }
    }
    info!(cleared, "cleared stale worker sessions");
    Ok(cleared)
}

/// In-process registry for tests and single-node embedding.
#[derive(Default)]
pub struct MemorySessionRegistry {
    sessions: RwLock<HashMap<String, WorkerSession>>,
}

impl MemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRegistry for MemorySessionRegistry {
    async fn put(&self, session: &WorkerSession) -> Result<(), DispatchError> {
        self.sessions
            .write()
            .await
            .insert(session.worker_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> Result<Option<WorkerSession>, DispatchError> {
        Ok(self.sessions.read().await.get(worker_id).cloned())
    }

    async fn delete(&self, worker_id: &str) -> Result<(), DispatchError> {
        self.sessions.write().await.remove(worker_id);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<WorkerSession>, DispatchError> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }
}
