//! Dispatch core for an inference-serving control plane.
//!
//! Clients enqueue messages that need a model response; remote generation
//! workers hold persistent bidirectional connections to this process and
//! drain a compatibility-scoped work queue. Each connection is owned by one
//! [`dispatch::Dispatcher`] loop that races queue polling against inbound
//! protocol frames and a keepalive timer, tracks in-flight requests in a
//! per-connection ledger, and reconciles all outstanding work when the
//! connection terminates.
//!
//! External collaborators (the durable queue, the transactional message
//! store, the worker-session registry) are trait seams so embedders can plug
//! in their own backends; in-process implementations are provided for tests
//! and single-node use.

use std::fmt;
use thiserror::Error;

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod ledger;
pub mod protocol;
pub mod queue;
pub mod recovery;
pub mod session;
pub mod store;

pub(crate) mod router;

pub use config::DispatchConfig;
pub use connection::{FramedConnection, WorkerSink, WorkerStream};
pub use dispatch::Dispatcher;
pub use ledger::{InFlightEntry, InFlightLedger};
pub use protocol::{
    DispatchRequest, GenerationParameters, MessageRole, MessageThread, OutputEvent, ThreadMessage,
    WorkRequest, WorkerConfig, WorkerMetrics, WorkerResponse,
};
pub use queue::{MemoryQueueHub, OutputSink, QueueConnector, WorkQueue};
pub use session::{MemorySessionRegistry, SessionRegistry, WorkerSession};
pub use store::{Message, MessageState, MessageStore};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("worker disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("work request not found: request_id={0}")]
    RequestNotFound(u64),

    #[error("queue error: {0}")]
    QueueError(String),

    #[error("store error: {0}")]
    StoreError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Why a dispatch loop stopped. The recovery pass consumes every reason
/// uniformly; the tag exists for logging and abort-reason text only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Disconnected,
    ProtocolError,
    StoreError,
    TransmissionError,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::Disconnected => "worker disconnected",
            TerminationReason::ProtocolError => "protocol error",
            TerminationReason::StoreError => "store error",
            TerminationReason::TransmissionError => "transmission error",
        };
        f.write_str(s)
    }
}

impl DispatchError {
    pub fn termination_reason(&self) -> TerminationReason {
        match self {
            DispatchError::Disconnected => TerminationReason::Disconnected,
            DispatchError::ProtocolError(_)
            | DispatchError::RequestNotFound(_)
            | DispatchError::SerializationError(_) => TerminationReason::ProtocolError,
            DispatchError::StoreError(_)
            | DispatchError::QueueError(_)
            | DispatchError::InternalError(_) => TerminationReason::StoreError,
            DispatchError::ConnectionError(_) | DispatchError::IoError(_) => {
                TerminationReason::TransmissionError
            }
        }
    }
}
