//! Wire model for the worker connection protocol and the per-message output
//! channel.
//!
//! Frames are bincode-encoded over a length-delimited transport, see
//! [`crate::connection`]. The response set is a closed enum: a frame that
//! does not decode into one of these kinds is a protocol error and
//! terminates the connection's loop.

use crate::store::Message;
use serde::{Deserialize, Serialize};

/// Capability descriptor a worker sends once, immediately after connecting.
/// Immutable for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Fingerprint of the worker's model/runtime compatibility class. Only
    /// queues with a matching fingerprint are drained by this worker.
    pub compat_hash: String,
    pub model_name: String,
    /// Concurrency cap for this connection; the loop never keeps more
    /// in-flight requests than this.
    pub max_parallel_requests: usize,
}

/// Point-in-time utilization numbers reported by a worker alongside most
/// responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub gpu_utilization: Option<f32>,
    pub memory_utilization: Option<f32>,
    pub requests_served: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    Prompter,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
}

/// The assembled conversation context a worker generates against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageThread {
    pub messages: Vec<ThreadMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            temperature: 1.0,
            top_p: 0.95,
        }
    }
}

/// One unit of generation work sent to a worker. `request_id` is assigned by
/// the dispatch loop and is distinct from the underlying message id; each
/// request is tracked independently in the loop's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub request_id: u64,
    pub thread: MessageThread,
    pub parameters: GenerationParameters,
}

/// Frames the control plane sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchRequest {
    Work(WorkRequest),
    /// Liveness probe, sent when the loop's wait times out with no event.
    Ping,
}

/// Frames a worker sends to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// Reply to a ping.
    Pong { metrics: WorkerMetrics },
    /// One incremental piece of generated content for an in-flight request.
    Token {
        request_id: u64,
        text: String,
        sequence: u32,
    },
    /// Terminal success: the full generated text for a request.
    GeneratedText {
        request_id: u64,
        text: String,
        metrics: WorkerMetrics,
    },
    /// Terminal failure scoped to a single request.
    Error {
        request_id: u64,
        error: String,
        metrics: WorkerMetrics,
    },
    /// Connection-scoped failure report, not tied to any request.
    GeneralError {
        error: String,
        metrics: WorkerMetrics,
    },
}

/// Payloads published on a message's output channel for the client-facing
/// stream to consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputEvent {
    Token {
        request_id: u64,
        text: String,
        sequence: u32,
    },
    /// Terminal notification carrying the completed message record.
    Finished { message: Message },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_request_survives_the_wire() {
        let request = WorkRequest {
            request_id: 42,
            thread: MessageThread {
                messages: vec![ThreadMessage {
                    id: "m1".into(),
                    role: MessageRole::Prompter,
                    content: "hello".into(),
                }],
            },
            parameters: GenerationParameters::default(),
        };
        let bytes = bincode::serialize(&DispatchRequest::Work(request.clone())).unwrap();
        let decoded: DispatchRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, DispatchRequest::Work(request));
    }

    #[test]
    fn garbage_is_not_a_worker_response() {
        let garbage = vec![0xffu8; 16];
        assert!(bincode::deserialize::<WorkerResponse>(&garbage).is_err());
    }
}
