//! In-flight request ledger: the per-connection map from request id to work
//! metadata. Owned exclusively by one dispatch loop, so no locking.

use std::collections::HashMap;
use std::time::Instant;

use crate::DispatchError;

/// Metadata for one dispatched, not-yet-terminal work request.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub message_id: String,
    pub start_time: Instant,
    /// Count of partial (token) responses observed for this request. Drives
    /// the recovery policy: zero means nothing leaked downstream and the
    /// work is safe to retry.
    pub num_responses: u32,
}

/// An entry is inserted only after its work request was successfully
/// transmitted, and removed only when a terminal response has been fully
/// processed or the connection terminates (recovery then drains the rest).
#[derive(Debug, Default)]
pub struct InFlightLedger {
    entries: HashMap<u64, InFlightEntry>,
}

impl InFlightLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity gate: true while this connection may poll the queue.
    pub fn has_capacity(&self, max_parallel_requests: usize) -> bool {
        self.entries.len() < max_parallel_requests
    }

    /// Inserts a new entry. A message id may appear in at most one entry at
    /// a time; violating that (or reusing a request id) is an internal
    /// invariant breach, not a worker protocol error.
    pub fn insert(&mut self, request_id: u64, message_id: &str) -> Result<(), DispatchError> {
        if self.entries.contains_key(&request_id) {
            return Err(DispatchError::InternalError(format!(
                "duplicate request id in ledger: {request_id}"
            )));
        }
        if self
            .entries
            .values()
            .any(|entry| entry.message_id == message_id)
        {
            return Err(DispatchError::InternalError(format!(
                "message already in flight: {message_id}"
            )));
        }
        self.entries.insert(
            request_id,
            InFlightEntry {
                message_id: message_id.to_owned(),
                start_time: Instant::now(),
                num_responses: 0,
            },
        );
        Ok(())
    }

    /// Looks up an entry by request id. An unknown id is a protocol error
    /// from the worker (a response for an expired or never-issued request);
    /// the caller decides what to do with it.
    pub fn get_mut(&mut self, request_id: u64) -> Result<&mut InFlightEntry, DispatchError> {
        self.entries
            .get_mut(&request_id)
            .ok_or(DispatchError::RequestNotFound(request_id))
    }

    pub fn remove(&mut self, request_id: u64) -> Result<InFlightEntry, DispatchError> {
        self.entries
            .remove(&request_id)
            .ok_or(DispatchError::RequestNotFound(request_id))
    }

    /// Consumes every remaining entry, for the recovery pass.
    pub fn drain(&mut self) -> Vec<(u64, InFlightEntry)> {
        self.entries.drain().collect()
    }
}
