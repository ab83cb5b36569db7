//! Termination-time reconciliation of outstanding work.
//!
//! Runs exactly once per connection, over whatever the ledger still holds.
//! The partition is decided solely by `num_responses`: work that never
//! produced a partial response is rolled back and re-enqueued for another
//! worker; work that already streamed output downstream cannot be silently
//! redone and is aborted instead.

use tracing::{error, warn};

use crate::ledger::InFlightEntry;
use crate::queue::WorkQueue;
use crate::store::MessageStore;
use crate::{DispatchError, TerminationReason};

/// Reconciles every remaining ledger entry with the store and queue. Each
/// entry is handled independently: a failure is logged and the pass moves on
/// to the next entry.
pub async fn recover_outstanding(
    entries: Vec<(u64, InFlightEntry)>,
    reason: TerminationReason,
    detail: &DispatchError,
    store: &dyn MessageStore,
    queue: &dyn WorkQueue,
) {
    for (request_id, entry) in entries {
        if let Err(err) = recover_entry(request_id, &entry, reason, detail, store, queue).await {
            error!(
                request_id,
                message_id = %entry.message_id,
                error = %err,
                "failed to recover outstanding work"
            );
        }
    }
}

async fn recover_entry(
    request_id: u64,
    entry: &InFlightEntry,
    reason: TerminationReason,
    detail: &DispatchError,
    store: &dyn MessageStore,
    queue: &dyn WorkQueue,
) -> Result<(), DispatchError> {
    if entry.num_responses == 0 {
        warn!(
            request_id,
            message_id = %entry.message_id,
            "no output observed, resetting message to pending"
        );
        store.reset_work(&entry.message_id).await?;
        queue.enqueue(&entry.message_id).await?;
    } else {
        warn!(
            request_id,
            message_id = %entry.message_id,
            num_responses = entry.num_responses,
            "partial output already delivered, aborting message"
        );
        store
            .abort_work(&entry.message_id, &format!("{reason}: {detail}"))
            .await?;
    }
    Ok(())
}
