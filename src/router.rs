//! Response routing: one handling path per inbound response kind, invoked by
//! the dispatch loop for each frame. Every store mutation here is one-shot;
//! a failure propagates to the loop and recovery deals with the remains.

use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ledger::InFlightLedger;
use crate::protocol::{OutputEvent, WorkerMetrics, WorkerResponse};
use crate::queue::OutputSink;
use crate::session::{SessionRegistry, WorkerSession};
use crate::store::MessageStore;
use crate::DispatchError;

/// Loop-owned state and collaborators a single response is routed against.
pub(crate) struct RouteContext<'a> {
    pub ledger: &'a mut InFlightLedger,
    pub session: &'a mut WorkerSession,
    pub store: &'a dyn MessageStore,
    pub output: &'a dyn OutputSink,
    pub registry: &'a dyn SessionRegistry,
    pub output_expire: Duration,
}

pub(crate) async fn route_response(
    ctx: &mut RouteContext<'_>,
    response: WorkerResponse,
) -> Result<(), DispatchError> {
    match response {
        WorkerResponse::Pong { metrics } => update_session(ctx, metrics).await,
        WorkerResponse::Token {
            request_id,
            text,
            sequence,
        } => handle_token(ctx, request_id, text, sequence).await,
        WorkerResponse::GeneratedText {
            request_id,
            text,
            metrics,
        } => {
            handle_generated_text(ctx, request_id, text).await?;
            update_session(ctx, metrics).await
        }
        WorkerResponse::Error {
            request_id,
            error,
            metrics,
        } => {
            handle_error(ctx, request_id, error).await?;
            update_session(ctx, metrics).await
        }
        WorkerResponse::GeneralError { error, metrics } => {
            warn!(worker_id = %ctx.session.worker_id, error = %error, "worker reported general error");
            update_session(ctx, metrics).await
        }
    }
}

/// Forwards a partial response onto the message's output channel and counts
/// it. The count is what decides retry safety at recovery time.
async fn handle_token(
    ctx: &mut RouteContext<'_>,
    request_id: u64,
    text: String,
    sequence: u32,
) -> Result<(), DispatchError> {
    let message_id = ctx.ledger.get_mut(request_id)?.message_id.clone();
    let payload = bincode::serialize(&OutputEvent::Token {
        request_id,
        text,
        sequence,
    })?;
    ctx.output
        .publish(&message_id, Bytes::from(payload), ctx.output_expire)
        .await?;
    ctx.ledger.get_mut(request_id)?.num_responses += 1;
    debug!(request_id, message_id = %message_id, sequence, "token forwarded");
    Ok(())
}

async fn handle_generated_text(
    ctx: &mut RouteContext<'_>,
    request_id: u64,
    text: String,
) -> Result<(), DispatchError> {
    let message_id = ctx.ledger.get_mut(request_id)?.message_id.clone();
    let message = ctx.store.complete_work(&message_id, &text).await?;
    info!(request_id, message_id = %message_id, "completed work");
    let payload = bincode::serialize(&OutputEvent::Finished { message })?;
    ctx.output
        .publish(&message_id, Bytes::from(payload), ctx.output_expire)
        .await?;
    ctx.ledger.remove(request_id)?;
    Ok(())
}

async fn handle_error(
    ctx: &mut RouteContext<'_>,
    request_id: u64,
    error: String,
) -> Result<(), DispatchError> {
    let message_id = ctx.ledger.get_mut(request_id)?.message_id.clone();
    warn!(request_id, message_id = %message_id, error = %error, "worker reported request error");
    ctx.store.abort_work(&message_id, &error).await?;
    ctx.ledger.remove(request_id)?;
    Ok(())
}

async fn update_session(
    ctx: &mut RouteContext<'_>,
    metrics: WorkerMetrics,
) -> Result<(), DispatchError> {
    ctx.session.requests_in_flight = ctx.ledger.len();
    ctx.session.metrics = metrics;
    ctx.registry.put(ctx.session).await
}
