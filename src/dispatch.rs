//! The per-worker dispatch loop: connection lifecycle, event racing, the
//! in-flight ledger, and the termination path.
//!
//! One loop instance owns one worker connection end to end. It keeps at most
//! one pending queue dequeue (only while under the worker's concurrency cap)
//! and at most one pending protocol receive, and waits for whichever
//! completes first, with the ping interval as the wait timeout. Both pending
//! operations run as spawned tasks so the loop itself only ever suspends at
//! that single wait point.

use std::convert::Infallible;
use std::future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::connection::{FramedConnection, WorkerSink, WorkerStream};
use crate::ledger::InFlightLedger;
use crate::protocol::{
    DispatchRequest, GenerationParameters, WorkRequest, WorkerConfig, WorkerResponse,
};
use crate::queue::{OutputSink, QueueConnector, WorkQueue};
use crate::recovery::recover_outstanding;
use crate::router::{route_response, RouteContext};
use crate::session::{SessionRegistry, WorkerSession};
use crate::store::MessageStore;
use crate::DispatchError;

/// Shared dependencies for all worker connections served by this process.
/// One long-lived shared queue handle covers non-blocking operations; each
/// connection additionally opens its own dedicated handle for blocking
/// dequeues and releases it at teardown.
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    queues: Arc<dyn QueueConnector>,
    output: Arc<dyn OutputSink>,
    registry: Arc<dyn SessionRegistry>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queues: Arc<dyn QueueConnector>,
        output: Arc<dyn OutputSink>,
        registry: Arc<dyn SessionRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            queues,
            output,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Serves one worker over a raw byte transport: performs the config
    /// handshake, then runs the dispatch loop until the connection dies.
    ///
    /// `worker_id` must already be authenticated by the caller. The returned
    /// error is the loop's termination cause; teardown (recovery included)
    /// has already completed when this returns.
    pub async fn serve_worker<S>(&self, worker_id: &str, transport: S) -> Result<(), DispatchError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (worker_config, connection) =
            FramedConnection::accept(transport, self.config.handshake_timeout()).await?;
        let (sink, stream) = connection.split();
        self.serve_connection(worker_id, worker_config, Box::new(sink), Box::new(stream))
            .await
    }

    /// Like [`Dispatcher::serve_worker`] but over pre-split connection
    /// halves, for transports with their own framing.
    pub async fn serve_connection(
        &self,
        worker_id: &str,
        worker_config: WorkerConfig,
        mut sink: Box<dyn WorkerSink>,
        stream: Box<dyn WorkerStream>,
    ) -> Result<(), DispatchError> {
        info!(
            worker_id,
            compat_hash = %worker_config.compat_hash,
            max_parallel_requests = worker_config.max_parallel_requests,
            "worker connected"
        );

        let dedicated_queue = match self.queues.connect(&worker_config.compat_hash).await {
            Ok(queue) => queue,
            Err(err) => {
                if let Err(close_err) = sink.close().await {
                    warn!(worker_id, error = %close_err, "error closing connection");
                }
                return Err(err);
            }
        };
        let shared_queue = self.queues.shared(&worker_config.compat_hash);
        let session = WorkerSession::new(worker_id, worker_config.clone());

        let mut worker_loop = WorkerLoop {
            worker_id: worker_id.to_owned(),
            worker_config,
            config: self.config.clone(),
            store: self.store.clone(),
            shared_queue,
            output: self.output.clone(),
            registry: self.registry.clone(),
            dedicated_queue,
            sink,
            receiver: Arc::new(Mutex::new(stream)),
            ledger: InFlightLedger::new(),
            session,
            next_request_id: 1,
            pending_dequeue: None,
            pending_receive: None,
        };

        let err = match worker_loop.run().await {
            Ok(never) => match never {},
            Err(err) => err,
        };
        let reason = err.termination_reason();
        error!(
            worker_id,
            error = %err,
            reason = %reason,
            outstanding = worker_loop.ledger.len(),
            "worker loop terminated"
        );

        // Teardown runs all five steps regardless of individual failures.
        recover_outstanding(
            worker_loop.ledger.drain(),
            reason,
            &err,
            self.store.as_ref(),
            worker_loop.shared_queue.as_ref(),
        )
        .await;
        if let Err(close_err) = worker_loop.dedicated_queue.close().await {
            warn!(worker_id, error = %close_err, "error closing dedicated queue handle");
        }
        if let Err(delete_err) = self.registry.delete(worker_id).await {
            warn!(worker_id, error = %delete_err, "error deleting worker session");
        }
        worker_loop.cancel_pending();
        if let Err(close_err) = worker_loop.sink.close().await {
            warn!(worker_id, error = %close_err, "error closing connection");
        }
        info!(worker_id, "worker disconnected");
        Err(err)
    }
}

enum Wakeup {
    Dequeued(Result<Result<Option<(String, String)>, DispatchError>, JoinError>),
    Received(Result<Result<WorkerResponse, DispatchError>, JoinError>),
    PingDue,
}

fn flatten<T>(joined: Result<Result<T, DispatchError>, JoinError>) -> Result<T, DispatchError> {
    match joined {
        Ok(inner) => inner,
        Err(join_err) => Err(DispatchError::InternalError(format!(
            "pending operation panicked: {join_err}"
        ))),
    }
}

struct WorkerLoop {
    worker_id: String,
    worker_config: WorkerConfig,
    config: DispatchConfig,
    store: Arc<dyn MessageStore>,
    shared_queue: Arc<dyn WorkQueue>,
    output: Arc<dyn OutputSink>,
    registry: Arc<dyn SessionRegistry>,
    dedicated_queue: Arc<dyn WorkQueue>,
    sink: Box<dyn WorkerSink>,
    receiver: Arc<Mutex<Box<dyn WorkerStream>>>,
    ledger: InFlightLedger,
    session: WorkerSession,
    next_request_id: u64,
    pending_dequeue: Option<JoinHandle<Result<Option<(String, String)>, DispatchError>>>,
    pending_receive: Option<JoinHandle<Result<WorkerResponse, DispatchError>>>,
}

impl WorkerLoop {
    async fn run(&mut self) -> Result<Infallible, DispatchError> {
        self.store
            .record_connect(&self.worker_id, &self.worker_config)
            .await?;
        self.registry.put(&self.session).await?;
        self.arm_dequeue();
        self.arm_receive();
        info!(worker_id = %self.worker_id, "worker loop started");

        loop {
            if self.sink.is_closed() {
                return Err(DispatchError::Disconnected);
            }
            match self.wait_next().await {
                Wakeup::Dequeued(joined) => {
                    match flatten(joined)? {
                        Some((queue_name, message_id)) => {
                            if message_id.is_empty() {
                                return Err(DispatchError::InternalError(
                                    "queue yielded an empty item".into(),
                                ));
                            }
                            debug!(
                                worker_id = %self.worker_id,
                                queue = %queue_name,
                                message_id = %message_id,
                                "dequeued work item"
                            );
                            // A failure here skips the re-arm: teardown must
                            // not race a fresh blocking dequeue against the
                            // message it just put back on the queue.
                            self.dispatch_message(&message_id).await?;
                        }
                        // The dequeue timed out empty; re-arm and keep going.
                        None => {}
                    }
                    self.arm_dequeue();
                }
                Wakeup::Received(joined) => {
                    let response = flatten(joined)?;
                    self.route(response).await?;
                    // A dequeue is re-armed after a receive only when no
                    // operation is left pending, which can transiently leave
                    // capacity unused.
                    if self.pending_dequeue.is_none() {
                        self.arm_dequeue();
                    }
                    self.arm_receive();
                }
                Wakeup::PingDue => {
                    debug!(worker_id = %self.worker_id, "pinging worker");
                    self.sink.send(&DispatchRequest::Ping).await?;
                }
            }
        }
    }

    /// Claims the message, transmits the work request, then records it in
    /// the ledger. A transmission failure rolls the claim back, re-enqueues
    /// the message, and re-raises.
    async fn dispatch_message(&mut self, message_id: &str) -> Result<(), DispatchError> {
        let message = self
            .store
            .start_work(message_id, &self.worker_id, &self.worker_config)
            .await?;
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let request = WorkRequest {
            request_id,
            thread: message.thread,
            parameters: GenerationParameters::default(),
        };
        info!(
            worker_id = %self.worker_id,
            message_id,
            request_id,
            thread_len = request.thread.messages.len(),
            "dispatching work request"
        );
        if let Err(send_err) = self.sink.send(&DispatchRequest::Work(request)).await {
            error!(
                worker_id = %self.worker_id,
                message_id,
                error = %send_err,
                "failed to transmit work request, rolling back"
            );
            self.store.reset_work(message_id).await?;
            self.shared_queue.enqueue(message_id).await?;
            return Err(send_err);
        }
        self.ledger.insert(request_id, message_id)?;
        Ok(())
    }

    async fn route(&mut self, response: WorkerResponse) -> Result<(), DispatchError> {
        let mut ctx = RouteContext {
            ledger: &mut self.ledger,
            session: &mut self.session,
            store: self.store.as_ref(),
            output: self.output.as_ref(),
            registry: self.registry.as_ref(),
            output_expire: self.config.output_expire(),
        };
        route_response(&mut ctx, response).await
    }

    /// Arms the blocking dequeue, gated on ledger capacity: a connection
    /// with a full ledger does not poll the queue at all.
    fn arm_dequeue(&mut self) {
        if self.pending_dequeue.is_some() {
            return;
        }
        if !self
            .ledger
            .has_capacity(self.worker_config.max_parallel_requests)
        {
            return;
        }
        let queue = self.dedicated_queue.clone();
        let timeout = self.config.dequeue_timeout();
        self.pending_dequeue = Some(tokio::spawn(async move { queue.dequeue(timeout).await }));
    }

    fn arm_receive(&mut self) {
        if self.pending_receive.is_some() {
            return;
        }
        let receiver = self.receiver.clone();
        self.pending_receive = Some(tokio::spawn(async move {
            let mut stream = receiver.lock().await;
            stream.receive().await
        }));
    }

    /// Waits for the first pending operation to complete, or for the ping
    /// interval to elapse with nothing done.
    async fn wait_next(&mut self) -> Wakeup {
        let ping_interval = self.config.ping_interval();
        let pending_dequeue = &mut self.pending_dequeue;
        let pending_receive = &mut self.pending_receive;
        let dequeue = async {
            match pending_dequeue.as_mut() {
                Some(handle) => handle.await,
                None => future::pending().await,
            }
        };
        let receive = async {
            match pending_receive.as_mut() {
                Some(handle) => handle.await,
                None => future::pending().await,
            }
        };
        let wakeup = tokio::select! {
            joined = dequeue => Wakeup::Dequeued(joined),
            joined = receive => Wakeup::Received(joined),
            _ = tokio::time::sleep(ping_interval) => Wakeup::PingDue,
        };
        match wakeup {
            Wakeup::Dequeued(_) => self.pending_dequeue = None,
            Wakeup::Received(_) => self.pending_receive = None,
            Wakeup::PingDue => {}
        }
        wakeup
    }

    /// Best-effort cancellation of whatever is still pending.
    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending_dequeue.take() {
            handle.abort();
        }
        if let Some(handle) = self.pending_receive.take() {
            handle.abort();
        }
    }
}
