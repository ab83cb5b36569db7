//! Shared test fixtures: an in-memory message store with failure injection,
//! a scripted worker speaking the framed protocol over an in-process duplex
//! pipe, and a harness wiring a `Dispatcher` to the in-memory seams.

#![allow(dead_code, unused_imports)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use worknet::{
    DispatchConfig, DispatchError, DispatchRequest, Dispatcher, MemoryQueueHub,
    MemorySessionRegistry, Message, MessageRole, MessageState, MessageStore, MessageThread,
    OutputEvent, QueueConnector, ThreadMessage, WorkQueue, WorkRequest, WorkerConfig,
    WorkerResponse,
};

pub fn worker_config(compat_hash: &str, max_parallel_requests: usize) -> WorkerConfig {
    WorkerConfig {
        compat_hash: compat_hash.to_owned(),
        model_name: "test-model".to_owned(),
        max_parallel_requests,
    }
}

pub fn decode_events(payloads: Vec<Bytes>) -> Vec<OutputEvent> {
    payloads
        .iter()
        .map(|bytes| bincode::deserialize(bytes).expect("undecodable output event"))
        .collect()
}

/// Polls a condition until it holds or a second elapses.
pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within one second");
}

/// In-memory message store enforcing the work-state transitions, with a call
/// log and injectable failures.
#[derive(Default)]
pub struct TestStore {
    messages: Mutex<HashMap<String, Message>>,
    calls: Mutex<Vec<String>>,
    pub fail_reset_for: Mutex<HashSet<String>>,
    pub fail_complete_for: Mutex<HashSet<String>>,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seeds a pending message whose thread holds a single prompter turn.
    pub fn seed(&self, message_id: &str, prompt: &str) {
        let message = Message {
            id: message_id.to_owned(),
            state: MessageState::Pending,
            content: None,
            error: None,
            thread: MessageThread {
                messages: vec![ThreadMessage {
                    id: format!("{message_id}-prompt"),
                    role: MessageRole::Prompter,
                    content: prompt.to_owned(),
                }],
            },
            worker_id: None,
        };
        self.messages
            .lock()
            .unwrap()
            .insert(message_id.to_owned(), message);
    }

    pub fn message(&self, message_id: &str) -> Message {
        self.messages
            .lock()
            .unwrap()
            .get(message_id)
            .cloned()
            .unwrap_or_else(|| panic!("message not seeded: {message_id}"))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MessageStore for TestStore {
    async fn start_work(
        &self,
        message_id: &str,
        worker_id: &str,
        _worker_config: &WorkerConfig,
    ) -> Result<Message, DispatchError> {
        self.log(format!("start:{message_id}"));
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| DispatchError::StoreError(format!("unknown message: {message_id}")))?;
        if message.state != MessageState::Pending {
            return Err(DispatchError::StoreError(format!(
                "message not pending: {message_id}"
            )));
        }
        message.state = MessageState::InProgress;
        message.worker_id = Some(worker_id.to_owned());
        Ok(message.clone())
    }

    async fn complete_work(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<Message, DispatchError> {
        self.log(format!("complete:{message_id}"));
        if self.fail_complete_for.lock().unwrap().contains(message_id) {
            return Err(DispatchError::StoreError(format!(
                "injected complete failure: {message_id}"
            )));
        }
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| DispatchError::StoreError(format!("unknown message: {message_id}")))?;
        if message.state != MessageState::InProgress {
            return Err(DispatchError::StoreError(format!(
                "message not in progress: {message_id}"
            )));
        }
        message.state = MessageState::Complete;
        message.content = Some(content.to_owned());
        Ok(message.clone())
    }

    async fn abort_work(&self, message_id: &str, reason: &str) -> Result<(), DispatchError> {
        self.log(format!("abort:{message_id}:{reason}"));
        let mut messages = self.messages.lock().unwrap();
        if let Some(message) = messages.get_mut(message_id) {
            message.state = MessageState::Aborted;
            message.error = Some(reason.to_owned());
        }
        Ok(())
    }

    async fn reset_work(&self, message_id: &str) -> Result<(), DispatchError> {
        if self.fail_reset_for.lock().unwrap().contains(message_id) {
            return Err(DispatchError::StoreError(format!(
                "injected reset failure: {message_id}"
            )));
        }
        self.log(format!("reset:{message_id}"));
        let mut messages = self.messages.lock().unwrap();
        if let Some(message) = messages.get_mut(message_id) {
            message.state = MessageState::Pending;
            message.worker_id = None;
        }
        Ok(())
    }

    async fn record_connect(
        &self,
        worker_id: &str,
        _worker_config: &WorkerConfig,
    ) -> Result<(), DispatchError> {
        self.log(format!("connect:{worker_id}"));
        Ok(())
    }
}

/// Dispatcher wired to the in-memory seams.
pub struct TestHarness {
    pub store: Arc<TestStore>,
    pub hub: Arc<MemoryQueueHub>,
    pub registry: Arc<MemorySessionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

impl TestHarness {
    pub fn new(config: DispatchConfig) -> Self {
        let store = TestStore::new();
        let hub = Arc::new(MemoryQueueHub::new());
        let registry = Arc::new(MemorySessionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            hub.clone(),
            hub.clone(),
            registry.clone(),
            config,
        ));
        Self {
            store,
            hub,
            registry,
            dispatcher,
        }
    }

    /// Default config for tests: long ping interval so pings never interfere
    /// unless a test asks for them.
    pub fn quiet() -> Self {
        Self::new(
            DispatchConfig::new()
                .with_ping_interval(Duration::from_secs(30))
                .with_handshake_timeout(Duration::from_secs(1)),
        )
    }

    pub async fn enqueue(&self, compat_hash: &str, message_id: &str) {
        self.hub
            .shared(compat_hash)
            .enqueue(message_id)
            .await
            .unwrap();
    }

    /// Spawns a serving loop for one worker and returns the worker-side
    /// transport plus the loop's join handle.
    pub fn spawn_loop(
        &self,
        worker_id: &str,
    ) -> (
        DuplexStream,
        tokio::task::JoinHandle<Result<(), DispatchError>>,
    ) {
        let (server, client) = io::duplex(64 * 1024);
        let dispatcher = self.dispatcher.clone();
        let worker_id = worker_id.to_owned();
        let handle =
            tokio::spawn(async move { dispatcher.serve_worker(&worker_id, server).await });
        (client, handle)
    }
}

/// Worker side of a framed connection, driven by test scripts.
pub struct TestWorker {
    tx: FramedWrite<WriteHalf<DuplexStream>, LengthDelimitedCodec>,
    rx: FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>,
}

impl TestWorker {
    /// Frames the transport and performs the config handshake.
    pub async fn connect(transport: DuplexStream, config: &WorkerConfig) -> Self {
        let (read_half, write_half) = io::split(transport);
        let mut worker = Self {
            tx: FramedWrite::new(write_half, LengthDelimitedCodec::new()),
            rx: FramedRead::new(read_half, LengthDelimitedCodec::new()),
        };
        worker
            .tx
            .send(Bytes::from(bincode::serialize(config).unwrap()))
            .await
            .unwrap();
        worker
    }

    pub async fn send(&mut self, response: &WorkerResponse) {
        self.tx
            .send(Bytes::from(bincode::serialize(response).unwrap()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, payload: &'static [u8]) {
        self.tx.send(Bytes::from_static(payload)).await.unwrap();
    }

    pub async fn recv(&mut self) -> Option<DispatchRequest> {
        let frame = self.rx.next().await?.ok()?;
        Some(bincode::deserialize(&frame).expect("undecodable dispatch request"))
    }

    /// Receives the next work request, skipping pings.
    pub async fn recv_work(&mut self) -> WorkRequest {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), self.recv()).await {
                Ok(Some(DispatchRequest::Work(request))) => return request,
                Ok(Some(DispatchRequest::Ping)) => continue,
                Ok(None) => panic!("connection closed while waiting for work request"),
                Err(_) => panic!("no work request within one second"),
            }
        }
    }

    /// Asserts no work request arrives within the window; pings are allowed.
    pub async fn expect_no_work(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            match tokio::time::timeout(remaining, self.recv()).await {
                Ok(Some(DispatchRequest::Work(request))) => {
                    panic!("unexpected work request: {request:?}")
                }
                Ok(Some(DispatchRequest::Ping)) => continue,
                Ok(None) => panic!("connection closed unexpectedly"),
                Err(_) => return,
            }
        }
    }
}
