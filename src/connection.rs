//! Transport seam between a dispatch loop and its worker.
//!
//! The loop only ever talks through the [`WorkerSink`]/[`WorkerStream`] trait
//! pair, so tests can substitute scripted connections. [`FramedConnection`]
//! is the production implementation: length-delimited bincode frames over
//! any `AsyncRead + AsyncWrite` transport (a TCP socket, a QUIC stream, an
//! in-process duplex pipe).

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{self, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use crate::protocol::{DispatchRequest, WorkerConfig, WorkerResponse};
use crate::DispatchError;

/// Outbound half of a worker connection, owned by the dispatch loop.
#[async_trait]
pub trait WorkerSink: Send {
    async fn send(&mut self, request: &DispatchRequest) -> Result<(), DispatchError>;

    /// Whether the connection has been observed closed. Checked at the top
    /// of every loop iteration so a dead connection is not waited on.
    fn is_closed(&self) -> bool;

    async fn close(&mut self) -> Result<(), DispatchError>;
}

/// Inbound half of a worker connection. At most one receive is outstanding
/// at a time.
#[async_trait]
pub trait WorkerStream: Send {
    async fn receive(&mut self) -> Result<WorkerResponse, DispatchError>;
}

/// Length-delimited bincode framing over a bidirectional byte transport.
pub struct FramedConnection<S> {
    reader: FramedRead<ReadHalf<S>, LengthDelimitedCodec>,
    writer: FramedWrite<WriteHalf<S>, LengthDelimitedCodec>,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Accepts a freshly established transport: frames it and performs the
    /// handshake, in which the first inbound frame must be the worker's
    /// [`WorkerConfig`].
    pub async fn accept(
        transport: S,
        handshake_timeout: Duration,
    ) -> Result<(WorkerConfig, Self), DispatchError> {
        let (read_half, write_half) = io::split(transport);
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let writer = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let frame = match tokio::time::timeout(handshake_timeout, reader.next()).await {
            Err(_) => {
                return Err(DispatchError::ConnectionError(
                    "timed out waiting for worker config".into(),
                ))
            }
            Ok(None) => return Err(DispatchError::Disconnected),
            Ok(Some(Err(err))) => return Err(DispatchError::ConnectionError(err.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };

        let config: WorkerConfig = bincode::deserialize(&frame).map_err(|err| {
            DispatchError::ProtocolError(format!("invalid worker config frame: {err}"))
        })?;
        debug!(compat_hash = %config.compat_hash, model = %config.model_name, "worker config received");

        Ok((config, Self { reader, writer }))
    }

    pub fn split(self) -> (FramedSink<S>, FramedStream<S>) {
        (
            FramedSink {
                writer: self.writer,
                closed: false,
            },
            FramedStream {
                reader: self.reader,
            },
        )
    }
}

pub struct FramedSink<S> {
    writer: FramedWrite<WriteHalf<S>, LengthDelimitedCodec>,
    closed: bool,
}

#[async_trait]
impl<S> WorkerSink for FramedSink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&mut self, request: &DispatchRequest) -> Result<(), DispatchError> {
        if self.closed {
            return Err(DispatchError::Disconnected);
        }
        let payload = bincode::serialize(request)?;
        if let Err(err) = self.writer.send(Bytes::from(payload)).await {
            self.closed = true;
            return Err(DispatchError::ConnectionError(err.to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> Result<(), DispatchError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer
            .close()
            .await
            .map_err(|err| DispatchError::ConnectionError(err.to_string()))
    }
}

pub struct FramedStream<S> {
    reader: FramedRead<ReadHalf<S>, LengthDelimitedCodec>,
}

#[async_trait]
impl<S> WorkerStream for FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn receive(&mut self) -> Result<WorkerResponse, DispatchError> {
        match self.reader.next().await {
            None => Err(DispatchError::Disconnected),
            Some(Err(err)) => Err(DispatchError::ConnectionError(err.to_string())),
            Some(Ok(frame)) => {
                let response = bincode::deserialize::<WorkerResponse>(&frame).map_err(|err| {
                    DispatchError::ProtocolError(format!("undecodable worker frame: {err}"))
                })?;
                Ok(response)
            }
        }
    }
}
