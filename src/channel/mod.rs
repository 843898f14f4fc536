//! Channel - request/response multiplexer over one worker connection
//!
//! This module provides:
//! - Request id allocation and response correlation by id
//! - Routing of worker-initiated requests to per-build handlers
//! - Fail-once semantics when the connection goes away
//! - The worker subprocess that backs a channel

pub mod handles;
mod transport;
pub mod worker;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

pub use handles::{HandleRef, HandleRegistry, HandlerTable, InboundHandler, Lookup};
pub use worker::WorkerProcess;

use crate::error::{PackwireError, Result};
use crate::protocol::codec::{DEFAULT_MAX_FRAME_LENGTH, ID_MASK, MAX_OUTBOUND_FRAME_LENGTH};
use crate::protocol::messages::{error_response, response_error};
use crate::protocol::{Commands, Map, Packet, Value, encode_packet};

/// Configuration for a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Version string the worker must announce in its first frame.
    pub expected_version: String,
    /// Largest accepted inbound frame.
    pub max_frame_bytes: usize,
    /// Largest outbound packet payload. Oversized requests are refused
    /// before anything is written.
    pub max_outbound_frame_bytes: usize,
    /// Optional client-side timeout for [`Channel::request`].
    pub request_timeout: Option<Duration>,
}

impl ChannelConfig {
    pub fn new(expected_version: impl Into<String>) -> Self {
        Self {
            expected_version: expected_version.into(),
            max_frame_bytes: DEFAULT_MAX_FRAME_LENGTH,
            max_outbound_frame_bytes: MAX_OUTBOUND_FRAME_LENGTH,
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Capped at what the u32 length prefix can describe.
    pub fn with_max_outbound_frame_bytes(mut self, max: usize) -> Self {
        self.max_outbound_frame_bytes = max.min(MAX_OUTBOUND_FRAME_LENGTH);
        self
    }
}

type ResponseSender = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct ChannelState {
    pending: HashMap<u32, ResponseSender>,
    next_request_id: u32,
    closed: bool,
    /// `": <cause>"` or empty
    close_reason: String,
}

pub(crate) struct ChannelInner {
    state: Mutex<ChannelState>,
    handles: Arc<HandleRegistry>,
    writer: mpsc::UnboundedSender<Bytes>,
    max_outbound: usize,
}

impl ChannelInner {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark closed and fail every pending caller once.
    /// Encode a packet, refusing payloads past the outbound limit.
    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        let frame = encode_packet(packet);
        let size = frame.len() - 4;
        if size > self.max_outbound {
            return Err(PackwireError::FrameTooLarge {
                size,
                max: self.max_outbound,
            });
        }
        Ok(frame)
    }

    pub(crate) fn close(&self, reason: Option<String>) {
        let pending = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.close_reason = reason.map(|r| format!(": {}", r)).unwrap_or_default();
            std::mem::take(&mut state.pending)
        };
        let text = format!("The service was stopped{}", self.lock().close_reason);
        tracing::info!(pending = pending.len(), reason = %text, "channel closed");
        for (_, sender) in pending {
            let _ = sender.send(Err(PackwireError::ServiceStopped(text.clone())));
        }
    }

    pub(crate) fn dispatch(self: Arc<Self>, packet: Packet) {
        if packet.is_request {
            self.handle_inbound_request(packet.id, packet.value);
            return;
        }

        let sender = self.lock().pending.remove(&packet.id);
        match sender {
            Some(sender) => {
                let result = match response_error(&packet.value) {
                    Some(error) => Err(PackwireError::Worker(error.to_string())),
                    None => Ok(packet.value),
                };
                let _ = sender.send(result);
            }
            None => tracing::warn!(id = packet.id, "response for unknown request id"),
        }
    }

    fn handle_inbound_request(self: Arc<Self>, id: u32, value: Value) {
        let command = value.get("command").and_then(Value::as_str).unwrap_or_default().to_string();

        if command == Commands::PING {
            self.send_response(id, Map::new().into());
            return;
        }

        let Some(key) = value.get("key").and_then(Value::as_u32) else {
            tracing::debug!(id, command = %command, "inbound request without a build key dropped");
            return;
        };

        let handler = match self.handles.lookup(key, &command) {
            Lookup::Found(handler) => handler,
            Lookup::NoHandle => {
                // the worker may still address a build that was just disposed
                tracing::debug!(id, key, command = %command, "inbound request for retired build dropped");
                return;
            }
            Lookup::NoCommand => {
                self.send_response(id, error_response(format!("Invalid command: {}", command)));
                return;
            }
        };

        tracing::debug!(id, key, command = %command, "dispatching inbound request");
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler(value)).catch_unwind().await;
            let response = match outcome {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => error_response(e.to_string()),
                Err(_) => error_response(format!("Handler for \"{}\" panicked", command)),
            };
            self.send_response(id, response);
        });
    }

    fn send_response(&self, id: u32, value: Value) {
        if self.lock().closed {
            return;
        }
        let frame = match self.encode(&Packet::response(id, value)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id, error = %e, "response too large, replying with an error");
                match self.encode(&Packet::response(id, error_response(e.to_string()))) {
                    Ok(frame) => frame,
                    Err(_) => return,
                }
            }
        };
        if self.writer.send(frame).is_err() {
            self.close(Some("writer stopped".to_string()));
        }
    }
}

/// Handle to one worker connection. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
    config: Arc<ChannelConfig>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .field("handles", &self.inner.handles)
            .finish()
    }
}

impl Channel {
    /// Start a channel over the worker's stdout (`reader`) and stdin
    /// (`writer`). Must be called inside a tokio runtime.
    pub fn connect<R, W>(reader: R, writer: W, config: ChannelConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            state: Mutex::new(ChannelState::default()),
            handles: Arc::new(HandleRegistry::new()),
            writer: writer_tx,
            max_outbound: config.max_outbound_frame_bytes,
        });

        tokio::spawn(transport::writer_loop(writer, writer_rx, Arc::downgrade(&inner)));
        tokio::spawn(transport::reader_loop(
            reader,
            Arc::downgrade(&inner),
            config.expected_version.clone(),
            config.max_frame_bytes,
        ));

        Self {
            inner,
            config: Arc::new(config),
        }
    }

    /// Queue a request and return a future for its response.
    ///
    /// Fails immediately, without writing anything, once the channel is
    /// closed or when the encoded request exceeds the outbound limit. An
    /// oversized request leaves the channel and other requests untouched.
    pub fn send_request(&self, value: impl Into<Value>) -> Result<PendingResponse> {
        let value = value.into();
        let (tx, rx) = oneshot::channel();
        let (id, sent) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(PackwireError::ServiceStopped(format!(
                    "The service is no longer running{}",
                    state.close_reason
                )));
            }
            let id = state.next_request_id;
            let frame = self.inner.encode(&Packet::request(id, value))?;
            state.next_request_id = (id + 1) & ID_MASK;
            state.pending.insert(id, tx);
            (id, self.inner.writer.send(frame).is_ok())
        };

        if !sent {
            self.inner.close(Some("writer stopped".to_string()));
        }
        tracing::trace!(id, "request queued");
        Ok(PendingResponse { id, rx })
    }

    /// Send a request and wait for its response, honoring the configured
    /// timeout.
    pub async fn request(&self, value: impl Into<Value>) -> Result<Value> {
        match self.config.request_timeout {
            None => self.send_request(value)?.await,
            Some(timeout) => self.request_with_timeout(value, timeout).await,
        }
    }

    /// Send a request, giving up after `timeout`. A late response for an
    /// abandoned request is logged and dropped.
    pub async fn request_with_timeout(&self, value: impl Into<Value>, timeout: Duration) -> Result<Value> {
        let pending = self.send_request(value)?;
        let id = pending.id();
        match tokio::time::timeout(timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.lock().pending.remove(&id);
                tracing::warn!(id, ms = timeout.as_millis() as u64, "request timed out");
                Err(PackwireError::Timeout {
                    id,
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Tear the channel down, failing everything pending.
    pub fn close(&self, reason: Option<String>) {
        self.inner.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Build handles addressable by this channel's worker.
    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.inner.handles
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

/// Future for one outstanding request.
#[derive(Debug)]
pub struct PendingResponse {
    id: u32,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingResponse {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PackwireError::ServiceStopped(
                "The service was stopped".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_payload, FrameCodec};
    use futures::StreamExt;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::FramedRead;

    const VERSION: &str = "0.0.0-test";

    struct Worker {
        to_host: DuplexStream,
        from_host: FramedRead<DuplexStream, FrameCodec>,
    }

    impl Worker {
        async fn send(&mut self, packet: Packet) {
            self.to_host.write_all(&encode_packet(&packet)).await.unwrap();
        }

        async fn recv(&mut self) -> Packet {
            let payload = self.from_host.next().await.unwrap().unwrap();
            decode_payload(&payload).unwrap()
        }
    }

    async fn connect() -> (Channel, Worker) {
        let (host_read, mut to_host) = tokio::io::duplex(64 * 1024);
        let (from_host, host_write) = tokio::io::duplex(64 * 1024);
        let channel = Channel::connect(host_read, host_write, ChannelConfig::new(VERSION));
        let mut frame = (VERSION.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(VERSION.as_bytes());
        to_host.write_all(&frame).await.unwrap();
        let worker = Worker {
            to_host,
            from_host: FramedRead::new(from_host, FrameCodec::new()),
        };
        (channel, worker)
    }

    #[tokio::test]
    async fn test_ids_increase_from_zero() {
        let (channel, mut worker) = connect().await;
        let a = channel.send_request(Map::new().with("command", "x")).unwrap();
        let b = channel.send_request(Map::new().with("command", "y")).unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert_eq!(worker.recv().await.id, 0);
        assert_eq!(worker.recv().await.id, 1);
    }

    #[tokio::test]
    async fn test_ids_wrap_within_int32() {
        let (channel, mut worker) = connect().await;
        channel.inner.lock().next_request_id = ID_MASK;
        let last = channel.send_request(Map::new()).unwrap();
        let first = channel.send_request(Map::new()).unwrap();
        assert_eq!((last.id(), first.id()), (ID_MASK, 0));
        let packet = worker.recv().await;
        assert_eq!(packet.id, ID_MASK);
        assert!(packet.is_request);
        assert_eq!(worker.recv().await.id, 0);
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_error_reply() {
        let (host_read, mut to_host) = tokio::io::duplex(64 * 1024);
        let (from_host, host_write) = tokio::io::duplex(64 * 1024);
        let config = ChannelConfig::new(VERSION).with_max_outbound_frame_bytes(256);
        let channel = Channel::connect(host_read, host_write, config);
        let mut frame = (VERSION.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(VERSION.as_bytes());
        to_host.write_all(&frame).await.unwrap();
        let mut worker = Worker {
            to_host,
            from_host: FramedRead::new(from_host, FrameCodec::new()),
        };

        let mut table = HandlerTable::new();
        let large: InboundHandler =
            Arc::new(|_| async { Ok(Map::new().with("contents", "x".repeat(1024)).into()) }.boxed());
        table.insert("on-load".to_string(), large);
        let _handle = channel.handles().register(0, table);

        worker
            .send(Packet::request(4, Map::new().with("command", "on-load").with("key", 0)))
            .await;
        let reply = worker.recv().await;
        assert_eq!(reply.id, 4);
        let errors = reply.value.get("errors").and_then(Value::as_array).unwrap();
        let text = errors[0].get("text").and_then(Value::as_str).unwrap();
        assert!(text.contains("exceeds the 256 byte frame limit"));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate_by_id() {
        let (channel, mut worker) = connect().await;
        let first = channel.send_request(Map::new().with("n", 1)).unwrap();
        let second = channel.send_request(Map::new().with("n", 2)).unwrap();
        worker.recv().await;
        worker.recv().await;

        worker.send(Packet::response(1, Map::new().with("echo", 2))).await;
        worker.send(Packet::response(0, Map::new().with("echo", 1))).await;

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap().get("echo"), Some(&Value::Int(1)));
        assert_eq!(b.unwrap().get("echo"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_error_field_becomes_worker_error() {
        let (channel, mut worker) = connect().await;
        let pending = channel.send_request(Map::new()).unwrap();
        worker.recv().await;
        worker.send(Packet::response(0, Map::new().with("error", "Invalid build key"))).await;
        let err = pending.await.unwrap_err();
        assert!(matches!(err, PackwireError::Worker(ref m) if m == "Invalid build key"));
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (_channel, mut worker) = connect().await;
        worker.send(Packet::request(7, Map::new().with("command", "ping"))).await;
        let reply = worker.recv().await;
        assert_eq!(reply.id, 7);
        assert!(!reply.is_request);
        assert_eq!(reply.value, Value::Map(Map::new()));
    }

    #[tokio::test]
    async fn test_unknown_command_on_live_handle_gets_error() {
        let (channel, mut worker) = connect().await;
        let _handle = channel.handles().register(0, HandlerTable::new());
        worker
            .send(Packet::request(2, Map::new().with("command", "on-load").with("key", 0)))
            .await;
        let reply = worker.recv().await;
        assert_eq!(reply.id, 2);
        let errors = reply.value.get("errors").and_then(Value::as_array).unwrap();
        assert_eq!(errors[0].get("text").and_then(Value::as_str), Some("Invalid command: on-load"));
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_not_fatal() {
        let (channel, mut worker) = connect().await;
        let mut table = HandlerTable::new();
        let failing: InboundHandler =
            Arc::new(|_| async { Err(PackwireError::Plugin("bad hook".into())) }.boxed());
        table.insert("on-start".to_string(), failing);
        let _handle = channel.handles().register(0, table);

        worker
            .send(Packet::request(1, Map::new().with("command", "on-start").with("key", 0)))
            .await;
        let reply = worker.recv().await;
        let errors = reply.value.get("errors").and_then(Value::as_array).unwrap();
        assert_eq!(errors[0].get("text").and_then(Value::as_str), Some("Plugin error: bad hook"));
        assert!(!channel.is_closed());
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_pending() {
        let (host_read, mut to_host) = tokio::io::duplex(1024);
        let (_from_host, host_write) = tokio::io::duplex(1024);
        let channel = Channel::connect(host_read, host_write, ChannelConfig::new("1.0.0"));
        let pending = channel.send_request(Map::new()).unwrap();

        let mut frame = 5u32.to_le_bytes().to_vec();
        frame.extend_from_slice(b"0.9.0");
        to_host.write_all(&frame).await.unwrap();

        let err = pending.await.unwrap_err();
        assert!(err.to_string().contains("does not match binary version \"0.9.0\""));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_request_timeout_removes_pending() {
        let (host_read, _to_host) = tokio::io::duplex(1024);
        let (_from_host, host_write) = tokio::io::duplex(1024);
        let config = ChannelConfig::new(VERSION).with_request_timeout(Duration::from_millis(20));
        let channel = Channel::connect(host_read, host_write, config);
        let err = channel.request(Map::new()).await.unwrap_err();
        assert!(matches!(err, PackwireError::Timeout { id: 0, .. }));
        assert_eq!(channel.pending_count(), 0);
    }
}
