//! In-process fake worker speaking the wire protocol over duplex pipes.

#![allow(dead_code)]

use std::time::Duration;

use futures::StreamExt;
use packwire::channel::{Channel, ChannelConfig};
use packwire::protocol::{FrameCodec, Map, Packet, Value, decode_payload, encode_packet};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::FramedRead;

pub const VERSION: &str = "0.0.0-test";

/// How long to wait before concluding that nothing was sent.
pub const QUIET: Duration = Duration::from_millis(100);

pub struct FakeWorker {
    to_host: DuplexStream,
    from_host: FramedRead<DuplexStream, FrameCodec>,
    next_id: u32,
}

/// A channel connected to a fake worker that has completed the handshake.
pub async fn connect() -> (Channel, FakeWorker) {
    connect_with(ChannelConfig::new(VERSION)).await
}

pub async fn connect_with(config: ChannelConfig) -> (Channel, FakeWorker) {
    let (host_read, mut to_host) = tokio::io::duplex(256 * 1024);
    let (from_host, host_write) = tokio::io::duplex(256 * 1024);
    let channel = Channel::connect(host_read, host_write, config);

    let mut frame = (VERSION.len() as u32).to_le_bytes().to_vec();
    frame.extend_from_slice(VERSION.as_bytes());
    to_host.write_all(&frame).await.unwrap();

    let worker = FakeWorker {
        to_host,
        from_host: FramedRead::new(from_host, FrameCodec::new()),
        next_id: 0,
    };
    (channel, worker)
}

impl FakeWorker {
    /// Next packet written by the host, of either kind.
    pub async fn recv(&mut self) -> Packet {
        let payload = self.from_host.next().await.expect("host closed").expect("bad frame");
        decode_payload(&payload).expect("bad packet")
    }

    /// Next packet, or `None` if the host stays quiet.
    pub async fn try_recv(&mut self) -> Option<Packet> {
        tokio::time::timeout(QUIET, self.recv()).await.ok()
    }

    /// Next host request, asserting its command.
    pub async fn expect_request(&mut self, command: &str) -> (u32, Value) {
        let packet = self.recv().await;
        assert!(packet.is_request, "expected a request, got response {:?}", packet);
        let got = packet.value.get("command").and_then(Value::as_str).unwrap_or_default();
        assert_eq!(got, command, "unexpected command in {:?}", packet.value);
        (packet.id, packet.value)
    }

    /// Next host response, asserting its id.
    pub async fn expect_response(&mut self, id: u32) -> Value {
        let packet = self.recv().await;
        assert!(!packet.is_request, "expected a response, got request {:?}", packet);
        assert_eq!(packet.id, id);
        packet.value
    }

    pub async fn respond(&mut self, id: u32, value: impl Into<Value>) {
        let frame = encode_packet(&Packet::response(id, value));
        self.to_host.write_all(&frame).await.unwrap();
    }

    /// Send a worker-initiated request; returns its id.
    pub async fn request(&mut self, value: impl Into<Value>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        let frame = encode_packet(&Packet::request(id, value));
        self.to_host.write_all(&frame).await.unwrap();
        id
    }

    /// Close the worker's output stream.
    pub async fn close(mut self) -> FramedRead<DuplexStream, FrameCodec> {
        self.to_host.shutdown().await.unwrap();
        drop(self.to_host);
        self.from_host
    }
}

/// `{errors: [], warnings: []}`
pub fn empty_result() -> Map {
    Map::new()
        .with("errors", Value::Array(vec![]))
        .with("warnings", Value::Array(vec![]))
}

/// A worker-side diagnostic.
pub fn wire_message(text: &str) -> Value {
    Map::new()
        .with("id", "")
        .with("pluginName", "")
        .with("text", text)
        .with("location", Value::Null)
        .with("notes", Value::Array(vec![]))
        .with("detail", -1)
        .into()
}
