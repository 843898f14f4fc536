//! Channel integration tests
//!
//! Drives the multiplexer against a scripted worker over in-process pipes.

mod common;

use common::{VERSION, connect, connect_with};
use futures::future::join_all;
use packwire::PackwireError;
use packwire::channel::{ChannelConfig, HandlerTable};
use packwire::protocol::{Map, Value};

/// Integration test: responses delivered in reverse order still reach the right caller
#[tokio::test]
async fn test_concurrent_requests_correlate_by_id() {
    let (channel, mut worker) = connect().await;

    let pending: Vec<_> = (0..8)
        .map(|n| channel.send_request(Map::new().with("command", "n").with("n", n)).unwrap())
        .collect();

    let mut seen = Vec::new();
    for _ in 0..8 {
        let packet = worker.recv().await;
        seen.push((packet.id, packet.value.get("n").and_then(Value::as_i32).unwrap()));
    }
    for (id, n) in seen.into_iter().rev() {
        worker.respond(id, Map::new().with("echo", n)).await;
    }

    let results = join_all(pending).await;
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().get("echo").and_then(Value::as_i32), Some(n as i32));
    }
}

/// Integration test: closing with three requests pending fails each exactly once
#[tokio::test]
async fn test_stream_close_fails_all_pending() {
    let (channel, mut worker) = connect().await;

    let a = channel.send_request(Map::new().with("command", "a")).unwrap();
    let b = channel.send_request(Map::new().with("command", "b")).unwrap();
    let c = channel.send_request(Map::new().with("command", "c")).unwrap();
    for _ in 0..3 {
        worker.recv().await;
    }
    assert_eq!(channel.pending_count(), 3);

    let mut from_host = worker.close().await;

    for result in [a.await, b.await, c.await] {
        match result {
            Err(PackwireError::ServiceStopped(msg)) => assert!(msg.starts_with("The service was stopped")),
            other => panic!("expected ServiceStopped, got {:?}", other),
        }
    }
    assert!(channel.is_closed());
    assert_eq!(channel.pending_count(), 0);

    // later sends fail synchronously and write nothing
    let err = channel.send_request(Map::new().with("command", "d")).unwrap_err();
    assert!(err.to_string().starts_with("The service is no longer running"));
    let nothing = tokio::time::timeout(common::QUIET, futures::StreamExt::next(&mut from_host)).await;
    assert!(nothing.is_err(), "no frame may be written after close");
}

/// Integration test: hook requests for a retired build key are dropped silently
#[tokio::test]
async fn test_request_for_disposed_key_gets_no_response() {
    let (channel, mut worker) = connect().await;

    let key = channel.handles().allocate_key();
    let handle = channel.handles().register(key, HandlerTable::new());
    drop(handle);
    assert!(!channel.handles().contains(key));

    let dropped = worker
        .request(
            Map::new()
                .with("command", "on-resolve")
                .with("key", key)
                .with("ids", Value::Array(vec![Value::from(0)]))
                .with("path", "./a"),
        )
        .await;
    let ping = worker.request(Map::new().with("command", "ping")).await;

    let reply = worker.recv().await;
    assert_eq!(reply.id, ping);
    assert_ne!(reply.id, dropped);
    assert!(worker.try_recv().await.is_none());
    assert!(!channel.is_closed());
}

/// Integration test: a malformed frame is fatal to everything pending
#[tokio::test]
async fn test_malformed_frame_is_fatal() {
    use tokio::io::AsyncWriteExt;

    let (host_read, mut to_host) = tokio::io::duplex(1024);
    let (_from_host, host_write) = tokio::io::duplex(1024);
    let channel = packwire::Channel::connect(
        host_read,
        host_write,
        packwire::ChannelConfig::new(common::VERSION),
    );
    let pending = channel.send_request(Map::new().with("command", "x")).unwrap();

    let mut frame = (common::VERSION.len() as u32).to_le_bytes().to_vec();
    frame.extend_from_slice(common::VERSION.as_bytes());
    // a request frame whose value has an unknown tag
    frame.extend_from_slice(&5u32.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.push(0xee);
    to_host.write_all(&frame).await.unwrap();

    let err = pending.await.unwrap_err();
    assert!(matches!(err, PackwireError::ServiceStopped(_)));
    assert!(err.to_string().contains("Invalid packet"));
}

/// Integration test: an oversized request is refused without disturbing other requests
#[tokio::test]
async fn test_oversized_request_leaves_channel_up() {
    let config = ChannelConfig::new(VERSION).with_max_outbound_frame_bytes(1024);
    let (channel, mut worker) = connect_with(config).await;

    let small = channel.send_request(Map::new().with("command", "small")).unwrap();
    let err = channel
        .send_request(Map::new().with("command", "large").with("contents", "x".repeat(4096)))
        .unwrap_err();
    assert!(matches!(err, PackwireError::FrameTooLarge { max: 1024, .. }));
    assert!(!err.is_fatal());
    assert!(!channel.is_closed());
    assert_eq!(channel.pending_count(), 1);

    let (id, _) = worker.expect_request("small").await;
    assert!(worker.try_recv().await.is_none());
    worker.respond(id, Map::new().with("ok", true)).await;
    assert_eq!(small.await.unwrap().get("ok"), Some(&Value::Bool(true)));

    let next = channel.send_request(Map::new().with("command", "after")).unwrap();
    assert_eq!(next.id(), id + 1);
    worker.expect_request("after").await;
}
