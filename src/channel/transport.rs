//! Reader and writer loops over the worker's byte streams.
//!
//! The reader owns the inbound stream: it checks the version handshake,
//! drains complete frames as they arrive and hands packets to the channel.
//! The writer owns the outbound stream and serializes all frame writes.

use std::sync::Weak;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::ChannelInner;
use crate::error::PackwireError;
use crate::protocol::codec::MAX_OUTBOUND_FRAME_LENGTH;
use crate::protocol::{FrameCodec, decode_payload};

/// Read frames until the stream ends or fails, then close the channel.
pub(crate) async fn reader_loop<R>(reader: R, inner: Weak<ChannelInner>, expected_version: String, max_frame_bytes: usize)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::with_max_length(max_frame_bytes));

    // The first frame is the worker's bare version string.
    let reason = match frames.next().await {
        Some(Ok(version)) if version.as_ref() == expected_version.as_bytes() => {
            tracing::debug!(version = %expected_version, "worker handshake complete");
            read_packets(&mut frames, &inner).await
        }
        Some(Ok(version)) => Some(
            PackwireError::VersionMismatch {
                expected: expected_version.clone(),
                actual: String::from_utf8_lossy(&version).into_owned(),
            }
            .to_string(),
        ),
        Some(Err(e)) => Some(e.to_string()),
        None => Some("worker exited before the handshake".to_string()),
    };

    if let Some(inner) = inner.upgrade() {
        inner.close(reason);
    }
}

/// Returns the close reason; `None` for a clean end of stream.
async fn read_packets<R>(frames: &mut FramedRead<R, FrameCodec>, inner: &Weak<ChannelInner>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = frames.next().await {
        let payload = match frame {
            Ok(payload) => payload,
            Err(e) => return Some(e.to_string()),
        };
        let packet = match decode_payload(&payload) {
            Ok(packet) => packet,
            Err(e) => return Some(e.to_string()),
        };
        let Some(inner) = inner.upgrade() else {
            return None;
        };
        inner.dispatch(packet);
    }
    None
}

/// Write queued frames in order until the queue closes or a write fails.
pub(crate) async fn writer_loop<W>(writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>, inner: Weak<ChannelInner>)
where
    W: AsyncWrite + Unpin,
{
    // sizes are checked before a frame is queued
    let mut sink = FramedWrite::new(writer, FrameCodec::with_max_length(MAX_OUTBOUND_FRAME_LENGTH));
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::error!(error = %e, "writing to worker failed");
            if let Some(inner) = inner.upgrade() {
                inner.close(Some(e.to_string()));
            }
            return;
        }
    }
}
