//! Framed channel behaviour over an in-memory duplex pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use exthost_bridge::protocol::{
    ChannelEvent, ChannelOptions, FrameKind, FramedChannel, LoadEstimator, HEADER_LEN,
};
use exthost_bridge::transport::Connection;
use exthost_bridge::AppError;
use tokio::io::AsyncWriteExt;

use super::test_helpers::{channel_pair, fast_options, next_message};

fn raw_frame(kind: FrameKind, id: u32, ack: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind.as_u8());
    buf.put_u32(id);
    buf.put_u32(ack);
    buf.put_u32(u32::try_from(payload.len()).expect("len"));
    buf.put_slice(payload);
    buf.freeze()
}

#[tokio::test]
async fn messages_arrive_in_send_order() {
    let ((left, _left_events), (_right, mut right_events)) = channel_pair(ChannelOptions::default());

    for i in 0..100u32 {
        left.send(Bytes::from(format!("message-{i}"))).expect("send");
    }
    for i in 0..100u32 {
        let payload = next_message(&mut right_events).await.expect("message");
        assert_eq!(payload, Bytes::from(format!("message-{i}")));
    }
}

#[tokio::test]
async fn frames_split_across_writes_are_reassembled() {
    let (raw, peer) = tokio::io::duplex(1024);
    let (_channel, mut events) =
        FramedChannel::new(Connection::from_stream("duplex", peer), ChannelOptions::default());
    let (_read, mut write) = tokio::io::split(raw);

    let mut wire = raw_frame(FrameKind::Regular, 1, 0, b"hello").to_vec();
    wire.extend_from_slice(&raw_frame(FrameKind::Regular, 2, 0, b"world"));
    for chunk in wire.chunks(3) {
        write.write_all(chunk).await.expect("write");
        write.flush().await.expect("flush");
        tokio::task::yield_now().await;
    }

    assert_eq!(next_message(&mut events).await.as_deref(), Some(&b"hello"[..]));
    assert_eq!(next_message(&mut events).await.as_deref(), Some(&b"world"[..]));
}

#[tokio::test]
async fn boundary_lengths_survive_any_chunking() {
    const LIMIT: usize = 4096;
    let lengths = [0, 1, HEADER_LEN, LIMIT, 0, LIMIT - 1];
    let payloads: Vec<Vec<u8>> = lengths
        .iter()
        .map(|&len| (0..len).map(|i| ((i * 31 + len) % 251) as u8).collect())
        .collect();

    let mut wire = Vec::new();
    for (id, payload) in (1u32..).zip(&payloads) {
        wire.extend_from_slice(&raw_frame(FrameKind::Regular, id, 0, payload));
    }

    for chunk_size in [1, 5, HEADER_LEN, HEADER_LEN + 1, 1000, wire.len()] {
        let (raw, peer) = tokio::io::duplex(64 * 1024);
        let options = ChannelOptions {
            max_frame_bytes: LIMIT,
            ..ChannelOptions::default()
        };
        let (channel, mut events) =
            FramedChannel::new(Connection::from_stream("duplex", peer), options);
        let (_read, mut write) = tokio::io::split(raw);

        for chunk in wire.chunks(chunk_size) {
            write.write_all(chunk).await.expect("write");
        }
        write.flush().await.expect("flush");

        for expected in &payloads {
            let got = next_message(&mut events).await.expect("message");
            assert_eq!(got.len(), expected.len(), "chunk size {chunk_size}");
            assert_eq!(got.as_ref(), expected.as_slice(), "chunk size {chunk_size}");
        }
        assert_eq!(channel.health().rejected_frames, 0, "chunk size {chunk_size}");
    }
}

#[tokio::test]
async fn early_frames_are_reordered_and_duplicates_dropped() {
    let (raw, peer) = tokio::io::duplex(1024);
    let (channel, mut events) =
        FramedChannel::new(Connection::from_stream("duplex", peer), ChannelOptions::default());
    let (_read, mut write) = tokio::io::split(raw);

    for (id, payload) in [(2, &b"second"[..]), (1, b"first"), (1, b"again"), (3, b"third")] {
        write
            .write_all(&raw_frame(FrameKind::Regular, id, 0, payload))
            .await
            .expect("write");
    }

    assert_eq!(next_message(&mut events).await.as_deref(), Some(&b"first"[..]));
    assert_eq!(next_message(&mut events).await.as_deref(), Some(&b"second"[..]));
    assert_eq!(next_message(&mut events).await.as_deref(), Some(&b"third"[..]));
    assert_eq!(channel.health().rejected_frames, 1);
}

#[tokio::test]
async fn acknowledgements_clear_unacked_bytes() {
    let ((left, _left_events), (_right, mut right_events)) = channel_pair(fast_options());

    left.send(Bytes::from_static(b"abcdef")).expect("send");
    assert!(left.health().unacknowledged_frames <= 1);
    next_message(&mut right_events).await.expect("delivered");

    let cleared = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if left.health().unacknowledged_bytes == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(cleared.is_ok(), "peer ack never arrived: {:?}", left.health());
}

#[tokio::test]
async fn oversized_send_is_refused() {
    let options = ChannelOptions {
        max_frame_bytes: 8,
        ..ChannelOptions::default()
    };
    let ((left, _le), (_right, _re)) = channel_pair(options);

    let err = left.send(Bytes::from_static(b"too many bytes")).expect_err("oversized");
    assert!(matches!(err, AppError::Protocol(msg) if msg.contains("frame too large")));
    left.send(Bytes::from_static(b"fits")).expect("small frame still accepted");
}

#[tokio::test]
async fn dispose_notifies_peer_and_is_idempotent() {
    let ((left, _left_events), (_right, mut right_events)) = channel_pair(ChannelOptions::default());

    left.dispose().await;
    left.dispose().await;
    assert!(left.is_disposed());
    assert!(left.transport_status().is_disposed());
    assert!(matches!(left.send(Bytes::from_static(b"late")), Err(AppError::Disposed(_))));

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match right_events.recv().await {
                Some(ChannelEvent::Closed { reason }) => return Some(reason),
                Some(_) => {}
                None => return None,
            }
        }
    })
    .await
    .expect("close observed");
    assert_eq!(closed.as_deref(), Some("peer disconnected"));
}

#[tokio::test]
async fn dropped_stream_reports_closed() {
    let (raw, peer) = tokio::io::duplex(1024);
    let (channel, mut events) =
        FramedChannel::new(Connection::from_stream("duplex", peer), ChannelOptions::default());
    drop(raw);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event");
    assert_eq!(
        event,
        Some(ChannelEvent::Closed {
            reason: "stream closed by peer".into()
        })
    );
    let status = channel.transport_status();
    assert!(status.is_read_closed());
    assert!(!status.is_disposed());
}

#[tokio::test]
async fn silent_peer_is_flagged_then_recovers() {
    let (raw, peer) = tokio::io::duplex(1024);
    let (channel, mut events) =
        FramedChannel::new(Connection::from_stream("duplex", peer), fast_options());
    let (_read, mut write) = tokio::io::split(raw);

    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("unresponsive reported");
    assert_eq!(first, Some(ChannelEvent::Unresponsive));
    assert!(!channel.health().responsive);

    write
        .write_all(&raw_frame(FrameKind::KeepAlive, 0, 0, b""))
        .await
        .expect("write");
    let second = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("responsive reported");
    assert_eq!(second, Some(ChannelEvent::Responsive));
    assert!(channel.health().responsive);
}

#[derive(Default)]
struct Overloaded(AtomicBool);

impl LoadEstimator for Overloaded {
    fn has_high_load(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn load_estimator_is_advisory() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let estimator = Arc::new(Overloaded::default());
    let (sender, _sender_events) = FramedChannel::with_load_estimator(
        Connection::from_stream("duplex:left", left),
        ChannelOptions::default(),
        Arc::clone(&estimator) as Arc<dyn LoadEstimator>,
    );
    let (_receiver, mut events) =
        FramedChannel::new(Connection::from_stream("duplex:right", right), ChannelOptions::default());

    sender.send(Bytes::from_static(b"calm")).expect("send");
    assert!(!sender.health().high_load);

    estimator.0.store(true, Ordering::SeqCst);
    sender.send(Bytes::from_static(b"busy")).expect("high load never blocks a send");
    assert!(sender.health().high_load);

    assert_eq!(next_message(&mut events).await.as_deref(), Some(&b"calm"[..]));
    assert_eq!(next_message(&mut events).await.as_deref(), Some(&b"busy"[..]));
}
