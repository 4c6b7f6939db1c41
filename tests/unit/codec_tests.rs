use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use exthost_bridge::protocol::{DecodedFrame, Frame, FrameCodec, FrameKind, HEADER_LEN};

fn encode(frame: Frame) -> BytesMut {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf).expect("encodes");
    buf
}

fn raw_header(kind: u8, id: u32, ack: u32, len: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(kind);
    buf.put_u32(id);
    buf.put_u32(ack);
    buf.put_u32(len);
    buf
}

#[test]
fn header_layout_is_big_endian() {
    let mut frame = Frame::regular(7, Bytes::from_static(b"hi"));
    frame.ack = 3;
    let buf = encode(frame);

    assert_eq!(buf.len(), HEADER_LEN + 2);
    assert_eq!(
        &buf[..HEADER_LEN],
        &[1, 0, 0, 0, 7, 0, 0, 0, 3, 0, 0, 0, 2]
    );
    assert_eq!(&buf[HEADER_LEN..], b"hi");
}

#[test]
fn partial_input_waits_for_more_bytes() {
    let full = encode(Frame::regular(1, Bytes::from_static(b"payload")));
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();

    for (i, byte) in full.iter().enumerate() {
        buf.put_u8(*byte);
        let decoded = codec.decode(&mut buf).expect("decode");
        if i + 1 < full.len() {
            assert!(decoded.is_none(), "frame emitted early at byte {i}");
        } else {
            assert_eq!(
                decoded,
                Some(DecodedFrame::Frame(Frame::regular(
                    1,
                    Bytes::from_static(b"payload")
                )))
            );
        }
    }
}

#[test]
fn several_frames_in_one_read_decode_in_order() {
    let mut buf = encode(Frame::regular(1, Bytes::from_static(b"a")));
    buf.extend_from_slice(&encode(Frame::signal(FrameKind::KeepAlive)));
    buf.extend_from_slice(&encode(Frame::regular(2, Bytes::from_static(b"b"))));

    let mut codec = FrameCodec::new();
    let mut kinds = Vec::new();
    while let Some(DecodedFrame::Frame(frame)) = codec.decode(&mut buf).expect("decode") {
        kinds.push((frame.kind, frame.id));
    }
    assert_eq!(
        kinds,
        vec![
            (FrameKind::Regular, 1),
            (FrameKind::KeepAlive, 0),
            (FrameKind::Regular, 2)
        ]
    );
}

#[test]
fn oversized_frame_is_skipped_and_stream_stays_in_sync() {
    let mut codec = FrameCodec::with_max_frame_bytes(4);
    let mut buf = raw_header(1, 1, 0, 10);
    buf.extend_from_slice(&[0xAA; 6]);

    let rejected = codec.decode(&mut buf).expect("decode");
    assert!(matches!(rejected, Some(DecodedFrame::Rejected { ref reason }) if reason.contains("too large")));

    // Remaining 4 bytes of the oversized payload arrive with the next frame.
    buf.extend_from_slice(&[0xAA; 4]);
    let mut next = BytesMut::new();
    FrameCodec::new()
        .encode(Frame::regular(2, Bytes::from_static(b"ok")), &mut next)
        .expect("encode");
    buf.extend_from_slice(&next);

    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some(DecodedFrame::Frame(Frame::regular(2, Bytes::from_static(b"ok"))))
    );
}

#[test]
fn unknown_kind_is_consumed_and_rejected() {
    let mut buf = raw_header(42, 0, 0, 3);
    buf.extend_from_slice(b"xyz");
    buf.extend_from_slice(&encode(Frame::signal(FrameKind::Ack)));

    let mut codec = FrameCodec::new();
    assert!(matches!(
        codec.decode(&mut buf).expect("decode"),
        Some(DecodedFrame::Rejected { reason }) if reason.contains("unknown frame kind 42")
    ));
    assert!(matches!(
        codec.decode(&mut buf).expect("decode"),
        Some(DecodedFrame::Frame(Frame { kind: FrameKind::Ack, .. }))
    ));
}

#[test]
fn encoder_refuses_oversized_payload() {
    let mut codec = FrameCodec::with_max_frame_bytes(2);
    let mut buf = BytesMut::new();
    let err = codec
        .encode(Frame::regular(1, Bytes::from_static(b"abc")), &mut buf)
        .expect_err("oversized payload refused");
    assert!(err.to_string().starts_with("protocol: frame too large"));
    assert!(buf.is_empty());
}

#[test]
fn kind_bytes_match_wire_values() {
    for (kind, byte) in [
        (FrameKind::Regular, 1),
        (FrameKind::Control, 2),
        (FrameKind::Ack, 3),
        (FrameKind::Disconnect, 5),
        (FrameKind::KeepAlive, 9),
    ] {
        assert_eq!(kind.as_u8(), byte);
        assert_eq!(FrameKind::from_u8(byte), Some(kind));
    }
    assert_eq!(FrameKind::from_u8(4), None);
}
