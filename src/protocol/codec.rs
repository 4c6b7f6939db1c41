//! Length-prefixed frame codec.
//!
//! Wire layout, all integers big-endian:
//!
//! | Offset | Size | Field                                      |
//! |--------|------|--------------------------------------------|
//! | 0      | 1    | frame kind                                 |
//! | 1      | 4    | sequence id (regular frames, else 0)       |
//! | 5      | 4    | highest in-order id received by the sender |
//! | 9      | 4    | payload length                             |
//! | 13     | len  | payload                                    |
//!
//! Frames whose payload exceeds the configured maximum, or whose kind byte is
//! unknown, are consumed from the stream and surfaced as
//! [`DecodedFrame::Rejected`] so the reader stays in sync and can keep going.
//! Only I/O failures are returned as decoder errors.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{AppError, Result};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 13;

/// Default maximum payload size: 4 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1_048_576;

/// Frame kinds understood by the framing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Application payload with a sequence id.
    Regular,
    /// Out-of-band control payload, not sequenced.
    Control,
    /// Standalone acknowledgement.
    Ack,
    /// Graceful close notice.
    Disconnect,
    /// Idle traffic keeping the link and the peer's liveness check alive.
    KeepAlive,
}

impl FrameKind {
    /// Wire byte for this kind.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Regular => 1,
            Self::Control => 2,
            Self::Ack => 3,
            Self::Disconnect => 5,
            Self::KeepAlive => 9,
        }
    }

    /// Parse a wire byte.
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Regular),
            2 => Some(Self::Control),
            3 => Some(Self::Ack),
            5 => Some(Self::Disconnect),
            9 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Sequence id; only meaningful for [`FrameKind::Regular`].
    pub id: u32,
    /// Highest in-order regular id the sender has received.
    pub ack: u32,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Frame {
    /// A sequenced application frame.
    #[must_use]
    pub fn regular(id: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Regular,
            id,
            ack: 0,
            payload,
        }
    }

    /// An unsequenced frame without payload.
    #[must_use]
    pub fn signal(kind: FrameKind) -> Self {
        Self {
            kind,
            id: 0,
            ack: 0,
            payload: Bytes::new(),
        }
    }
}

/// Result of decoding one frame from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// A well-formed frame.
    Frame(Frame),
    /// A frame that was consumed but could not be accepted.
    Rejected {
        /// Why the frame was rejected.
        reason: String,
    },
}

/// Codec for [`Frame`]s with a payload size limit.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Bytes of an oversized payload still to be discarded.
    skip: usize,
}

impl FrameCodec {
    /// Create a codec with the default [`DEFAULT_MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create a codec with an explicit payload limit.
    #[must_use]
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            skip: 0,
        }
    }

    /// Configured payload limit.
    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = DecodedFrame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if self.skip > 0 {
            let n = self.skip.min(src.len());
            src.advance(n);
            self.skip -= n;
            if self.skip > 0 {
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let kind_raw = src[0];
        let id = read_u32(&src[1..5]);
        let ack = read_u32(&src[5..9]);
        let len = read_u32(&src[9..13]) as usize;

        if len > self.max_frame_bytes {
            src.advance(HEADER_LEN);
            let n = len.min(src.len());
            src.advance(n);
            self.skip = len - n;
            return Ok(Some(DecodedFrame::Rejected {
                reason: format!(
                    "frame too large: {len} bytes exceeds {} byte limit",
                    self.max_frame_bytes
                ),
            }));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        let Some(kind) = FrameKind::from_u8(kind_raw) else {
            return Ok(Some(DecodedFrame::Rejected {
                reason: format!("unknown frame kind {kind_raw}"),
            }));
        };

        Ok(Some(DecodedFrame::Frame(Frame {
            kind,
            id,
            ack,
            payload,
        })))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.payload.len();
        if len > self.max_frame_bytes {
            return Err(AppError::Protocol(format!(
                "frame too large: {len} bytes exceeds {} byte limit",
                self.max_frame_bytes
            )));
        }
        let wire_len = u32::try_from(len)
            .map_err(|_| AppError::Protocol(format!("frame length {len} does not fit in u32")))?;

        dst.reserve(HEADER_LEN + len);
        dst.put_u8(frame.kind.as_u8());
        dst.put_u32(frame.id);
        dst.put_u32(frame.ack);
        dst.put_u32(wire_len);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

fn read_u32(raw: &[u8]) -> u32 {
    let mut buf = [0_u8; 4];
    buf.copy_from_slice(raw);
    u32::from_be_bytes(buf)
}
