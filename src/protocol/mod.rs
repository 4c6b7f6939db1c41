//! Framing protocol over a byte-stream transport.
//!
//! Submodules:
//! - `codec`: 13-byte-header frame codec for [`tokio_util::codec`].
//! - `sequencer`: duplicate rejection and reordering of sequenced frames.
//! - `channel`: the [`FramedChannel`] with its reader, writer and keep-alive
//!   tasks.

pub mod channel;
pub mod codec;
pub mod sequencer;

pub use channel::{
    ChannelEvent, ChannelOptions, FramedChannel, FramedSender, HealthSnapshot, LoadEstimator,
};
pub use codec::{DecodedFrame, Frame, FrameCodec, FrameKind, DEFAULT_MAX_FRAME_BYTES, HEADER_LEN};
