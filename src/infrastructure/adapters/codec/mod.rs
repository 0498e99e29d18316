//! Frame Codec Adapters

mod opus_codec;

pub use opus_codec::{OpusFrameCodec, FRAME_MS};
