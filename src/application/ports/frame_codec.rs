//! Frame Codec Port - 传输帧编解码抽象
//!
//! 压缩帧与线性 PCM（s16le 交错）之间的有状态转换。
//! 解码器必须跨帧保持流状态：每帧独立调用 decode，不能把多帧拼接后一次解码。

use thiserror::Error;

use crate::domain::PcmFormat;

/// 编解码错误
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Codec unavailable: {0}")]
    Unavailable(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// 单流解码器
pub trait FrameDecoder: Send {
    /// 解码一帧，返回 s16le 交错 PCM 字节
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// 单流编码器
pub trait FrameEncoder: Send {
    /// 每帧需要的 PCM 字节数
    fn frame_bytes(&self) -> usize;

    /// 编码一帧 PCM（长度必须等于 `frame_bytes()`）
    fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Frame Codec Port
///
/// 每次调用创建全新的流上下文
pub trait FrameCodecPort: Send + Sync {
    /// PCM 侧格式
    fn format(&self) -> PcmFormat;

    fn new_decoder(&self) -> Result<Box<dyn FrameDecoder>, CodecError>;

    fn new_encoder(&self) -> Result<Box<dyn FrameEncoder>, CodecError>;
}
