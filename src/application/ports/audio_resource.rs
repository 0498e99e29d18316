//! Audio Resource Port - 可播放资源构建抽象

use super::CodecError;
use crate::domain::AudioResource;

/// Audio Resource Port
///
/// 把调用方提供的音频缓冲包装为播放器可播放的资源
pub trait AudioResourcePort: Send + Sync {
    /// 构建资源
    ///
    /// # Arguments
    /// * `buffer` - Ogg/Opus、WAV 或原始 PCM 数据
    fn load(&self, buffer: &[u8]) -> Result<AudioResource, CodecError>;
}
