//! 应用层错误定义
//!
//! 语音操作对调用方暴露的统一错误类型

use thiserror::Error;

use crate::application::ports::{CodecError, TransportError};
use crate::domain::room::RoomId;

/// 语音操作错误
#[derive(Debug, Error)]
pub enum VoiceError {
    /// 等待连接 Ready 超时
    #[error("Connection to room {room_id} not ready within {timeout_ms}ms")]
    ConnectTimeout { room_id: RoomId, timeout_ms: u64 },

    /// 传输协作方报告的错误
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 房间没有 Ready 连接
    #[error("Room {0} is not connected")]
    NotConnected(RoomId),

    /// 播放器未在限定时间内进入 Playing
    #[error("Playback in room {room_id} did not start within {timeout_ms}ms")]
    PlaybackStartTimeout { room_id: RoomId, timeout_ms: u64 },

    /// 播放器未在限定时间内回到 Idle
    #[error("Playback in room {room_id} did not finish within {timeout_ms}ms")]
    PlaybackTimeout { room_id: RoomId, timeout_ms: u64 },

    /// 已有播放进行中
    #[error("Room {0} is already playing")]
    PlaybackBusy(RoomId),

    /// 无法构建可播放资源
    #[error("Invalid audio: {0}")]
    InvalidAudio(String),

    /// 编解码器不可用
    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    /// 等待过程中房间被 leave
    #[error("Operation in room {0} cancelled by leave")]
    Cancelled(RoomId),
}

impl VoiceError {
    /// 由编解码错误构建（构建资源阶段）
    pub fn invalid_audio(err: CodecError) -> Self {
        match err {
            CodecError::Unavailable(msg) => Self::CodecUnavailable(msg),
            other => Self::InvalidAudio(other.to_string()),
        }
    }

    /// 是否为超时类错误
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::PlaybackStartTimeout { .. }
                | Self::PlaybackTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_mapping() {
        let err = VoiceError::invalid_audio(CodecError::Unavailable("libopus".into()));
        assert!(matches!(err, VoiceError::CodecUnavailable(_)));

        let err = VoiceError::invalid_audio(CodecError::InvalidInput("empty".into()));
        assert!(matches!(err, VoiceError::InvalidAudio(_)));
    }

    #[test]
    fn test_timeout_classification() {
        let room = RoomId::new("r").unwrap();
        assert!(VoiceError::PlaybackTimeout {
            room_id: room.clone(),
            timeout_ms: 1
        }
        .is_timeout());
        assert!(!VoiceError::NotConnected(room).is_timeout());
    }
}
