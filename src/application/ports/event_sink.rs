//! Voice Event Sink Port - 语音事件观察者出口

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::room::{CloseReason, ConnectionState, RoomId};

/// 语音事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum VoiceEvent {
    /// 连接状态变更
    ConnectionStateChanged {
        room_id: String,
        connection_id: String,
        from: ConnectionState,
        to: ConnectionState,
        changed_at: DateTime<Utc>,
    },
    /// 连接已拆除
    ConnectionClosed {
        room_id: String,
        connection_id: String,
        reason: CloseReason,
    },
    /// 播放开始
    PlaybackStarted { room_id: String, duration_ms: u64 },
    /// 播放完成
    PlaybackFinished { room_id: String, elapsed_ms: u64 },
    /// 播放失败
    PlaybackFailed { room_id: String, error: String },
    /// 开始采集某个说话人
    CaptureStarted { room_id: String, user_id: String },
    /// 一段语音已交付
    UtteranceCaptured {
        room_id: String,
        user_id: String,
        bytes: usize,
        duration_ms: u64,
        frames: usize,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    /// 过短的语音被当作噪声丢弃
    UtteranceDiscarded {
        room_id: String,
        user_id: String,
        bytes: usize,
    },
    /// 采集会话未完成即终止
    CaptureAborted {
        room_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl VoiceEvent {
    /// 事件所属房间
    pub fn room_id(&self) -> &str {
        match self {
            VoiceEvent::ConnectionStateChanged { room_id, .. }
            | VoiceEvent::ConnectionClosed { room_id, .. }
            | VoiceEvent::PlaybackStarted { room_id, .. }
            | VoiceEvent::PlaybackFinished { room_id, .. }
            | VoiceEvent::PlaybackFailed { room_id, .. }
            | VoiceEvent::CaptureStarted { room_id, .. }
            | VoiceEvent::UtteranceCaptured { room_id, .. }
            | VoiceEvent::UtteranceDiscarded { room_id, .. }
            | VoiceEvent::CaptureAborted { room_id, .. } => room_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Voice Event Sink Port
pub trait VoiceEventSinkPort: Send + Sync {
    /// 发布事件（无订阅者时静默丢弃）
    fn publish(&self, event: VoiceEvent);

    /// 房间连接已拆除，释放该房间的观察者资源
    ///
    /// 调用时该连接的 CaptureAborted 与 ConnectionClosed 均已发布
    fn room_closed(&self, _room_id: &RoomId) {}
}
