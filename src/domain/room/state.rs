//! Room Context - Connection / Player State Machines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RoomError;

/// 传输连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// 正在与信令服务协商
    Signalling,
    /// 正在建立媒体连接
    Connecting,
    /// 可收发音频
    Ready,
    /// 连接中断（可能正在重连）
    Disconnected,
    /// 已销毁（终态）
    Destroyed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Signalling => "signalling",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Destroyed => "destroyed",
        }
    }

    /// 是否为重连进行中的标志状态
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, ConnectionState::Signalling | ConnectionState::Connecting)
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Signalling, Connecting | Ready | Disconnected) => true,
            (Connecting, Signalling | Ready | Disconnected) => true,
            (Ready, Signalling | Connecting | Disconnected) => true,
            (Disconnected, Signalling | Connecting) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接状态记录
///
/// 不变量:
/// - Destroyed 之后不再接受任何迁移
/// - last_state_change_at 只在状态真正变化时更新
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    state: ConnectionState,
    last_state_change_at: DateTime<Utc>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Signalling,
            last_state_change_at: Utc::now(),
        }
    }

    /// 执行状态迁移
    ///
    /// 返回迁移前的状态；相同状态返回 `Ok(None)`
    pub fn transition(
        &mut self,
        next: ConnectionState,
    ) -> Result<Option<ConnectionState>, RoomError> {
        if self.state == next {
            return Ok(None);
        }
        if !self.state.can_transition_to(next) {
            return Err(RoomError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        self.last_state_change_at = Utc::now();
        Ok(Some(previous))
    }

    /// 强制进入终态（拆除路径使用）
    pub fn destroy(&mut self) -> bool {
        if self.state == ConnectionState::Destroyed {
            return false;
        }
        self.state = ConnectionState::Destroyed;
        self.last_state_change_at = Utc::now();
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_state_change_at(&self) -> DateTime<Utc> {
        self.last_state_change_at
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// 播放器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Idle,
    Buffering,
    Playing,
    Paused,
    AutoPaused,
}

impl PlayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Idle => "idle",
            PlayerState::Buffering => "buffering",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::AutoPaused => "auto_paused",
        }
    }
}

/// 连接关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// 调用方主动 leave
    Left,
    /// 等待 Ready 超时
    ReadyTimeout,
    /// 断线后重连窗口内未恢复
    ReconnectExpired,
    /// 传输层报告 Destroyed 或事件流关闭
    TransportClosed,
    /// 并发 join 竞争失败，被已有连接取代
    Superseded,
    /// 播放器创建失败
    PlayerUnavailable,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Left => "left",
            CloseReason::ReadyTimeout => "ready_timeout",
            CloseReason::ReconnectExpired => "reconnect_expired",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::Superseded => "superseded",
            CloseReason::PlayerUnavailable => "player_unavailable",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
