//! Room Context - Value Objects

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 房间唯一标识（语音会话，例如一个服务器一个房间）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Result<Self, &'static str> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("房间 ID 不能为空");
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 说话人标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, &'static str> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("用户 ID 不能为空");
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 连接实例标识
///
/// 同一房间离开后重新加入会得到新的 ConnectionId，
/// 用于防止过期的后台任务误删新连接
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 传输层加入参数（原样透传给传输协作方）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportParams {
    /// 目标语音频道
    pub channel_id: String,
    /// 是否静音自己的麦克风
    #[serde(default)]
    pub self_mute: bool,
    /// 是否屏蔽入站音频（屏蔽后无法采集）
    #[serde(default)]
    pub self_deaf: bool,
}

impl TransportParams {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            self_mute: false,
            self_deaf: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_validation() {
        assert!(RoomId::new("guild-1").is_ok());
        assert!(RoomId::new("").is_err());
        assert!(RoomId::new("   ").is_err());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_transport_params_default_flags() {
        let params = TransportParams::new("channel-9");
        assert_eq!(params.channel_id, "channel-9");
        assert!(!params.self_deaf);
        assert!(!params.self_mute);
    }
}
