//! Voice Transport Port - 信令/传输协作方抽象
//!
//! 定义加入房间、播放器原语和说话人订阅的抽象接口，
//! 具体实现由外部传输库提供（测试使用 infrastructure/adapters/transport 中的模拟实现）

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::room::{ConnectionState, PlayerState, RoomId, TransportParams, UserId};
use crate::domain::AudioResource;

/// 传输层错误
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Signalling failed: {0}")]
    Signalling(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Player error: {0}")]
    Player(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),
}

/// 入站音频流错误（终止当前采集会话）
#[derive(Debug, Clone, Error)]
#[error("Audio stream error: {0}")]
pub struct StreamError(pub String);

/// 连接级事件，按发生顺序投递
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// 连接状态变化
    StateChanged(ConnectionState),
    /// 某个用户开始说话
    SpeakingStarted(UserId),
}

/// 单个说话人的压缩帧流
///
/// 流结束表示传输层判定该用户停止说话
pub type FrameStream = BoxStream<'static, Result<Vec<u8>, StreamError>>;

/// 建立连接的结果：连接句柄 + 有序事件接收端
pub struct TransportSession {
    pub link: Arc<dyn TransportLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// 播放器句柄 + 有序状态事件接收端
pub struct PlayerSession {
    pub player: Arc<dyn AudioPlayer>,
    pub events: mpsc::UnboundedReceiver<PlayerState>,
}

/// Voice Transport Port
///
/// 外部信令/传输库的抽象入口
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// 开始加入房间
    ///
    /// 只负责获取传输句柄，不等待 Ready；状态推进通过事件流报告
    async fn open(
        &self,
        room_id: &RoomId,
        params: &TransportParams,
    ) -> Result<TransportSession, TransportError>;
}

/// 单个房间的传输连接
pub trait TransportLink: Send + Sync {
    /// 创建该连接的播放器
    fn create_player(&self) -> Result<PlayerSession, TransportError>;

    /// 订阅指定用户的入站压缩帧
    fn subscribe_speaker(&self, user_id: &UserId) -> Result<FrameStream, TransportError>;

    /// 销毁连接（幂等）
    fn destroy(&self);
}

/// 播放器原语
pub trait AudioPlayer: Send + Sync {
    /// 播放资源，替换当前资源
    fn play(&self, resource: AudioResource) -> Result<(), TransportError>;

    /// 停止播放，播放器回到 Idle
    fn stop(&self);
}
