//! Voxroom - 多房间实时语音管线
//!
//! 架构设计: DDD + Hexagonal Architecture
//!
//! 领域层 (domain/):
//! - Room Context: 房间/说话人标识、连接与播放器状态机
//! - Capture Context: 说话人缓冲与语音分段
//! - Audio: PCM 格式与可播放资源
//!
//! 应用层 (application/):
//! - Ports: 端口定义（Transport, FrameCodec, AudioResource, ConnectionRegistry, EventSink）
//! - Voice: 连接生命周期、播放控制、采集分段、VoiceService 入口
//!
//! 基础设施层 (infrastructure/):
//! - Adapters: Opus 编解码、音频资源加载、模拟传输层
//! - Memory: ConnectionRegistry 内存实现
//! - Events: 语音事件发布
//! - Telemetry: tracing 初始化

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{VoiceError, VoiceService};
pub use config::{load_config, AppConfig};
