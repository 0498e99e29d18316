//! Voice Application - 房间语音管线
//!
//! - connection: 单房间连接资源
//! - lifecycle: 连接状态机与房间协调任务
//! - registry: 房间 → 连接注册表端口
//! - playback: 出站播放
//! - capture: 入站语音分段
//! - service: 对外操作入口

mod capture;
mod connection;
mod lifecycle;
mod playback;
mod registry;
mod service;

pub use capture::{CaptureSegmenter, CaptureSession, UtteranceCallback};
pub use connection::{ConnectionHandle, RoomConnection};
pub use lifecycle::ConnectionLifecycle;
pub use playback::PlaybackController;
pub use registry::ConnectionRegistryPort;
pub use service::VoiceService;
