//! 应用层 - 用例编排
//!
//! 包含：
//! - ports: 六边形架构端口定义（Transport、FrameCodec、AudioResource、EventSink）
//! - voice: 连接生命周期、连接注册表、播放控制、采集分段与 VoiceService 入口
//! - error: 应用层错误定义

pub mod error;
pub mod ports;
pub mod voice;

pub use error::VoiceError;

pub use ports::{
    // Audio resource
    AudioResourcePort,
    // Codec
    CodecError,
    FrameCodecPort,
    FrameDecoder,
    FrameEncoder,
    // Events
    VoiceEvent,
    VoiceEventSinkPort,
    // Transport
    AudioPlayer,
    FrameStream,
    LinkEvent,
    PlayerSession,
    StreamError,
    TransportError,
    TransportLink,
    TransportPort,
    TransportSession,
};

pub use voice::{
    CaptureSegmenter, CaptureSession, ConnectionHandle, ConnectionLifecycle,
    ConnectionRegistryPort, PlaybackController, RoomConnection, UtteranceCallback, VoiceService,
};
