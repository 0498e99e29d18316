//! Application Ports - 出站端口定义
//!
//! 定义应用层与基础设施层的抽象接口

mod audio_resource;
mod event_sink;
mod frame_codec;
mod transport;

pub use audio_resource::AudioResourcePort;
pub use event_sink::{VoiceEvent, VoiceEventSinkPort};
pub use frame_codec::{CodecError, FrameCodecPort, FrameDecoder, FrameEncoder};
pub use transport::{
    AudioPlayer, FrameStream, LinkEvent, PlayerSession, StreamError, TransportError,
    TransportLink, TransportPort, TransportSession,
};
