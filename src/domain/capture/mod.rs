//! Capture Context - 入站语音采集限界上下文
//!
//! 职责:
//! - 单说话人 PCM 累积
//! - 噪声阈值判定与拼接

mod speaker_buffer;

pub use speaker_buffer::{SpeakerBuffer, Utterance};
