//! Domain Layer - 领域层
//!
//! 包含两个限界上下文:
//! - Room Context: 房间、连接状态机、播放器状态
//! - Capture Context: 说话人语音累积与分段
//!
//! 以及共享的音频值对象

pub mod capture;
pub mod room;

mod audio;

pub use audio::{AudioResource, PcmFormat, ResourceSource};
