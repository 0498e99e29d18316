//! Configuration Types
//!
//! 定义所有配置结构体

use serde::Deserialize;
use std::time::Duration;

use crate::domain::PcmFormat;

/// 应用主配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// 连接生命周期配置
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// 播放配置
    #[serde(default)]
    pub playback: PlaybackConfig,

    /// 采集配置
    #[serde(default)]
    pub capture: CaptureConfig,

    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 连接生命周期配置
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// 等待连接进入 Ready 的超时（毫秒）
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    /// 断线后等待重连开始的窗口（毫秒）
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout_ms: u64,
}

fn default_ready_timeout() -> u64 {
    30_000
}

fn default_reconnect_timeout() -> u64 {
    5_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout(),
            reconnect_timeout_ms: default_reconnect_timeout(),
        }
    }
}

impl ConnectionConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

/// 播放配置
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// 等待播放器进入 Playing 的超时（毫秒）
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,

    /// 等待播放器回到 Idle 的超时（毫秒），即单段语音最大时长
    #[serde(default = "default_finish_timeout")]
    pub finish_timeout_ms: u64,
}

fn default_start_timeout() -> u64 {
    5_000
}

fn default_finish_timeout() -> u64 {
    60_000
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout(),
            finish_timeout_ms: default_finish_timeout(),
        }
    }
}

impl PlaybackConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}

/// 采集配置
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// 静音多久后结束一段语音（毫秒）
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_ms: u64,

    /// 最短有效语音时长（毫秒），低于该值视为噪声
    #[serde(default = "default_min_utterance")]
    pub min_utterance_ms: u64,

    /// PCM 采样率（Hz）
    /// Opus 支持: 8000, 12000, 16000, 24000, 48000
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// 声道数（1 或 2）
    #[serde(default = "default_channels")]
    pub channels: u8,

    /// 出站 Opus 编码比特率（bps）
    #[serde(default = "default_opus_bitrate")]
    pub opus_bitrate: u32,

    /// 播放期间是否忽略新的说话事件
    #[serde(default = "default_suppress_during_playback")]
    pub suppress_during_playback: bool,
}

fn default_silence_timeout() -> u64 {
    2_000
}

fn default_min_utterance() -> u64 {
    500
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_channels() -> u8 {
    2
}

fn default_opus_bitrate() -> u32 {
    64_000
}

fn default_suppress_during_playback() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: default_silence_timeout(),
            min_utterance_ms: default_min_utterance(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            opus_bitrate: default_opus_bitrate(),
            suppress_during_playback: default_suppress_during_playback(),
        }
    }
}

impl CaptureConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat::new(self.sample_rate, self.channels)
    }

    /// 最短有效语音对应的 PCM 字节数
    pub fn min_utterance_bytes(&self) -> usize {
        self.pcm_format()
            .bytes_for(Duration::from_millis(self.min_utterance_ms))
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否启用 JSON 格式
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
