//! Audio Value Objects - PCM 格式与可播放资源

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 线性 PCM 格式（s16le 交错）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub const fn new(sample_rate: u32, channels: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    /// 每个采样帧（所有声道）的字节数
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.block_align() as u64
    }

    /// 指定时长对应的字节数
    pub fn bytes_for(&self, duration: Duration) -> usize {
        (self.bytes_per_second() * duration.as_millis() as u64 / 1000) as usize
    }

    /// 字节数对应的时长（毫秒）
    pub fn duration_ms(&self, bytes: usize) -> u64 {
        let rate = self.bytes_per_second();
        if rate == 0 {
            return 0;
        }
        bytes as u64 * 1000 / rate
    }

    /// 一帧（frame_ms 毫秒）对应的每声道采样数
    pub fn samples_per_frame(&self, frame_ms: u32) -> usize {
        self.sample_rate as usize * frame_ms as usize / 1000
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::new(48000, 2)
    }
}

/// 资源来源格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceSource {
    /// Ogg 容器中的 Opus 包，直接透传
    Ogg,
    /// WAV，解码后重新编码
    Wav,
    /// 原始 s16le PCM
    Pcm,
}

/// 可播放资源：按顺序发送给播放器的 Opus 帧
#[derive(Debug, Clone)]
pub struct AudioResource {
    frames: Vec<Vec<u8>>,
    duration_ms: u64,
    source: ResourceSource,
}

impl AudioResource {
    pub fn new(frames: Vec<Vec<u8>>, duration_ms: u64, source: ResourceSource) -> Self {
        Self {
            frames,
            duration_ms,
            source,
        }
    }

    /// 交给播放器发送的帧
    pub fn into_frames(self) -> Vec<Vec<u8>> {
        self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn source(&self) -> ResourceSource {
        self.source
    }
}
