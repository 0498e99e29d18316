//! Capture Context - Speaker Buffer

use chrono::{DateTime, Utc};

use crate::domain::room::UserId;

/// 单个说话人的一段语音累积缓冲
///
/// 不变量:
/// - chunks 按到达顺序保存已解码的 PCM 块
/// - total_bytes 始终等于所有 chunk 长度之和
#[derive(Debug)]
pub struct SpeakerBuffer {
    user_id: UserId,
    chunks: Vec<Vec<u8>>,
    total_bytes: usize,
    skipped_frames: u32,
    started_at: DateTime<Utc>,
    last_chunk_at: Option<DateTime<Utc>>,
}

impl SpeakerBuffer {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            chunks: Vec::new(),
            total_bytes: 0,
            skipped_frames: 0,
            started_at: Utc::now(),
            last_chunk_at: None,
        }
    }

    /// 追加一个解码后的 PCM 块
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
        self.last_chunk_at = Some(Utc::now());
    }

    /// 记录一个解码失败被跳过的帧
    pub fn skip_frame(&mut self) {
        self.skipped_frames += 1;
    }

    pub fn len(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn skipped_frames(&self) -> u32 {
        self.skipped_frames
    }

    /// 结束累积并拼接
    ///
    /// 总长度低于 `min_bytes` 时视为背景噪声，返回 `Err` 携带被丢弃的字节数
    pub fn finalize(self, min_bytes: usize) -> Result<Utterance, usize> {
        if self.total_bytes < min_bytes {
            return Err(self.total_bytes);
        }

        let frame_count = self.chunks.len();
        let mut pcm = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks {
            pcm.extend_from_slice(&chunk);
        }

        Ok(Utterance {
            user_id: self.user_id,
            pcm,
            frame_count,
            started_at: self.started_at,
            ended_at: self.last_chunk_at.unwrap_or_else(Utc::now),
        })
    }
}

/// 完成的一段语音
#[derive(Debug, Clone)]
pub struct Utterance {
    pub user_id: UserId,
    pub pcm: Vec<u8>,
    pub frame_count: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}
