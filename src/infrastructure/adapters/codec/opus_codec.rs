//! Opus Frame Codec - 基于 libopus 的传输帧编解码
//!
//! 传输层约定：48kHz、20ms 帧；PCM 侧为 s16le 交错

use opus::{Application, Bitrate, Channels, Decoder, Encoder};

use crate::application::ports::{CodecError, FrameCodecPort, FrameDecoder, FrameEncoder};
use crate::config::CaptureConfig;
use crate::domain::PcmFormat;

/// 每帧时长
pub const FRAME_MS: u32 = 20;

/// 单包最大时长 120ms @ 48kHz
const MAX_FRAME_SAMPLES: usize = 5760;

/// Opus 单包最大字节数
const MAX_PACKET_BYTES: usize = 4000;

/// Opus 帧编解码器
pub struct OpusFrameCodec {
    format: PcmFormat,
    bitrate: i32,
}

impl OpusFrameCodec {
    pub fn new(format: PcmFormat, bitrate: u32) -> Self {
        Self {
            format,
            bitrate: bitrate as i32,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.pcm_format(), config.opus_bitrate)
    }

    fn channels(&self) -> Result<Channels, CodecError> {
        match self.format.channels {
            1 => Ok(Channels::Mono),
            2 => Ok(Channels::Stereo),
            n => Err(CodecError::Unavailable(format!(
                "Opus supports 1 or 2 channels, got {}",
                n
            ))),
        }
    }
}

impl Default for OpusFrameCodec {
    fn default() -> Self {
        Self::new(PcmFormat::default(), 64000)
    }
}

impl FrameCodecPort for OpusFrameCodec {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn new_decoder(&self) -> Result<Box<dyn FrameDecoder>, CodecError> {
        let decoder = Decoder::new(self.format.sample_rate, self.channels()?).map_err(|e| {
            CodecError::Unavailable(format!("Failed to create Opus decoder: {}", e))
        })?;

        Ok(Box::new(OpusFrameDecoder {
            decoder,
            channels: self.format.channels as usize,
            pcm: vec![0i16; MAX_FRAME_SAMPLES * self.format.channels as usize],
        }))
    }

    fn new_encoder(&self) -> Result<Box<dyn FrameEncoder>, CodecError> {
        let mut encoder = Encoder::new(self.format.sample_rate, self.channels()?, Application::Voip)
            .map_err(|e| {
                CodecError::Unavailable(format!("Failed to create Opus encoder: {}", e))
            })?;

        encoder
            .set_bitrate(Bitrate::Bits(self.bitrate))
            .map_err(|e| CodecError::Encode(format!("Failed to set bitrate: {}", e)))?;

        let samples = self.format.samples_per_frame(FRAME_MS) * self.format.channels as usize;
        Ok(Box::new(OpusFrameEncoder {
            encoder,
            frame_bytes: samples * 2,
            output: vec![0u8; MAX_PACKET_BYTES],
        }))
    }
}

/// 单流 Opus 解码器
struct OpusFrameDecoder {
    decoder: Decoder,
    channels: usize,
    pcm: Vec<i16>,
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>, CodecError> {
        // 空包会触发丢包补偿，这里视为无效帧
        if frame.is_empty() {
            return Err(CodecError::Decode("Empty Opus frame".to_string()));
        }

        let samples = self
            .decoder
            .decode(frame, &mut self.pcm, false)
            .map_err(|e| CodecError::Decode(format!("Opus decode failed: {}", e)))?;

        let mut bytes = Vec::with_capacity(samples * self.channels * 2);
        for sample in &self.pcm[..samples * self.channels] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(bytes)
    }
}

/// 单流 Opus 编码器
struct OpusFrameEncoder {
    encoder: Encoder,
    frame_bytes: usize,
    output: Vec<u8>,
}

impl FrameEncoder for OpusFrameEncoder {
    fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>, CodecError> {
        if pcm.len() != self.frame_bytes {
            return Err(CodecError::InvalidInput(format!(
                "Expected {} PCM bytes per frame, got {}",
                self.frame_bytes,
                pcm.len()
            )));
        }

        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        let len = self
            .encoder
            .encode(&samples, &mut self.output)
            .map_err(|e| CodecError::Encode(format!("Opus encode failed: {}", e)))?;

        Ok(self.output[..len].to_vec())
    }
}
