//! Audio Resource Loader - 把调用方音频包装为可播放资源
//!
//! 支持：
//! - Ogg/Opus: 解封装后直接透传 Opus 包
//! - WAV: symphonia 解码为 s16 PCM 后重新编码
//! - 原始 s16le PCM（编解码器的 PCM 格式）

use ogg::reading::PacketReader;
use std::io::Cursor;
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::application::ports::{AudioResourcePort, CodecError, FrameCodecPort};
use crate::domain::{AudioResource, PcmFormat, ResourceSource};

/// Opus 在 Ogg 中的 granule position 固定按 48kHz 计数
const OPUS_GRANULE_RATE: u64 = 48;

/// 音频资源加载器
pub struct AudioResourceLoader {
    codec: Arc<dyn FrameCodecPort>,
}

impl AudioResourceLoader {
    pub fn new(codec: Arc<dyn FrameCodecPort>) -> Self {
        Self { codec }
    }

    /// 解封装 Ogg/Opus，跳过 OpusHead / OpusTags
    fn demux_ogg(&self, data: &[u8]) -> Result<AudioResource, CodecError> {
        let mut reader = PacketReader::new(Cursor::new(data));
        let mut frames = Vec::new();
        let mut pre_skip: Option<u64> = None;
        let mut last_granule: u64 = 0;

        loop {
            let packet = match reader.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    return Err(CodecError::InvalidInput(format!("Ogg read error: {}", e)));
                }
            };

            if packet.data.starts_with(b"OpusHead") {
                if packet.data.len() < 19 {
                    return Err(CodecError::InvalidInput(
                        "Invalid OpusHead packet".to_string(),
                    ));
                }
                pre_skip = Some(u16::from_le_bytes([packet.data[10], packet.data[11]]) as u64);
                continue;
            }
            if packet.data.starts_with(b"OpusTags") {
                continue;
            }
            if pre_skip.is_none() {
                return Err(CodecError::InvalidInput(
                    "Ogg stream is not Opus: missing OpusHead".to_string(),
                ));
            }

            last_granule = last_granule.max(packet.absgp_page());
            frames.push(packet.data);
        }

        let pre_skip = pre_skip.ok_or_else(|| {
            CodecError::InvalidInput("Ogg stream is not Opus: missing OpusHead".to_string())
        })?;
        if frames.is_empty() {
            return Err(CodecError::InvalidInput(
                "Ogg stream has no audio packets".to_string(),
            ));
        }

        let duration_ms = last_granule.saturating_sub(pre_skip) / OPUS_GRANULE_RATE;
        Ok(AudioResource::new(frames, duration_ms, ResourceSource::Ogg))
    }

    /// 使用 symphonia 解码 WAV 获取 s16le PCM
    fn decode_wav(&self, data: &[u8], expected: PcmFormat) -> Result<Vec<u8>, CodecError> {
        let cursor = Cursor::new(data.to_vec());
        let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

        let mut hint = Hint::new();
        hint.with_extension("wav");

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| CodecError::InvalidInput(format!("Probe failed: {}", e)))?;

        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| CodecError::InvalidInput("No audio track found".to_string()))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| CodecError::InvalidInput("Unknown sample rate".to_string()))?;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u8)
            .ok_or_else(|| CodecError::InvalidInput("Unknown channel count".to_string()))?;

        if sample_rate != expected.sample_rate || channels != expected.channels {
            return Err(CodecError::InvalidInput(format!(
                "WAV format {}Hz/{}ch does not match {}Hz/{}ch",
                sample_rate, channels, expected.sample_rate, expected.channels
            )));
        }

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| CodecError::Decode(format!("Decoder creation failed: {}", e)))?;
        let track_id = track.id;

        let mut pcm = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => {
                    return Err(CodecError::Decode(format!("Packet read error: {}", e)));
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "WAV decode error (skipping packet)");
                    continue;
                }
            };

            let spec = *decoded.spec();
            let num_frames = decoded.frames();
            let mut sample_buf = SampleBuffer::<i16>::new(num_frames as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            let actual_samples = num_frames * spec.channels.count();
            for sample in &sample_buf.samples()[..actual_samples] {
                pcm.extend_from_slice(&sample.to_le_bytes());
            }
        }

        Ok(pcm)
    }

    /// 按 20ms 帧编码 PCM，最后一帧补零
    fn encode_pcm(&self, pcm: &[u8], source: ResourceSource) -> Result<AudioResource, CodecError> {
        let format = self.codec.format();
        if pcm.is_empty() {
            return Err(CodecError::InvalidInput("Empty PCM data".to_string()));
        }
        if pcm.len() % format.block_align() != 0 {
            return Err(CodecError::InvalidInput(format!(
                "PCM length {} is not a multiple of block align {}",
                pcm.len(),
                format.block_align()
            )));
        }

        let mut encoder = self.codec.new_encoder()?;
        let frame_bytes = encoder.frame_bytes();

        let mut frames = Vec::with_capacity(pcm.len().div_ceil(frame_bytes));
        for chunk in pcm.chunks(frame_bytes) {
            let frame = if chunk.len() < frame_bytes {
                let mut padded = chunk.to_vec();
                padded.resize(frame_bytes, 0);
                encoder.encode(&padded)?
            } else {
                encoder.encode(chunk)?
            };
            frames.push(frame);
        }

        Ok(AudioResource::new(
            frames,
            format.duration_ms(pcm.len()),
            source,
        ))
    }
}

impl AudioResourcePort for AudioResourceLoader {
    fn load(&self, buffer: &[u8]) -> Result<AudioResource, CodecError> {
        if buffer.is_empty() {
            return Err(CodecError::InvalidInput("Empty audio buffer".to_string()));
        }

        let resource = if buffer.starts_with(b"OggS") {
            self.demux_ogg(buffer)?
        } else if buffer.len() >= 12 && &buffer[0..4] == b"RIFF" && &buffer[8..12] == b"WAVE" {
            let pcm = self.decode_wav(buffer, self.codec.format())?;
            self.encode_pcm(&pcm, ResourceSource::Wav)?
        } else {
            self.encode_pcm(buffer, ResourceSource::Pcm)?
        };

        tracing::debug!(
            source = ?resource.source(),
            input_bytes = buffer.len(),
            frames = resource.frame_count(),
            duration_ms = resource.duration_ms(),
            "Audio resource loaded"
        );
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::adapters::codec::OpusFrameCodec;
    use ogg::writing::{PacketWriteEndInfo, PacketWriter};

    fn loader() -> AudioResourceLoader {
        AudioResourceLoader::new(Arc::new(OpusFrameCodec::default()))
    }

    fn create_test_wav(sample_rate: u32, num_channels: u16, millis: u32) -> Vec<u8> {
        let bits_per_sample: u16 = 16;
        let num_samples = (sample_rate * millis / 1000) as usize * num_channels as usize;
        let data_size = num_samples * 2;

        let mut wav = Vec::with_capacity(44 + data_size);
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&((36 + data_size) as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVE");

        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&num_channels.to_le_bytes());
        wav.extend_from_slice(&sample_rate.to_le_bytes());
        let byte_rate = sample_rate * num_channels as u32 * (bits_per_sample / 8) as u32;
        wav.extend_from_slice(&byte_rate.to_le_bytes());
        let block_align = num_channels * (bits_per_sample / 8);
        wav.extend_from_slice(&block_align.to_le_bytes());
        wav.extend_from_slice(&bits_per_sample.to_le_bytes());

        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(data_size as u32).to_le_bytes());
        wav.resize(44 + data_size, 0);
        wav
    }

    fn create_test_ogg(packets: usize, pre_skip: u16) -> Vec<u8> {
        let mut head = Vec::new();
        head.extend_from_slice(b"OpusHead");
        head.push(1);
        head.push(2);
        head.extend_from_slice(&pre_skip.to_le_bytes());
        head.extend_from_slice(&48000u32.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes());
        head.push(0);

        let mut tags = Vec::new();
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&0u32.to_le_bytes());
        tags.extend_from_slice(&0u32.to_le_bytes());

        let mut data = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut data);
            writer
                .write_packet(head, 1, PacketWriteEndInfo::EndPage, 0)
                .unwrap();
            writer
                .write_packet(tags, 1, PacketWriteEndInfo::EndPage, 0)
                .unwrap();
            let mut granule = pre_skip as u64;
            for i in 0..packets {
                granule += 960;
                let end = if i + 1 == packets {
                    PacketWriteEndInfo::EndStream
                } else {
                    PacketWriteEndInfo::NormalPacket
                };
                writer
                    .write_packet(vec![0xFC, 0xFF, 0xFE], 1, end, granule)
                    .unwrap();
            }
        }
        data
    }

    #[test]
    fn test_raw_pcm_is_split_into_padded_frames() {
        // 50ms @ 48kHz 立体声 = 2.5 帧
        let pcm = vec![0u8; 9600];
        let resource = loader().load(&pcm).unwrap();

        assert_eq!(resource.source(), ResourceSource::Pcm);
        assert_eq!(resource.frame_count(), 3);
        assert_eq!(resource.duration_ms(), 50);
    }

    #[test]
    fn test_wav_is_decoded_and_encoded() {
        let wav = create_test_wav(48000, 2, 100);
        let resource = loader().load(&wav).unwrap();

        assert_eq!(resource.source(), ResourceSource::Wav);
        assert_eq!(resource.frame_count(), 5);
        assert_eq!(resource.duration_ms(), 100);
    }

    #[test]
    fn test_wav_format_mismatch_rejected() {
        let wav = create_test_wav(16000, 1, 100);
        assert!(matches!(
            loader().load(&wav),
            Err(CodecError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_ogg_opus_packets_pass_through() {
        let ogg = create_test_ogg(10, 312);
        let resource = loader().load(&ogg).unwrap();

        assert_eq!(resource.source(), ResourceSource::Ogg);
        assert_eq!(resource.frame_count(), 10);
        // 10 * 20ms
        assert_eq!(resource.duration_ms(), 200);
    }

    #[test]
    fn test_empty_and_misaligned_input_rejected() {
        assert!(matches!(loader().load(&[]), Err(CodecError::InvalidInput(_))));
        assert!(matches!(
            loader().load(&[1, 2, 3]),
            Err(CodecError::InvalidInput(_))
        ));
    }
}
