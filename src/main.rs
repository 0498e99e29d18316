//! Voxroom - 房间语音管线本地演示
//!
//! 使用模拟传输层串起完整流程：
//! join → play_audio → start_receiving → 模拟说话人 → 语音回调 → shutdown

use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use voxroom::application::ports::FrameCodecPort;
use voxroom::application::VoiceService;
use voxroom::config::{load_config, print_config};
use voxroom::domain::room::{RoomId, TransportParams, UserId};
use voxroom::infrastructure::adapters::{
    AudioResourceLoader, FakeTransport, FakeTransportConfig, OpusFrameCodec,
};
use voxroom::infrastructure::events::EventPublisher;
use voxroom::infrastructure::memory::InMemoryConnectionRegistry;
use voxroom::infrastructure::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置（优先级：环境变量 > 配置文件 > 默认值）
    let config = load_config().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    init_tracing(&config.log);
    tracing::info!("Voxroom - 房间语音管线演示");
    print_config(&config);

    let codec = Arc::new(OpusFrameCodec::from_config(&config.capture));
    let transport = Arc::new(FakeTransport::new(FakeTransportConfig::default()));
    let event_publisher = EventPublisher::new().arc();

    // 转发全部事件到日志
    let mut events = event_publisher.subscribe_global();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.to_json() {
                Ok(json) => tracing::info!(event = %json, "Voice event"),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
            }
        }
    });

    let service = VoiceService::new(
        &config,
        transport.clone(),
        codec.clone(),
        Arc::new(AudioResourceLoader::new(codec.clone())),
        InMemoryConnectionRegistry::new().arc(),
        event_publisher,
    );

    let room_id = RoomId::new("demo-room").map_err(anyhow::Error::msg)?;
    let handle = service
        .join(&room_id, &TransportParams::new("demo-channel"))
        .await?;
    tracing::info!(connection_id = %handle.connection_id, "Joined");

    let format = codec.format();
    service.play_audio(&room_id, &tone(format.sample_rate, format.channels, 1000)).await?;

    service.start_receiving(&room_id, |pcm, user_id| {
        tracing::info!(user_id = %user_id, bytes = pcm.len(), "Utterance received");
    })?;

    // 模拟一位说话人说 1 秒
    let link = transport
        .link(&room_id)
        .ok_or_else(|| anyhow::anyhow!("demo link missing"))?;
    let speaker = UserId::new("demo-speaker").map_err(anyhow::Error::msg)?;
    let mut encoder = codec.new_encoder()?;
    let pcm = tone(format.sample_rate, format.channels, 1000);

    link.start_speaking(&speaker);
    for frame in pcm.chunks_exact(encoder.frame_bytes()) {
        link.send_frame(&speaker, encoder.encode(frame)?);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // 等待静音超时触发分段
    tokio::time::sleep(config.capture.silence_timeout() + Duration::from_millis(500)).await;

    service.shutdown();
    tracing::info!("Demo complete");

    Ok(())
}

/// 生成 440Hz 正弦波 s16le PCM
fn tone(sample_rate: u32, channels: u8, millis: u32) -> Vec<u8> {
    let frames = (sample_rate as u64 * millis as u64 / 1000) as usize;
    let mut pcm = Vec::with_capacity(frames * channels as usize * 2);
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = ((2.0 * PI * 440.0 * t).sin() * 0.3 * i16::MAX as f32) as i16;
        for _ in 0..channels {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
    }
    pcm
}
