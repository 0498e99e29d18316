//! Voice Service - 对外操作入口
//!
//! 组合连接生命周期、播放控制与采集分段：
//! join / leave / play_audio / start_receiving / stop_receiving / is_connected

use std::sync::Arc;

use super::capture::{CaptureSegmenter, UtteranceCallback};
use super::connection::{ConnectionHandle, RoomConnection};
use super::lifecycle::ConnectionLifecycle;
use super::playback::PlaybackController;
use super::registry::ConnectionRegistryPort;
use crate::application::error::VoiceError;
use crate::application::ports::{
    AudioResourcePort, FrameCodecPort, TransportPort, VoiceEventSinkPort,
};
use crate::config::{AppConfig, PlaybackConfig};
use crate::domain::room::{CloseReason, ConnectionState, RoomId, TransportParams, UserId};

/// 语音服务
pub struct VoiceService {
    registry: Arc<dyn ConnectionRegistryPort>,
    lifecycle: Arc<ConnectionLifecycle>,
    capture: Arc<CaptureSegmenter>,
    resources: Arc<dyn AudioResourcePort>,
    event_sink: Arc<dyn VoiceEventSinkPort>,
    playback_config: PlaybackConfig,
}

impl VoiceService {
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn TransportPort>,
        codec: Arc<dyn FrameCodecPort>,
        resources: Arc<dyn AudioResourcePort>,
        registry: Arc<dyn ConnectionRegistryPort>,
        event_sink: Arc<dyn VoiceEventSinkPort>,
    ) -> Self {
        let capture = Arc::new(CaptureSegmenter::new(
            codec,
            config.capture.clone(),
            event_sink.clone(),
        ));
        let lifecycle = Arc::new(ConnectionLifecycle::new(
            config.connection.clone(),
            transport,
            registry.clone(),
            capture.clone(),
            event_sink.clone(),
        ));

        Self {
            registry,
            lifecycle,
            capture,
            resources,
            event_sink,
            playback_config: config.playback.clone(),
        }
    }

    /// 加入房间，成功后挂载播放器
    pub async fn join(
        &self,
        room_id: &RoomId,
        params: &TransportParams,
    ) -> Result<ConnectionHandle, VoiceError> {
        let connection = self.lifecycle.join(room_id, params).await?;
        self.attach_player(&connection)?;
        Ok(connection.handle())
    }

    /// 离开房间（幂等）
    pub fn leave(&self, room_id: &RoomId) {
        if self.lifecycle.leave(room_id) {
            tracing::info!(room_id = %room_id, "Left room");
        }
    }

    /// 播放音频并等待播放完成
    pub async fn play_audio(&self, room_id: &RoomId, buffer: &[u8]) -> Result<(), VoiceError> {
        let connection = self.ready_connection(room_id)?;
        let player = connection
            .player()
            .ok_or_else(|| VoiceError::NotConnected(room_id.clone()))?;

        let resource = self
            .resources
            .load(buffer)
            .map_err(VoiceError::invalid_audio)?;

        player.play(&connection, resource).await
    }

    /// 开始接收入站语音
    pub fn start_receiving<F>(&self, room_id: &RoomId, on_utterance: F) -> Result<(), VoiceError>
    where
        F: Fn(Vec<u8>, UserId) + Send + Sync + 'static,
    {
        let connection = self.ready_connection(room_id)?;
        let callback: UtteranceCallback = Arc::new(on_utterance);
        self.capture.start_receiving(&connection, callback)
    }

    /// 停止接收入站语音
    pub fn stop_receiving(&self, room_id: &RoomId) {
        if let Some(connection) = self.registry.get(room_id) {
            self.capture.stop_receiving(&connection);
        }
    }

    pub fn is_connected(&self, room_id: &RoomId) -> bool {
        self.registry
            .get(room_id)
            .map(|connection| connection.is_connected())
            .unwrap_or(false)
    }

    /// 房间当前连接状态，未加入时为 None
    pub fn connection_state(&self, room_id: &RoomId) -> Option<ConnectionState> {
        self.registry.get(room_id).map(|connection| connection.state())
    }

    /// 是否正在接收该房间的入站语音
    pub fn is_receiving(&self, room_id: &RoomId) -> bool {
        self.registry
            .get(room_id)
            .map(|connection| connection.is_receiving())
            .unwrap_or(false)
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.registry.room_ids()
    }

    /// 离开所有房间
    pub fn shutdown(&self) {
        let rooms = self.registry.room_ids();
        tracing::info!(rooms = rooms.len(), "Shutting down voice service");
        for room_id in rooms {
            self.leave(&room_id);
        }
    }

    fn ready_connection(&self, room_id: &RoomId) -> Result<Arc<RoomConnection>, VoiceError> {
        self.registry
            .get(room_id)
            .filter(|connection| connection.is_connected())
            .ok_or_else(|| VoiceError::NotConnected(room_id.clone()))
    }

    fn attach_player(&self, connection: &Arc<RoomConnection>) -> Result<(), VoiceError> {
        let attached = connection.ensure_player(|session| {
            PlaybackController::new(
                connection.room_id().clone(),
                session,
                self.playback_config.clone(),
                self.event_sink.clone(),
            )
        });

        match attached {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(VoiceError::NotConnected(connection.room_id().clone())),
            Err(e) => {
                tracing::error!(room_id = %connection.room_id(), error = %e, "Player creation failed");
                self.lifecycle
                    .destroy(connection, CloseReason::PlayerUnavailable);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{
        CodecError, FrameDecoder, FrameEncoder, TransportError, VoiceEvent,
    };
    use crate::domain::PcmFormat;
    use crate::infrastructure::{
        AudioResourceLoader, EventPublisher, FakePlayerBehavior, FakeTransport,
        FakeTransportConfig, InMemoryConnectionRegistry, OpusFrameCodec,
    };
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::sleep;

    /// 直通编解码器：帧内容即 PCM，以 0xFF 开头的帧视为损坏
    struct PassthroughCodec {
        available: bool,
    }

    struct PassthroughDecoder;

    impl FrameDecoder for PassthroughDecoder {
        fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>, CodecError> {
            if frame.first() == Some(&0xFF) {
                return Err(CodecError::Decode("corrupt frame".to_string()));
            }
            Ok(frame.to_vec())
        }
    }

    struct PassthroughEncoder;

    impl FrameEncoder for PassthroughEncoder {
        fn frame_bytes(&self) -> usize {
            3840
        }

        fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>, CodecError> {
            Ok(pcm.to_vec())
        }
    }

    impl FrameCodecPort for PassthroughCodec {
        fn format(&self) -> PcmFormat {
            PcmFormat::default()
        }

        fn new_decoder(&self) -> Result<Box<dyn FrameDecoder>, CodecError> {
            if !self.available {
                return Err(CodecError::Unavailable("no decoder".to_string()));
            }
            Ok(Box::new(PassthroughDecoder))
        }

        fn new_encoder(&self) -> Result<Box<dyn FrameEncoder>, CodecError> {
            Ok(Box::new(PassthroughEncoder))
        }
    }

    struct Harness {
        service: VoiceService,
        transport: Arc<FakeTransport>,
        publisher: Arc<EventPublisher>,
    }

    fn harness(config: FakeTransportConfig) -> Harness {
        harness_with_codec(config, Arc::new(PassthroughCodec { available: true }))
    }

    fn harness_with_codec(config: FakeTransportConfig, codec: Arc<dyn FrameCodecPort>) -> Harness {
        let transport = Arc::new(FakeTransport::new(config));
        let publisher = EventPublisher::new().arc();
        let service = VoiceService::new(
            &AppConfig::default(),
            transport.clone(),
            codec.clone(),
            Arc::new(AudioResourceLoader::new(codec)),
            InMemoryConnectionRegistry::new().arc(),
            publisher.clone(),
        );
        Harness {
            service,
            transport,
            publisher,
        }
    }

    fn player(behavior: FakePlayerBehavior) -> FakeTransportConfig {
        FakeTransportConfig {
            player: behavior,
            ..Default::default()
        }
    }

    fn room(id: &str) -> RoomId {
        RoomId::new(id).unwrap()
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn params() -> TransportParams {
        TransportParams::new("channel-1")
    }

    /// 100ms 的静音 PCM
    fn pcm_clip() -> Vec<u8> {
        vec![0u8; 19_200]
    }

    type Captured = Arc<Mutex<Vec<(Vec<u8>, UserId)>>>;

    fn collector() -> (Captured, impl Fn(Vec<u8>, UserId) + Send + Sync + 'static) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        (captured, move |pcm: Vec<u8>, user_id: UserId| {
            sink.lock().unwrap().push((pcm, user_id))
        })
    }

    fn drain(rx: &mut broadcast::Receiver<VoiceEvent>) -> Vec<VoiceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ========== join / leave ==========

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_before_join_and_after_leave() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        assert!(!h.service.is_connected(&room));

        let handle = h.service.join(&room, &params()).await.unwrap();
        assert_eq!(handle.room_id, room);
        assert!(h.service.is_connected(&room));
        assert_eq!(
            h.service.connection_state(&room),
            Some(ConnectionState::Ready)
        );

        h.service.leave(&room);
        assert!(!h.service.is_connected(&room));
        assert!(h.service.connection_state(&room).is_none());
        assert!(h.transport.link(&room).unwrap().is_destroyed());

        // 重复 leave 是无操作
        h.service.leave(&room);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_publishes_state_changes() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        let mut rx = h.publisher.subscribe(&room);

        h.service.join(&room, &params()).await.unwrap();

        let transitions: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                VoiceEvent::ConnectionStateChanged { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (ConnectionState::Signalling, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Ready),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_destroys_half_built_connection() {
        let h = harness(FakeTransportConfig {
            auto_ready: false,
            ..Default::default()
        });
        let room = room("room-1");

        let err = h.service.join(&room, &params()).await.unwrap_err();
        assert!(matches!(err, VoiceError::ConnectTimeout { timeout_ms: 30000, .. }));
        assert!(!h.service.is_connected(&room));
        assert!(h.service.rooms().is_empty());
        assert!(h.transport.link(&room).unwrap().is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_open_surfaces_transport_error() {
        let h = harness(FakeTransportConfig {
            reject_open: true,
            ..Default::default()
        });

        let err = h.service.join(&room("room-1"), &params()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Transport(TransportError::Rejected(_))));
        assert!(h.service.rooms().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_creation_failure_tears_down() {
        let h = harness(FakeTransportConfig {
            fail_player: true,
            ..Default::default()
        });
        let room = room("room-1");

        let err = h.service.join(&room, &params()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Transport(TransportError::Player(_))));
        assert!(!h.service.is_connected(&room));
        assert!(h.transport.link(&room).unwrap().is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_twice_reuses_connection() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");

        let first = h.service.join(&room, &params()).await.unwrap();
        let second = h.service.join(&room, &params()).await.unwrap();

        assert_eq!(first.connection_id, second.connection_id);
        assert_eq!(h.transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_joins_share_one_transport_handle() {
        let h = harness(FakeTransportConfig {
            auto_ready: false,
            ..Default::default()
        });
        let room = room("room-1");
        let params = params();

        let (first, second, _) = tokio::join!(
            h.service.join(&room, &params),
            h.service.join(&room, &params),
            async {
                sleep(Duration::from_millis(10)).await;
                h.transport
                    .link(&room)
                    .unwrap()
                    .emit_state(ConnectionState::Ready);
            }
        );

        assert_eq!(
            first.unwrap().connection_id,
            second.unwrap().connection_id
        );
        assert_eq!(h.transport.open_count(), 1);
        assert!(h.service.is_connected(&room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_while_joining_cancels_join() {
        let h = harness(FakeTransportConfig {
            auto_ready: false,
            ..Default::default()
        });
        let room = room("room-1");
        let params = params();

        let (result, _) = tokio::join!(h.service.join(&room, &params), async {
            sleep(Duration::from_millis(10)).await;
            h.service.leave(&room);
        });

        assert!(matches!(result, Err(VoiceError::Cancelled(_))));
        assert!(!h.service.is_connected(&room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_while_transport_opening_cancels_join() {
        let h = harness(FakeTransportConfig {
            open_delay_ms: 100,
            ..Default::default()
        });
        let room = room("room-1");
        let params = params();

        let (result, _) = tokio::join!(h.service.join(&room, &params), async {
            sleep(Duration::from_millis(10)).await;
            h.service.leave(&room);
        });

        assert!(matches!(result, Err(VoiceError::Cancelled(_))));
        assert!(!h.service.is_connected(&room));
        assert!(h.service.rooms().is_empty());
        assert!(h.transport.link(&room).unwrap().is_destroyed());

        // 之后的 join 不受影响
        h.service.join(&room, &params).await.unwrap();
        assert!(h.service.is_connected(&room));
        assert_eq!(h.transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_join_does_not_wedge_room() {
        let h = harness(FakeTransportConfig {
            auto_ready: false,
            ..Default::default()
        });
        let room = room("room-1");
        let params = params();
        let mut rx = h.publisher.subscribe_global();

        let gave_up =
            tokio::time::timeout(Duration::from_secs(1), h.service.join(&room, &params)).await;
        assert!(gave_up.is_err());
        let link = h.transport.link(&room).unwrap();

        sleep(Duration::from_secs(30)).await;

        assert!(h.service.rooms().is_empty());
        assert!(link.is_destroyed());
        assert!(drain(&mut rx).iter().any(|event| matches!(
            event,
            VoiceEvent::ConnectionClosed {
                reason: CloseReason::ReadyTimeout,
                ..
            }
        )));

        // 新的 join 重新打开传输句柄
        let retry =
            tokio::time::timeout(Duration::from_secs(1), h.service.join(&room, &params)).await;
        assert!(retry.is_err());
        assert_eq!(h.transport.open_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_joins_waking_together_create_one_player() {
        let h = Arc::new(harness(FakeTransportConfig {
            auto_ready: false,
            ..Default::default()
        }));

        for n in 0..8 {
            let room = room(&format!("room-{n}"));
            let mut joins = Vec::new();

            let first = {
                let (h, room) = (h.clone(), room.clone());
                tokio::spawn(async move { h.service.join(&room, &params()).await })
            };
            while h.service.connection_state(&room).is_none() {
                tokio::task::yield_now().await;
            }
            joins.push(first);
            for _ in 0..3 {
                let (h, room) = (h.clone(), room.clone());
                joins.push(tokio::spawn(async move {
                    h.service.join(&room, &params()).await
                }));
            }

            let link = h.transport.link(&room).unwrap();
            link.emit_state(ConnectionState::Ready);
            for join in joins {
                join.await.unwrap().unwrap();
            }

            assert_eq!(link.player_count(), 1);
            assert_eq!(h.transport.open_count(), n + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_destroy_tears_down() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        let mut rx = h.publisher.subscribe_global();
        h.service.join(&room, &params()).await.unwrap();

        h.transport
            .link(&room)
            .unwrap()
            .emit_state(ConnectionState::Destroyed);
        sleep(Duration::from_millis(10)).await;

        assert!(!h.service.is_connected(&room));
        assert!(h.service.rooms().is_empty());
        assert!(drain(&mut rx).iter().any(|event| matches!(
            event,
            VoiceEvent::ConnectionClosed {
                reason: CloseReason::TransportClosed,
                ..
            }
        )));
    }

    // ========== reconnect ==========

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_window_keeps_connection() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let link = h.transport.link(&room).unwrap();

        link.emit_state(ConnectionState::Disconnected);
        sleep(Duration::from_millis(1000)).await;
        assert!(!h.service.is_connected(&room));
        assert_eq!(
            h.service.connection_state(&room),
            Some(ConnectionState::Disconnected)
        );

        link.emit_state(ConnectionState::Connecting);
        // 超过重连窗口后才恢复 Ready，也不应被拆除
        sleep(Duration::from_millis(10_000)).await;
        link.emit_state(ConnectionState::Ready);
        sleep(Duration::from_millis(10)).await;

        assert!(h.service.is_connected(&room));
        assert!(!link.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_window_expiry_destroys_connection() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let link = h.transport.link(&room).unwrap();

        link.emit_state(ConnectionState::Disconnected);
        sleep(Duration::from_millis(6000)).await;

        assert!(!h.service.is_connected(&room));
        assert!(h.service.connection_state(&room).is_none());
        assert!(link.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_failure_does_not_affect_other_room() {
        let h = harness(FakeTransportConfig::default());
        let room_a = room("room-a");
        let room_b = room("room-b");
        let params = params();

        let (a, b) = tokio::join!(
            h.service.join(&room_a, &params),
            h.service.join(&room_b, &params)
        );
        assert!(a.is_ok() && b.is_ok());

        h.transport
            .link(&room_a)
            .unwrap()
            .emit_state(ConnectionState::Disconnected);
        sleep(Duration::from_millis(6000)).await;

        assert!(!h.service.is_connected(&room_a));
        assert!(h.service.is_connected(&room_b));
        assert_eq!(h.service.rooms(), vec![room_b]);
    }

    // ========== playback ==========

    #[tokio::test(start_paused = true)]
    async fn test_play_audio_without_connection_fails() {
        let h = harness(FakeTransportConfig::default());

        let err = h
            .service
            .play_audio(&room("room-1"), &pcm_clip())
            .await
            .unwrap_err();

        assert!(matches!(err, VoiceError::NotConnected(_)));
        assert_eq!(h.transport.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_audio_completes() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let mut rx = h.publisher.subscribe(&room);

        h.service.play_audio(&room, &pcm_clip()).await.unwrap();

        assert!(h.service.is_connected(&room));
        let player = h.transport.link(&room).unwrap().player().unwrap();
        assert_eq!(player.play_count(), 1);
        assert_eq!(player.last_frames(), 5);

        let events = drain(&mut rx);
        assert!(matches!(
            events.first(),
            Some(VoiceEvent::PlaybackStarted { duration_ms: 100, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(VoiceEvent::PlaybackFinished { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_is_reusable_across_calls() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();

        h.service.play_audio(&room, &pcm_clip()).await.unwrap();
        h.service.play_audio(&room, &pcm_clip()).await.unwrap();

        let player = h.transport.link(&room).unwrap().player().unwrap();
        assert_eq!(player.play_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_audio_start_timeout_stops_player() {
        let h = harness(player(FakePlayerBehavior::NeverStarts));
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();

        let err = h.service.play_audio(&room, &pcm_clip()).await.unwrap_err();

        assert!(matches!(
            err,
            VoiceError::PlaybackStartTimeout { timeout_ms: 5000, .. }
        ));
        assert!(err.is_timeout());
        assert!(h.service.is_connected(&room));
        let player = h.transport.link(&room).unwrap().player().unwrap();
        assert_eq!(player.stop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_audio_finish_timeout() {
        let h = harness(player(FakePlayerBehavior::NeverFinishes));
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let mut rx = h.publisher.subscribe(&room);

        let err = h.service.play_audio(&room, &pcm_clip()).await.unwrap_err();

        assert!(matches!(
            err,
            VoiceError::PlaybackTimeout { timeout_ms: 60000, .. }
        ));
        assert!(h.service.is_connected(&room));
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, VoiceEvent::PlaybackFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_play_while_active_is_busy() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();

        let clip = pcm_clip();
        let (first, second) = tokio::join!(
            h.service.play_audio(&room, &clip),
            h.service.play_audio(&room, &clip)
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(VoiceError::PlaybackBusy(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_audio_does_not_touch_player() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();

        let err = h.service.play_audio(&room, &[1, 2, 3]).await.unwrap_err();

        assert!(matches!(err, VoiceError::InvalidAudio(_)));
        let player = h.transport.link(&room).unwrap().player().unwrap();
        assert_eq!(player.play_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_during_playback_settles_call() {
        let h = harness(player(FakePlayerBehavior::NeverFinishes));
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let clip = pcm_clip();

        let (result, _) = tokio::join!(h.service.play_audio(&room, &clip), async {
            sleep(Duration::from_millis(50)).await;
            h.service.leave(&room);
        });

        assert!(matches!(result, Err(VoiceError::Cancelled(_))));
        assert!(!h.service.is_connected(&room));
    }

    // ========== capture ==========

    #[tokio::test(start_paused = true)]
    async fn test_start_receiving_requires_connection() {
        let h = harness(FakeTransportConfig::default());
        let (_, callback) = collector();

        let err = h
            .service
            .start_receiving(&room("room-1"), callback)
            .unwrap_err();
        assert!(matches!(err, VoiceError::NotConnected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_receiving_fails_without_codec() {
        let h = harness_with_codec(
            FakeTransportConfig::default(),
            Arc::new(PassthroughCodec { available: false }),
        );
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let (_, callback) = collector();

        let err = h.service.start_receiving(&room, callback).unwrap_err();
        assert!(matches!(err, VoiceError::CodecUnavailable(_)));
        assert!(!h.service.is_receiving(&room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_utterance_is_discarded() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let mut rx = h.publisher.subscribe(&room);
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for _ in 0..50 {
            link.send_frame(&speaker, vec![1u8; 1000]);
        }
        sleep(Duration::from_millis(2500)).await;

        assert!(captured.lock().unwrap().is_empty());
        assert!(drain(&mut rx).iter().any(|event| matches!(
            event,
            VoiceEvent::UtteranceDiscarded { bytes: 50_000, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_utterance_is_delivered_once_after_silence() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for i in 0..150u8 {
            link.send_frame(&speaker, vec![i; 1000]);
        }

        sleep(Duration::from_millis(1500)).await;
        assert!(captured.lock().unwrap().is_empty());

        sleep(Duration::from_millis(1000)).await;
        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (pcm, user_id) = &captured[0];
        assert_eq!(pcm.len(), 150_000);
        assert_eq!(user_id, &speaker);
        // 按到达顺序拼接
        assert_eq!(pcm[0], 0);
        assert_eq!(pcm[149_999], 149);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frame_is_skipped() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for i in 0..100 {
            if i == 50 {
                link.send_frame(&speaker, vec![0xFF; 1000]);
            }
            link.send_frame(&speaker, vec![1u8; 1000]);
        }
        sleep(Duration::from_millis(2500)).await;

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0.len(), 100_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_drops_session() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let mut rx = h.publisher.subscribe(&room);
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for _ in 0..150 {
            link.send_frame(&speaker, vec![1u8; 1000]);
        }
        link.fail_stream(&speaker, "socket reset");
        sleep(Duration::from_millis(2500)).await;

        assert!(captured.lock().unwrap().is_empty());
        assert!(h.service.is_connected(&room));
        assert!(drain(&mut rx).iter().any(|event| matches!(
            event,
            VoiceEvent::CaptureAborted { error: Some(_), .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_finalizes_without_waiting_for_silence() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for _ in 0..120 {
            link.send_frame(&speaker, vec![1u8; 1000]);
        }
        link.end_stream(&speaker);
        sleep(Duration::from_millis(10)).await;

        assert_eq!(captured.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_utterances_from_one_user() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let mut rx = h.publisher.subscribe(&room);
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for _ in 0..120 {
            link.send_frame(&speaker, vec![1u8; 1000]);
        }
        link.end_stream(&speaker);
        link.start_speaking(&speaker);
        for _ in 0..120 {
            link.send_frame(&speaker, vec![2u8; 1000]);
        }
        sleep(Duration::from_millis(2500)).await;

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].0.len(), 120_000);
        assert_eq!(captured[0].0[0], 1);
        assert_eq!(captured[1].0.len(), 120_000);
        assert_eq!(captured[1].0[0], 2);

        let frames: Vec<usize> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                VoiceEvent::UtteranceCaptured {
                    frames,
                    started_at,
                    ended_at,
                    ..
                } => {
                    assert!(started_at <= ended_at);
                    Some(frames)
                }
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![120, 120]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_receiving_abandons_open_utterance() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for _ in 0..150 {
            link.send_frame(&speaker, vec![1u8; 1000]);
        }
        sleep(Duration::from_millis(500)).await;

        h.service.stop_receiving(&room);
        assert!(!h.service.is_receiving(&room));
        sleep(Duration::from_millis(3000)).await;

        assert!(captured.lock().unwrap().is_empty());
        assert!(h.service.is_connected(&room));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_abandons_open_utterance() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for _ in 0..150 {
            link.send_frame(&speaker, vec![1u8; 1000]);
        }
        sleep(Duration::from_millis(500)).await;

        h.service.leave(&room);
        sleep(Duration::from_millis(3000)).await;

        assert!(captured.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_subscribers_see_aborts_before_close() {
        let h = harness(FakeTransportConfig::default());
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let mut rx = h.publisher.subscribe(&room);
        let (_, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        link.start_speaking(&speaker);
        for _ in 0..10 {
            link.send_frame(&speaker, vec![1u8; 1000]);
        }
        sleep(Duration::from_millis(100)).await;

        h.service.leave(&room);
        assert_eq!(h.publisher.room_channel_count(), 0);

        let events = drain(&mut rx);
        let aborted = events.iter().position(|event| {
            matches!(event, VoiceEvent::CaptureAborted { error: None, .. })
        });
        let closed = events
            .iter()
            .position(|event| matches!(event, VoiceEvent::ConnectionClosed { .. }));
        assert!(aborted.unwrap() < closed.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_during_playback_is_not_captured() {
        let h = harness(player(FakePlayerBehavior::Normal { play_ms: 4000 }));
        let room = room("room-1");
        h.service.join(&room, &params()).await.unwrap();
        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();
        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        let clip = pcm_clip();

        let (played, _) = tokio::join!(h.service.play_audio(&room, &clip), async {
            sleep(Duration::from_millis(10)).await;
            link.start_speaking(&speaker);
            for _ in 0..150 {
                link.send_frame(&speaker, vec![1u8; 1000]);
            }
            sleep(Duration::from_millis(3000)).await;
        });

        assert!(played.is_ok());
        assert!(captured.lock().unwrap().is_empty());
    }

    // ========== end to end ==========

    #[tokio::test(start_paused = true)]
    async fn test_join_play_and_capture_with_opus() {
        let codec: Arc<dyn FrameCodecPort> = Arc::new(OpusFrameCodec::default());
        let h = harness_with_codec(FakeTransportConfig::default(), codec.clone());
        let room = room("room-1");

        h.service.join(&room, &params()).await.unwrap();
        h.service.play_audio(&room, &pcm_clip()).await.unwrap();

        let (captured, callback) = collector();
        h.service.start_receiving(&room, callback).unwrap();

        let link = h.transport.link(&room).unwrap();
        let speaker = user("user-u");
        let mut encoder = codec.new_encoder().unwrap();
        let silence = vec![0u8; encoder.frame_bytes()];
        link.start_speaking(&speaker);
        for _ in 0..30 {
            let frame = encoder.encode(&silence).unwrap();
            link.send_frame(&speaker, frame);
        }
        sleep(Duration::from_millis(2500)).await;

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        // 30 帧 * 20ms @ 48kHz 立体声
        assert_eq!(captured[0].0.len(), 30 * 3840);
        assert_eq!(captured[0].1, speaker);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_leaves_every_room() {
        let h = harness(FakeTransportConfig::default());
        h.service.join(&room("room-a"), &params()).await.unwrap();
        h.service.join(&room("room-b"), &params()).await.unwrap();
        assert_eq!(h.service.rooms().len(), 2);

        h.service.shutdown();

        assert!(h.service.rooms().is_empty());
        assert!(h.transport.link(&room("room-a")).unwrap().is_destroyed());
        assert!(h.transport.link(&room("room-b")).unwrap().is_destroyed());
    }
}
