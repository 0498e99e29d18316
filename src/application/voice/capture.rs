//! Capture Segmenter - 入站语音分段
//!
//! 每个说话事件打开一个订阅和一个全新的解码器；
//! 静音超过 silence_timeout 或流结束时拼接并按最短时长过滤。

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use super::connection::RoomConnection;
use crate::application::error::VoiceError;
use crate::application::ports::{
    FrameCodecPort, FrameDecoder, FrameStream, TransportLink, VoiceEvent, VoiceEventSinkPort,
};
use crate::config::CaptureConfig;
use crate::domain::capture::SpeakerBuffer;
use crate::domain::room::{RoomId, UserId};
use crate::domain::PcmFormat;

/// 语音回调：`(拼接后的 PCM, 说话人)`
pub type UtteranceCallback = Arc<dyn Fn(Vec<u8>, UserId) + Send + Sync>;

/// 正在累积的说话人
struct SpeakerSlot {
    started_at: DateTime<Utc>,
    /// 上一段尚未结束时又收到说话事件，结束后立即重新订阅
    restart: bool,
}

impl SpeakerSlot {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            restart: false,
        }
    }
}

#[derive(Default)]
struct Speakers {
    closed: bool,
    active: HashMap<UserId, SpeakerSlot>,
}

/// 说话事件的登记结果
enum Claim {
    Started,
    /// 同一用户的上一段仍在结束中
    Deferred,
    Closed,
}

/// 采集任务结束时的登记结果
enum Release {
    Done,
    Restart,
    /// 条目已被 abandon 收走，终止事件也已由其发布
    Abandoned,
}

/// 房间级采集注册
///
/// 不变量:
/// - 同一用户同时只有一个采集任务
/// - 移除说话人条目的一方负责结束该会话；abandon 在同一把锁内关闭登记并收走所有条目
pub struct CaptureSession {
    room_id: RoomId,
    callback: UtteranceCallback,
    cancel: CancellationToken,
    speakers: Mutex<Speakers>,
    event_sink: Arc<dyn VoiceEventSinkPort>,
}

impl CaptureSession {
    fn new(
        room_id: RoomId,
        callback: UtteranceCallback,
        cancel: CancellationToken,
        event_sink: Arc<dyn VoiceEventSinkPort>,
    ) -> Self {
        Self {
            room_id,
            callback,
            cancel,
            speakers: Mutex::new(Speakers::default()),
            event_sink,
        }
    }

    /// 放弃所有进行中的会话，不触发回调
    ///
    /// 返回前同步发布每个说话人的 CaptureAborted
    pub(crate) fn abandon(&self) -> usize {
        let drained: Vec<(UserId, SpeakerSlot)> = {
            let mut speakers = self.speakers();
            if speakers.closed {
                return 0;
            }
            speakers.closed = true;
            self.cancel.cancel();
            std::mem::take(&mut speakers.active).into_iter().collect()
        };

        for (user_id, slot) in &drained {
            tracing::debug!(
                room_id = %self.room_id,
                user_id = %user_id,
                started_at = %slot.started_at,
                "Capture abandoned"
            );
            self.event_sink.publish(VoiceEvent::CaptureAborted {
                room_id: self.room_id.to_string(),
                user_id: user_id.to_string(),
                error: None,
            });
        }
        drained.len()
    }

    pub fn active_speakers(&self) -> usize {
        self.speakers().active.len()
    }

    fn claim(&self, user_id: &UserId) -> Claim {
        let mut speakers = self.speakers();
        if speakers.closed {
            return Claim::Closed;
        }
        match speakers.active.get_mut(user_id) {
            Some(slot) => {
                slot.restart = true;
                Claim::Deferred
            }
            None => {
                speakers.active.insert(user_id.clone(), SpeakerSlot::new());
                Claim::Started
            }
        }
    }

    fn release(&self, user_id: &UserId) -> Release {
        let mut speakers = self.speakers();
        let restart = match speakers.active.get_mut(user_id) {
            None => return Release::Abandoned,
            Some(slot) if slot.restart => {
                *slot = SpeakerSlot::new();
                true
            }
            Some(_) => false,
        };

        if restart {
            Release::Restart
        } else {
            speakers.active.remove(user_id);
            Release::Done
        }
    }

    fn forget(&self, user_id: &UserId) {
        self.speakers().active.remove(user_id);
    }

    fn speakers(&self) -> MutexGuard<'_, Speakers> {
        self.speakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 会话结束方式
enum SessionEnd {
    /// 静音超时
    Silence,
    /// 传输层结束了该用户的帧流
    StreamEnded,
    /// 流错误，不交付
    StreamFailed(String),
    /// stop_receiving / leave
    Abandoned,
}

/// 采集分段器
pub struct CaptureSegmenter {
    codec: Arc<dyn FrameCodecPort>,
    config: CaptureConfig,
    event_sink: Arc<dyn VoiceEventSinkPort>,
}

impl CaptureSegmenter {
    pub fn new(
        codec: Arc<dyn FrameCodecPort>,
        config: CaptureConfig,
        event_sink: Arc<dyn VoiceEventSinkPort>,
    ) -> Self {
        Self {
            codec,
            config,
            event_sink,
        }
    }

    pub fn pcm_format(&self) -> PcmFormat {
        self.codec.format()
    }

    /// 开始接收房间的入站语音
    ///
    /// 编解码器是必需能力：无法创建解码器时立即失败，而不是退化为原始字节
    pub fn start_receiving(
        &self,
        connection: &RoomConnection,
        callback: UtteranceCallback,
    ) -> Result<(), VoiceError> {
        if !connection.is_connected() {
            return Err(VoiceError::NotConnected(connection.room_id().clone()));
        }

        self.codec
            .new_decoder()
            .map_err(|e| VoiceError::CodecUnavailable(e.to_string()))?;

        let session = Arc::new(CaptureSession::new(
            connection.room_id().clone(),
            callback,
            connection.cancellation().child_token(),
            self.event_sink.clone(),
        ));
        if !connection.install_capture(session) {
            return Err(VoiceError::NotConnected(connection.room_id().clone()));
        }

        tracing::info!(room_id = %connection.room_id(), "Receiving started");
        Ok(())
    }

    /// 停止接收；进行中的会话直接放弃
    pub fn stop_receiving(&self, connection: &RoomConnection) {
        if let Some(session) = connection.take_capture() {
            let abandoned = session.abandon();
            tracing::info!(
                room_id = %connection.room_id(),
                abandoned = abandoned,
                "Receiving stopped"
            );
        }
    }

    /// 处理说话开始事件（由房间协调任务调用）
    pub(crate) fn on_speaking_started(self: &Arc<Self>, connection: &RoomConnection, user_id: UserId) {
        let room_id = connection.room_id();
        let Some(session) = connection.capture() else {
            tracing::trace!(room_id = %room_id, user_id = %user_id, "Not receiving, speaking ignored");
            return;
        };

        if self.config.suppress_during_playback && connection.is_playing() {
            tracing::debug!(room_id = %room_id, user_id = %user_id, "Speaking during playback ignored");
            return;
        }

        match session.claim(&user_id) {
            Claim::Started => self.open_speaker(connection.link().clone(), session, user_id),
            Claim::Deferred => {
                tracing::debug!(
                    room_id = %room_id,
                    user_id = %user_id,
                    "Previous utterance still finishing, resubscribing afterwards"
                );
            }
            Claim::Closed => {}
        }
    }

    /// 订阅说话人帧流并启动采集任务；调用方已登记该说话人
    fn open_speaker(
        self: &Arc<Self>,
        link: Arc<dyn TransportLink>,
        session: Arc<CaptureSession>,
        user_id: UserId,
    ) {
        let room_id = session.room_id.clone();

        let stream = match link.subscribe_speaker(&user_id) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(room_id = %room_id, user_id = %user_id, error = %e, "Subscribe failed");
                session.forget(&user_id);
                return;
            }
        };

        let decoder = match self.codec.new_decoder() {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::error!(room_id = %room_id, user_id = %user_id, error = %e, "Decoder unavailable");
                session.forget(&user_id);
                return;
            }
        };

        self.event_sink.publish(VoiceEvent::CaptureStarted {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        });

        let task = SpeakerTask {
            segmenter: self.clone(),
            link,
            session,
            user_id,
            decoder,
        };
        tokio::spawn(task.run(stream));
    }
}

/// 单说话人采集任务
struct SpeakerTask {
    segmenter: Arc<CaptureSegmenter>,
    link: Arc<dyn TransportLink>,
    session: Arc<CaptureSession>,
    user_id: UserId,
    decoder: Box<dyn FrameDecoder>,
}

impl SpeakerTask {
    async fn run(mut self, mut stream: FrameStream) {
        let mut buffer = SpeakerBuffer::new(self.user_id.clone());
        let cancel = self.session.cancel.clone();
        let silence = self.segmenter.config.silence_timeout();

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Abandoned,
                next = tokio::time::timeout(silence, stream.next()) => next,
            };

            match next {
                Err(_) => break SessionEnd::Silence,
                Ok(None) => break SessionEnd::StreamEnded,
                Ok(Some(Err(e))) => break SessionEnd::StreamFailed(e.to_string()),
                Ok(Some(Ok(frame))) => match self.decoder.decode(&frame) {
                    Ok(pcm) => buffer.push(pcm),
                    Err(e) => {
                        buffer.skip_frame();
                        tracing::debug!(
                            room_id = %self.session.room_id,
                            user_id = %self.user_id,
                            error = %e,
                            "Skipping undecodable frame"
                        );
                    }
                },
            }
        };

        drop(stream);
        let release = self.session.release(&self.user_id);
        match release {
            Release::Abandoned => {}
            Release::Done => self.finish(buffer, end),
            Release::Restart => {
                self.finish(buffer, end);
                let SpeakerTask {
                    segmenter,
                    link,
                    session,
                    user_id,
                    ..
                } = self;
                segmenter.open_speaker(link, session, user_id);
            }
        }
    }

    fn finish(&self, buffer: SpeakerBuffer, end: SessionEnd) {
        let room_id = self.session.room_id.to_string();
        let user_id = self.user_id.to_string();
        let event_sink = &self.segmenter.event_sink;

        match end {
            SessionEnd::Abandoned => {
                tracing::debug!(room_id = %room_id, user_id = %user_id, bytes = buffer.len(), "Capture abandoned");
                event_sink.publish(VoiceEvent::CaptureAborted {
                    room_id,
                    user_id,
                    error: None,
                });
            }
            SessionEnd::StreamFailed(error) => {
                tracing::warn!(room_id = %room_id, user_id = %user_id, error = %error, "Capture stream failed");
                event_sink.publish(VoiceEvent::CaptureAborted {
                    room_id,
                    user_id,
                    error: Some(error),
                });
            }
            SessionEnd::Silence | SessionEnd::StreamEnded => {
                // 回调前再检查一次，stop_receiving 与静音超时可能同时发生
                if self.session.cancel.is_cancelled() {
                    return;
                }
                let skipped = buffer.skipped_frames();
                let format = self.segmenter.codec.format();
                match buffer.finalize(self.segmenter.config.min_utterance_bytes()) {
                    Ok(utterance) => {
                        let bytes = utterance.pcm.len();
                        let duration_ms = format.duration_ms(bytes);
                        tracing::info!(
                            room_id = %room_id,
                            user_id = %user_id,
                            bytes = bytes,
                            duration_ms = duration_ms,
                            skipped_frames = skipped,
                            "Utterance captured"
                        );
                        (self.session.callback)(utterance.pcm, utterance.user_id);
                        event_sink.publish(VoiceEvent::UtteranceCaptured {
                            room_id,
                            user_id,
                            bytes,
                            duration_ms,
                            frames: utterance.frame_count,
                            started_at: utterance.started_at,
                            ended_at: utterance.ended_at,
                        });
                    }
                    Err(bytes) => {
                        tracing::debug!(
                            room_id = %room_id,
                            user_id = %user_id,
                            bytes = bytes,
                            "Utterance too short, discarded as noise"
                        );
                        event_sink.publish(VoiceEvent::UtteranceDiscarded {
                            room_id,
                            user_id,
                            bytes,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::EventPublisher;

    fn session(publisher: Arc<EventPublisher>) -> CaptureSession {
        let callback: UtteranceCallback = Arc::new(|_: Vec<u8>, _: UserId| {});
        CaptureSession::new(
            RoomId::new("room-1").unwrap(),
            callback,
            CancellationToken::new(),
            publisher,
        )
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn test_repeat_speaking_restarts_after_release() {
        let session = session(EventPublisher::new().arc());
        let speaker = user("user-u");

        assert!(matches!(session.claim(&speaker), Claim::Started));
        assert!(matches!(session.claim(&speaker), Claim::Deferred));
        assert_eq!(session.active_speakers(), 1);

        assert!(matches!(session.release(&speaker), Release::Restart));
        assert_eq!(session.active_speakers(), 1);
        assert!(matches!(session.release(&speaker), Release::Done));
        assert_eq!(session.active_speakers(), 0);
    }

    #[tokio::test]
    async fn test_abandon_drains_speakers_and_publishes_aborts() {
        let publisher = EventPublisher::new().arc();
        let mut rx = publisher.subscribe_global();
        let session = session(publisher.clone());
        let (a, b) = (user("user-a"), user("user-b"));
        session.claim(&a);
        session.claim(&b);

        assert_eq!(session.abandon(), 2);
        assert!(session.cancel.is_cancelled());
        assert!(matches!(session.claim(&a), Claim::Closed));
        assert!(matches!(session.release(&b), Release::Abandoned));
        assert_eq!(session.abandon(), 0);

        let mut aborted = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, VoiceEvent::CaptureAborted { error: None, .. }));
            aborted += 1;
        }
        assert_eq!(aborted, 2);
    }
}
