//! Playback Controller - 单房间出站播放
//!
//! 一次只允许一个资源处于播放中；调用方负责多段音频的排序。
//! 播放完成以播放器回到 Idle 为准，保证房间在自身发声期间不采集新的语音。

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use super::connection::RoomConnection;
use super::lifecycle::closed_error;
use crate::application::error::VoiceError;
use crate::application::ports::{AudioPlayer, PlayerSession, VoiceEvent, VoiceEventSinkPort};
use crate::config::PlaybackConfig;
use crate::domain::room::{PlayerState, RoomId};
use crate::domain::AudioResource;

/// 播放控制器
pub struct PlaybackController {
    room_id: RoomId,
    player: Arc<dyn AudioPlayer>,
    /// 播放器事件接收端，同时充当"单一活动播放"的互斥锁
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<PlayerState>>,
    state: Mutex<PlayerState>,
    config: PlaybackConfig,
    event_sink: Arc<dyn VoiceEventSinkPort>,
}

impl PlaybackController {
    pub fn new(
        room_id: RoomId,
        session: PlayerSession,
        config: PlaybackConfig,
        event_sink: Arc<dyn VoiceEventSinkPort>,
    ) -> Self {
        Self {
            room_id,
            player: session.player,
            events: tokio::sync::Mutex::new(session.events),
            state: Mutex::new(PlayerState::Idle),
            config,
            event_sink,
        }
    }

    /// 最近一次观察到的播放器状态
    pub fn state(&self) -> PlayerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 停止播放器（连接拆除时调用）
    pub(crate) fn shutdown(&self) {
        self.player.stop();
        tracing::debug!(room_id = %self.room_id, "Player stopped");
    }

    /// 播放资源并等待其完成
    ///
    /// 1. 指示播放器播放
    /// 2. start_timeout 内等待 Playing
    /// 3. finish_timeout 内等待回到 Idle
    pub async fn play(
        &self,
        connection: &RoomConnection,
        resource: AudioResource,
    ) -> Result<(), VoiceError> {
        let Ok(mut events) = self.events.try_lock() else {
            tracing::debug!(
                room_id = %self.room_id,
                state = self.state().as_str(),
                "Playback already active"
            );
            return Err(VoiceError::PlaybackBusy(self.room_id.clone()));
        };

        let result = self.run(connection, &mut events, resource).await;

        if let Err(e) = &result {
            tracing::warn!(room_id = %self.room_id, error = %e, "Playback failed");
            self.event_sink.publish(VoiceEvent::PlaybackFailed {
                room_id: self.room_id.to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn run(
        &self,
        connection: &RoomConnection,
        events: &mut mpsc::UnboundedReceiver<PlayerState>,
        resource: AudioResource,
    ) -> Result<(), VoiceError> {
        // 丢弃上一次播放遗留的状态事件
        while let Ok(state) = events.try_recv() {
            self.record(state);
        }

        let duration_ms = resource.duration_ms();
        let frames = resource.frame_count();
        self.player.play(resource)?;

        let _playing = PlayingFlag::raise(connection);
        let started_at = Instant::now();

        tokio::select! {
            biased;
            _ = connection.cancellation().cancelled() => return Err(closed_error(connection)),
            result = timeout(self.config.start_timeout(), self.wait_for(events, PlayerState::Playing)) => {
                match result {
                    Ok(outcome) => outcome?,
                    Err(_) => {
                        self.player.stop();
                        return Err(VoiceError::PlaybackStartTimeout {
                            room_id: self.room_id.clone(),
                            timeout_ms: self.config.start_timeout_ms,
                        });
                    }
                }
            }
        }

        tracing::debug!(
            room_id = %self.room_id,
            frames = frames,
            duration_ms = duration_ms,
            "Playback started"
        );
        self.event_sink.publish(VoiceEvent::PlaybackStarted {
            room_id: self.room_id.to_string(),
            duration_ms,
        });

        tokio::select! {
            biased;
            _ = connection.cancellation().cancelled() => return Err(closed_error(connection)),
            result = timeout(self.config.finish_timeout(), self.wait_for(events, PlayerState::Idle)) => {
                match result {
                    Ok(outcome) => outcome?,
                    Err(_) => {
                        self.player.stop();
                        return Err(VoiceError::PlaybackTimeout {
                            room_id: self.room_id.clone(),
                            timeout_ms: self.config.finish_timeout_ms,
                        });
                    }
                }
            }
        }

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        tracing::info!(room_id = %self.room_id, elapsed_ms = elapsed_ms, "Playback finished");
        self.event_sink.publish(VoiceEvent::PlaybackFinished {
            room_id: self.room_id.to_string(),
            elapsed_ms,
        });
        Ok(())
    }

    /// 等待播放器报告目标状态；事件流关闭视为播放器已随连接销毁
    async fn wait_for(
        &self,
        events: &mut mpsc::UnboundedReceiver<PlayerState>,
        target: PlayerState,
    ) -> Result<(), VoiceError> {
        while let Some(state) = events.recv().await {
            self.record(state);
            if state == target {
                return Ok(());
            }
        }
        Err(VoiceError::NotConnected(self.room_id.clone()))
    }

    fn record(&self, state: PlayerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            tracing::trace!(room_id = %self.room_id, state = state.as_str(), "Player state");
            *current = state;
        }
    }
}

/// 播放期间标记房间正在发声，离开作用域时清除
struct PlayingFlag<'a> {
    connection: &'a RoomConnection,
}

impl<'a> PlayingFlag<'a> {
    fn raise(connection: &'a RoomConnection) -> Self {
        connection.set_playing(true);
        Self { connection }
    }
}

impl Drop for PlayingFlag<'_> {
    fn drop(&mut self) {
        self.connection.set_playing(false);
    }
}
