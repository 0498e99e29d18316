//! Event Publisher Implementation
//!
//! 基于 broadcast 的语音事件推送实现

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::application::ports::{VoiceEvent, VoiceEventSinkPort};
use crate::domain::room::RoomId;

const CHANNEL_CAPACITY: usize = 100;

/// 事件发布器
pub struct EventPublisher {
    /// room_id -> broadcast sender (for room-specific events)
    room_channels: DashMap<String, broadcast::Sender<VoiceEvent>>,
    /// Global broadcast channel, receives every event
    global_channel: broadcast::Sender<VoiceEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        let (global_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            room_channels: DashMap::new(),
            global_channel: global_tx,
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// 订阅全部房间的事件
    pub fn subscribe_global(&self) -> broadcast::Receiver<VoiceEvent> {
        self.global_channel.subscribe()
    }

    /// 订阅指定房间的事件（通道按需创建）
    pub fn subscribe(&self, room_id: &RoomId) -> broadcast::Receiver<VoiceEvent> {
        self.room_channels
            .entry(room_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// 当前持有事件通道的房间数
    pub fn room_channel_count(&self) -> usize {
        self.room_channels.len()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceEventSinkPort for EventPublisher {
    fn publish(&self, event: VoiceEvent) {
        if let Some(sender) = self.room_channels.get(event.room_id()) {
            if let Err(e) = sender.send(event.clone()) {
                tracing::trace!(
                    room_id = %event.room_id(),
                    error = %e,
                    "Failed to publish room event (no receivers)"
                );
            }
        }

        if let Err(e) = self.global_channel.send(event) {
            tracing::trace!(error = %e, "Failed to publish global event (no receivers)");
        }
    }

    fn room_closed(&self, room_id: &RoomId) {
        if self.room_channels.remove(room_id.as_str()).is_some() {
            tracing::debug!(room_id = %room_id, "Room event channel released");
        }
    }
}
