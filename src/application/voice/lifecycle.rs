//! Connection Lifecycle - 连接生命周期状态机
//!
//! - join: 获取传输句柄，注册连接，在 ready_timeout 内等待 Ready
//! - 每个房间一个协调任务，按顺序消费传输事件并执行状态迁移
//! - 协调任务自身执行 ready_timeout：调用方放弃等待也不会留下半建立的连接
//! - 断线后在 reconnect_timeout 内等待进入 Signalling / Connecting，否则拆除
//! - leave: 幂等拆除；也会取消仍在打开传输句柄的 join

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::capture::CaptureSegmenter;
use super::connection::RoomConnection;
use super::registry::ConnectionRegistryPort;
use crate::application::error::VoiceError;
use crate::application::ports::{
    LinkEvent, TransportError, TransportPort, VoiceEvent, VoiceEventSinkPort,
};
use crate::config::ConnectionConfig;
use crate::domain::room::{CloseReason, ConnectionState, RoomId, TransportParams};

/// 连接生命周期管理
pub struct ConnectionLifecycle {
    config: ConnectionConfig,
    transport: Arc<dyn TransportPort>,
    registry: Arc<dyn ConnectionRegistryPort>,
    capture: Arc<CaptureSegmenter>,
    event_sink: Arc<dyn VoiceEventSinkPort>,
    /// 每个房间的 leave 次数；join 在注册后比对，发现期间有 leave 即放弃
    leave_generations: DashMap<RoomId, u64>,
}

impl ConnectionLifecycle {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn TransportPort>,
        registry: Arc<dyn ConnectionRegistryPort>,
        capture: Arc<CaptureSegmenter>,
        event_sink: Arc<dyn VoiceEventSinkPort>,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
            capture,
            event_sink,
            leave_generations: DashMap::new(),
        }
    }

    /// 加入房间并等待 Ready
    ///
    /// 房间已有连接时不会再打开新的传输句柄，而是等待已有连接
    pub async fn join(
        self: &Arc<Self>,
        room_id: &RoomId,
        params: &TransportParams,
    ) -> Result<Arc<RoomConnection>, VoiceError> {
        if let Some(existing) = self.registry.get(room_id) {
            tracing::debug!(room_id = %room_id, "Room already registered, awaiting existing connection");
            return self.await_ready(&existing).await.map(|_| existing);
        }

        let generation = self.leave_generation(room_id);
        let session = self.transport.open(room_id, params).await?;
        let connection = Arc::new(RoomConnection::new(room_id.clone(), session.link));

        if let Err(existing) = self.registry.register(connection.clone()) {
            tracing::debug!(room_id = %room_id, "Concurrent join won the race, dropping fresh link");
            connection.teardown(CloseReason::Superseded);
            return self.await_ready(&existing).await.map(|_| existing);
        }

        // 注册先于读取：leave 要么在这里被发现，要么能在注册表里找到本连接
        if self.leave_generation(room_id) != generation {
            tracing::info!(room_id = %room_id, "Room left while transport was opening");
            self.destroy(&connection, CloseReason::Left);
            return Err(VoiceError::Cancelled(room_id.clone()));
        }

        tracing::info!(
            room_id = %room_id,
            connection_id = %connection.connection_id(),
            channel_id = %params.channel_id,
            "Connection registered"
        );

        tokio::spawn(self.clone().drive(connection.clone(), session.events));

        match self.await_ready(&connection).await {
            Ok(()) => Ok(connection),
            Err(e) => {
                if matches!(e, VoiceError::ConnectTimeout { .. }) {
                    self.destroy(&connection, CloseReason::ReadyTimeout);
                }
                Err(e)
            }
        }
    }

    /// 离开房间（幂等）
    ///
    /// 返回是否拆除了已注册的连接；正在打开传输句柄的 join 同样会被取消
    pub fn leave(&self, room_id: &RoomId) -> bool {
        *self.leave_generations.entry(room_id.clone()).or_insert(0) += 1;

        match self.registry.unregister(room_id) {
            Some(connection) => {
                self.close(&connection, CloseReason::Left);
                true
            }
            None => {
                tracing::debug!(room_id = %room_id, "Leave on unregistered room ignored");
                false
            }
        }
    }

    /// 注销并拆除连接
    pub(crate) fn destroy(&self, connection: &Arc<RoomConnection>, reason: CloseReason) {
        self.registry
            .unregister_if(connection.room_id(), connection.connection_id());
        self.close(connection, reason);
    }

    fn leave_generation(&self, room_id: &RoomId) -> u64 {
        self.leave_generations
            .get(room_id)
            .map(|generation| *generation)
            .unwrap_or(0)
    }

    fn close(&self, connection: &RoomConnection, reason: CloseReason) {
        if connection.teardown(reason) {
            self.event_sink.publish(VoiceEvent::ConnectionClosed {
                room_id: connection.room_id().to_string(),
                connection_id: connection.connection_id().to_string(),
                reason,
            });
            self.event_sink.room_closed(connection.room_id());
        }
    }

    /// 在 ready_timeout 内等待连接进入 Ready
    async fn await_ready(&self, connection: &RoomConnection) -> Result<(), VoiceError> {
        let room_id = connection.room_id().clone();
        let mut status = connection.subscribe_status();

        let wait_ready = async {
            loop {
                let state = status.borrow_and_update().state();
                match state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Destroyed => break,
                    _ => {}
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
            Err(VoiceError::Transport(TransportError::Closed(format!(
                "connection to room {} destroyed before ready",
                room_id
            ))))
        };

        tokio::select! {
            biased;
            _ = connection.cancellation().cancelled() => Err(self.wait_error(connection)),
            result = tokio::time::timeout(self.config.ready_timeout(), wait_ready) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::warn!(
                            room_id = %connection.room_id(),
                            timeout_ms = self.config.ready_timeout_ms,
                            "Connection not ready in time"
                        );
                        Err(self.connect_timeout(connection.room_id()))
                    }
                }
            }
        }
    }

    /// 协调任务因 ready_timeout 拆除的连接，对等待方仍报告连接超时
    fn wait_error(&self, connection: &RoomConnection) -> VoiceError {
        match connection.close_reason() {
            Some(CloseReason::ReadyTimeout) => self.connect_timeout(connection.room_id()),
            _ => closed_error(connection),
        }
    }

    fn connect_timeout(&self, room_id: &RoomId) -> VoiceError {
        VoiceError::ConnectTimeout {
            room_id: room_id.clone(),
            timeout_ms: self.config.ready_timeout_ms,
        }
    }

    /// 房间协调任务：顺序消费传输事件，唯一的状态写入者
    async fn drive(
        self: Arc<Self>,
        connection: Arc<RoomConnection>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let room_id = connection.room_id().clone();
        let mut ready_deadline = Some(Instant::now() + self.config.ready_timeout());
        let mut reconnect_deadline: Option<Instant> = None;

        tracing::debug!(room_id = %room_id, "Room coordinator started");

        loop {
            tokio::select! {
                biased;
                _ = connection.cancellation().cancelled() => break,
                _ = deadline_elapsed(ready_deadline) => {
                    tracing::warn!(
                        room_id = %room_id,
                        timeout_ms = self.config.ready_timeout_ms,
                        "Connection never became ready, dropping connection"
                    );
                    self.destroy(&connection, CloseReason::ReadyTimeout);
                    break;
                }
                _ = deadline_elapsed(reconnect_deadline) => {
                    tracing::warn!(
                        room_id = %room_id,
                        window_ms = self.config.reconnect_timeout_ms,
                        "Reconnect did not start in time, dropping connection"
                    );
                    self.destroy(&connection, CloseReason::ReconnectExpired);
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!(room_id = %room_id, "Transport event stream closed");
                        self.destroy(&connection, CloseReason::TransportClosed);
                        break;
                    };
                    match event {
                        LinkEvent::StateChanged(next) => {
                            if next == ConnectionState::Destroyed {
                                self.destroy(&connection, CloseReason::TransportClosed);
                                break;
                            }
                            if let Some(previous) = self.on_state_changed(&connection, next) {
                                if next == ConnectionState::Ready {
                                    ready_deadline = None;
                                }
                                reconnect_deadline = next_deadline(
                                    reconnect_deadline,
                                    previous,
                                    next,
                                    self.config.reconnect_timeout(),
                                );
                            }
                        }
                        LinkEvent::SpeakingStarted(user_id) => {
                            self.capture.on_speaking_started(&connection, user_id);
                        }
                    }
                }
            }
        }

        tracing::debug!(room_id = %room_id, "Room coordinator stopped");
    }

    fn on_state_changed(
        &self,
        connection: &RoomConnection,
        next: ConnectionState,
    ) -> Option<ConnectionState> {
        match connection.apply_transition(next) {
            Ok(Some(previous)) => {
                tracing::info!(
                    room_id = %connection.room_id(),
                    from = %previous,
                    to = %next,
                    "Connection state changed"
                );
                self.event_sink.publish(VoiceEvent::ConnectionStateChanged {
                    room_id: connection.room_id().to_string(),
                    connection_id: connection.connection_id().to_string(),
                    from: previous,
                    to: next,
                    changed_at: connection.last_state_change_at(),
                });
                Some(previous)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(room_id = %connection.room_id(), error = %e, "Ignoring transport state");
                None
            }
        }
    }
}

/// 根据迁移计算新的重连截止时间
///
/// - 进入 Disconnected: 开始计时
/// - 计时中进入 Signalling / Connecting: 重连已开始，停止计时
fn next_deadline(
    current: Option<Instant>,
    previous: ConnectionState,
    next: ConnectionState,
    window: Duration,
) -> Option<Instant> {
    match next {
        ConnectionState::Disconnected => Some(Instant::now() + window),
        state if state.is_reconnecting() && previous == ConnectionState::Disconnected => {
            tracing::info!(state = %state, "Reconnect in progress");
            None
        }
        _ => current,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 连接在等待期间被拆除时返回给调用方的错误
pub(crate) fn closed_error(connection: &RoomConnection) -> VoiceError {
    match connection.close_reason() {
        Some(CloseReason::Left) | None => VoiceError::Cancelled(connection.room_id().clone()),
        Some(reason) => VoiceError::Transport(TransportError::Closed(format!(
            "connection to room {} closed: {}",
            connection.room_id(),
            reason
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_starts_on_disconnect_and_clears_on_reconnect() {
        let window = Duration::from_secs(5);
        let deadline = next_deadline(
            None,
            ConnectionState::Ready,
            ConnectionState::Disconnected,
            window,
        );
        assert!(deadline.is_some());

        let cleared = next_deadline(
            deadline,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            window,
        );
        assert!(cleared.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_kept_for_unrelated_transitions() {
        let window = Duration::from_secs(5);
        let deadline = Some(Instant::now() + window);
        assert_eq!(
            next_deadline(deadline, ConnectionState::Signalling, ConnectionState::Connecting, window),
            deadline
        );
    }
}
