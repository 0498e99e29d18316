//! Room Connection - 单个房间的连接资源
//!
//! 由注册表独占持有；播放器与采集会话挂在连接上，随连接一起销毁

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::capture::CaptureSession;
use super::playback::PlaybackController;
use crate::application::ports::{PlayerSession, TransportError, TransportLink};
use crate::domain::room::{
    CloseReason, ConnectionId, ConnectionState, ConnectionStatus, RoomError, RoomId,
};

/// join 成功后返回给调用方的连接句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHandle {
    pub room_id: RoomId,
    pub connection_id: ConnectionId,
    pub created_at: DateTime<Utc>,
}

/// 房间连接
///
/// 不变量:
/// - 拆除只执行一次，之后状态恒为 Destroyed
/// - 播放器 / 采集会话不会在拆除后重新挂载
pub struct RoomConnection {
    room_id: RoomId,
    connection_id: ConnectionId,
    created_at: DateTime<Utc>,
    link: Arc<dyn TransportLink>,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    player: Mutex<Option<Arc<PlaybackController>>>,
    capture: Mutex<Option<Arc<CaptureSession>>>,
    playing: AtomicBool,
    close_reason: OnceLock<CloseReason>,
}

impl RoomConnection {
    pub fn new(room_id: RoomId, link: Arc<dyn TransportLink>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::new());
        Self {
            room_id,
            connection_id: ConnectionId::new(),
            created_at: Utc::now(),
            link,
            status,
            cancel: CancellationToken::new(),
            player: Mutex::new(None),
            capture: Mutex::new(None),
            playing: AtomicBool::new(false),
            close_reason: OnceLock::new(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            room_id: self.room_id.clone(),
            connection_id: self.connection_id,
            created_at: self.created_at,
        }
    }

    pub fn link(&self) -> &Arc<dyn TransportLink> {
        &self.link
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state()
    }

    pub fn last_state_change_at(&self) -> DateTime<Utc> {
        self.status.borrow().last_state_change_at()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.state() == ConnectionState::Ready
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason.get().is_some()
    }

    /// 应用传输层报告的状态迁移
    ///
    /// 返回迁移前的状态；重复状态返回 `Ok(None)`
    pub(crate) fn apply_transition(
        &self,
        next: ConnectionState,
    ) -> Result<Option<ConnectionState>, RoomError> {
        let mut outcome = Ok(None);
        self.status.send_if_modified(|status| {
            outcome = status.transition(next);
            matches!(outcome, Ok(Some(_)))
        });
        outcome
    }

    pub fn player(&self) -> Option<Arc<PlaybackController>> {
        lock(&self.player).clone()
    }

    /// 返回房间的播放器，尚未创建时在持有槽位锁的情况下创建
    ///
    /// 并发调用只会创建一个传输层播放器；连接已拆除时返回 `Ok(None)`
    pub(crate) fn ensure_player<F>(
        &self,
        build: F,
    ) -> Result<Option<Arc<PlaybackController>>, TransportError>
    where
        F: FnOnce(PlayerSession) -> PlaybackController,
    {
        let mut slot = lock(&self.player);
        if self.is_closed() {
            return Ok(None);
        }
        if let Some(player) = slot.as_ref() {
            return Ok(Some(player.clone()));
        }

        let session = self.link.create_player()?;
        let player = Arc::new(build(session));
        *slot = Some(player.clone());
        Ok(Some(player))
    }

    pub fn capture(&self) -> Option<Arc<CaptureSession>> {
        lock(&self.capture).clone()
    }

    pub fn is_receiving(&self) -> bool {
        lock(&self.capture).is_some()
    }

    /// 安装采集会话，替换并放弃旧会话；已拆除时返回 false
    pub(crate) fn install_capture(&self, session: Arc<CaptureSession>) -> bool {
        let previous = {
            let mut slot = lock(&self.capture);
            if self.is_closed() {
                return false;
            }
            slot.replace(session)
        };
        if let Some(previous) = previous {
            previous.abandon();
        }
        true
    }

    pub(crate) fn take_capture(&self) -> Option<Arc<CaptureSession>> {
        lock(&self.capture).take()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub(crate) fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    /// 拆除连接：放弃采集，取消所有等待，停止播放器并销毁传输句柄
    ///
    /// 幂等；只有第一次调用返回 true。采集先于取消令牌放弃，
    /// 返回时所有 CaptureAborted 都已发布
    pub(crate) fn teardown(&self, reason: CloseReason) -> bool {
        if self.close_reason.set(reason).is_err() {
            return false;
        }

        if let Some(capture) = self.take_capture() {
            capture.abandon();
        }

        self.cancel.cancel();
        if let Some(player) = lock(&self.player).take() {
            player.shutdown();
        }

        self.link.destroy();
        self.status.send_modify(|status| {
            status.destroy();
        });
        self.playing.store(false, Ordering::Release);

        tracing::info!(
            room_id = %self.room_id,
            connection_id = %self.connection_id,
            reason = %reason,
            "Connection torn down"
        );
        true
    }
}

impl std::fmt::Debug for RoomConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomConnection")
            .field("room_id", &self.room_id)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .field("close_reason", &self.close_reason())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
