//! Fake Transport - 用于测试与本地联调的模拟传输层
//!
//! 不连接任何信令服务：状态事件、说话事件和入站帧都由测试代码手动注入

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::application::ports::{
    AudioPlayer, FrameStream, LinkEvent, PlayerSession, StreamError, TransportError,
    TransportLink, TransportPort, TransportSession,
};
use crate::domain::room::{ConnectionState, PlayerState, RoomId, TransportParams, UserId};
use crate::domain::AudioResource;

type FrameSender = mpsc::UnboundedSender<Result<Vec<u8>, StreamError>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<Vec<u8>, StreamError>>;

/// 模拟播放器行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakePlayerBehavior {
    /// Buffering → Playing，play_ms 后回到 Idle
    Normal { play_ms: u64 },
    /// 停在 Buffering，永不进入 Playing
    NeverStarts,
    /// 进入 Playing 后永不结束
    NeverFinishes,
}

/// Fake Transport 配置
#[derive(Debug, Clone)]
pub struct FakeTransportConfig {
    /// open 后立即推进到 Connecting → Ready
    pub auto_ready: bool,
    pub player: FakePlayerBehavior,
    /// open 直接失败
    pub reject_open: bool,
    /// create_player 失败
    pub fail_player: bool,
    /// open 返回前的模拟信令耗时
    pub open_delay_ms: u64,
}

impl Default for FakeTransportConfig {
    fn default() -> Self {
        Self {
            auto_ready: true,
            player: FakePlayerBehavior::Normal { play_ms: 100 },
            reject_open: false,
            fail_player: false,
            open_delay_ms: 0,
        }
    }
}

/// Fake Transport
pub struct FakeTransport {
    config: FakeTransportConfig,
    links: DashMap<RoomId, Arc<FakeLink>>,
    opened: AtomicUsize,
}

impl FakeTransport {
    pub fn new(config: FakeTransportConfig) -> Self {
        Self {
            config,
            links: DashMap::new(),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(FakeTransportConfig::default())
    }

    /// 房间最近一次打开的连接
    pub fn link(&self, room_id: &RoomId) -> Option<Arc<FakeLink>> {
        self.links.get(room_id).map(|l| l.clone())
    }

    /// open 被调用的次数
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportPort for FakeTransport {
    async fn open(
        &self,
        room_id: &RoomId,
        params: &TransportParams,
    ) -> Result<TransportSession, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);

        if self.config.open_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.open_delay_ms)).await;
        }

        if self.config.reject_open {
            return Err(TransportError::Rejected(format!(
                "channel {} refused",
                params.channel_id
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = Arc::new(FakeLink::new(
            events_tx,
            self.config.player,
            self.config.fail_player,
        ));

        if self.config.auto_ready {
            link.emit_state(ConnectionState::Connecting);
            link.emit_state(ConnectionState::Ready);
        }

        self.links.insert(room_id.clone(), link.clone());
        tracing::debug!(room_id = %room_id, channel_id = %params.channel_id, "FakeTransport: link opened");

        Ok(TransportSession {
            link,
            events: events_rx,
        })
    }
}

/// 模拟的单房间连接
pub struct FakeLink {
    events: mpsc::UnboundedSender<LinkEvent>,
    speakers: DashMap<UserId, FrameSender>,
    /// start_speaking 预先创建、尚未被订阅的帧流，按说话顺序排队
    pending: DashMap<UserId, VecDeque<FrameReceiver>>,
    players: Mutex<Vec<Arc<FakePlayer>>>,
    behavior: FakePlayerBehavior,
    fail_player: bool,
    destroyed: AtomicBool,
}

impl FakeLink {
    fn new(
        events: mpsc::UnboundedSender<LinkEvent>,
        behavior: FakePlayerBehavior,
        fail_player: bool,
    ) -> Self {
        Self {
            events,
            speakers: DashMap::new(),
            pending: DashMap::new(),
            players: Mutex::new(Vec::new()),
            behavior,
            fail_player,
            destroyed: AtomicBool::new(false),
        }
    }

    /// 不经过 FakeTransport 创建连接，返回连接和事件接收端
    pub fn detached() -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Self::new(tx, FakePlayerBehavior::Normal { play_ms: 100 }, false);
        (Arc::new(link), rx)
    }

    /// 报告连接状态
    pub fn emit_state(&self, state: ConnectionState) -> bool {
        self.events.send(LinkEvent::StateChanged(state)).is_ok()
    }

    /// 用户开始说话：准备好帧流并发送说话事件
    pub fn start_speaking(&self, user_id: &UserId) -> bool {
        let (tx, rx) = mpsc::unbounded_channel();
        self.speakers.insert(user_id.clone(), tx);
        self.pending
            .entry(user_id.clone())
            .or_default()
            .push_back(rx);
        self.events
            .send(LinkEvent::SpeakingStarted(user_id.clone()))
            .is_ok()
    }

    /// 推送一帧压缩音频
    pub fn send_frame(&self, user_id: &UserId, frame: Vec<u8>) -> bool {
        self.speakers
            .get(user_id)
            .map(|tx| tx.send(Ok(frame)).is_ok())
            .unwrap_or(false)
    }

    /// 结束该用户的帧流（传输层判定说话结束）
    pub fn end_stream(&self, user_id: &UserId) {
        self.speakers.remove(user_id);
    }

    /// 以错误终止该用户的帧流
    pub fn fail_stream(&self, user_id: &UserId, message: &str) {
        if let Some((_, tx)) = self.speakers.remove(user_id) {
            let _ = tx.send(Err(StreamError(message.to_string())));
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// 该连接上创建过的播放器数量
    pub fn player_count(&self) -> usize {
        self.players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 最近创建的播放器
    pub fn player(&self) -> Option<Arc<FakePlayer>> {
        self.players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl TransportLink for FakeLink {
    fn create_player(&self) -> Result<PlayerSession, TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Closed("link destroyed".to_string()));
        }
        if self.fail_player {
            return Err(TransportError::Player("player unavailable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let player = Arc::new(FakePlayer::new(tx, self.behavior));
        self.players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(player.clone());

        Ok(PlayerSession {
            player,
            events: rx,
        })
    }

    fn subscribe_speaker(&self, user_id: &UserId) -> Result<FrameStream, TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Subscription("link destroyed".to_string()));
        }

        let queued = match self.pending.get_mut(user_id) {
            Some(mut queue) => queue.pop_front(),
            None => None,
        };
        let rx = match queued {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.speakers.insert(user_id.clone(), tx);
                rx
            }
        };

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.speakers.clear();
        self.pending.clear();
        for player in self
            .players
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            player.close();
        }
        tracing::debug!("FakeTransport: link destroyed");
    }
}

/// 模拟播放器
pub struct FakePlayer {
    events: Mutex<Option<mpsc::UnboundedSender<PlayerState>>>,
    behavior: FakePlayerBehavior,
    task: Mutex<Option<JoinHandle<()>>>,
    play_count: AtomicUsize,
    stop_count: AtomicUsize,
    last_frames: AtomicUsize,
}

impl FakePlayer {
    fn new(events: mpsc::UnboundedSender<PlayerState>, behavior: FakePlayerBehavior) -> Self {
        Self {
            events: Mutex::new(Some(events)),
            behavior,
            task: Mutex::new(None),
            play_count: AtomicUsize::new(0),
            stop_count: AtomicUsize::new(0),
            last_frames: AtomicUsize::new(0),
        }
    }

    pub fn play_count(&self) -> usize {
        self.play_count.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// 最近一次播放资源的帧数
    pub fn last_frames(&self) -> usize {
        self.last_frames.load(Ordering::SeqCst)
    }

    fn emit(&self, state: PlayerState) {
        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(state);
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<PlayerState>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn abort_task(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// 连接销毁：关闭状态事件流
    fn close(&self) {
        self.abort_task();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl AudioPlayer for FakePlayer {
    fn play(&self, resource: AudioResource) -> Result<(), TransportError> {
        let Some(tx) = self.sender() else {
            return Err(TransportError::Player("player closed".to_string()));
        };

        self.abort_task();
        self.play_count.fetch_add(1, Ordering::SeqCst);
        let frames = resource.into_frames();
        self.last_frames.store(frames.len(), Ordering::SeqCst);

        let _ = tx.send(PlayerState::Buffering);
        match self.behavior {
            FakePlayerBehavior::NeverStarts => {}
            FakePlayerBehavior::NeverFinishes => {
                let _ = tx.send(PlayerState::Playing);
            }
            FakePlayerBehavior::Normal { play_ms } => {
                let _ = tx.send(PlayerState::Playing);
                let task = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(play_ms)).await;
                    let _ = tx.send(PlayerState::Idle);
                });
                *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.abort_task();
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.emit(PlayerState::Idle);
    }
}
