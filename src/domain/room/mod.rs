//! Room Context - 房间限界上下文
//!
//! 职责:
//! - 房间 / 说话人 / 连接标识
//! - 连接状态机与播放器状态

mod errors;
mod state;
mod value_objects;

pub use errors::RoomError;
pub use state::{CloseReason, ConnectionState, ConnectionStatus, PlayerState};
pub use value_objects::{ConnectionId, RoomId, TransportParams, UserId};
