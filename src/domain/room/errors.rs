//! Room Context - Errors

use thiserror::Error;

use super::ConnectionState;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("非法的连接状态迁移: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}
