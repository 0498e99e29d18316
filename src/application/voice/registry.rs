//! Connection Registry - 房间资源注册表
//!
//! 房间 → 连接映射的抽象接口，与 RoomConnection 同属 voice 模块；
//! 具体实现在 infrastructure/memory 层

use std::sync::Arc;

use super::connection::RoomConnection;
use crate::domain::room::{ConnectionId, RoomId};

/// Connection Registry Port
///
/// 每个房间最多一个活动连接；插入/删除对同一房间互斥
pub trait ConnectionRegistryPort: Send + Sync {
    /// 注册连接
    ///
    /// 房间已有连接时不覆盖，返回 `Err(existing)`
    fn register(&self, connection: Arc<RoomConnection>) -> Result<(), Arc<RoomConnection>>;

    /// 获取房间当前连接
    fn get(&self, room_id: &RoomId) -> Option<Arc<RoomConnection>>;

    /// 移除房间连接
    fn unregister(&self, room_id: &RoomId) -> Option<Arc<RoomConnection>>;

    /// 仅当当前连接就是 `connection_id` 时移除
    fn unregister_if(
        &self,
        room_id: &RoomId,
        connection_id: ConnectionId,
    ) -> Option<Arc<RoomConnection>>;

    /// 所有已注册房间
    fn room_ids(&self) -> Vec<RoomId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
