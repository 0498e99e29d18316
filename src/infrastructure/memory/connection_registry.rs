//! In-Memory Connection Registry Implementation

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::application::voice::{ConnectionRegistryPort, RoomConnection};
use crate::domain::room::{ConnectionId, RoomId};

/// 内存连接注册表
///
/// DashMap 的分片锁保证同一房间的插入/删除互斥
pub struct InMemoryConnectionRegistry {
    connections: DashMap<RoomId, Arc<RoomConnection>>,
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Default for InMemoryConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistryPort for InMemoryConnectionRegistry {
    fn register(&self, connection: Arc<RoomConnection>) -> Result<(), Arc<RoomConnection>> {
        match self.connections.entry(connection.room_id().clone()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                tracing::debug!(
                    room_id = %connection.room_id(),
                    connection_id = %connection.connection_id(),
                    "Connection registered in registry"
                );
                slot.insert(connection);
                Ok(())
            }
        }
    }

    fn get(&self, room_id: &RoomId) -> Option<Arc<RoomConnection>> {
        self.connections.get(room_id).map(|c| c.clone())
    }

    fn unregister(&self, room_id: &RoomId) -> Option<Arc<RoomConnection>> {
        self.connections.remove(room_id).map(|(_, connection)| {
            tracing::debug!(room_id = %room_id, "Connection removed from registry");
            connection
        })
    }

    fn unregister_if(
        &self,
        room_id: &RoomId,
        connection_id: ConnectionId,
    ) -> Option<Arc<RoomConnection>> {
        self.connections
            .remove_if(room_id, |_, current| current.connection_id() == connection_id)
            .map(|(_, connection)| connection)
    }

    fn room_ids(&self) -> Vec<RoomId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.connections.len()
    }
}
