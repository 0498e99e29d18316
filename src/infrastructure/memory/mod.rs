//! Memory Layer - In-Memory State Management
//!
//! 实现 ConnectionRegistry，管理房间 → 连接的内存映射

mod connection_registry;

pub use connection_registry::InMemoryConnectionRegistry;
