//! Infrastructure Layer - 基础设施层
//!
//! 提供所有端口的具体实现

pub mod adapters;
pub mod events;
pub mod memory;
pub mod telemetry;

pub use adapters::{
    AudioResourceLoader, FakeLink, FakePlayer, FakePlayerBehavior, FakeTransport,
    FakeTransportConfig, OpusFrameCodec,
};
pub use events::EventPublisher;
pub use memory::InMemoryConnectionRegistry;
pub use telemetry::init_tracing;
