//! Infrastructure Adapters
//!
//! 六边形架构的适配器实现

pub mod codec;
pub mod resource;
pub mod transport;

pub use codec::*;
pub use resource::*;
pub use transport::*;
