//! Transport Adapters

mod fake_transport;

pub use fake_transport::{
    FakeLink, FakePlayer, FakePlayerBehavior, FakeTransport, FakeTransportConfig,
};
