//! Realtime side of the storefront client.
//!
//! Two push channels (topic broadcast and a per-session authenticated
//! connection) feed a single bridge actor, which turns server events into
//! invalidation signals and carries request/response exchanges.

pub mod bridge;
pub mod config;
pub mod error;
pub mod polling;
pub mod protocol;
pub mod push;
pub mod scope;
pub mod ws;

#[cfg(test)]
mod testing;

pub use bridge::{
    AccessTokenProvider, BridgeEvent, BridgeHandle, BridgeStatus, BridgeWiring,
    SubscriptionHandle, spawn_bridge,
};
pub use config::{BridgeConfig, ChannelConfig};
pub use error::RealtimeError;
pub use polling::PollingFallback;
pub use protocol::{AuthenticatedProtocol, BroadcastProtocol, Inbound, WireProtocol};
pub use push::{ChannelKind, ChannelSignal, PushChannel, PushFrame};
pub use scope::ViewScope;
pub use ws::WsPushChannel;
