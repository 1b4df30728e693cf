use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::RealtimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Topic fan-out without per-connection identity.
    Broadcast,
    /// Per-connection channel established with a bearer token.
    Authenticated,
}

/// Decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct PushFrame {
    /// Topic the event was published on, when the protocol carries one.
    pub channel: Option<String>,
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Connected,
    Disconnected { reason: String },
    /// The server refused the credential. The channel does not retry.
    AuthRejected { reason: String },
    Event(PushFrame),
}

/// Capability shared by both push channel variants.
///
/// `connect` returns once the connection loop is started; progress is
/// reported through [`PushChannel::signals`]. Subscribe and emit calls fail
/// with [`RealtimeError::NotConnected`] while no connection is live.
#[async_trait]
pub trait PushChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn connect(&self, token: Option<String>) -> Result<(), RealtimeError>;

    async fn subscribe(&self, channel: &str) -> Result<(), RealtimeError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), RealtimeError>;

    async fn emit(&self, event: &str, data: Value) -> Result<(), RealtimeError>;

    fn signals(&self) -> broadcast::Receiver<ChannelSignal>;

    /// Stop the connection loop and drop the socket.
    async fn close(&self);
}
