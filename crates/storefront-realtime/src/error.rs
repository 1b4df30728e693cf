use storefront_core::ChannelError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    #[error("push channel connect failed: {0}")]
    Connect(String),
    #[error("push channel rejected credentials: {0}")]
    AuthRejected(String),
    #[error("push channel is not connected")]
    NotConnected,
    #[error("bridge is no longer running")]
    ChannelClosed,
    #[error("request timed out")]
    Timeout,
    #[error("request superseded by a newer request")]
    Superseded,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server reported failure: {0}")]
    Remote(String),
}

impl From<ChannelError> for RealtimeError {
    fn from(_: ChannelError) -> Self {
        Self::ChannelClosed
    }
}
