use std::time::Duration;

use storefront_core::RetryPolicy;
use url::Url;

use crate::error::RealtimeError;

/// Connection settings of one push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub url: Url,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ChannelConfig {
    pub fn new(url: &str) -> Result<Self, RealtimeError> {
        let parsed = Url::parse(url)
            .map_err(|err| RealtimeError::Connect(format!("invalid channel url '{url}': {err}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RealtimeError::Connect(format!(
                "channel url must use ws or wss, got '{}'",
                parsed.scheme()
            )));
        }
        Ok(Self {
            url: parsed,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Interval of the polling backstop.
    pub poll_interval: Duration,
    /// How long a request over the authenticated channel waits for its reply.
    pub request_timeout: Duration,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            command_buffer: 128,
            event_buffer: 512,
        }
    }
}
