use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::InputValue;

/// Authenticated session state owned by the session guard.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Short-lived bearer token attached to every request.
    pub access_token: String,
    /// Long-lived token exchanged for a new access token.
    pub refresh_token: String,
    /// Opaque user record returned by login/registration.
    #[serde(default)]
    pub user: Value,
    /// Anti-forgery token last read from the trusted source, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anti_forgery_token: Option<String>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("user", &self.user)
            .field("has_anti_forgery_token", &self.anti_forgery_token.is_some())
            .finish()
    }
}

/// Token pair returned by the refresh endpoint.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenPair { .. }")
    }
}

/// Lifecycle signals emitted by the session guard.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A session was created by login, registration or restore.
    Established,
    /// Tokens were rotated in place after an expiry.
    Refreshed,
    /// Refresh failed; the session was destroyed and re-login is required.
    Invalidated,
    /// The user logged out explicitly.
    LoggedOut,
}

/// HTTP method of a REST-style request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

/// Request as handed over by a screen, before transport encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEnvelope {
    /// Query-language call; `variables` may contain file attachments.
    Query { query: String, variables: InputValue },
    /// REST-style call with an optional JSON body.
    Rest {
        method: HttpMethod,
        path: String,
        body: Option<Value>,
    },
}

/// List endpoint response shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListPage<T> {
    pub data: Vec<T>,
    pub total: u64,
}

/// Signal that cached results for a resource may be stale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvalidationEvent {
    /// Resource identifier, for example `orders`.
    pub resource_tag: String,
    /// Opaque event payload forwarded from the push channel.
    pub payload: Value,
}

impl InvalidationEvent {
    pub fn new(resource_tag: impl Into<String>, payload: Value) -> Self {
        Self {
            resource_tag: resource_tag.into(),
            payload,
        }
    }
}

/// What a consuming view wants to hear from a push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    /// Topic or channel name, for example `admin-notifications`.
    pub channel_name: String,
    /// Event names delivered to this subscription. Empty means all events.
    pub event_names: Vec<String>,
    /// Whether the subscription lives on the authenticated channel.
    pub auth_required: bool,
    /// Resource tag attached to produced invalidation events.
    ///
    /// Defaults to the channel name.
    pub resource_tag: Option<String>,
}

impl ChannelSubscription {
    /// Subscription on the broadcast channel.
    pub fn broadcast(channel_name: impl Into<String>, event_names: &[&str]) -> Self {
        Self {
            channel_name: channel_name.into(),
            event_names: event_names.iter().map(|name| (*name).to_owned()).collect(),
            auth_required: false,
            resource_tag: None,
        }
    }

    /// Subscription on the authenticated channel.
    pub fn authenticated(channel_name: impl Into<String>, event_names: &[&str]) -> Self {
        Self {
            auth_required: true,
            ..Self::broadcast(channel_name, event_names)
        }
    }

    pub fn tagged(mut self, resource_tag: impl Into<String>) -> Self {
        self.resource_tag = Some(resource_tag.into());
        self
    }

    pub fn resource_tag(&self) -> &str {
        self.resource_tag.as_deref().unwrap_or(&self.channel_name)
    }

    /// Whether an event name is delivered to this subscription.
    pub fn accepts(&self, event_name: &str) -> bool {
        self.event_names.is_empty() || self.event_names.iter().any(|name| name == event_name)
    }
}

/// Reply shape of request/response exchanges over the authenticated channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueryReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}
