//! Environment-backed configuration for `storefront-smoke`.

use std::{env, path::PathBuf, time::Duration};

use thiserror::Error;

const DEFAULT_API_URL: &str = "http://localhost:8000/api";
const DEFAULT_QUERY_PATH: &str = "/graphql";
const DEFAULT_QUERY: &str = "{ __typename }";
const DEFAULT_SESSION_FILE: &str = "./.storefront-smoke-session.json";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Base URL of the primary (REST + auth) backend.
    pub api_url: String,
    /// Base URL of a separate query-language backend, when there is one.
    pub query_url: Option<String>,
    pub query_path: String,
    /// Query executed once after the session is ready.
    pub query: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub session_store: SessionStoreKind,
    /// Run the anti-forgery cookie handshake against the primary backend.
    pub handshake: bool,
    pub http_timeout: Duration,
    pub broadcast_url: Option<String>,
    pub push_url: Option<String>,
    /// Broadcast topics to watch, comma separated in the environment.
    pub topics: Vec<String>,
    pub poll_interval: Duration,
}

impl SmokeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_url = optional_trimmed("STOREFRONT_API_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_API_URL.to_owned());
        let query_url = optional_trimmed("STOREFRONT_QUERY_URL", &mut lookup);
        let query_path = optional_trimmed("STOREFRONT_QUERY_PATH", &mut lookup)
            .unwrap_or_else(|| DEFAULT_QUERY_PATH.to_owned());
        let query = optional_trimmed("STOREFRONT_QUERY", &mut lookup)
            .unwrap_or_else(|| DEFAULT_QUERY.to_owned());
        let email = optional_trimmed("STOREFRONT_EMAIL", &mut lookup);
        let password = lookup("STOREFRONT_PASSWORD").filter(|value| !value.is_empty());
        let session_store = parse_session_store(&mut lookup)?;
        let handshake = parse_bool("STOREFRONT_HANDSHAKE", false, &mut lookup)?;
        let http_timeout =
            parse_millis("STOREFRONT_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS, &mut lookup)?;
        let broadcast_url = optional_trimmed("STOREFRONT_BROADCAST_URL", &mut lookup);
        let push_url = optional_trimmed("STOREFRONT_PUSH_URL", &mut lookup);
        let topics = optional_trimmed("STOREFRONT_TOPICS", &mut lookup)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|topic| !topic.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let poll_interval =
            parse_millis("STOREFRONT_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS, &mut lookup)?;

        if email.is_some() != password.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "STOREFRONT_EMAIL",
                value: email.unwrap_or_default(),
                reason: "STOREFRONT_EMAIL and STOREFRONT_PASSWORD must be set together".to_owned(),
            });
        }
        if push_url.is_some() && broadcast_url.is_none() {
            return Err(ConfigError::InvalidValue {
                key: "STOREFRONT_PUSH_URL",
                value: push_url.unwrap_or_default(),
                reason: "requires STOREFRONT_BROADCAST_URL".to_owned(),
            });
        }

        Ok(Self {
            api_url,
            query_url,
            query_path,
            query,
            email,
            password,
            session_store,
            handshake,
            http_timeout,
            broadcast_url,
            push_url,
            topics,
            poll_interval,
        })
    }
}

/// Where the session survives between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreKind {
    File(PathBuf),
    /// OS credential store, keyed by the API base URL.
    #[cfg(feature = "keyring")]
    Keyring,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_millis<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(Duration::from_millis(default));
    };
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "must be greater than 0".to_owned(),
        }),
        Ok(millis) => Ok(Duration::from_millis(millis)),
        Err(err) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        }),
    }
}

fn parse_session_store<F>(lookup: &mut F) -> Result<SessionStoreKind, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let kind = optional_trimmed("STOREFRONT_SESSION_STORE", lookup)
        .map(|value| value.to_ascii_lowercase());
    match kind.as_deref() {
        None | Some("file") => {
            let path = optional_trimmed("STOREFRONT_SESSION_FILE", lookup)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_FILE));
            Ok(SessionStoreKind::File(path))
        }
        #[cfg(feature = "keyring")]
        Some("keyring") => Ok(SessionStoreKind::Keyring),
        #[cfg(not(feature = "keyring"))]
        Some("keyring") => Err(ConfigError::InvalidValue {
            key: "STOREFRONT_SESSION_STORE",
            value: "keyring".to_owned(),
            reason: "built without the `keyring` feature".to_owned(),
        }),
        Some(other) => Err(ConfigError::InvalidValue {
            key: "STOREFRONT_SESSION_STORE",
            value: other.to_owned(),
            reason: "expected `file` or `keyring`".to_owned(),
        }),
    }
}

fn parse_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}
