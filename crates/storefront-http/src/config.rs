use std::time::Duration;

use storefront_core::ClientError;
use url::Url;

/// Request timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether cookies are stored and sent with requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsMode {
    Omit,
    #[default]
    Include,
}

/// Anti-forgery handshake settings of a cookie-protected backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Endpoint whose response sets the anti-forgery cookie.
    pub bootstrap_path: String,
    /// Cookie carrying the token.
    pub cookie_name: String,
    /// Request header the token is echoed in.
    pub header_name: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            bootstrap_path: "/sanctum/csrf-cookie".to_owned(),
            cookie_name: "XSRF-TOKEN".to_owned(),
            header_name: "X-XSRF-TOKEN".to_owned(),
        }
    }
}

/// Connection settings of one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub base_url: Url,
    pub timeout: Duration,
    pub default_headers: Vec<(String, String)>,
    pub credentials: CredentialsMode,
    pub handshake: Option<HandshakeConfig>,
}

impl BackendConfig {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| ClientError::Internal(format!("invalid base url '{base_url}': {err}")))?;
        Ok(Self {
            base_url,
            timeout: DEFAULT_TIMEOUT,
            default_headers: Vec::new(),
            credentials: CredentialsMode::default(),
            handshake: None,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    /// Enable anti-forgery protection. Forces cookie credentials on.
    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = Some(handshake);
        self.credentials = CredentialsMode::Include;
        self
    }

    /// Absolute URL of `path` under the base URL.
    pub fn url_for(&self, path: &str) -> String {
        join_url(self.base_url.as_str(), path)
    }
}

/// Paths of the session lifecycle endpoints on the primary backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    pub login_path: String,
    pub register_path: String,
    pub refresh_path: String,
    pub logout_path: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login_path: "/auth/login".to_owned(),
            register_path: "/auth/register".to_owned(),
            refresh_path: "/auth/refresh".to_owned(),
            logout_path: "/auth/logout".to_owned(),
        }
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_owned();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_without_double_slashes() {
        let config = BackendConfig::new("https://api.example.com/v1/").expect("valid url");
        assert_eq!(config.url_for("/orders"), "https://api.example.com/v1/orders");
        assert_eq!(config.url_for("graphql"), "https://api.example.com/v1/graphql");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn handshake_forces_cookie_credentials() {
        let config = BackendConfig::new("https://admin.example.com")
            .expect("valid url")
            .with_credentials(CredentialsMode::Omit)
            .with_handshake(HandshakeConfig::default());
        assert_eq!(config.credentials, CredentialsMode::Include);
        assert_eq!(
            config.handshake.map(|h| h.header_name),
            Some("X-XSRF-TOKEN".to_owned())
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = BackendConfig::new("not a url").expect_err("must fail");
        assert_eq!(err.code(), "internal_error");
    }
}
