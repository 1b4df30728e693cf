use std::sync::{Arc, PoisonError, RwLock};

use reqwest::cookie::{CookieStore, Jar};
use storefront_core::ClientError;
use url::Url;

/// Trusted origin of the current anti-forgery token.
pub trait AntiForgerySource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Reads the token from the cookie the backend set on its own origin.
#[derive(Debug, Clone)]
pub struct CookieTokenSource {
    jar: Arc<Jar>,
    origin: Url,
    cookie_name: String,
}

impl CookieTokenSource {
    pub fn new(jar: Arc<Jar>, origin: &str, cookie_name: &str) -> Result<Self, ClientError> {
        let origin = Url::parse(origin)
            .map_err(|err| ClientError::Internal(format!("invalid cookie origin '{origin}': {err}")))?;
        Ok(Self {
            jar,
            origin,
            cookie_name: cookie_name.to_owned(),
        })
    }
}

impl AntiForgerySource for CookieTokenSource {
    fn token(&self) -> Option<String> {
        let header = self.jar.cookies(&self.origin)?;
        let cookies = header.to_str().ok()?;
        cookie_value(cookies, &self.cookie_name)
    }
}

/// Token held in memory. Used when the token arrives through another channel.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenSource {
    token: Arc<RwLock<Option<String>>>,
}

impl StaticTokenSource {
    pub fn set(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }
}

impl AntiForgerySource for StaticTokenSource {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Find `name` in a `Cookie` header value. The value is percent-decoded
/// because frameworks URL-encode the token when setting the cookie.
fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies
        .split(';')
        .map(str::trim)
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|value| !value.is_empty())
}
