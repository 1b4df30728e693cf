//! Raw request dispatch. Transports know nothing about sessions; the
//! [`SessionGuard`](crate::SessionGuard) decorates requests before they get here.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{
    Client, Method,
    cookie::Jar,
    header::{ACCEPT, HeaderMap, HeaderName, HeaderValue},
    multipart::{Form, Part},
};
use serde_json::Value;
use storefront_core::{ClientError, HttpMethod, MultipartBody, QueryBody, RequestEnvelope};
use thiserror::Error;
use tracing::trace;

use crate::{
    anti_forgery::CookieTokenSource,
    config::{BackendConfig, CredentialsMode, HandshakeConfig, join_url},
};

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartBody),
}

impl From<QueryBody> for RequestBody {
    fn from(body: QueryBody) -> Self {
        match body {
            QueryBody::Json(value) => Self::Json(value),
            QueryBody::Multipart(body) => Self::Multipart(body),
        }
    }
}

/// A request relative to a backend's base URL. Cloneable so it can be replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl OutgoingRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, path).with_body(RequestBody::Json(body))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set a header, replacing any existing value with the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Build a request from an envelope. Query envelopes are posted to `query_path`.
    pub fn from_envelope(envelope: &RequestEnvelope, query_path: &str) -> Result<Self, ClientError> {
        match envelope {
            RequestEnvelope::Query { query, variables } => {
                let body = storefront_core::encode_query(query, variables)?;
                Ok(Self::new(HttpMethod::Post, query_path).with_body(body.into()))
            }
            RequestEnvelope::Rest { method, path, body } => {
                let request = Self::new(*method, path.clone());
                Ok(match body {
                    Some(body) => request.with_body(RequestBody::Json(body.clone())),
                    None => request,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("http status {status}")]
    Status { status: u16, body: Value },
    #[error("request encoding failed: {0}")]
    Encoding(String),
}

impl TransportError {
    /// Map to the caller-facing taxonomy without any recovery.
    pub fn into_client_error(self) -> ClientError {
        match self {
            Self::Network(message) => ClientError::Network(message),
            Self::Status { status, body } => ClientError::Application { status, body },
            Self::Encoding(message) => ClientError::Encoding(message),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Dispatch one request. Non-2xx statuses come back as [`TransportError::Status`].
    async fn send(&self, request: &OutgoingRequest) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] over a reqwest client with an optional cookie jar.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    jar: Arc<Jar>,
}

impl ReqwestTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| ClientError::Internal(format!("invalid header name '{name}': {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| ClientError::Internal(format!("invalid header value: {err}")))?;
            headers.insert(name, value);
        }

        let jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout);
        if config.credentials == CredentialsMode::Include {
            builder = builder.cookie_provider(Arc::clone(&jar));
        }
        let client = builder
            .build()
            .map_err(|err| ClientError::Internal(format!("http client init failed: {err}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.as_str().to_owned(),
            jar,
        })
    }

    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar)
    }

    /// Token source reading the anti-forgery cookie this transport receives.
    pub fn anti_forgery_source(
        &self,
        handshake: &HandshakeConfig,
    ) -> Result<CookieTokenSource, ClientError> {
        CookieTokenSource::new(self.cookie_jar(), &self.base_url, &handshake.cookie_name)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &OutgoingRequest) -> Result<TransportResponse, TransportError> {
        let url = join_url(&self.base_url, &request.path);
        trace!(method = request.method.as_str(), %url, "dispatching http request");

        let mut builder = self.client.request(to_method(request.method), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(body) => builder.multipart(multipart_form(body)?),
        };

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        let body = parse_body(&text);

        if (200..300).contains(&status) {
            Ok(TransportResponse { status, body })
        } else {
            Err(TransportError::Status { status, body })
        }
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Parts go out as `operations`, `map`, then files in index order.
fn multipart_form(body: &MultipartBody) -> Result<Form, TransportError> {
    let mut form = Form::new()
        .text("operations", body.operations.clone())
        .text("map", body.map.clone());
    for (index, file) in &body.files {
        let part = Part::bytes(file.data.to_vec())
            .file_name(file.file_name.clone())
            .mime_str(&file.content_type)
            .map_err(|err| {
                TransportError::Encoding(format!("invalid content type for part {index}: {err}"))
            })?;
        form = form.part(index.clone(), part);
    }
    Ok(form)
}

/// JSON when it parses, otherwise the raw text as a JSON string.
pub(crate) fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}
