use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use storefront_core::{ClientError, HttpMethod, ListPage, RequestEnvelope};

use crate::{
    guard::{Backend, SessionGuard},
    transport::{OutgoingRequest, RequestBody},
};

/// Resource-style client over the session guard.
#[derive(Clone)]
pub struct RestClient {
    guard: Arc<SessionGuard>,
    backend: Backend,
}

impl RestClient {
    pub fn new(guard: Arc<SessionGuard>, backend: Backend) -> Self {
        Self { guard, backend }
    }

    /// Fetch one page of a collection. The endpoint answers `{data, total}`.
    pub async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<ListPage<T>, ClientError> {
        let mut request = OutgoingRequest::get(path);
        for (name, value) in params {
            request = request.with_query(*name, value.clone());
        }
        let body = self.call(request).await?;
        decode(path, body)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let body = self.call(OutgoingRequest::get(path)).await?;
        decode(path, unwrap_data(body))
    }

    pub async fn create<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &B,
    ) -> Result<T, ClientError> {
        let body = self.call(with_payload(HttpMethod::Post, path, payload)?).await?;
        decode(path, unwrap_data(body))
    }

    pub async fn update<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        payload: &B,
    ) -> Result<T, ClientError> {
        let body = self.call(with_payload(HttpMethod::Put, path, payload)?).await?;
        decode(path, unwrap_data(body))
    }

    pub async fn delete(&self, path: &str) -> Result<(), ClientError> {
        self.call(OutgoingRequest::new(HttpMethod::Delete, path))
            .await
            .map(|_| ())
    }

    /// Send a REST envelope and return the raw body.
    pub async fn send_envelope(&self, envelope: &RequestEnvelope) -> Result<Value, ClientError> {
        match envelope {
            RequestEnvelope::Rest { .. } => {
                let request = OutgoingRequest::from_envelope(envelope, "")?;
                self.call(request).await
            }
            RequestEnvelope::Query { .. } => Err(ClientError::Internal(
                "query envelopes must go through the query client".to_owned(),
            )),
        }
    }

    async fn call(&self, request: OutgoingRequest) -> Result<Value, ClientError> {
        let response = self.guard.send(self.backend, &request).await?;
        Ok(response.body)
    }
}

fn with_payload<B: Serialize>(
    method: HttpMethod,
    path: &str,
    payload: &B,
) -> Result<OutgoingRequest, ClientError> {
    let body = serde_json::to_value(payload)
        .map_err(|err| ClientError::Encoding(format!("request body for {path}: {err}")))?;
    Ok(OutgoingRequest::new(method, path).with_body(RequestBody::Json(body)))
}

/// Single-resource endpoints may wrap the record in `data`.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: Value) -> Result<T, ClientError> {
    serde_json::from_value(body)
        .map_err(|err| ClientError::Internal(format!("unexpected response shape from {path}: {err}")))
}
