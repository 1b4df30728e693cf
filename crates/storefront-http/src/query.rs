use std::sync::Arc;

use serde_json::Value;
use storefront_core::{
    ClientError, HttpMethod, InputValue, RequestEnvelope, encode_query, normalize_query_response,
};
use tracing::debug;

use crate::{
    guard::{Backend, SessionGuard},
    rest::RestClient,
    transport::OutgoingRequest,
};

/// Query-language client. Variables may carry file attachments, in which
/// case the request goes out as multipart.
#[derive(Clone)]
pub struct QueryClient {
    guard: Arc<SessionGuard>,
    backend: Backend,
    path: String,
}

impl QueryClient {
    pub fn new(guard: Arc<SessionGuard>, backend: Backend, path: impl Into<String>) -> Self {
        Self {
            guard,
            backend,
            path: path.into(),
        }
    }

    /// Run a query or mutation and return its `data`.
    pub async fn execute(&self, query: &str, variables: &InputValue) -> Result<Value, ClientError> {
        let body = encode_query(query, variables)?;
        let request = OutgoingRequest::new(HttpMethod::Post, self.path.clone()).with_body(body.into());
        debug!(backend = ?self.backend, path = %self.path, "executing query");

        let response = self.guard.send(self.backend, &request).await?;
        normalize_query_response(response.status, response.body)
    }

    /// Dispatch either envelope kind. REST envelopes go through `rest`.
    pub async fn dispatch(
        &self,
        envelope: &RequestEnvelope,
        rest: &RestClient,
    ) -> Result<Value, ClientError> {
        match envelope {
            RequestEnvelope::Query { query, variables } => self.execute(query, variables).await,
            RequestEnvelope::Rest { .. } => rest.send_envelope(envelope).await,
        }
    }
}
