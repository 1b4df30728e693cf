use serde_json::Value;

use crate::error::ClientError;

/// Convert a query-language response body into its `data` payload.
///
/// A non-empty `errors` array fails the call even when the HTTP status was
/// 2xx. A response without `data` and without errors yields `Value::Null`.
pub fn normalize_query_response(status: u16, body: Value) -> Result<Value, ClientError> {
    let has_errors = body
        .get("errors")
        .and_then(Value::as_array)
        .is_some_and(|errors| !errors.is_empty());
    if has_errors {
        return Err(ClientError::Application { status, body });
    }

    match body {
        Value::Object(mut entries) => Ok(entries.remove("data").unwrap_or(Value::Null)),
        Value::Null => Ok(Value::Null),
        other => Err(ClientError::Application {
            status,
            body: other,
        }),
    }
}

/// Messages of every entry in a query `errors` array.
pub fn query_error_messages(body: &Value) -> Vec<String> {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .map(|err| {
                    err.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_owned()
                })
                .collect()
        })
        .unwrap_or_default()
}
