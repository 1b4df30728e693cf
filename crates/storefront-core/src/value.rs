use bytes::Bytes;
use indexmap::IndexMap;
use serde_json::{Number, Value};

/// Binary attachment carried inside query variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    /// File name reported in the multipart part.
    pub file_name: String,
    /// MIME type, for example `image/png`.
    pub content_type: String,
    pub data: Bytes,
}

impl FileUpload {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Structured request input that may contain binary attachments.
///
/// Mirrors the JSON data model plus a `Binary` variant. Map keys keep
/// insertion order so attachment indices follow the order fields were built.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum InputValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<InputValue>),
    Map(IndexMap<String, InputValue>),
    Binary(FileUpload),
}

impl InputValue {
    /// Empty keyed structure.
    pub fn map() -> Self {
        Self::Map(IndexMap::new())
    }

    /// Builder-style insert; no-op when `self` is not a map.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<InputValue>) -> Self {
        if let Self::Map(entries) = &mut self {
            entries.insert(key.into(), value.into());
        }
        self
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => Self::Number(number),
            Value::String(text) => Self::String(text),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<FileUpload> for InputValue {
    fn from(file: FileUpload) -> Self {
        Self::Binary(file)
    }
}

impl From<&str> for InputValue {
    fn from(text: &str) -> Self {
        Self::String(text.to_owned())
    }
}

impl From<String> for InputValue {
    fn from(text: String) -> Self {
        Self::String(text)
    }
}

impl From<bool> for InputValue {
    fn from(flag: bool) -> Self {
        Self::Bool(flag)
    }
}

impl From<i32> for InputValue {
    fn from(number: i32) -> Self {
        Self::Number(number.into())
    }
}

impl From<i64> for InputValue {
    fn from(number: i64) -> Self {
        Self::Number(number.into())
    }
}

impl From<u64> for InputValue {
    fn from(number: u64) -> Self {
        Self::Number(number.into())
    }
}

impl<T: Into<InputValue>> From<Vec<T>> for InputValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<InputValue>> From<Option<T>> for InputValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn converts_json_preserving_key_order() {
        let value = InputValue::from(json!({"b": 1, "a": [true, null]}));
        let InputValue::Map(entries) = &value else {
            panic!("expected map, got {value:?}");
        };
        let keys: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(
            entries.get("a"),
            Some(&InputValue::List(vec![InputValue::Bool(true), InputValue::Null]))
        );
    }

    #[test]
    fn builder_inserts_nested_files() {
        let file = FileUpload::new("a.png", "image/png", vec![1_u8, 2, 3]);
        let value = InputValue::map().with(
            "input",
            InputValue::map()
                .with("name", "a")
                .with("attachments", vec![file.clone()]),
        );

        let expected = InputValue::Map(
            [
                ("name".to_owned(), InputValue::from("a")),
                (
                    "attachments".to_owned(),
                    InputValue::List(vec![InputValue::Binary(file)]),
                ),
            ]
            .into_iter()
            .collect(),
        );
        let InputValue::Map(entries) = &value else {
            panic!("expected map, got {value:?}");
        };
        assert_eq!(entries.get("input"), Some(&expected));
        assert_eq!(entries.len(), 1);
    }
}
