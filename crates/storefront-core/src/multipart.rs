//! Query-language request encoding with file attachments.
//!
//! Implements the GraphQL multipart request convention: a JSON `operations`
//! part whose file positions are nulled, a `map` part linking file indices to
//! dot-paths inside `operations`, and one part per file keyed by its index.

use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use tracing::trace;

use crate::{
    error::ClientError,
    value::{FileUpload, InputValue},
};

/// Root path segment of query variables inside `operations`.
pub const VARIABLES_ROOT: &str = "variables";

/// Mapping from stable file index (`"0"`, `"1"`, ...) to variable paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentMap {
    entries: IndexMap<String, Vec<String>>,
}

impl AttachmentMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self, index: &str) -> Option<&[String]> {
        self.entries.get(index).map(Vec::as_slice)
    }

    /// JSON form sent as the `map` part.
    pub fn to_json(&self) -> Value {
        let object: Map<String, Value> = self
            .entries
            .iter()
            .map(|(index, paths)| {
                let paths = paths.iter().cloned().map(Value::String).collect();
                (index.clone(), Value::Array(paths))
            })
            .collect();
        Value::Object(object)
    }

    fn record(&mut self, index: usize, path: String) {
        self.entries.insert(index.to_string(), vec![path]);
    }
}

/// Result of walking query variables for attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFiles {
    /// Variables with every file replaced by `null`; safe to serialize.
    pub cleaned: Value,
    /// Files in walk order; file `i` is referenced by map key `i`.
    pub files: Vec<FileUpload>,
    pub map: AttachmentMap,
}

/// Walk `value` and pull every binary out of it.
///
/// `root` is the path prefix for recorded positions, normally
/// [`VARIABLES_ROOT`]. A map key that is empty or contains `.` cannot be
/// written into a dot-path, so a binary found beneath one is rejected. Such
/// keys are fine in file-free subtrees.
pub fn extract_files(value: &InputValue, root: &str) -> Result<ExtractedFiles, ClientError> {
    let mut files = Vec::new();
    let mut map = AttachmentMap::default();
    let mut path = root.to_owned();
    let cleaned = walk(value, &mut path, None, &mut files, &mut map)?;

    debug_assert_eq!(files.len(), map.len());
    Ok(ExtractedFiles {
        cleaned,
        files,
        map,
    })
}

/// `unaddressable` holds the first key on the current path that a dot-path
/// cannot express.
fn walk<'a>(
    value: &'a InputValue,
    path: &mut String,
    unaddressable: Option<&'a str>,
    files: &mut Vec<FileUpload>,
    map: &mut AttachmentMap,
) -> Result<Value, ClientError> {
    match value {
        InputValue::Binary(file) => {
            if let Some(key) = unaddressable {
                return Err(ClientError::Encoding(format!(
                    "file under key '{key}' at '{path}': keys above a file must be non-empty and dot-free"
                )));
            }
            files.push(file.clone());
            map.record(files.len() - 1, path.clone());
            trace!(path = %path, index = files.len() - 1, "extracted attachment");
            Ok(Value::Null)
        }
        InputValue::List(items) => {
            let mut cleaned = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let restore = push_segment(path, &index.to_string());
                cleaned.push(walk(item, path, unaddressable, files, map)?);
                path.truncate(restore);
            }
            Ok(Value::Array(cleaned))
        }
        InputValue::Map(entries) => {
            let mut cleaned = Map::with_capacity(entries.len());
            for (key, entry) in entries {
                let unaddressable = unaddressable
                    .or_else(|| (key.is_empty() || key.contains('.')).then_some(key.as_str()));
                let restore = push_segment(path, key);
                let value = walk(entry, path, unaddressable, files, map)?;
                path.truncate(restore);
                cleaned.insert(key.clone(), value);
            }
            Ok(Value::Object(cleaned))
        }
        InputValue::Null => Ok(Value::Null),
        InputValue::Bool(flag) => Ok(Value::Bool(*flag)),
        InputValue::Number(number) => Ok(Value::Number(number.clone())),
        InputValue::String(text) => Ok(Value::String(text.clone())),
    }
}

fn push_segment(path: &mut String, segment: &str) -> usize {
    let restore = path.len();
    path.push('.');
    path.push_str(segment);
    restore
}

/// Multipart body parts in transmission order.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartBody {
    /// JSON string of `{query, variables}` with files nulled.
    pub operations: String,
    /// JSON string of the index-to-paths map.
    pub map: String,
    /// File parts keyed by their string index.
    pub files: Vec<(String, FileUpload)>,
}

/// Wire-ready body of a query-language request.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryBody {
    /// No attachments: plain `{query, variables}` JSON.
    Json(Value),
    /// At least one attachment: `operations`, `map` and file parts.
    Multipart(MultipartBody),
}

impl QueryBody {
    /// Content type the caller must set. `None` for multipart, whose boundary
    /// header is produced by the transport.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Self::Json(_) => Some("application/json"),
            Self::Multipart(_) => None,
        }
    }
}

/// Encode a query and its variables into a wire body.
pub fn encode_query(query: &str, variables: &InputValue) -> Result<QueryBody, ClientError> {
    let ExtractedFiles {
        cleaned,
        files,
        map,
    } = extract_files(variables, VARIABLES_ROOT)?;

    let operations = json!({ "query": query, "variables": cleaned });
    if files.is_empty() {
        return Ok(QueryBody::Json(operations));
    }

    let operations = serde_json::to_string(&operations)
        .map_err(|err| ClientError::Encoding(format!("operations: {err}")))?;
    let map_json = serde_json::to_string(&map.to_json())
        .map_err(|err| ClientError::Encoding(format!("map: {err}")))?;
    let files = files
        .into_iter()
        .enumerate()
        .map(|(index, file)| (index.to_string(), file))
        .collect();

    Ok(QueryBody::Multipart(MultipartBody {
        operations,
        map: map_json,
        files,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;

    fn file(name: &str) -> FileUpload {
        FileUpload::new(name, "application/octet-stream", name.as_bytes().to_vec())
    }

    fn value_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = value;
        for segment in path.split('.').skip(1) {
            current = match current {
                Value::Object(entries) => entries.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn collect_binary_paths(value: &InputValue, path: String, out: &mut BTreeSet<String>) {
        match value {
            InputValue::Binary(_) => {
                out.insert(path);
            }
            InputValue::List(items) => {
                for (index, item) in items.iter().enumerate() {
                    collect_binary_paths(item, format!("{path}.{index}"), out);
                }
            }
            InputValue::Map(entries) => {
                for (key, entry) in entries {
                    collect_binary_paths(entry, format!("{path}.{key}"), out);
                }
            }
            _ => {}
        }
    }

    #[test]
    fn extracts_files_nested_in_object_list() {
        let variables = InputValue::map().with(
            "input",
            InputValue::map()
                .with("name", "a")
                .with("attachments", vec![file("A"), file("B")]),
        );

        let extracted = extract_files(&variables, VARIABLES_ROOT).expect("encode");

        assert_eq!(extracted.files, vec![file("A"), file("B")]);
        assert_eq!(
            extracted.map.to_json(),
            json!({
                "0": ["variables.input.attachments.0"],
                "1": ["variables.input.attachments.1"]
            })
        );
        assert_eq!(
            extracted.cleaned,
            json!({"input": {"name": "a", "attachments": [null, null]}})
        );
    }

    #[test]
    fn extraction_is_path_faithful() {
        let variables = InputValue::map()
            .with("avatar", file("avatar"))
            .with(
                "products",
                vec![
                    InputValue::map()
                        .with("title", "p0")
                        .with("images", vec![file("p0-a")]),
                    InputValue::map().with("title", "p1").with("images", Vec::<InputValue>::new()),
                    InputValue::map().with(
                        "images",
                        vec![InputValue::Null, file("p2-b").into(), InputValue::from(3)],
                    ),
                ],
            )
            .with("note", InputValue::Null);

        let mut expected_paths = BTreeSet::new();
        collect_binary_paths(&variables, VARIABLES_ROOT.to_owned(), &mut expected_paths);

        let extracted = extract_files(&variables, VARIABLES_ROOT).expect("encode");
        assert_eq!(extracted.files.len(), expected_paths.len());
        assert_eq!(extracted.map.len(), extracted.files.len());

        let mut decoded_paths = BTreeSet::new();
        let Value::Object(map) = extracted.map.to_json() else {
            panic!("map must be an object");
        };
        for (index, paths) in &map {
            let index: usize = index.parse().expect("numeric index");
            assert!(index < extracted.files.len());
            for path in paths.as_array().expect("path list") {
                let path = path.as_str().expect("string path");
                assert_eq!(value_at(&extracted.cleaned, path), Some(&Value::Null));
                decoded_paths.insert(path.to_owned());
            }
        }
        assert_eq!(decoded_paths, expected_paths);

        assert_eq!(extracted.cleaned["products"][0]["title"], "p0");
        assert_eq!(extracted.cleaned["products"][1]["images"], json!([]));
        assert_eq!(extracted.cleaned["products"][2]["images"], json!([null, null, 3]));
        assert_eq!(extracted.cleaned["note"], Value::Null);
    }

    #[test]
    fn same_file_at_two_paths_keeps_both_entries() {
        let shared = file("shared");
        let variables = InputValue::map()
            .with("front", shared.clone())
            .with("back", shared);

        let extracted = extract_files(&variables, VARIABLES_ROOT).expect("encode");
        assert_eq!(extracted.files.len(), 2);
        assert_eq!(extracted.map.paths("0"), Some(&["variables.front".to_owned()][..]));
        assert_eq!(extracted.map.paths("1"), Some(&["variables.back".to_owned()][..]));
    }

    #[test]
    fn null_and_empty_containers_pass_through() {
        let variables = InputValue::from(json!({"a": null, "b": {}, "c": [], "d": [null]}));
        let extracted = extract_files(&variables, VARIABLES_ROOT).expect("encode");
        assert!(extracted.files.is_empty());
        assert!(extracted.map.is_empty());
        assert_eq!(extracted.cleaned, json!({"a": null, "b": {}, "c": [], "d": [null]}));

        let extracted = extract_files(&InputValue::Null, VARIABLES_ROOT).expect("encode");
        assert_eq!(extracted.cleaned, Value::Null);
    }

    #[test]
    fn no_file_payload_takes_json_fast_path() {
        let variables = InputValue::from(json!({"id": 4}));
        let body = encode_query("query($id: ID!) { order(id: $id) { id } }", &variables)
            .expect("encode");

        assert_eq!(body.content_type(), Some("application/json"));
        match body {
            QueryBody::Json(value) => {
                assert_eq!(
                    value,
                    json!({
                        "query": "query($id: ID!) { order(id: $id) { id } }",
                        "variables": {"id": 4}
                    })
                );
                assert!(value.get("operations").is_none());
                assert!(value.get("map").is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn file_payload_produces_three_part_multipart() {
        let variables = InputValue::map().with(
            "input",
            InputValue::map().with("attachments", vec![file("A"), file("B")]),
        );
        let body = encode_query("mutation Upload", &variables).expect("encode");
        assert_eq!(body.content_type(), None);

        let QueryBody::Multipart(multipart) = body else {
            panic!("expected multipart body");
        };
        let operations: Value = serde_json::from_str(&multipart.operations).expect("json");
        assert_eq!(operations["query"], "mutation Upload");
        assert_eq!(operations["variables"]["input"]["attachments"], json!([null, null]));

        let map: Value = serde_json::from_str(&multipart.map).expect("json");
        assert_eq!(map["1"], json!(["variables.input.attachments.1"]));

        let keys: Vec<&str> = multipart.files.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["0", "1"]);
        assert_eq!(multipart.files[1].1, file("B"));
    }

    #[test]
    fn rejects_keys_that_break_paths() {
        let variables = InputValue::map().with("a.b", file("x"));
        let err = extract_files(&variables, VARIABLES_ROOT).expect_err("dotted key must fail");
        assert_eq!(err.code(), "encoding_error");

        let variables = InputValue::map().with("", InputValue::map().with("doc", file("x")));
        assert!(extract_files(&variables, VARIABLES_ROOT).is_err());

        let variables =
            InputValue::map().with("meta.v2", vec![InputValue::Null, file("deep").into()]);
        assert!(extract_files(&variables, VARIABLES_ROOT).is_err());
    }

    #[test]
    fn odd_keys_are_allowed_without_files_beneath_them() {
        let variables = InputValue::map()
            .with("filters", InputValue::map().with("price.min", 5).with("", "blank"))
            .with("attachment", file("x"));

        let body = encode_query("mutation Upload", &variables).expect("encode");

        let QueryBody::Multipart(multipart) = body else {
            panic!("expected multipart body");
        };
        let operations: Value = serde_json::from_str(&multipart.operations).expect("json");
        assert_eq!(
            operations["variables"],
            json!({"filters": {"price.min": 5, "": "blank"}, "attachment": null})
        );
        let map: Value = serde_json::from_str(&multipart.map).expect("json");
        assert_eq!(map, json!({"0": ["variables.attachment"]}));

        let plain = encode_query("query", &InputValue::from(json!({"a.b": {"": 1}})))
            .expect("file-free payload encodes");
        assert!(matches!(plain, QueryBody::Json(_)));
    }
}
