//! Parameter extraction from query strings and request bodies.
//!
//! A request carries parameters in two places: the URL query and the body.
//! Bodies come in three shapes, tried in order:
//!
//! 1. query-shaped (`a=1&b=2`), decoded as a form
//! 2. JSON, flattened into composite keys (`user.name`, `items[0].id`)
//! 3. anything else, kept whole under [`RAW_CONTENT_KEY`]
//!
//! Keys are kept in first-seen order; a repeated key keeps its position and
//! takes the last value.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::sample::Sample;

/// Key for a body that is neither a form nor JSON.
pub const RAW_CONTENT_KEY: &str = "raw_content";

/// Key for a body that is a bare JSON scalar.
pub const SCALAR_KEY: &str = "value";

static QUERY_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w.\-\[\]%+]+=").expect("valid query segment pattern"));

/// Ordered name -> value mapping.
pub type ParamMap = IndexMap<String, String>;

/// Where a parameter was found in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamOrigin {
    Query,
    Body,
}

/// A named value carried by a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Parameter {
    /// Composite path for values nested in structured bodies
    pub name: String,
    pub value: String,
    pub origin: ParamOrigin,
}

/// Whether text looks like `key=value&...` rather than a structured body.
pub fn is_query_shaped(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() || text.starts_with('{') || text.starts_with('[') {
        return false;
    }
    let first = text.split('&').next().unwrap_or("");
    QUERY_SEGMENT_RE.is_match(first)
}

/// Decode a form / query string. Repeated keys keep the last value.
pub fn parse_query(text: &str) -> ParamMap {
    let mut map = ParamMap::new();
    for (key, value) in url::form_urlencoded::parse(text.trim().as_bytes()) {
        map.insert(key.into_owned(), value.into_owned());
    }
    map
}

/// Extract parameters from a request body or query string.
///
/// Blank input yields an empty map.
pub fn extract_params(text: &str) -> ParamMap {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ParamMap::new();
    }
    if is_query_shaped(trimmed) {
        return parse_query(trimmed);
    }
    match serde_json::from_str::<JsonValue>(trimmed) {
        Ok(value) => flatten_json(&value),
        Err(_) => {
            let mut map = ParamMap::new();
            map.insert(RAW_CONTENT_KEY.to_string(), trimmed.to_string());
            map
        }
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => Some(String::new()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

/// Flatten JSON into scalar leaves keyed by composite path.
///
/// Object members join with `.`, array elements append `[i]`, and a top-level
/// array starts at `[0]`. A bare scalar is stored under [`SCALAR_KEY`]. Empty
/// containers produce no leaves.
pub fn flatten_json(value: &JsonValue) -> ParamMap {
    let mut map = ParamMap::new();
    if let Some(text) = scalar_text(value) {
        map.insert(SCALAR_KEY.to_string(), text);
        return map;
    }

    // Children are pushed in reverse so leaves come out in document order.
    let mut stack: Vec<(String, &JsonValue)> = vec![(String::new(), value)];
    while let Some((prefix, node)) = stack.pop() {
        match node {
            JsonValue::Object(members) => {
                for (key, child) in members.iter().rev() {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    stack.push((path, child));
                }
            }
            JsonValue::Array(items) => {
                for (idx, child) in items.iter().enumerate().rev() {
                    stack.push((format!("{}[{}]", prefix, idx), child));
                }
            }
            scalar => {
                if let Some(text) = scalar_text(scalar) {
                    map.insert(prefix, text);
                }
            }
        }
    }
    map
}

/// One step along a composite key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySegment {
    Field(String),
    Index(usize),
}

/// Split a composite key back into its path segments.
///
/// Returns `None` for keys that [`flatten_json`] cannot have produced.
pub fn key_segments(key: &str) -> Option<Vec<KeySegment>> {
    let mut segments = Vec::new();
    let mut field = String::new();
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !field.is_empty() {
                    segments.push(KeySegment::Field(std::mem::take(&mut field)));
                } else if !matches!(segments.last(), Some(KeySegment::Index(_))) {
                    return None;
                }
            }
            '[' => {
                if !field.is_empty() {
                    segments.push(KeySegment::Field(std::mem::take(&mut field)));
                }
                let mut digits = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    digits.push(d);
                }
                segments.push(KeySegment::Index(digits.parse().ok()?));
            }
            other => field.push(other),
        }
    }
    if !field.is_empty() {
        segments.push(KeySegment::Field(field));
    }
    Some(segments)
}

/// Last named segment of a composite key (`items[0].id` -> `id`).
pub fn last_field(key: &str) -> &str {
    let tail = key.rsplit('.').next().unwrap_or(key);
    let tail = tail.split('[').next().unwrap_or(tail);
    if tail.is_empty() {
        key
    } else {
        tail
    }
}

/// All non-empty parameters of a sample. Body parameters override query
/// parameters with the same name; the query's ordering is kept.
pub fn sample_parameters(sample: &Sample) -> Vec<Parameter> {
    let mut merged: IndexMap<String, (String, ParamOrigin)> = IndexMap::new();
    for (name, value) in parse_query(sample.url_query()) {
        merged.insert(name, (value, ParamOrigin::Query));
    }
    for (name, value) in extract_params(&sample.request_body) {
        merged.insert(name, (value, ParamOrigin::Body));
    }
    merged
        .into_iter()
        .filter(|(_, (value, _))| !value.is_empty())
        .map(|(name, (value, origin))| Parameter {
            name,
            value,
            origin,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn pairs(map: &ParamMap) -> Vec<(&str, &str)> {
        map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    #[test]
    fn test_repeated_query_key_last_wins() {
        let map = extract_params("a=1&a=2");
        assert_eq!(pairs(&map), vec![("a", "2")]);
    }

    #[test]
    fn test_query_is_form_decoded() {
        let map = extract_params("q=hello+world&sig=YWJj%3D%3D&empty=");
        assert_eq!(
            pairs(&map),
            vec![("q", "hello world"), ("sig", "YWJj=="), ("empty", "")]
        );
    }

    #[test]
    fn test_query_shape_detection() {
        assert!(is_query_shaped("user[name]=x&b"));
        assert!(!is_query_shaped("{\"a\":1}"));
        assert!(!is_query_shaped("[1,2]"));
        assert!(!is_query_shaped("just some text"));
        assert!(!is_query_shaped("=x"));
    }

    #[test]
    fn test_flatten_nested() {
        let map = flatten_json(&json!({
            "user": {"name": "ann", "active": true},
            "items": [{"id": 7}, {"id": null}],
            "empty": {}
        }));
        assert_eq!(
            pairs(&map),
            vec![
                ("user.name", "ann"),
                ("user.active", "true"),
                ("items[0].id", "7"),
                ("items[1].id", ""),
            ]
        );
    }

    #[test]
    fn test_flatten_top_level_array_and_scalar() {
        let map = flatten_json(&json!([{"a": 1}, 2]));
        assert_eq!(pairs(&map), vec![("[0].a", "1"), ("[1]", "2")]);
        let map = flatten_json(&json!("tok"));
        assert_eq!(pairs(&map), vec![("value", "tok")]);
    }

    #[test]
    fn test_raw_content_fallback() {
        let map = extract_params("  <soap>payload</soap>\n");
        assert_eq!(pairs(&map), vec![("raw_content", "<soap>payload</soap>")]);
        assert!(extract_params("   ").is_empty());
    }

    #[test]
    fn test_last_field() {
        assert_eq!(last_field("items[0].id"), "id");
        assert_eq!(last_field("user.name"), "name");
        assert_eq!(last_field("tags[2]"), "tags");
        assert_eq!(last_field("[0]"), "[0]");
        assert_eq!(last_field("token"), "token");
    }

    #[test]
    fn test_sample_parameters_body_wins_and_empties_dropped() {
        let mut sample = Sample::new(0, "s");
        sample.method = "POST".into();
        sample.url = Some("https://x.test/a?id=1&page=&keep=y".into());
        sample.request_body = r#"{"id": "2", "note": null}"#.into();
        let params = sample_parameters(&sample);
        assert_eq!(
            params,
            vec![
                Parameter {
                    name: "id".into(),
                    value: "2".into(),
                    origin: ParamOrigin::Body
                },
                Parameter {
                    name: "keep".into(),
                    value: "y".into(),
                    origin: ParamOrigin::Query
                },
            ]
        );
    }

    #[test]
    fn test_key_segments() {
        assert_eq!(
            key_segments("items[0].id"),
            Some(vec![
                KeySegment::Field("items".into()),
                KeySegment::Index(0),
                KeySegment::Field("id".into()),
            ])
        );
        assert_eq!(key_segments("[1][2]"), Some(vec![KeySegment::Index(1), KeySegment::Index(2)]));
        assert_eq!(key_segments("a[x]"), None);
    }

    fn lookup<'a>(root: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
        key_segments(key)?
            .iter()
            .try_fold(root, |node, segment| match segment {
                KeySegment::Field(name) => node.get(name),
                KeySegment::Index(idx) => node.get(*idx),
            })
    }

    fn json_leaf() -> impl Strategy<Value = JsonValue> {
        prop_oneof![
            any::<bool>().prop_map(JsonValue::from),
            any::<i64>().prop_map(JsonValue::from),
            "[a-zA-Z0-9 _-]{1,12}".prop_map(JsonValue::from),
        ]
    }

    fn json_tree() -> impl Strategy<Value = JsonValue> {
        json_leaf().prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..4).prop_map(JsonValue::Array),
                prop::collection::btree_map("[a-z][a-z0-9_]{0,6}", inner, 1..4)
                    .prop_map(|m| JsonValue::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_flatten_round_trip(tree in prop::collection::btree_map("[a-z][a-z0-9_]{0,6}", json_tree(), 1..4)) {
            let root = JsonValue::Object(tree.into_iter().collect());
            let flat = flatten_json(&root);
            prop_assert!(!flat.is_empty());
            for (key, text) in &flat {
                let leaf = lookup(&root, key);
                prop_assert!(leaf.is_some(), "no value at {}", key);
                let leaf_text = scalar_text(leaf.unwrap());
                prop_assert_eq!(leaf_text.as_deref(), Some(text.as_str()));
            }
        }

        #[test]
        fn prop_query_last_value_wins(key in "[a-z]{1,5}", values in prop::collection::vec("[a-z0-9]{1,5}", 1..5)) {
            let text = values.iter().map(|v| format!("{}={}", key, v)).collect::<Vec<_>>().join("&");
            let map = extract_params(&text);
            prop_assert_eq!(map.len(), 1);
            prop_assert_eq!(map.get(&key), values.last());
        }
    }
}
