//! API collection exports (Postman v2 style).
//!
//! Folders nest arbitrarily; every leaf with a `request` becomes a sample in
//! depth-first order. Saved example responses stand in for live responses so
//! that later requests can be correlated against them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::{ExtractionWarning, LoadError, WarningKind};
use crate::filter::{EntryFilter, FilterTarget, Inventory};
use crate::sample::{format_header_block, normalize_method, Sample, SampleSet};

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("valid placeholder pattern"));

#[derive(Debug, Clone, Default, Deserialize)]
struct KeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: JsonValue,
    #[serde(default)]
    disabled: bool,
}

impl KeyValue {
    fn value_text(&self) -> String {
        match &self.value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawBody {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    raw: String,
    #[serde(default)]
    urlencoded: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum RawUrl {
    #[default]
    Missing,
    Text(String),
    Structured {
        #[serde(default)]
        raw: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawRequest {
    #[serde(default)]
    method: String,
    #[serde(default)]
    url: RawUrl,
    #[serde(default)]
    header: Vec<KeyValue>,
    #[serde(default)]
    body: Option<RawBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawResponse {
    #[serde(default)]
    header: Vec<KeyValue>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawItem {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    item: Option<Vec<RawItem>>,
    #[serde(default)]
    request: Option<RawRequest>,
    #[serde(default)]
    response: Vec<RawResponse>,
}

/// One request leaf, with placeholders already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRequest {
    pub name: String,
    pub method: String,
    /// Empty when the URL is missing or still holds unresolved placeholders
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Saved example responses as (header block, body)
    pub responses: Vec<(String, String)>,
}

impl FilterTarget for CollectionRequest {
    fn request_method(&self) -> &str {
        &self.method
    }

    fn request_url(&self) -> &str {
        &self.url
    }
}

/// A parsed collection: its name, variables and flattened request leaves.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub name: String,
    pub variables: Vec<(String, String)>,
    pub requests: Vec<CollectionRequest>,
}

/// Replace `{{name}}` placeholders; unknown names are left untouched.
pub fn resolve_placeholders(text: &str, variables: &[(String, String)]) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            variables
                .iter()
                .find(|(name, _)| name == &caps[1])
                .map(|(_, value)| value.clone())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn walk(items: Vec<RawItem>, leaves: &mut Vec<(Option<String>, RawRequest, Vec<RawResponse>)>) {
    // Depth-first, keeping sibling order.
    let mut stack: Vec<RawItem> = items.into_iter().rev().collect();
    while let Some(item) = stack.pop() {
        if let Some(children) = item.item {
            stack.extend(children.into_iter().rev());
        } else if let Some(request) = item.request {
            leaves.push((item.name, request, item.response));
        }
    }
}

impl Collection {
    pub fn from_value(value: &JsonValue, source_name: &str) -> Result<Self, LoadError> {
        let structure = |message: String| LoadError::Structure {
            source_name: source_name.to_string(),
            message,
        };
        let items = value
            .get("item")
            .cloned()
            .ok_or_else(|| structure("missing 'item' array".to_string()))?;
        let items: Vec<RawItem> =
            serde_json::from_value(items).map_err(|e| structure(e.to_string()))?;
        let variables: Vec<(String, String)> = value
            .get("variable")
            .cloned()
            .map(serde_json::from_value::<Vec<KeyValue>>)
            .transpose()
            .map_err(|e| structure(e.to_string()))?
            .unwrap_or_default()
            .into_iter()
            .filter(|kv| !kv.key.is_empty() && !kv.disabled)
            .map(|kv| {
                let text = kv.value_text();
                (kv.key, text)
            })
            .collect();
        let name = value
            .pointer("/info/name")
            .and_then(JsonValue::as_str)
            .unwrap_or("Unnamed Collection")
            .to_string();

        let mut leaves = Vec::new();
        walk(items, &mut leaves);

        let requests = leaves
            .into_iter()
            .enumerate()
            .map(|(idx, (name, request, responses))| {
                let resolve = |text: &str| resolve_placeholders(text, &variables);
                let raw_url = match &request.url {
                    RawUrl::Missing => String::new(),
                    RawUrl::Text(s) => s.clone(),
                    RawUrl::Structured { raw } => raw.clone(),
                };
                let url = resolve(raw_url.trim());
                let url = if PLACEHOLDER_RE.is_match(&url) {
                    log::debug!("Unresolved placeholder in collection URL '{}'", url);
                    String::new()
                } else {
                    url
                };
                let body = match &request.body {
                    Some(b) if b.mode == "urlencoded" => {
                        url::form_urlencoded::Serializer::new(String::new())
                            .extend_pairs(
                                b.urlencoded
                                    .iter()
                                    .filter(|kv| !kv.disabled)
                                    .map(|kv| (resolve(&kv.key), resolve(&kv.value_text()))),
                            )
                            .finish()
                    }
                    Some(b) => resolve(&b.raw),
                    None => String::new(),
                };
                CollectionRequest {
                    name: name
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| format!("Request {}", idx + 1)),
                    method: normalize_method(&request.method),
                    url,
                    headers: request
                        .header
                        .iter()
                        .filter(|h| !h.disabled && !h.key.is_empty())
                        .map(|h| (h.key.clone(), resolve(&h.value_text())))
                        .collect(),
                    body,
                    responses: responses
                        .iter()
                        .map(|r| {
                            let pairs: Vec<(String, String)> = r
                                .header
                                .iter()
                                .map(|h| (h.key.clone(), h.value_text()))
                                .collect();
                            let headers = format_header_block(
                                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                            );
                            (headers, r.body.clone().unwrap_or_default())
                        })
                        .collect(),
                }
            })
            .collect();

        Ok(Self {
            name,
            variables,
            requests,
        })
    }

    /// Base URLs, methods and extensions of the resolved requests.
    pub fn inventory(&self) -> Inventory {
        Inventory::of(&self.requests)
    }

    /// Filter the request leaves, then turn them into samples.
    pub fn to_samples(&self, filter: &EntryFilter) -> SampleSet {
        let mut set = SampleSet {
            variables: self.variables.clone(),
            ..SampleSet::default()
        };
        for (idx, request) in filter.apply(self.requests.clone()).into_iter().enumerate() {
            let mut sample = Sample::new(idx, request.name);
            sample.method = request.method;
            sample.url = (!request.url.is_empty()).then_some(request.url);
            sample.request_headers = format_header_block(
                request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            );
            sample.request_body = request.body;
            sample.response_headers = request
                .responses
                .iter()
                .map(|(h, _)| h.as_str())
                .collect::<Vec<_>>()
                .join("");
            sample.response_body = request
                .responses
                .iter()
                .map(|(_, b)| b.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if sample.url.is_none() {
                set.warn(ExtractionWarning {
                    kind: WarningKind::MissingUrl,
                    sequence_index: Some(idx),
                    label: sample.label.clone(),
                });
            }
            set.samples.push(sample);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection() -> JsonValue {
        json!({
            "info": {"name": "Shop"},
            "variable": [
                {"key": "baseUrl", "value": "https://shop.test"},
                {"key": "off", "value": "x", "disabled": true}
            ],
            "item": [
                {"name": "Auth", "item": [
                    {"name": "Login", "request": {
                        "method": "post",
                        "url": {"raw": "{{baseUrl}}/login"},
                        "header": [{"key": "Content-Type", "value": "application/json"}],
                        "body": {"mode": "raw", "raw": "{\"user\": \"ann\"}"}
                    }, "response": [
                        {"header": [{"key": "X-Session", "value": "s-1"}], "body": "{\"token\": \"t-9\"}"}
                    ]}
                ]},
                {"request": {
                    "method": "GET",
                    "url": "{{baseUrl}}/orders?token=t-9"
                }},
                {"name": "Form", "request": {
                    "method": "PUT",
                    "url": "{{missing}}/form",
                    "body": {"mode": "urlencoded", "urlencoded": [
                        {"key": "a", "value": "1 2"},
                        {"key": "b", "value": "x", "disabled": true}
                    ]}
                }}
            ]
        })
    }

    #[test]
    fn test_walk_and_resolve() {
        let c = Collection::from_value(&collection(), "shop.json").unwrap();
        assert_eq!(c.name, "Shop");
        assert_eq!(c.variables, vec![("baseUrl".to_string(), "https://shop.test".to_string())]);
        let names: Vec<_> = c.requests.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Login", "Request 2", "Form"]);
        assert_eq!(c.requests[0].url, "https://shop.test/login");
        assert_eq!(c.requests[0].method, "POST");
        assert_eq!(c.requests[1].url, "https://shop.test/orders?token=t-9");
        assert_eq!(c.requests[2].url, "");
        assert_eq!(c.requests[2].body, "a=1+2");
    }

    #[test]
    fn test_to_samples() {
        let c = Collection::from_value(&collection(), "shop.json").unwrap();
        let set = c.to_samples(&EntryFilter::default());
        assert_eq!(set.len(), 3);
        assert_eq!(set.samples[0].response_headers, "X-Session: s-1\n");
        assert_eq!(set.samples[0].response_body, "{\"token\": \"t-9\"}");
        assert_eq!(set.samples[0].request_headers, "Content-Type: application/json\n");
        assert_eq!(set.warnings.len(), 1);
        assert_eq!(set.warnings[0].kind, WarningKind::MissingUrl);
        assert_eq!(set.variables.len(), 1);
        assert_eq!(set.correlatable().count(), 2);
    }

    #[test]
    fn test_filter_applies_before_indexing() {
        let c = Collection::from_value(&collection(), "shop.json").unwrap();
        let filter = EntryFilter {
            methods: vec!["GET".into()],
            ..EntryFilter::default()
        };
        let set = c.to_samples(&filter);
        assert_eq!(set.len(), 1);
        assert_eq!(set.samples[0].sequence_index, 0);
        assert_eq!(set.samples[0].label, "Request 2");
    }

    #[test]
    fn test_resolve_placeholders() {
        let vars = vec![("host".to_string(), "a.test".to_string())];
        assert_eq!(resolve_placeholders("https://{{ host }}/{{x}}", &vars), "https://a.test/{{x}}");
    }

    #[test]
    fn test_missing_items_is_structure_error() {
        let err = Collection::from_value(&json!({"info": {}}), "c.json").unwrap_err();
        assert!(matches!(err, LoadError::Structure { .. }));
    }
}
