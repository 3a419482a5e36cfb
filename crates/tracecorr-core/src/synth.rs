//! Test-plan synthesis.
//!
//! Turns a [`CorrelationReport`] and the samples it was built from into a
//! [`TestPlan`]: one HTTP request element per reported sample, with a regex
//! extractor on each source element and `${var}` references wherever a
//! correlated literal was used. The plan is plain data; [`TestPlan::render`]
//! turns it into JMX through the template set.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::DateTime;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

use crate::correlation::{CorrelationReport, MatchLocation, SourceRef};
use crate::error::SynthesisError;
use crate::params::{
    is_query_shaped, key_segments, last_field, KeySegment, ParamOrigin, RAW_CONTENT_KEY, SCALAR_KEY,
};
use crate::sample::Sample;
use crate::templates::{TemplateKind, TemplateSet};
use crate::utils::{to_variable_name, truncate_chars};

/// Longest label written into the plan
pub const MAX_LABEL_CHARS: usize = 200;

/// Label for samples without a timestamp when grouping by minute
pub const UNKNOWN_BUCKET: &str = "Unknown";

/// How request elements are bucketed into transaction controllers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GroupingPolicy {
    /// All requests directly under the thread group
    #[default]
    None,
    /// Consecutive requests started in the same minute share a controller
    ByMinute,
}

/// Knobs for the generated plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisOptions {
    /// Test plan name
    pub name: String,
    pub threads: u32,
    /// Ramp-up period in seconds
    pub ramp_up: u32,
    pub loops: u32,
    /// Reuse connections (HTTP Request Defaults)
    pub keep_alive: bool,
    pub dns_cache: bool,
    pub cookie_manager: bool,
    pub cache_manager: bool,
    pub grouping: GroupingPolicy,
    /// User-defined variables, in declaration order
    pub variables: IndexMap<String, String>,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            name: "Correlated Test Plan".to_string(),
            threads: 1,
            ramp_up: 1,
            loops: 1,
            keep_alive: true,
            dns_cache: true,
            cookie_manager: true,
            cache_manager: true,
            grouping: GroupingPolicy::None,
            variables: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Argument {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Regex extractor attached to the element whose response holds the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Extractor {
    pub variable: String,
    pub pattern: String,
    /// Match against response headers instead of the body
    pub use_headers: bool,
    pub default_value: String,
}

/// One HTTP request element of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestElement {
    pub sequence_index: usize,
    pub label: String,
    pub method: String,
    pub protocol: String,
    pub domain: String,
    /// Explicit port, empty for the scheme default
    pub port: String,
    /// Path, including the query when a raw body is sent
    pub path: String,
    /// Verbatim request body; excludes `arguments`
    pub raw_body: Option<String>,
    pub arguments: Vec<Argument>,
    pub headers: Vec<Header>,
    pub extractors: Vec<Extractor>,
}

impl RequestElement {
    /// Whether `needle` appears in the path, the body or an argument value
    fn references(&self, needle: &str) -> bool {
        self.path.contains(needle)
            || self.raw_body.as_deref().is_some_and(|b| b.contains(needle))
            || self.arguments.iter().any(|a| a.value.contains(needle))
    }
}

/// Consecutive request elements, optionally wrapped in a named controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestGroup {
    pub name: String,
    /// Render as a transaction controller rather than bare siblings
    pub container: bool,
    pub requests: Vec<RequestElement>,
}

/// A synthesized test plan, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestPlan {
    pub name: String,
    pub threads: u32,
    pub ramp_up: u32,
    pub loops: u32,
    pub keep_alive: bool,
    pub dns_cache: bool,
    pub cookie_manager: bool,
    pub cache_manager: bool,
    pub variables: Vec<Argument>,
    pub groups: Vec<RequestGroup>,
}

impl TestPlan {
    /// All request elements in plan order.
    pub fn requests(&self) -> impl Iterator<Item = &RequestElement> {
        self.groups.iter().flat_map(|g| g.requests.iter())
    }

    /// Names of the variables introduced by extractors.
    pub fn extracted_variables(&self) -> Vec<&str> {
        self.requests()
            .flat_map(|r| r.extractors.iter().map(|e| e.variable.as_str()))
            .collect()
    }

    /// Render as a JMX document.
    pub fn render(&self, templates: &TemplateSet) -> crate::Result<String> {
        templates.render(TemplateKind::TestPlan, "plan", self)
    }
}

/// Minute bucket of a timestamp (`YYYY-MM-DD HH:MM`, UTC).
pub fn minute_key(timestamp_ms: i64) -> String {
    if timestamp_ms == 0 {
        return UNKNOWN_BUCKET.to_string();
    }
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| UNKNOWN_BUCKET.to_string())
}

/// A literal to replace with a variable reference at its point of use.
#[derive(Debug, Clone)]
struct Substitution {
    name: String,
    value: String,
    origin: ParamOrigin,
    variable: String,
}

fn reference(variable: &str) -> String {
    format!("${{{}}}", variable)
}

/// Picks variable names and extractor placement for correlated values.
#[derive(Default)]
struct VariablePlanner {
    by_source_value: HashMap<(usize, String), String>,
    used: HashSet<String>,
    extractors: BTreeMap<usize, Vec<Extractor>>,
    substitutions: HashMap<usize, Vec<Substitution>>,
}

impl VariablePlanner {
    fn unique_name(&mut self, base: &str) -> String {
        let base = to_variable_name(base);
        let mut candidate = base.clone();
        let mut n = 2;
        while self.used.contains(&candidate) {
            candidate = format!("{}_{}", base, n);
            n += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }

    fn plan(&mut self, report: &CorrelationReport) {
        for (entry, parameter, m) in report.correlated_parameters() {
            // The extractor must live on an element that is actually in the plan.
            let source: Option<&SourceRef> = [&m.first_source, &m.nearest_source]
                .into_iter()
                .find(|s| report.entry(s.sequence_index).is_some() && !s.context_patterns.is_empty());
            let Some(source) = source else {
                log::debug!(
                    "No usable source for '{}' in '{}', keeping literal",
                    parameter.name,
                    entry.label
                );
                continue;
            };

            let key = (source.sequence_index, parameter.value.clone());
            let variable = match self.by_source_value.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let variable = self.unique_name(last_field(&parameter.name));
                    let pattern = &source.context_patterns[0];
                    self.extractors
                        .entry(source.sequence_index)
                        .or_default()
                        .push(Extractor {
                            variable: variable.clone(),
                            pattern: pattern.pattern.clone(),
                            use_headers: pattern.location == MatchLocation::Headers,
                            default_value: format!("NOT_FOUND_{}", variable),
                        });
                    self.by_source_value.insert(key, variable.clone());
                    variable
                }
            };
            self.substitutions
                .entry(entry.sequence_index)
                .or_default()
                .push(Substitution {
                    name: parameter.name.clone(),
                    value: parameter.value.clone(),
                    origin: parameter.origin,
                    variable,
                });
        }
    }
}

/// Replace matching `name=value` pairs of a form or query string, keeping
/// every other segment byte for byte.
fn substitute_form(text: &str, subs: &[&Substitution]) -> String {
    if subs.is_empty() {
        return text.to_string();
    }
    text.split('&')
        .map(|segment| {
            let Some((raw_key, raw_value)) = segment.split_once('=') else {
                return segment.to_string();
            };
            let decoded = url::form_urlencoded::parse(segment.as_bytes())
                .next()
                .map(|(k, v)| (k.into_owned(), v.into_owned()));
            let hit = decoded.and_then(|(key, value)| {
                subs.iter().find(|s| s.name == key && s.value == value)
            });
            match hit {
                Some(sub) => format!("{}={}", raw_key, reference(&sub.variable)),
                None => format!("{}={}", raw_key, raw_value),
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn json_leaf<'a>(root: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
    if name == SCALAR_KEY && !root.is_object() && !root.is_array() {
        return Some(root);
    }
    key_segments(name)?
        .iter()
        .try_fold(root, |node, segment| match segment {
            KeySegment::Field(field) => node.get(field),
            KeySegment::Index(idx) => node.get(*idx),
        })
}

/// Replace `literal` where it stands as a JSON value: after `:`, `[`, `,` or
/// at the start, and followed by `,`, `}`, `]` or the end. Keys never match.
fn replace_json_literal(text: &str, literal: &str, replacement: &str) -> String {
    let Ok(re) = Regex::new(&format!(r"(?:^|[:\[,])\s*({})", regex::escape(literal))) else {
        return text.to_string();
    };
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(1) else {
            continue;
        };
        let rest = text[m.end()..].trim_start();
        if !(rest.is_empty() || rest.starts_with([',', '}', ']'])) {
            continue;
        }
        out.push_str(&text[last..m.start()]);
        out.push_str(replacement);
        last = m.end();
    }
    out.push_str(&text[last..]);
    out
}

/// Replace correlated literals inside a raw body.
fn substitute_body(body: &str, subs: &[&Substitution]) -> String {
    if subs.is_empty() {
        return body.to_string();
    }
    if is_query_shaped(body) {
        return substitute_form(body.trim(), subs);
    }
    let parsed = serde_json::from_str::<JsonValue>(body.trim()).ok();
    let mut out = body.to_string();
    for sub in subs {
        let target = reference(&sub.variable);
        if sub.name == RAW_CONTENT_KEY {
            out = out.replace(&sub.value, &target);
            continue;
        }
        match parsed.as_ref().and_then(|root| json_leaf(root, &sub.name)) {
            Some(JsonValue::String(_)) => {
                let quoted = JsonValue::String(sub.value.clone()).to_string();
                out = replace_json_literal(&out, &quoted, &format!("\"{}\"", target));
            }
            Some(_) => out = replace_json_literal(&out, &sub.value, &target),
            None => out = out.replace(&sub.value, &target),
        }
    }
    out
}

fn build_element(sample: &Sample, subs: &[Substitution]) -> Result<RequestElement, SynthesisError> {
    let raw_url = sample.url.clone().unwrap_or_default();
    let url = Url::parse(&raw_url).map_err(|source| SynthesisError::MalformedUrl {
        label: sample.label.clone(),
        url: raw_url.clone(),
        source,
    })?;
    let domain = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| SynthesisError::MissingHost {
            label: sample.label.clone(),
            url: raw_url.clone(),
        })?
        .to_string();

    let query_subs: Vec<&Substitution> = subs.iter().filter(|s| s.origin == ParamOrigin::Query).collect();
    let body_subs: Vec<&Substitution> = subs.iter().filter(|s| s.origin == ParamOrigin::Body).collect();

    let query = url.query().unwrap_or_default();
    let (path, raw_body, arguments) = if sample.has_raw_body() {
        let path = if query.is_empty() {
            url.path().to_string()
        } else {
            format!("{}?{}", url.path(), substitute_form(query, &query_subs))
        };
        (path, Some(substitute_body(&sample.request_body, &body_subs)), Vec::new())
    } else {
        // Without a raw body a recorded query string copy is just the URL
        // query again, so body-origin substitutions apply here too.
        let arguments = url::form_urlencoded::parse(query.as_bytes())
            .map(|(name, value)| {
                let value = query_subs
                    .iter()
                    .chain(&body_subs)
                    .find(|s| s.name == name && s.value == value)
                    .map(|s| reference(&s.variable))
                    .unwrap_or_else(|| value.into_owned());
                Argument {
                    name: name.into_owned(),
                    value,
                }
            })
            .collect();
        (url.path().to_string(), None, arguments)
    };

    let headers = sample
        .header_pairs()
        .into_iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("content-length"))
        .map(|(name, value)| Header { name, value })
        .collect();

    Ok(RequestElement {
        sequence_index: sample.sequence_index,
        label: truncate_chars(&sample.label, MAX_LABEL_CHARS).to_string(),
        method: sample.method.clone(),
        protocol: url.scheme().to_string(),
        domain,
        port: url.port().map(|p| p.to_string()).unwrap_or_default(),
        path,
        raw_body,
        arguments,
        headers,
        extractors: Vec::new(),
    })
}

fn group(elements: Vec<(i64, RequestElement)>, policy: GroupingPolicy) -> Vec<RequestGroup> {
    match policy {
        GroupingPolicy::None => vec![RequestGroup {
            name: String::new(),
            container: false,
            requests: elements.into_iter().map(|(_, e)| e).collect(),
        }],
        GroupingPolicy::ByMinute => {
            let mut groups: Vec<RequestGroup> = Vec::new();
            for (timestamp_ms, element) in elements {
                let key = minute_key(timestamp_ms);
                match groups.last_mut() {
                    Some(last) if last.name == key => last.requests.push(element),
                    _ => groups.push(RequestGroup {
                        name: key,
                        container: true,
                        requests: vec![element],
                    }),
                }
            }
            groups
        }
    }
}

/// Build a test plan from a correlation report.
///
/// Every report entry must refer to one of `samples` by sequence index.
pub fn synthesize(
    report: &CorrelationReport,
    samples: &[Sample],
    options: &SynthesisOptions,
) -> Result<TestPlan, SynthesisError> {
    if report.is_empty() {
        return Err(SynthesisError::NoRequests);
    }
    let by_index: HashMap<usize, &Sample> =
        samples.iter().map(|s| (s.sequence_index, s)).collect();

    let mut planner = VariablePlanner::default();
    planner.plan(report);

    let mut elements = Vec::with_capacity(report.len());
    for entry in &report.entries {
        let sample = by_index
            .get(&entry.sequence_index)
            .copied()
            .ok_or(SynthesisError::UnknownSample {
                sequence_index: entry.sequence_index,
            })?;
        let subs = planner
            .substitutions
            .remove(&entry.sequence_index)
            .unwrap_or_default();
        elements.push((sample.timestamp_ms, build_element(sample, &subs)?));
    }

    // An extractor is only kept when some request references its variable.
    for (_, element) in elements.iter_mut() {
        let extractors = planner
            .extractors
            .remove(&element.sequence_index)
            .unwrap_or_default();
        element.extractors = extractors;
    }
    let used: HashSet<String> = elements
        .iter()
        .flat_map(|(_, element)| element.extractors.iter().map(|x| x.variable.clone()))
        .filter(|variable| {
            let needle = reference(variable);
            elements.iter().any(|(_, element)| element.references(&needle))
        })
        .collect();
    for (_, element) in elements.iter_mut() {
        let label = &element.label;
        element.extractors.retain(|x| {
            let kept = used.contains(&x.variable);
            if !kept {
                log::debug!(
                    "Dropping extractor '{}' on '{}': no request uses it",
                    x.variable,
                    label
                );
            }
            kept
        });
    }

    let plan = TestPlan {
        name: options.name.clone(),
        threads: options.threads,
        ramp_up: options.ramp_up,
        loops: options.loops,
        keep_alive: options.keep_alive,
        dns_cache: options.dns_cache,
        cookie_manager: options.cookie_manager,
        cache_manager: options.cache_manager,
        variables: options
            .variables
            .iter()
            .map(|(name, value)| Argument {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        groups: group(elements, options.grouping),
    };
    log::info!(
        "Synthesized plan '{}' with {} requests and {} extractors",
        plan.name,
        plan.requests().count(),
        plan.extracted_variables().len()
    );
    Ok(plan)
}
