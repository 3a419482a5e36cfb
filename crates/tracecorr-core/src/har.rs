//! HAR (HTTP Archive) capture logs.
//!
//! Browser captures are turned into normalized [`Sample`]s so they can be
//! correlated like any other recording. Entries are decoded one by one and a
//! malformed entry is skipped with a warning rather than failing the whole
//! log. [`HarContext::inventory`] lists what a capture contains so a caller
//! can build an [`EntryFilter`].

use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use url::Url;

use crate::error::{ExtractionWarning, LoadError, WarningKind};
use crate::filter::{EntryFilter, FilterTarget, Inventory};
use crate::sample::{format_header_block, normalize_method, Sample, SampleSet, BINARY_PLACEHOLDER};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    #[serde(default)]
    pub started_date_time: String,
    #[serde(default)]
    pub time: f64,
    #[serde(default)]
    pub request: HarRequest,
    #[serde(default)]
    pub response: HarResponse,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: Vec<HarHeader>,
    #[serde(default)]
    pub post_data: Option<HarPostData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: Vec<HarHeader>,
    #[serde(default)]
    pub content: HarContent,
    #[serde(default)]
    pub body_size: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HarHeader {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub mime_type: String,
}

impl FilterTarget for HarEntry {
    fn request_method(&self) -> &str {
        &self.request.method
    }

    fn request_url(&self) -> &str {
        &self.request.url
    }
}

impl HarEntry {
    /// Response body as text; `None` when base64 content does not decode.
    pub fn response_text(&self) -> Option<String> {
        let content = &self.response.content;
        let text = content.text.clone().unwrap_or_default();
        let is_base64 = content
            .encoding
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case("base64"));
        if !is_base64 {
            return Some(text);
        }
        base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Start time in milliseconds since the epoch, `0` if absent or unparseable.
    pub fn timestamp_ms(&self) -> i64 {
        parse_timestamp_ms(&self.started_date_time).unwrap_or(0)
    }

    /// Convert into a sample at the given position. Labels count from 1.
    pub fn to_sample(&self, sequence_index: usize) -> Sample {
        let method = normalize_method(&self.request.method);
        let url = self.request.url.trim();
        let path = Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string());

        let mut sample = Sample::new(
            sequence_index,
            format!("{:03}_{}_{}", sequence_index + 1, method, path),
        );
        sample.url = (!url.is_empty()).then(|| url.to_string());
        sample.request_headers = header_block(&self.request.headers);
        sample.request_body = self
            .request
            .post_data
            .as_ref()
            .map(|p| p.text.clone())
            .unwrap_or_default();
        sample.response_headers = header_block(&self.response.headers);
        match self.response_text() {
            Some(text) => sample.response_body = text,
            None => {
                sample.response_body = BINARY_PLACEHOLDER.to_string();
                sample.binary_response = true;
            }
        }
        sample.timestamp_ms = self.timestamp_ms();
        sample.method = method;
        sample
    }
}

fn header_block(headers: &[HarHeader]) -> String {
    format_header_block(
        headers
            .iter()
            .filter(|h| !h.name.is_empty())
            .map(|h| (h.name.as_str(), h.value.as_str())),
    )
}

/// Parse the timestamp formats seen in HAR files.
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Parsed representation of a HAR file.
#[derive(Debug, Clone, Default)]
pub struct HarContext {
    entries: Vec<HarEntry>,
    /// Entries that could not be decoded, by array position
    skipped: Vec<usize>,
}

impl HarContext {
    /// Decode the entries of a parsed HAR document.
    pub fn from_value(value: &JsonValue, source_name: &str) -> Result<Self, LoadError> {
        let raw_entries = value
            .get("log")
            .and_then(|l| l.get("entries"))
            .and_then(JsonValue::as_array)
            .ok_or_else(|| LoadError::Structure {
                source_name: source_name.to_string(),
                message: "missing 'log.entries' array".to_string(),
            })?;

        let mut entries = Vec::with_capacity(raw_entries.len());
        let mut skipped = Vec::new();
        for (idx, raw) in raw_entries.iter().enumerate() {
            match serde_json::from_value::<HarEntry>(raw.clone()) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    log::warn!("Skipping HAR entry {} in {}: {}", idx, source_name, e);
                    skipped.push(idx);
                }
            }
        }
        Ok(Self { entries, skipped })
    }

    pub fn entries(&self) -> &[HarEntry] {
        &self.entries
    }

    /// Base URLs, methods and extensions present in the capture.
    pub fn inventory(&self) -> Inventory {
        Inventory::of(&self.entries)
    }

    /// Entries that pass the filter, in capture order.
    pub fn filtered(&self, filter: &EntryFilter) -> Vec<HarEntry> {
        filter.apply(self.entries.clone())
    }

    /// Filter, then convert every remaining entry into a sample.
    pub fn to_samples(&self, filter: &EntryFilter) -> SampleSet {
        let mut set = SampleSet::default();
        for idx in &self.skipped {
            set.warn(ExtractionWarning {
                kind: WarningKind::MalformedEntry,
                sequence_index: None,
                label: format!("entry {}", idx),
            });
        }
        for (idx, entry) in self.filtered(filter).iter().enumerate() {
            let sample = entry.to_sample(idx);
            if sample.url.is_none() {
                set.warn(ExtractionWarning {
                    kind: WarningKind::MissingUrl,
                    sequence_index: Some(idx),
                    label: sample.label.clone(),
                });
            }
            if sample.binary_response {
                set.warn(ExtractionWarning {
                    kind: WarningKind::BinaryResponse,
                    sequence_index: Some(idx),
                    label: sample.label.clone(),
                });
            }
            set.samples.push(sample);
        }
        set
    }
}
