//! Sample recordings: JMeter result trees (`testResults` XML / JTL).
//!
//! Reading walks the markup tree in document order and turns every sample
//! node into a [`Sample`]. Writing goes the other way and exports a filtered
//! capture log as a recording that [`extract_samples`] can read back.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{ExtractionWarning, WarningKind};
use crate::filter::EntryFilter;
use crate::har::HarContext;
use crate::loader::MarkupNode;
use crate::sample::{Sample, SampleSet, BINARY_PLACEHOLDER, DEFAULT_LABEL};
use crate::templates::{TemplateKind, TemplateSet};

static SAMPLER_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).expect("valid sampler URL pattern"));

/// Child elements that hold the request URL, in lookup order.
const URL_FIELDS: [&str; 3] = ["java.net.URL", "URL", "url"];

/// What a markup node means to the extractor, decided once per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// `httpSample`, `sample`, or anything else whose name ends in "sample"
    Sample,
    /// Container or unrelated element
    Other,
}

impl NodeKind {
    pub fn of(node: &MarkupNode) -> Self {
        if node.name.to_lowercase().ends_with("sample") {
            Self::Sample
        } else {
            Self::Other
        }
    }
}

/// Outcome of visiting one node.
#[derive(Debug)]
pub enum Visit {
    Sample(Box<Sample>),
    NonSample,
}

fn child_text(node: &MarkupNode, name: &str) -> String {
    node.child_text(name).unwrap_or_default().to_string()
}

fn resolve_url(node: &MarkupNode) -> Option<String> {
    URL_FIELDS
        .iter()
        .filter_map(|name| node.child_text(name))
        .map(str::trim)
        .find(|url| !url.is_empty())
        .map(str::to_string)
        .or_else(|| {
            node.child_text("samplerData")
                .and_then(|data| SAMPLER_URL_RE.find(data))
                .map(|m| m.as_str().to_string())
        })
}

/// Turn a node into a sample if it is one. `sequence_index` is the
/// position the sample would take.
pub fn visit(node: &MarkupNode, sequence_index: usize) -> Visit {
    if NodeKind::of(node) != NodeKind::Sample {
        return Visit::NonSample;
    }
    let label = node
        .attribute("lb")
        .filter(|lb| !lb.is_empty())
        .unwrap_or(DEFAULT_LABEL);
    let mut sample = Sample::new(sequence_index, label);
    let method = child_text(node, "method").trim().to_uppercase();
    sample.method = if method.is_empty() {
        "GET".to_string()
    } else {
        method
    };
    sample.url = resolve_url(node);
    sample.request_headers = child_text(node, "requestHeader");
    sample.request_body = child_text(node, "queryString");
    sample.response_headers = child_text(node, "responseHeader");
    sample.response_body = child_text(node, "responseData");
    sample.timestamp_ms = node
        .attribute("ts")
        .and_then(|ts| ts.trim().parse().ok())
        .unwrap_or(0);
    sample.binary_response =
        node.attribute("dt") == Some("bin") || sample.response_body.trim() == BINARY_PLACEHOLDER;
    Visit::Sample(Box::new(sample))
}

/// Accumulates visit results into a sample set.
#[derive(Debug, Default)]
pub struct SampleCollector {
    set: SampleSet,
}

impl SampleCollector {
    /// Index the next collected sample will get
    pub fn next_index(&self) -> usize {
        self.set.samples.len()
    }

    pub fn accept(&mut self, visit: Visit) {
        let Visit::Sample(sample) = visit else {
            return;
        };
        let sample = *sample;
        if sample.url.is_none() {
            self.set.warn(ExtractionWarning {
                kind: WarningKind::MissingUrl,
                sequence_index: Some(sample.sequence_index),
                label: sample.label.clone(),
            });
        }
        if sample.binary_response {
            self.set.warn(ExtractionWarning {
                kind: WarningKind::BinaryResponse,
                sequence_index: Some(sample.sequence_index),
                label: sample.label.clone(),
            });
        }
        self.set.samples.push(sample);
    }

    pub fn finish(self) -> SampleSet {
        self.set
    }
}

/// Extract every sample node, nested ones included, in document order.
pub fn extract_samples(root: &MarkupNode) -> SampleSet {
    let mut collector = SampleCollector::default();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        let outcome = visit(node, collector.next_index());
        collector.accept(outcome);
        stack.extend(node.children.iter().rev());
    }
    let set = collector.finish();
    log::debug!(
        "Extracted {} samples ({} with URL) from recording",
        set.len(),
        set.correlatable().count()
    );
    set
}

/// One `httpSample` element of an exported recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedSample {
    pub label: String,
    pub elapsed_ms: i64,
    pub timestamp_ms: i64,
    pub success: bool,
    pub status: i64,
    pub status_text: String,
    /// `text` or `bin`
    pub data_type: &'static str,
    pub bytes: i64,
    pub method: String,
    pub url: String,
    pub request_headers: String,
    pub request_body: String,
    pub response_headers: String,
    pub response_body: String,
}

/// A recording ready to be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recording {
    pub thread_name: String,
    pub samples: Vec<RecordedSample>,
}

impl Recording {
    /// Build a recording from the entries of a capture log that pass `filter`.
    pub fn from_capture(har: &HarContext, filter: &EntryFilter) -> Self {
        let samples = har
            .filtered(filter)
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let sample = entry.to_sample(idx);
                let status = entry.response.status;
                RecordedSample {
                    label: sample.label,
                    elapsed_ms: entry.time.max(0.0) as i64,
                    timestamp_ms: sample.timestamp_ms,
                    success: (100..400).contains(&status),
                    status,
                    status_text: entry.response.status_text.clone(),
                    data_type: if sample.binary_response { "bin" } else { "text" },
                    bytes: entry.response.body_size.max(0),
                    method: sample.method,
                    url: sample.url.unwrap_or_default(),
                    request_headers: sample.request_headers,
                    request_body: sample.request_body,
                    response_headers: sample.response_headers,
                    response_body: sample.response_body,
                }
            })
            .collect();
        Self {
            thread_name: "Thread Group 1-1".to_string(),
            samples,
        }
    }

    pub fn render(&self, templates: &TemplateSet) -> crate::Result<String> {
        templates.render(TemplateKind::Recording, "recording", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{parse_markup, Document, LoadedDocument};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn fixture_path(rel: &str) -> PathBuf {
        let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest.parent().unwrap().parent().unwrap().join(rel)
    }

    fn markup(text: &str) -> MarkupNode {
        parse_markup(text).unwrap().into_value()
    }

    #[test]
    fn test_nested_samples_in_document_order() {
        let root = markup(
            r#"<testResults>
                 <httpSample lb="parent" ts="1000">
                   <java.net.URL>https://x.test/a</java.net.URL>
                   <sample lb="child"><URL>https://x.test/b</URL></sample>
                 </httpSample>
                 <ns:HTTPSAMPLE xmlns:ns="urn:x" lb="third"><url>https://x.test/c</url></ns:HTTPSAMPLE>
                 <assertionResult><name>not a sample</name></assertionResult>
               </testResults>"#,
        );
        let set = extract_samples(&root);
        let labels: Vec<_> = set.samples.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["parent", "child", "third"]);
        let indices: Vec<_> = set.samples.iter().map(|s| s.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(set.samples[0].timestamp_ms, 1000);
        assert_eq!(set.samples[1].url.as_deref(), Some("https://x.test/b"));
        assert_eq!(set.samples[2].url.as_deref(), Some("https://x.test/c"));
        assert!(set.warnings.is_empty());
    }

    #[test]
    fn test_url_from_sampler_data_and_defaults() {
        let root = markup(
            r#"<testResults>
                 <httpSample><samplerData>GET https://x.test/data?q=1
                 Cookie: a=b</samplerData></httpSample>
                 <httpSample lb="nourl"/>
               </testResults>"#,
        );
        let set = extract_samples(&root);
        assert_eq!(set.samples[0].label, DEFAULT_LABEL);
        assert_eq!(set.samples[0].method, "GET");
        assert_eq!(set.samples[0].url.as_deref(), Some("https://x.test/data?q=1"));
        assert_eq!(set.samples[1].url, None);
        assert_eq!(set.warnings.len(), 1);
        assert_eq!(set.warnings[0].kind, WarningKind::MissingUrl);
        assert_eq!(set.correlatable().count(), 1);
    }

    #[test]
    fn test_binary_response_warns() {
        let root = markup(
            r#"<testResults>
                 <httpSample lb="img" dt="bin"><java.net.URL>https://x.test/i</java.net.URL><responseData>PNG</responseData></httpSample>
                 <httpSample lb="img2"><java.net.URL>https://x.test/j</java.net.URL><responseData>[Binary data]</responseData></httpSample>
               </testResults>"#,
        );
        let set = extract_samples(&root);
        assert!(set.samples.iter().all(|s| s.binary_response));
        assert_eq!(set.warnings.len(), 2);
        assert!(set.warnings.iter().all(|w| w.kind == WarningKind::BinaryResponse));
    }

    #[tokio::test]
    async fn test_fixture_recording() -> crate::Result<()> {
        let loaded = LoadedDocument::from_file(fixture_path("tests/fixtures/recording/sample.jtl")).await?;
        assert!(loaded.was_repaired());
        let Document::Recording(root) = &loaded.document else {
            panic!("expected a recording");
        };
        let set = extract_samples(root);
        assert_eq!(set.len(), 3);
        assert!(set.samples[0].response_body.contains("sess-42"));
        assert_eq!(set.samples[2].method, "POST");
        Ok(())
    }

    #[tokio::test]
    async fn test_export_reads_back() -> crate::Result<()> {
        let loaded = LoadedDocument::from_file(fixture_path("tests/fixtures/har/sample.har")).await?;
        let Document::CaptureLog(value) = &loaded.document else {
            panic!("expected a capture log");
        };
        let har = HarContext::from_value(value, &loaded.source_name)?;
        let filter = EntryFilter::default();
        let recording = Recording::from_capture(&har, &filter);
        let xml = recording.render(&TemplateSet::builtin()?)?;

        let reread = LoadedDocument::from_bytes("export.xml", xml.as_bytes(), None)?;
        let Document::Recording(root) = &reread.document else {
            panic!("expected a recording");
        };
        let from_xml = extract_samples(root);
        let from_har = har.to_samples(&filter);
        assert_eq!(from_xml.len(), from_har.len());
        for (a, b) in from_xml.samples.iter().zip(&from_har.samples) {
            assert_eq!(a.label, b.label);
            assert_eq!(a.url, b.url);
            assert_eq!(a.method, b.method);
            assert_eq!(a.request_body, b.request_body);
            assert_eq!(a.response_body, b.response_body);
            assert_eq!(a.timestamp_ms, b.timestamp_ms);
        }
        Ok(())
    }
}
