//! Normalized request/response samples shared by every input format.

use serde::Serialize;

use crate::error::ExtractionWarning;

/// Label given to samples that carry none.
pub const DEFAULT_LABEL: &str = "No_Label";

/// Body text standing in for non-text response content.
pub const BINARY_PLACEHOLDER: &str = "[Binary data]";

/// Methods accepted verbatim from capture logs; anything else becomes GET.
pub const STANDARD_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

/// Methods whose request body is sent as a raw payload.
pub const BODY_METHODS: [&str; 4] = ["POST", "PUT", "PATCH", "DELETE"];

/// One observed request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Position in the trace; defines "earlier than" for correlation
    pub sequence_index: usize,
    pub label: String,
    pub method: String,
    /// `None` for samples kept only for diagnostics
    pub url: Option<String>,
    pub request_headers: String,
    pub request_body: String,
    pub response_headers: String,
    pub response_body: String,
    /// Milliseconds since the epoch, `0` when unknown
    pub timestamp_ms: i64,
    /// Response content was binary; `response_body` holds no usable text
    pub binary_response: bool,
}

impl Sample {
    /// Create an empty sample at the given position.
    pub fn new(sequence_index: usize, label: impl Into<String>) -> Self {
        Self {
            sequence_index,
            label: label.into(),
            method: String::new(),
            url: None,
            request_headers: String::new(),
            request_body: String::new(),
            response_headers: String::new(),
            response_body: String::new(),
            timestamp_ms: 0,
            binary_response: false,
        }
    }

    /// Text searched when this sample is a correlation source.
    ///
    /// Binary bodies contribute nothing; headers are always included.
    pub fn response_text(&self) -> String {
        let body = if self.binary_response {
            ""
        } else {
            self.response_body.as_str()
        };
        format!("{}\n{}", self.response_headers, body)
    }

    /// Query part of the URL, without the leading `?`.
    pub fn url_query(&self) -> &str {
        self.url
            .as_deref()
            .and_then(|u| u.split_once('?'))
            .map(|(_, q)| q.split('#').next().unwrap_or(""))
            .unwrap_or("")
    }

    /// Request headers as name/value pairs, one per `Name: value` line.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        parse_header_block(&self.request_headers)
    }

    /// Whether the request body is sent as a raw payload.
    pub fn has_raw_body(&self) -> bool {
        !self.request_body.trim().is_empty() && BODY_METHODS.contains(&self.method.as_str())
    }
}

/// Parse a `Name: value` per line header block. Lines without a colon and
/// HTTP/2 pseudo headers (`:authority`) are skipped.
pub fn parse_header_block(block: &str) -> Vec<(String, String)> {
    block
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            if line.starts_with(':') {
                return None;
            }
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Render name/value pairs back into a header block.
pub fn format_header_block<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(name, value)| format!("{}: {}\n", name, value))
        .collect()
}

/// Normalize a captured method name, defaulting unknown methods to GET.
pub fn normalize_method(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    if STANDARD_METHODS.contains(&upper.as_str()) {
        upper
    } else {
        "GET".to_string()
    }
}

/// Ordered samples extracted from one document, with their diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SampleSet {
    pub samples: Vec<Sample>,
    pub warnings: Vec<ExtractionWarning>,
    /// Collection-level variables (name, value), if the input defines any
    pub variables: Vec<(String, String)>,
}

impl SampleSet {
    /// Samples that can take part in parameter extraction and correlation.
    pub fn correlatable(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter().filter(|s| s.url.is_some())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub(crate) fn warn(&mut self, warning: ExtractionWarning) {
        log::warn!("{}", warning);
        self.warnings.push(warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_text_ignores_binary_body() {
        let mut sample = Sample::new(0, "s");
        sample.response_headers = "Content-Type: image/png".into();
        sample.response_body = BINARY_PLACEHOLDER.into();
        sample.binary_response = true;
        assert_eq!(sample.response_text(), "Content-Type: image/png\n");
    }

    #[test]
    fn test_url_query() {
        let mut sample = Sample::new(0, "s");
        assert_eq!(sample.url_query(), "");
        sample.url = Some("https://x.test/a?id=1&b=2#frag".into());
        assert_eq!(sample.url_query(), "id=1&b=2");
    }

    #[test]
    fn test_parse_header_block_skips_pseudo_headers() {
        let pairs = parse_header_block(":authority: x.test\r\nAccept: */*\r\nbroken\nX-Token: a:b\n");
        assert_eq!(
            pairs,
            vec![
                ("Accept".to_string(), "*/*".to_string()),
                ("X-Token".to_string(), "a:b".to_string()),
            ]
        );
    }

    #[test]
    fn test_normalize_method() {
        assert_eq!(normalize_method("post"), "POST");
        assert_eq!(normalize_method("PROPFIND"), "GET");
        assert_eq!(normalize_method(""), "GET");
    }

    #[test]
    fn test_has_raw_body() {
        let mut sample = Sample::new(0, "s");
        sample.method = "GET".into();
        sample.request_body = "a=1".into();
        assert!(!sample.has_raw_body());
        sample.method = "POST".into();
        assert!(sample.has_raw_body());
        sample.request_body = "  ".into();
        assert!(!sample.has_raw_body());
    }
}
