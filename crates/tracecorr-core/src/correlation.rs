//! Correlation matching and the correlation report.
//!
//! A parameter is *correlated* when its value, or one of its encoding
//! variants, appears in the response text of an earlier sample. For every
//! such parameter the report records the earliest and the latest matching
//! source together with context patterns that can be turned into regex
//! extractors.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Deserializer, Serialize};
use serde_value::Value as SerdeValue;

use crate::params::{sample_parameters, Parameter};
use crate::sample::Sample;

/// Unreserved characters (RFC 3986) stay literal when encoding a variant.
const VARIANT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Which occurrences inside one response feed the context patterns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OccurrencePreference {
    /// Earliest occurrences first
    #[default]
    First,
    /// Latest occurrences first
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherOptions {
    /// Context patterns kept per matching source
    pub max_patterns: usize,
    /// Characters of context taken on each side of an occurrence
    pub context_width: usize,
    pub occurrence: OccurrencePreference,
}

impl Default for MatcherOptions {
    fn default() -> Self {
        Self {
            max_patterns: 3,
            context_width: 20,
            occurrence: OccurrencePreference::First,
        }
    }
}

/// Part of the response an occurrence was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchLocation {
    Headers,
    Body,
}

/// A value occurrence generalized into an extraction regex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextPattern {
    pub pattern: String,
    pub location: MatchLocation,
}

/// A prior sample whose response contains the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRef {
    pub sequence_index: usize,
    pub label: String,
    /// The textual form that was found (literal or an encoding variant)
    pub variant: String,
    pub context_patterns: Vec<ContextPattern>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationMatch {
    pub first_source: SourceRef,
    pub nearest_source: SourceRef,
    /// Number of prior samples whose response contains the value
    pub match_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Correlation {
    Correlated(CorrelationMatch),
    Uncorrelated,
}

impl Correlation {
    pub fn is_correlated(&self) -> bool {
        matches!(self, Self::Correlated(_))
    }

    pub fn as_match(&self) -> Option<&CorrelationMatch> {
        match self {
            Self::Correlated(m) => Some(m),
            Self::Uncorrelated => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterCorrelation {
    #[serde(flatten)]
    pub parameter: Parameter,
    pub correlation: Correlation,
}

/// One reported request with all of its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub sequence_index: usize,
    pub label: String,
    pub method: String,
    pub url: String,
    /// Empty when the request carries no non-empty parameters
    pub parameters: Vec<ParameterCorrelation>,
}

/// Analysis result, ordered by `sequence_index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationReport {
    pub entries: Vec<ReportEntry>,
}

impl CorrelationReport {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, sequence_index: usize) -> Option<&ReportEntry> {
        self.entries
            .binary_search_by_key(&sequence_index, |e| e.sequence_index)
            .ok()
            .map(|pos| &self.entries[pos])
    }

    /// Keep only the entries whose URL passes `filter`.
    pub fn restrict_to(&self, filter: &UrlFilter) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| filter.matches(&e.url))
                .cloned()
                .collect(),
        }
    }

    /// Every correlated parameter with the entry that uses it.
    pub fn correlated_parameters(
        &self,
    ) -> impl Iterator<Item = (&ReportEntry, &Parameter, &CorrelationMatch)> {
        self.entries.iter().flat_map(|entry| {
            entry.parameters.iter().filter_map(move |pc| {
                pc.correlation
                    .as_match()
                    .map(|m| (entry, &pc.parameter, m))
            })
        })
    }
}

/// Allow-list of URL substrings. Schemes are ignored and matching is
/// case-insensitive; an empty filter accepts every URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct UrlFilter {
    patterns: Vec<String>,
}

fn normalize_url(url: &str) -> String {
    url.trim()
        .to_lowercase()
        .replace("https://", "")
        .replace("http://", "")
}

impl UrlFilter {
    /// Parse a comma-separated list; blank items are ignored.
    pub fn parse(text: &str) -> Self {
        Self::from_patterns(text.split(','))
    }

    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| normalize_url(p.as_ref()))
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, url: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let url = normalize_url(url);
        self.patterns.iter().any(|p| url.contains(p.as_str()))
    }
}

impl<'de> Deserialize<'de> for UrlFilter {
    /// Accepts a comma-separated string or a list of strings.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = SerdeValue::deserialize(deserializer)?;

        match value {
            SerdeValue::Unit | SerdeValue::Option(None) => Ok(Self::default()),
            SerdeValue::String(s) => Ok(Self::parse(&s)),
            SerdeValue::Seq(seq) => {
                let mut result = Vec::new();
                for item in seq {
                    if let SerdeValue::String(s) = item {
                        result.push(s);
                    } else {
                        return Err(serde::de::Error::custom(
                            "Expected string or array of strings",
                        ));
                    }
                }
                Ok(Self::from_patterns(result))
            }
            _ => Err(serde::de::Error::custom(
                "Expected string or array of strings",
            )),
        }
    }
}

/// Textual forms under which a value may appear in a response.
///
/// Order: literal, percent-decoded, percent-encoded, then base64 padding
/// toggles. Duplicates and empty strings are dropped.
pub fn value_variants(value: &str) -> Vec<String> {
    let mut candidates = vec![
        value.to_string(),
        percent_decode_str(value).decode_utf8_lossy().into_owned(),
        utf8_percent_encode(value, VARIANT_ENCODE_SET).to_string(),
    ];

    if let Some(stem) = value.strip_suffix("==") {
        candidates.push(format!("{}%3D%3D", stem));
        candidates.push(format!("{}%3d%3d", stem));
    } else if let Some(stem) = value.strip_suffix('=') {
        candidates.push(format!("{}%3D", stem));
        candidates.push(format!("{}%3d", stem));
    }
    let lower = value.to_ascii_lowercase();
    if lower.ends_with("%3d%3d") {
        candidates.push(format!("{}==", &value[..value.len() - 6]));
    } else if lower.ends_with("%3d") {
        candidates.push(format!("{}=", &value[..value.len() - 3]));
    }

    let mut variants: Vec<String> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

fn last_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

fn first_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Generalize the occurrences of `needle` in a response into regexes.
///
/// `headers_len` is the byte length of the header part of `text`;
/// occurrences before it are reported as header matches.
pub fn context_patterns(
    text: &str,
    headers_len: usize,
    needle: &str,
    options: &MatcherOptions,
) -> Vec<ContextPattern> {
    if needle.is_empty() || options.max_patterns == 0 {
        return Vec::new();
    }
    let occurrences: Vec<(usize, usize)> = text
        .match_indices(needle)
        .map(|(start, m)| (start, start + m.len()))
        .collect();

    let order: Box<dyn Iterator<Item = usize>> = match options.occurrence {
        OccurrencePreference::First => Box::new(0..occurrences.len()),
        OccurrencePreference::Last => Box::new((0..occurrences.len()).rev()),
    };

    let mut patterns: Vec<ContextPattern> = Vec::new();
    for i in order {
        let (start, end) = occurrences[i];
        let lower = text[..start]
            .rfind('\n')
            .map(|p| p + 1)
            .unwrap_or(0)
            .max(if i > 0 { occurrences[i - 1].1 } else { 0 });
        let upper = text[end..]
            .find('\n')
            .map(|p| end + p)
            .unwrap_or(text.len())
            .min(occurrences.get(i + 1).map(|o| o.0).unwrap_or(text.len()));

        let before = last_chars(&text[lower..start], options.context_width);
        let after = first_chars(&text[end..upper], options.context_width);
        let capture = if after.is_empty() { "(.+)" } else { "(.+?)" };
        let pattern = format!(
            "{}{}{}",
            regex::escape(before),
            capture,
            regex::escape(after)
        );
        if patterns.iter().any(|p| p.pattern == pattern) {
            continue;
        }
        patterns.push(ContextPattern {
            pattern,
            location: if start < headers_len {
                MatchLocation::Headers
            } else {
                MatchLocation::Body
            },
        });
        if patterns.len() == options.max_patterns {
            break;
        }
    }
    patterns
}

struct Source<'a> {
    sample: &'a Sample,
    text: String,
}

impl Source<'_> {
    fn find(&self, variants: &[String], options: &MatcherOptions) -> Option<SourceRef> {
        let variant = variants.iter().find(|v| self.text.contains(v.as_str()))?;
        Some(SourceRef {
            sequence_index: self.sample.sequence_index,
            label: self.sample.label.clone(),
            variant: variant.clone(),
            context_patterns: context_patterns(
                &self.text,
                self.sample.response_headers.len(),
                variant,
                options,
            ),
        })
    }
}

fn correlate(value: &str, sources: &[Source<'_>], options: &MatcherOptions) -> Correlation {
    let variants = value_variants(value);
    let mut found = sources.iter().filter_map(|s| s.find(&variants, options));
    let Some(first_source) = found.next() else {
        return Correlation::Uncorrelated;
    };
    let mut match_count = 1;
    let mut nearest_source = None;
    for source in found {
        match_count += 1;
        nearest_source = Some(source);
    }
    Correlation::Correlated(CorrelationMatch {
        nearest_source: nearest_source.unwrap_or_else(|| first_source.clone()),
        first_source,
        match_count,
    })
}

/// Correlate every parameter of every URL-bearing sample against the
/// responses of all earlier URL-bearing samples.
///
/// `url_filter` only decides which samples are reported; filtered-out
/// samples still act as sources.
pub fn analyze(
    samples: &[Sample],
    url_filter: &UrlFilter,
    options: &MatcherOptions,
) -> CorrelationReport {
    let mut ordered: Vec<&Sample> = samples.iter().filter(|s| s.url.is_some()).collect();
    ordered.sort_by_key(|s| s.sequence_index);

    let sources: Vec<Source<'_>> = ordered
        .iter()
        .map(|&sample| Source {
            sample,
            text: sample.response_text(),
        })
        .collect();

    let mut report = CorrelationReport::default();
    for (pos, sample) in ordered.iter().enumerate() {
        let url = sample.url.as_deref().unwrap_or_default();
        if !url_filter.matches(url) {
            continue;
        }
        let earlier = &sources[..pos];
        let parameters = sample_parameters(sample)
            .into_iter()
            .map(|parameter| ParameterCorrelation {
                correlation: correlate(&parameter.value, earlier, options),
                parameter,
            })
            .collect::<Vec<_>>();
        log::debug!(
            "Sample #{} '{}': {} parameters, {} correlated",
            sample.sequence_index,
            sample.label,
            parameters.len(),
            parameters
                .iter()
                .filter(|p| p.correlation.is_correlated())
                .count()
        );
        report.entries.push(ReportEntry {
            sequence_index: sample.sequence_index,
            label: sample.label.clone(),
            method: sample.method.clone(),
            url: url.to_string(),
            parameters,
        });
    }
    log::info!(
        "Correlation analysis reported {} of {} samples",
        report.len(),
        samples.len()
    );
    report
}
