//! Loading of raw capture files into parsed documents.
//!
//! Captures produced by recording tools are frequently a little broken:
//! recordings carry numeric character references to control characters that
//! XML forbids, and hand-edited JSON exports carry bare keys and trailing
//! commas. The loader repairs these defects locally before giving up, and
//! reports which repairs fired through [`ParseOutcome`].
//!
//! # Examples
//!
//! ```
//! use tracecorr_core::loader::{parse_json, ParseOutcome};
//!
//! let outcome = parse_json("{log: {entries: [],}}").unwrap();
//! assert!(outcome.was_repaired());
//! assert!(outcome.value().get("log").is_some());
//! ```

// Internal imports (std, crate)
use std::path::Path;

use crate::error::LoadError;

// External imports (alphabetized)
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::fs;

static CHAR_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#([xX][0-9A-Fa-f]+|[0-9]+);").expect("valid regex"));

/// A textual repair applied before a successful parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "count")]
pub enum Repair {
    /// Numeric character references outside the XML character range were removed
    InvalidCharacterReferences(usize),
    /// Raw control characters were removed from JSON text
    ControlCharacters(usize),
    /// Bare identifier keys were quoted
    BareKeys(usize),
    /// Commas directly before a closing bracket were removed
    TrailingCommas(usize),
    /// Commas were inserted between adjacent values
    MissingCommas(usize),
}

/// Result of a parse that succeeded, possibly after repairs.
///
/// Failure is the `Err` arm of the surrounding `Result`.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    /// Parsed as-is
    Parsed(T),
    /// Parsed after the listed repairs
    Repaired { value: T, repairs: Vec<Repair> },
}

impl<T> ParseOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            Self::Parsed(value) | Self::Repaired { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Parsed(value) | Self::Repaired { value, .. } => value,
        }
    }

    pub fn was_repaired(&self) -> bool {
        matches!(self, Self::Repaired { .. })
    }

    pub fn repairs(&self) -> &[Repair] {
        match self {
            Self::Parsed(_) => &[],
            Self::Repaired { repairs, .. } => repairs,
        }
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseOutcome<U> {
        match self {
            Self::Parsed(value) => ParseOutcome::Parsed(f(value)),
            Self::Repaired { value, repairs } => ParseOutcome::Repaired {
                value: f(value),
                repairs,
            },
        }
    }
}

/// Owned element of a parsed markup document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkupNode {
    /// Tag name without namespace
    pub name: String,
    pub attributes: Vec<(String, String)>,
    /// Concatenated direct text and CDATA content
    pub text: String,
    pub children: Vec<MarkupNode>,
}

impl MarkupNode {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First direct child with the given tag name.
    pub fn child(&self, name: &str) -> Option<&MarkupNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text of the first direct child with the given tag name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    fn from_roxmltree(node: roxmltree::Node<'_, '_>) -> Self {
        let mut text = String::new();
        let mut children = Vec::new();
        for child in node.children() {
            if child.is_element() {
                children.push(Self::from_roxmltree(child));
            } else if child.is_text() {
                text.push_str(child.text().unwrap_or_default());
            }
        }
        Self {
            name: node.tag_name().name().to_string(),
            attributes: node
                .attributes()
                .map(|a| (a.name().to_string(), a.value().to_string()))
                .collect(),
            text,
            children,
        }
    }
}

/// Whether a code point may appear in an XML 1.0 document.
pub fn is_valid_xml_char(codepoint: u32) -> bool {
    matches!(codepoint,
        0x9 | 0xA | 0xD
        | 0x20..=0xD7FF
        | 0xE000..=0xFFFD
        | 0x10000..=0x10FFFF)
}

/// Remove numeric character references that XML forbids, keeping valid ones
/// byte-for-byte. Returns the cleaned text and the number of removals.
pub fn strip_invalid_char_refs(text: &str) -> (String, usize) {
    let mut removed = 0;
    let cleaned = CHAR_REF_RE.replace_all(text, |caps: &Captures| {
        let digits = &caps[1];
        let codepoint = match digits.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => digits.parse::<u32>().ok(),
        };
        match codepoint {
            Some(cp) if is_valid_xml_char(cp) => caps[0].to_string(),
            _ => {
                removed += 1;
                String::new()
            }
        }
    });
    (cleaned.into_owned(), removed)
}

/// Parse markup after stripping invalid character references.
pub fn parse_markup(text: &str) -> Result<ParseOutcome<MarkupNode>, roxmltree::Error> {
    let (cleaned, removed) = strip_invalid_char_refs(text);
    let mut options = roxmltree::ParsingOptions::default();
    options.allow_dtd = true;
    let doc = roxmltree::Document::parse_with_options(&cleaned, options)?;
    let root = MarkupNode::from_roxmltree(doc.root_element());
    if removed == 0 {
        Ok(ParseOutcome::Parsed(root))
    } else {
        Ok(ParseOutcome::Repaired {
            value: root,
            repairs: vec![Repair::InvalidCharacterReferences(removed)],
        })
    }
}

/// Parse JSON strictly, then once more after textual repairs.
///
/// On final failure the error of the *strict* attempt is returned together
/// with the message of the retry.
pub fn parse_json(text: &str) -> Result<ParseOutcome<JsonValue>, (serde_json::Error, String)> {
    let original = match serde_json::from_str(text) {
        Ok(value) => return Ok(ParseOutcome::Parsed(value)),
        Err(e) => e,
    };
    let (repaired, repairs) = repair_json(text);
    match serde_json::from_str(&repaired) {
        Ok(value) => Ok(ParseOutcome::Repaired { value, repairs }),
        Err(retry) => Err((original, retry.to_string())),
    }
}

/// Apply the bounded set of JSON repairs outside string literals.
pub fn repair_json(text: &str) -> (String, Vec<Repair>) {
    let chars: Vec<char> = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect();
    let control_removed = text.chars().count() - chars.len();

    let mut out = String::with_capacity(text.len() + 16);
    let mut bare_keys = 0;
    let mut trailing = 0;
    let mut missing = 0;
    // Last significant character emitted outside a string, and whether it
    // closed a value.
    let mut last_sig: Option<char> = None;
    let mut value_ended = false;
    let mut i = 0;

    let next_significant = |from: usize| chars[from..].iter().copied().find(|c| !c.is_whitespace());

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            out.push(c);
            i += 1;
            continue;
        }

        let starts_value = matches!(c, '{' | '[' | '"' | '-') || c.is_alphanumeric() || c == '_';
        if starts_value && value_ended {
            out.push(',');
            last_sig = Some(',');
            missing += 1;
        }

        match c {
            '"' => {
                let start = i;
                i += 1;
                let mut escaped = false;
                while i < chars.len() {
                    let sc = chars[i];
                    i += 1;
                    if escaped {
                        escaped = false;
                    } else if sc == '\\' {
                        escaped = true;
                    } else if sc == '"' {
                        break;
                    }
                }
                out.extend(&chars[start..i]);
                last_sig = Some('"');
                value_ended = true;
                continue;
            }
            ',' => {
                if matches!(next_significant(i + 1), Some('}' | ']')) {
                    trailing += 1;
                } else {
                    out.push(',');
                    last_sig = Some(',');
                }
                value_ended = false;
            }
            ':' => {
                out.push(':');
                last_sig = Some(':');
                value_ended = false;
            }
            '{' | '[' => {
                out.push(c);
                last_sig = Some(c);
                value_ended = false;
            }
            '}' | ']' => {
                out.push(c);
                last_sig = Some(c);
                value_ended = true;
            }
            _ if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '+' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.' | '+'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let is_identifier = word
                    .chars()
                    .next()
                    .is_some_and(|f| f.is_alphabetic() || f == '_')
                    && word.chars().all(|w| w.is_alphanumeric() || w == '_');
                let key_position = matches!(last_sig, Some('{' | ',')) || last_sig.is_none();
                if is_identifier && key_position && next_significant(i) == Some(':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                    bare_keys += 1;
                } else {
                    out.push_str(&word);
                }
                last_sig = word.chars().last();
                value_ended = true;
                continue;
            }
            _ => {
                out.push(c);
                last_sig = Some(c);
                value_ended = false;
            }
        }
        i += 1;
    }

    let repairs = [
        Repair::ControlCharacters(control_removed),
        Repair::BareKeys(bare_keys),
        Repair::TrailingCommas(trailing),
        Repair::MissingCommas(missing),
    ]
    .into_iter()
    .filter(|r| repair_count(r) > 0)
    .collect();
    (out, repairs)
}

fn repair_count(repair: &Repair) -> usize {
    match *repair {
        Repair::InvalidCharacterReferences(n)
        | Repair::ControlCharacters(n)
        | Repair::BareKeys(n)
        | Repair::TrailingCommas(n)
        | Repair::MissingCommas(n) => n,
    }
}

/// Supported capture formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    /// Tree of sample nodes (JMeter results XML / JTL)
    Recording,
    /// HAR capture log
    CaptureLog,
    /// API-collection export (Postman-style)
    Collection,
}

impl DocumentFormat {
    /// Guess the format from the file extension; `None` when the content
    /// must decide.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "xml" | "jtl" => Some(Self::Recording),
            "har" => Some(Self::CaptureLog),
            _ => None,
        }
    }

    fn from_json(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;
        if obj
            .get("log")
            .and_then(|l| l.get("entries"))
            .is_some_and(JsonValue::is_array)
        {
            Some(Self::CaptureLog)
        } else if obj.get("item").is_some_and(JsonValue::is_array) {
            Some(Self::Collection)
        } else {
            None
        }
    }
}

/// Parsed input, ready for sample extraction.
#[derive(Debug, Clone)]
pub enum Document {
    Recording(MarkupNode),
    CaptureLog(JsonValue),
    Collection(JsonValue),
}

impl Document {
    pub fn format(&self) -> DocumentFormat {
        match self {
            Self::Recording(_) => DocumentFormat::Recording,
            Self::CaptureLog(_) => DocumentFormat::CaptureLog,
            Self::Collection(_) => DocumentFormat::Collection,
        }
    }
}

/// A document together with where it came from and how it was repaired.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    /// Path or other identifier used in error messages
    pub source_name: String,
    pub document: Document,
    pub repairs: Vec<Repair>,
}

impl LoadedDocument {
    /// Read and parse a capture file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).await?;
        let hint = DocumentFormat::from_extension(path);
        Ok(Self::from_bytes(path.display().to_string(), &bytes, hint)?)
    }

    /// Parse an in-memory capture. Bytes are decoded as UTF-8, replacing
    /// invalid sequences.
    pub fn from_bytes(
        source_name: impl Into<String>,
        bytes: &[u8],
        hint: Option<DocumentFormat>,
    ) -> Result<Self, LoadError> {
        let source_name = source_name.into();
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_start_matches('\u{feff}');

        let looks_like_markup = text.trim_start().starts_with('<');
        let format = match hint {
            Some(format) => Some(format),
            None if looks_like_markup => Some(DocumentFormat::Recording),
            None => None,
        };

        if format == Some(DocumentFormat::Recording) {
            let outcome = parse_markup(text).map_err(|source| LoadError::Markup {
                source_name: source_name.clone(),
                source,
            })?;
            return Ok(Self::finish(source_name, outcome.map(Document::Recording)));
        }

        let outcome = parse_json(text).map_err(|(source, retry)| LoadError::Json {
            source_name: source_name.clone(),
            source,
            retry,
        })?;
        let format = match format {
            Some(format) => format,
            None => DocumentFormat::from_json(outcome.value()).ok_or_else(|| {
                LoadError::UnknownFormat {
                    source_name: source_name.clone(),
                }
            })?,
        };
        let outcome = outcome.map(|value| match format {
            DocumentFormat::Collection => Document::Collection(value),
            _ => Document::CaptureLog(value),
        });
        Ok(Self::finish(source_name, outcome))
    }

    fn finish(source_name: String, outcome: ParseOutcome<Document>) -> Self {
        let repairs = outcome.repairs().to_vec();
        if !repairs.is_empty() {
            log::info!("Repaired {} before parsing: {:?}", source_name, repairs);
        }
        Self {
            source_name,
            document: outcome.into_value(),
            repairs,
        }
    }

    pub fn format(&self) -> DocumentFormat {
        self.document.format()
    }

    pub fn was_repaired(&self) -> bool {
        !self.repairs.is_empty()
    }
}
