//! Error handling for the tracecorr correlation engine.
//!
//! This module defines the main error type `Error` used throughout the library,
//! along with a convenient `Result` type alias. The stage-specific failures
//! (`LoadError`, `SynthesisError`, `CollaboratorError`) are separate enums so
//! callers can tell a broken input document from a plan that could not be
//! built, and all of them convert into `Error` with `?`.
//!
//! Non-terminal problems found while extracting samples are not errors; they
//! are reported as [`ExtractionWarning`] values next to the samples.
//!
//! # Examples
//!
//! ```
//! use tracecorr_core::error::{Error, Result};
//!
//! fn might_fail() -> Result<()> {
//!     Err(Error::config("missing input path"))
//! }
//!
//! assert!(might_fail().is_err());
//! ```

use serde::Serialize;
use thiserror::Error;

/// Result type for tracecorr operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tracecorr operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Template engine error
    #[error("Template engine error: {0}")]
    Tera(#[from] tera::Error),

    /// Input document could not be loaded
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Test plan could not be synthesized
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// External text-generation path failed
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }
}

/// Terminal failure to turn an input document into something walkable.
///
/// Every variant names the document it came from so an operator can fix the
/// input and retry.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Markup was still malformed after invalid character references were stripped
    #[error("failed to parse markup document {source_name}: {source}")]
    Markup {
        source_name: String,
        #[source]
        source: roxmltree::Error,
    },

    /// JSON was malformed and the repaired text did not parse either
    #[error("failed to parse JSON document {source_name}: {source} (after repair: {retry})")]
    Json {
        source_name: String,
        /// The error from the strict, unrepaired parse
        #[source]
        source: serde_json::Error,
        /// The error from the single retry on repaired text
        retry: String,
    },

    /// Document parsed but does not have the expected shape
    #[error("unexpected structure in {source_name}: {message}")]
    Structure { source_name: String, message: String },

    /// Neither the file name nor the content identify a supported format
    #[error("cannot determine the capture format of {source_name}")]
    UnknownFormat { source_name: String },
}

/// Terminal failure for one synthesis call.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Nothing survived filtering
    #[error("no request elements remain after filtering")]
    NoRequests,

    /// The sample's URL could not be parsed
    #[error("sample '{label}' has a malformed URL '{url}': {source}")]
    MalformedUrl {
        label: String,
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The URL parsed but carries no host
    #[error("sample '{label}' has no host in URL '{url}'")]
    MissingHost { label: String, url: String },

    /// The report refers to a sample that was not supplied
    #[error("report entry {sequence_index} has no matching sample")]
    UnknownSample { sequence_index: usize },
}

/// Failure of the optional external text-generation path.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Transport or HTTP status failure
    #[error("collaborator request failed: {0}")]
    Transport(String),

    /// No `<jmeterTestPlan>` envelope could be located in the response text
    #[error("collaborator response contains no test plan document")]
    NoDocument,

    /// The envelope was found but is not well-formed markup
    #[error("collaborator returned a malformed test plan: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Why a sample was kept only for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// No URL could be resolved; excluded from extraction and correlation
    MissingUrl,
    /// Response content is binary; its body is ignored for matching
    BinaryResponse,
    /// A capture-log entry could not be decoded and was skipped
    MalformedEntry,
}

/// Non-terminal problem with an individual sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionWarning {
    pub kind: WarningKind,
    /// Sequence index of the affected sample, if one was created
    pub sequence_index: Option<usize>,
    pub label: String,
}

impl std::fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.kind {
            WarningKind::MissingUrl => "has no resolvable URL",
            WarningKind::BinaryResponse => "has a binary response body",
            WarningKind::MalformedEntry => "could not be decoded",
        };
        match self.sequence_index {
            Some(idx) => write!(f, "sample #{} '{}' {}", idx, self.label, what),
            None => write!(f, "entry '{}' {}", self.label, what),
        }
    }
}
