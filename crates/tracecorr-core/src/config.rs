//! Configuration management for tracecorr runs.
//!
//! This module defines the `Config` struct that bundles everything a run
//! needs: where the capture comes from, which entries to keep, how values
//! are matched and what the generated plan looks like. The configuration can
//! be loaded from a YAML or TOML file (chosen by extension), created
//! programmatically, or assembled from command-line arguments.
//!
//! # Examples
//!
//! ```no_run
//! use tracecorr_core::config::Config;
//! use tracecorr_core::correlation::UrlFilter;
//!
//! // Create a new config programmatically
//! let mut config = Config::new("capture.har", "plan.jmx");
//! config.url_filter = UrlFilter::parse("api.example.test/orders");
//! config.plan.threads = 10;
//!
//! // Or load from a config file
//! # async fn load() -> tracecorr_core::Result<()> {
//! let config = Config::from_file("tracecorr.yaml").await?;
//! # Ok(())
//! # }
//! ```

// Internal imports (std, crate)
use std::path::{Path, PathBuf};

use crate::collaborator::CollaboratorSettings;
use crate::correlation::{MatcherOptions, UrlFilter};
use crate::filter::EntryFilter;
use crate::synth::SynthesisOptions;

// External imports (alphabetized)
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Configuration for one analysis/synthesis run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Capture to analyze (recording, HAR or collection)
    #[serde(default)]
    pub input: Option<PathBuf>,

    /// Where the generated document is written
    #[serde(default)]
    pub output: Option<PathBuf>,

    /// URL substrings whose requests are reported; comma-separated or a list
    #[serde(default)]
    pub url_filter: UrlFilter,

    /// Base-URL, method and extension allow-lists for capture logs and collections
    #[serde(default)]
    pub filter: EntryFilter,

    #[serde(default)]
    pub matcher: MatcherOptions,

    #[serde(default)]
    pub plan: SynthesisOptions,

    /// Optional directory with template overrides
    #[serde(default)]
    pub template_dir: Option<PathBuf>,

    /// Settings for the external text-generation path
    #[serde(default)]
    pub collaborator: Option<CollaboratorSettings>,
}

impl Config {
    /// Create a new Config with default values
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: Some(input.into()),
            output: Some(output.into()),
            ..Self::default()
        }
    }

    /// Load configuration from a file. `.toml` files are read as TOML,
    /// everything else as YAML.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        let config = if is_toml(path) {
            toml::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        Ok(config)
    }

    /// Save configuration to a file, in the format its extension names
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        let content = if is_toml(path) {
            toml::to_string(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        fs::write(path, content).await?;
        Ok(())
    }

    /// `<config dir>/tracecorr/config.yaml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tracecorr").join("config.yaml"))
    }

    /// Load the config at [`Config::default_path`] when it exists.
    pub async fn load_default() -> crate::Result<Option<Self>> {
        let Some(path) = Self::default_path() else {
            return Ok(None);
        };
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        log::debug!("Loading default config from {}", path.display());
        Self::from_file(&path).await.map(Some)
    }

    /// The input path, or a configuration error naming what is missing
    pub fn require_input(&self) -> crate::Result<&Path> {
        self.input
            .as_deref()
            .ok_or_else(|| crate::Error::config("no input capture configured"))
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"))
}
