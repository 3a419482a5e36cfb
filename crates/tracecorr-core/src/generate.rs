//! End-to-end runs: load a capture, analyze it and write a document.

// Internal imports (std, crate)
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::{
    collaborator::{self, TextCollaborator},
    collection::Collection,
    config::Config,
    correlation::{analyze, CorrelationReport},
    error::{Error, LoadError, Result},
    filter::{EntryFilter, Inventory},
    har::HarContext,
    loader::{Document, DocumentFormat, LoadedDocument, Repair},
    recording::{extract_samples, Recording},
    sample::SampleSet,
    synth::{synthesize, SynthesisOptions, TestPlan},
    templates::TemplateSet,
};

// External imports (alphabetized)
use tokio::fs;

/// Samples extracted from one input document.
#[derive(Debug, Clone)]
pub struct Capture {
    pub source_name: String,
    pub format: DocumentFormat,
    pub repairs: Vec<Repair>,
    pub samples: SampleSet,
    /// Present for capture logs and collections, which can be filtered
    pub inventory: Option<Inventory>,
}

impl Capture {
    /// Load a capture file and extract its samples.
    pub async fn load<P: AsRef<Path>>(path: P, filter: &EntryFilter) -> Result<Self> {
        let loaded = LoadedDocument::from_file(path).await?;
        Ok(Self::from_document(loaded, filter)?)
    }

    /// Extract samples from an already parsed document. `filter` applies to
    /// capture logs and collections only.
    pub fn from_document(loaded: LoadedDocument, filter: &EntryFilter) -> std::result::Result<Self, LoadError> {
        let format = loaded.format();
        let (samples, inventory) = match &loaded.document {
            Document::Recording(root) => {
                if !filter.is_noop() {
                    log::debug!("Entry filter ignored for recording {}", loaded.source_name);
                }
                (extract_samples(root), None)
            }
            Document::CaptureLog(value) => {
                let har = HarContext::from_value(value, &loaded.source_name)?;
                (har.to_samples(filter), Some(har.inventory()))
            }
            Document::Collection(value) => {
                let collection = Collection::from_value(value, &loaded.source_name)?;
                (collection.to_samples(filter), Some(collection.inventory()))
            }
        };
        for warning in &samples.warnings {
            log::warn!("{}: {}", loaded.source_name, warning);
        }
        log::info!(
            "Extracted {} samples from {} ({:?})",
            samples.len(),
            loaded.source_name,
            format
        );
        Ok(Self {
            source_name: loaded.source_name,
            format,
            repairs: loaded.repairs,
            samples,
            inventory,
        })
    }

    /// Per-sample listing followed by the extraction warnings.
    pub fn diagnostics(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Source: {} ({:?})", self.source_name, self.format);
        if !self.repairs.is_empty() {
            let _ = writeln!(out, "Repairs: {:?}", self.repairs);
        }
        let _ = writeln!(out, "Samples: {}", self.samples.len());
        for sample in &self.samples.samples {
            let _ = writeln!(
                out,
                "  [{}] {} {} {}",
                sample.sequence_index,
                sample.label,
                sample.method,
                sample.url.as_deref().unwrap_or("<missing URL>")
            );
        }
        if !self.samples.warnings.is_empty() {
            let _ = writeln!(out, "Warnings: {}", self.samples.warnings.len());
            for warning in &self.samples.warnings {
                let _ = writeln!(out, "  - {}", warning);
            }
        }
        out
    }
}

/// A capture together with its correlation report.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub capture: Capture,
    pub report: CorrelationReport,
}

impl Analysis {
    /// Plan options from the config, with collection variables added to
    /// the user variables. Variables set in the config win.
    pub fn plan_options(&self, config: &Config) -> SynthesisOptions {
        let mut options = config.plan.clone();
        for (name, value) in &self.capture.samples.variables {
            if !options.variables.contains_key(name) {
                options.variables.insert(name.clone(), value.clone());
            }
        }
        options
    }

    pub fn synthesize(&self, config: &Config) -> Result<TestPlan> {
        Ok(synthesize(
            &self.report,
            &self.capture.samples.samples,
            &self.plan_options(config),
        )?)
    }
}

/// Load the configured input and correlate it.
pub async fn analyze_input(config: &Config) -> Result<Analysis> {
    let capture = Capture::load(config.require_input()?, &config.filter).await?;
    let report = analyze(&capture.samples.samples, &config.url_filter, &config.matcher);
    log::info!(
        "{} of {} reported parameters are correlated",
        report.correlated_parameters().count(),
        report.entries.iter().map(|e| e.parameters.len()).sum::<usize>()
    );
    Ok(Analysis { capture, report })
}

fn require_output(config: &Config) -> Result<&Path> {
    config
        .output
        .as_deref()
        .ok_or_else(|| Error::config("no output path configured"))
}

async fn write_output(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, content).await?;
    Ok(())
}

/// Outcome of a [`generate`] run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateSummary {
    pub output: PathBuf,
    pub requests: usize,
    pub extractors: usize,
}

/// Main entry point: analyze the input and write the rendered test plan.
pub async fn generate(config: &Config) -> Result<GenerateSummary> {
    // 1. Load and correlate the capture
    let analysis = analyze_input(config).await?;

    // 2. Build the plan
    let plan = analysis.synthesize(config)?;

    // 3. Render it with the configured templates
    let templates = TemplateSet::new(config.template_dir.clone()).await?;
    let document = plan.render(&templates)?;

    let output = require_output(config)?;
    write_output(output, &document).await?;
    Ok(GenerateSummary {
        output: output.to_path_buf(),
        requests: plan.requests().count(),
        extractors: plan.extracted_variables().len(),
    })
}

/// Export the configured capture log as a sample recording. Returns the
/// number of exported samples.
pub async fn export_recording(config: &Config) -> Result<usize> {
    let input = config.require_input()?;
    let loaded = LoadedDocument::from_file(input).await?;
    let Document::CaptureLog(value) = &loaded.document else {
        return Err(Error::config(format!(
            "{} is not a HAR capture log",
            loaded.source_name
        )));
    };
    let har = HarContext::from_value(value, &loaded.source_name)?;
    let recording = Recording::from_capture(&har, &config.filter);

    let templates = TemplateSet::new(config.template_dir.clone()).await?;
    let document = recording.render(&templates)?;
    write_output(require_output(config)?, &document).await?;
    Ok(recording.samples.len())
}

/// Hand the analysis to an external collaborator and write the document it
/// returns.
pub async fn delegate(config: &Config, collaborator: &dyn TextCollaborator) -> Result<PathBuf> {
    let analysis = analyze_input(config).await?;
    if analysis.report.is_empty() {
        return Err(crate::error::SynthesisError::NoRequests.into());
    }
    let document =
        collaborator::delegate(collaborator, &analysis.report, &analysis.capture.samples.samples)
            .await?;
    let output = require_output(config)?;
    write_output(output, &document).await?;
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::filter::ExtensionPolicy;
    use futures::future::BoxFuture;
    use tempfile::tempdir;

    fn fixture_path(rel: &str) -> PathBuf {
        let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest.parent().unwrap().parent().unwrap().join(rel)
    }

    #[tokio::test]
    async fn test_generate_from_recording() -> Result<()> {
        let dir = tempdir()?;
        let output = dir.path().join("out").join("plan.jmx");
        let config = Config::new(fixture_path("tests/fixtures/recording/sample.jtl"), &output);

        let summary = generate(&config).await?;
        assert_eq!(summary.requests, 3);
        assert!(summary.extractors >= 2);

        let jmx = fs::read_to_string(&output).await?;
        let doc = roxmltree::Document::parse(&jmx).expect("well-formed plan");
        assert!(doc.descendants().any(|n| n.has_tag_name("RegexExtractor")));
        assert!(jmx.contains("${session}"));
        assert!(jmx.contains("${csrf}"));
        Ok(())
    }

    #[tokio::test]
    async fn test_recorded_get_query_uses_extracted_variable() -> Result<()> {
        let config = Config::new(fixture_path("tests/fixtures/recording/sample.jtl"), "unused.jmx");
        let analysis = analyze_input(&config).await?;
        assert_eq!(analysis.capture.samples.samples[1].request_body, "session=sess-42");

        let plan = analysis.synthesize(&config)?;
        let catalog = plan
            .requests()
            .find(|r| r.label == "Catalog")
            .expect("catalog request");
        assert_eq!(catalog.method, "GET");
        assert_eq!(catalog.raw_body, None);
        assert_eq!(catalog.arguments.len(), 1);
        assert_eq!(catalog.arguments[0].name, "session");
        assert_eq!(catalog.arguments[0].value, "${session}");

        let rendered = plan.render(&TemplateSet::builtin()?)?;
        for variable in plan.extracted_variables() {
            let reference = format!("${{{}}}", variable);
            assert!(
                plan.requests().any(|r| r
                    .arguments
                    .iter()
                    .any(|a| a.value == reference)
                    || r.path.contains(&reference)
                    || r.raw_body.as_deref().is_some_and(|b| b.contains(&reference))),
                "extractor '{}' has no use",
                variable
            );
            assert!(rendered.contains(&reference));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_analyze_filtered_capture_log() -> Result<()> {
        let mut config = Config::new(fixture_path("tests/fixtures/har/sample.har"), "unused.jmx");
        config.filter = EntryFilter {
            base_urls: vec!["https://api.example.test".into()],
            methods: Vec::new(),
            extensions: ExtensionPolicy::NoExtensions,
        };
        let analysis = analyze_input(&config).await?;
        assert_eq!(analysis.capture.samples.len(), 3);
        let inventory = analysis.capture.inventory.as_ref().expect("capture log inventory");
        assert_eq!(inventory.base_urls.len(), 2);

        let correlated: Vec<_> = analysis
            .report
            .correlated_parameters()
            .map(|(entry, param, _)| (entry.sequence_index, param.name.as_str()))
            .collect();
        assert!(correlated.contains(&(1, "token")));
        assert!(correlated.contains(&(2, "parent")));
        Ok(())
    }

    #[tokio::test]
    async fn test_collection_variables_reach_the_plan() -> Result<()> {
        let mut config = Config::new(
            fixture_path("tests/fixtures/collection/sample.postman_collection.json"),
            "unused.jmx",
        );
        config.plan.variables.insert("apiVersion".into(), "v3".into());
        let analysis = analyze_input(&config).await?;
        let plan = analysis.synthesize(&config)?;
        let vars: Vec<_> = plan
            .variables
            .iter()
            .map(|a| (a.name.as_str(), a.value.as_str()))
            .collect();
        assert_eq!(vars, vec![("apiVersion", "v3"), ("baseUrl", "https://shop.example.test")]);
        assert_eq!(plan.extracted_variables(), vec!["token"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_export_recording() -> Result<()> {
        let dir = tempdir()?;
        let output = dir.path().join("recording.xml");
        let mut config = Config::new(fixture_path("tests/fixtures/har/sample.har"), &output);
        config.filter.methods = vec!["POST".into()];

        assert_eq!(export_recording(&config).await?, 2);
        let capture = Capture::load(&output, &EntryFilter::default()).await?;
        assert_eq!(capture.format, DocumentFormat::Recording);
        assert_eq!(capture.samples.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_export_rejects_recordings() {
        let config = Config::new(fixture_path("tests/fixtures/recording/sample.jtl"), "x.xml");
        assert!(matches!(export_recording(&config).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_diagnostics_listing() -> Result<()> {
        let capture = Capture::load(
            fixture_path("tests/fixtures/har/sample.har"),
            &EntryFilter::default(),
        )
        .await?;
        let listing = capture.diagnostics();
        assert!(listing.contains("Samples: 5"));
        assert!(listing.contains("[0] 001_POST_/api/login POST https://api.example.test/api/login"));
        assert!(listing.contains("has a binary response body"));
        Ok(())
    }

    struct Fixed(&'static str);

    impl TextCollaborator for Fixed {
        fn complete<'a>(&'a self, _prompt: &'a str) -> BoxFuture<'a, std::result::Result<String, CollaboratorError>> {
            Box::pin(async move { Ok(self.0.to_string()) })
        }
    }

    #[tokio::test]
    async fn test_delegate_writes_envelope() -> Result<()> {
        let dir = tempdir()?;
        let output = dir.path().join("plan.jmx");
        let config = Config::new(fixture_path("tests/fixtures/recording/sample.jtl"), &output);

        let written = delegate(&config, &Fixed("Sure!\n<jmeterTestPlan version=\"1.2\"></jmeterTestPlan>")).await?;
        assert_eq!(written, output);
        assert_eq!(
            fs::read_to_string(&output).await?,
            "<jmeterTestPlan version=\"1.2\"></jmeterTestPlan>"
        );

        let err = delegate(&config, &Fixed("no plan today")).await.unwrap_err();
        assert!(matches!(err, Error::Collaborator(CollaboratorError::NoDocument)));
        Ok(())
    }
}
