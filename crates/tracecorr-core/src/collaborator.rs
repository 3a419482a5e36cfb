//! Optional external text-generation path.
//!
//! Instead of synthesizing the plan locally, the correlation report and a
//! summary of the samples can be handed to a text-generation service. Its
//! answer is free text; the only part we keep is the `<jmeterTestPlan>`
//! document inside it, and that document must be well-formed markup.

// Internal imports (std, crate)
use std::env;

use crate::correlation::CorrelationReport;
use crate::error::CollaboratorError;
use crate::sample::Sample;
use crate::utils::truncate_chars;

// External imports (alphabetized)
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;

const ENVELOPE_OPEN: &str = "<jmeterTestPlan";
const ENVELOPE_CLOSE: &str = "</jmeterTestPlan>";

/// Characters of request/response body included per sample in the prompt
const SUMMARY_BODY_CHARS: usize = 300;

/// Something that turns a prompt into text.
pub trait TextCollaborator: Send + Sync {
    fn complete<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, CollaboratorError>>;
}

/// Connection settings for [`HttpCollaborator`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorSettings {
    /// Messages endpoint
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    /// Environment variable holding the API key
    pub api_key_env: String,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-3-7-sonnet-20250219".to_string(),
            max_tokens: 8000,
            api_key_env: "TRACECORR_COLLABORATOR_KEY".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

/// Collaborator speaking a messages-style JSON API over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpCollaborator {
    client: reqwest::Client,
    settings: CollaboratorSettings,
    api_key: String,
}

impl HttpCollaborator {
    /// Create a collaborator, reading the API key from the configured
    /// environment variable.
    pub fn new(settings: CollaboratorSettings) -> Result<Self, CollaboratorError> {
        let api_key = env::var(&settings.api_key_env).map_err(|_| {
            CollaboratorError::Transport(format!(
                "environment variable {} is not set",
                settings.api_key_env
            ))
        })?;
        Ok(Self::with_key(settings, api_key))
    }

    pub fn with_key(settings: CollaboratorSettings, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            api_key: api_key.into(),
        }
    }

    async fn send(&self, prompt: &str) -> Result<String, CollaboratorError> {
        let body = json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });
        log::debug!("Sending {} prompt characters to {}", prompt.len(), self.settings.endpoint);

        let response = self
            .client
            .post(&self.settings.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Transport(format!(
                "{} answered HTTP {}",
                self.settings.endpoint,
                response.status()
            )));
        }

        let parsed: MessagesResponse = response.json().await?;
        Ok(parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

impl TextCollaborator for HttpCollaborator {
    fn complete<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, CollaboratorError>> {
        Box::pin(self.send(prompt))
    }
}

/// Prompt containing the report and a short summary of every sample.
pub fn build_prompt(report: &CorrelationReport, samples: &[Sample]) -> String {
    let mut prompt = String::from(
        "Generate a complete Apache JMeter test plan (.jmx) for the HTTP trace below. \
         Use Regular Expression Extractors for every correlated parameter and \
         reference the extracted variables as ${name} where the values are reused. \
         Answer with the XML document, starting at <jmeterTestPlan>.\n\n## Samples\n",
    );
    for sample in samples {
        let Some(url) = sample.url.as_deref() else {
            continue;
        };
        prompt.push_str(&format!(
            "#{} {} {} {}\n",
            sample.sequence_index, sample.label, sample.method, url
        ));
        if !sample.request_body.is_empty() {
            prompt.push_str(&format!(
                "  request body: {}\n",
                truncate_chars(&sample.request_body, SUMMARY_BODY_CHARS)
            ));
        }
        if !sample.binary_response && !sample.response_body.is_empty() {
            prompt.push_str(&format!(
                "  response body: {}\n",
                truncate_chars(&sample.response_body, SUMMARY_BODY_CHARS)
            ));
        }
    }
    prompt.push_str("\n## Correlation report\n");
    prompt.push_str(&serde_json::to_string_pretty(report).unwrap_or_default());
    prompt
}

/// Locate the test-plan document in free text and check it is well-formed.
///
/// An `<?xml ...?>` declaration directly in front of the envelope is kept.
/// Anything else around it (prose, code fences) is dropped.
pub fn extract_plan_document(text: &str) -> Result<String, CollaboratorError> {
    let start = text.find(ENVELOPE_OPEN).ok_or(CollaboratorError::NoDocument)?;
    let end = match text.rfind(ENVELOPE_CLOSE).filter(|end| *end > start) {
        Some(close) => close + ENVELOPE_CLOSE.len(),
        // An empty plan may be written as a self-closing tag.
        None => {
            let tag_end = text[start..]
                .find('>')
                .ok_or(CollaboratorError::NoDocument)?;
            if !text[..start + tag_end].ends_with('/') {
                return Err(CollaboratorError::NoDocument);
            }
            start + tag_end + 1
        }
    };

    let prefix = &text[..start];
    let begin = prefix
        .rfind("<?xml")
        .filter(|decl| {
            prefix[*decl..]
                .find("?>")
                .is_some_and(|close| prefix[*decl + close + 2..].trim().is_empty())
        })
        .unwrap_or(start);

    let document = &text[begin..end];
    roxmltree::Document::parse(document)
        .map_err(|e| CollaboratorError::Malformed(e.to_string()))?;
    Ok(document.to_string())
}

/// Ask the collaborator for a plan, exactly once.
pub async fn delegate(
    collaborator: &dyn TextCollaborator,
    report: &CorrelationReport,
    samples: &[Sample],
) -> Result<String, CollaboratorError> {
    let prompt = build_prompt(report, samples);
    let answer = collaborator.complete(&prompt).await?;
    let document = extract_plan_document(&answer)?;
    log::info!("Collaborator returned a {} byte test plan", document.len());
    Ok(document)
}
