//! Template rendering for generated documents.
//!
//! Both output documents (the test plan and the exported recording) are
//! rendered with Tera. The built-in templates are compiled into the crate; a
//! directory containing `test_plan.jmx.tera` and/or `recording.xml.tera`
//! overrides them one by one.
//!
//! Autoescaping is off. Templates escape explicitly with the `xml` and
//! `cdata` filters.

// Internal imports (std, crate)
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::utils::{cdata, escape_xml};

// External imports (alphabetized)
use serde::Serialize;
use tera::{Context, Tera, Value};

const TEST_PLAN_TEMPLATE: &str = include_str!("../templates/test_plan.jmx.tera");
const RECORDING_TEMPLATE: &str = include_str!("../templates/recording.xml.tera");

/// Documents this crate knows how to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    /// JMeter test plan (`.jmx`)
    TestPlan,
    /// JMeter sample recording (`testResults` XML)
    Recording,
}

impl TemplateKind {
    /// Template file name, also used as the Tera template name
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::TestPlan => "test_plan.jmx.tera",
            Self::Recording => "recording.xml.tera",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            Self::TestPlan => TEST_PLAN_TEMPLATE,
            Self::Recording => RECORDING_TEMPLATE,
        }
    }

    /// Returns an iterator over all template kinds
    pub fn all() -> impl Iterator<Item = Self> {
        [Self::TestPlan, Self::Recording].into_iter()
    }
}

fn xml_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(escape_xml(&value_text(value))))
}

fn cdata_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    Ok(Value::String(cdata(&value_text(value))))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Loaded templates, ready to render
#[derive(Debug, Clone)]
pub struct TemplateSet {
    tera: Arc<Tera>,
}

impl TemplateSet {
    /// Built-in templates only
    pub fn builtin() -> Result<Self> {
        Self::build(Vec::new())
    }

    /// Built-in templates, overridden by any matching file in `template_dir`
    pub async fn new(template_dir: Option<PathBuf>) -> Result<Self> {
        let Some(dir) = template_dir else {
            return Self::builtin();
        };
        let mut overrides = Vec::new();
        for kind in TemplateKind::all() {
            let path = dir.join(kind.file_name());
            if tokio::fs::try_exists(&path).await? {
                log::debug!("Using template override {}", path.display());
                overrides.push((kind, tokio::fs::read_to_string(&path).await?));
            }
        }
        Self::build(overrides)
    }

    fn build(overrides: Vec<(TemplateKind, String)>) -> Result<Self> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.register_filter("xml", xml_filter);
        tera.register_filter("cdata", cdata_filter);

        let mut templates: Vec<(&'static str, String)> = TemplateKind::all()
            .map(|kind| (kind.file_name(), kind.builtin().to_string()))
            .collect();
        for (kind, content) in overrides {
            if let Some(slot) = templates.iter_mut().find(|(name, _)| *name == kind.file_name()) {
                slot.1 = content;
            }
        }
        tera.add_raw_templates(templates)?;

        Ok(Self {
            tera: Arc::new(tera),
        })
    }

    /// Render `data` with the given template, exposed to it as `name`.
    pub fn render<T: Serialize>(&self, kind: TemplateKind, name: &str, data: &T) -> Result<String> {
        let mut context = Context::new();
        context.insert(name, data);
        Ok(self.tera.render(kind.file_name(), &context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Empty {
        samples: Vec<String>,
    }

    #[test]
    fn test_filters() {
        let set = TemplateSet::builtin().unwrap();
        let mut context = Context::new();
        context.insert("v", "a<b]]>c");
        let mut tera = (*set.tera).clone();
        let out = tera
            .render_str("{{ v | xml }}|{{ v | cdata }}", &context)
            .unwrap();
        assert_eq!(out, "a&lt;b]]&gt;c|<![CDATA[a<b]]]]><![CDATA[>c]]>");
    }

    #[tokio::test]
    async fn test_directory_override() -> crate::Result<()> {
        let dir = tempdir()?;
        tokio::fs::write(dir.path().join("recording.xml.tera"), "custom {{ recording.samples | length }}").await?;

        let set = TemplateSet::new(Some(dir.path().to_path_buf())).await?;
        let out = set.render(TemplateKind::Recording, "recording", &Empty { samples: vec![] })?;
        assert_eq!(out, "custom 0");
        Ok(())
    }
}
