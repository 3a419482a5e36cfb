//! Tracecorr Core Library
//!
//! This library finds the request parameters of a recorded HTTP trace that
//! were produced by earlier responses, and synthesizes a JMeter test plan
//! that extracts and reuses those values instead of replaying literals.
//!
//! The pipeline is: [`loader`] (parse and repair the capture) → sample
//! extraction ([`recording`], [`har`], [`collection`]) → [`correlation`]
//! (the report) → [`synth`] (the plan) → [`templates`] (rendering).

pub mod collaborator;
pub mod collection;
pub mod config;
pub mod correlation;
pub mod error;
pub mod filter;
pub mod generate;
pub mod har;
pub mod loader;
pub mod params;
pub mod recording;
pub mod sample;
pub mod synth;
pub mod templates;
pub mod utils;

pub use crate::{
    collaborator::{CollaboratorSettings, HttpCollaborator, TextCollaborator},
    config::Config,
    correlation::{analyze, CorrelationReport, MatcherOptions, UrlFilter},
    error::{Error, Result},
    filter::{EntryFilter, ExtensionPolicy, Inventory},
    generate::{generate, Analysis, Capture},
    loader::{DocumentFormat, LoadedDocument},
    sample::{Sample, SampleSet},
    synth::{synthesize, GroupingPolicy, SynthesisOptions, TestPlan},
    templates::{TemplateKind, TemplateSet},
};
