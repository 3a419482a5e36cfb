//! tracecorr CLI entrypoint
//! Parses command-line arguments and dispatches to the core library.

// Internal imports (std, crate)
use std::path::PathBuf;

// External imports (alphabetized)
use anyhow::Context;
use clap::{Args, Parser, ValueEnum};
use dialoguer::{theme::ColorfulTheme, MultiSelect};
use tracecorr_core::{
    correlation::{Correlation, CorrelationReport, OccurrencePreference},
    generate::{self, Capture},
    Config, EntryFilter, ExtensionPolicy, GroupingPolicy, HttpCollaborator, Inventory,
    LoadedDocument, UrlFilter,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tracecorr")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (YAML or TOML); defaults to the user config if present
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Input selection shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
struct InputArgs {
    /// Capture to read: JMeter recording (.xml/.jtl), HAR (.har) or collection (.json)
    input: Option<PathBuf>,
    /// Keep only requests from these base URLs (scheme://host[:port])
    #[arg(long = "base-url")]
    base_urls: Vec<String>,
    /// Keep only these HTTP methods
    #[arg(long = "method")]
    methods: Vec<String>,
    /// Keep only paths with these extensions (paths without one always pass)
    #[arg(long = "extension", conflicts_with = "no_extensions")]
    extensions: Vec<String>,
    /// Drop every path that has an extension
    #[arg(long)]
    no_extensions: bool,
    /// Pick base URLs, methods and extensions from what the capture contains
    #[arg(short, long)]
    interactive: bool,
}

/// Options that change how values are correlated
#[derive(Args, Debug, Clone, Default)]
struct MatchArgs {
    /// Comma-separated URL substrings; only matching requests are reported
    #[arg(long)]
    url_filter: Option<String>,
    /// Which occurrences inside a response produce the extractor patterns
    #[arg(long, value_enum)]
    occurrence: Option<OccurrencePreference>,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum ReportFormat {
    #[default]
    Text,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Correlate a capture and print the report
    Analyze {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        matching: MatchArgs,
        /// Output format
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },
    /// Correlate a capture and write a JMeter test plan
    Synthesize {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        matching: MatchArgs,
        /// Where to write the plan (.jmx)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Test plan name
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        threads: Option<u32>,
        /// Ramp-up period in seconds
        #[arg(long)]
        ramp_up: Option<u32>,
        #[arg(long)]
        loops: Option<u32>,
        /// Group requests into transaction controllers
        #[arg(long, value_enum)]
        group_by: Option<GroupingPolicy>,
        /// Directory with template overrides
        #[arg(long)]
        template_dir: Option<PathBuf>,
        /// Leave out HTTP Request Defaults (connection reuse)
        #[arg(long)]
        no_keep_alive: bool,
        #[arg(long)]
        no_dns_cache: bool,
        #[arg(long)]
        no_cookie_manager: bool,
        #[arg(long)]
        no_cache_manager: bool,
    },
    /// Convert a HAR capture into a JMeter sample recording
    Record {
        #[command(flatten)]
        input: InputArgs,
        /// Where to write the recording (.xml)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the samples of a capture and what it contains
    Inspect {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Ask the configured text-generation service for a test plan
    Delegate {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        matching: MatchArgs,
        /// Where to write the plan (.jmx)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(Config::load_default()
            .await
            .context("Failed to load default config")?
            .unwrap_or_default()),
    }
}

fn select(prompt: &str, items: &[String]) -> anyhow::Result<Vec<String>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let picked = MultiSelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(items)
        .defaults(&vec![true; items.len()])
        .interact()
        .context("Selection cancelled")?;
    Ok(picked.into_iter().map(|i| items[i].clone()).collect())
}

fn interactive_filter(inventory: &Inventory) -> anyhow::Result<EntryFilter> {
    println!("All entries pre-selected. Use SPACE to toggle, ENTER to confirm.");
    let base_urls = select("Base URLs", &inventory.base_urls)?;
    let methods = select("Methods", &inventory.methods)?;
    let extensions = if inventory.extensions.is_empty() {
        ExtensionPolicy::Any
    } else {
        ExtensionPolicy::from_selection(Some(select("Extensions", &inventory.extensions)?))
    };
    Ok(EntryFilter {
        base_urls,
        methods,
        extensions,
    })
}

impl InputArgs {
    async fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(input) = &self.input {
            config.input = Some(input.clone());
        }
        if !self.base_urls.is_empty() {
            config.filter.base_urls = self.base_urls.clone();
        }
        if !self.methods.is_empty() {
            config.filter.methods = self.methods.clone();
        }
        if self.no_extensions {
            config.filter.extensions = ExtensionPolicy::NoExtensions;
        } else if !self.extensions.is_empty() {
            config.filter.extensions = ExtensionPolicy::from_selection(Some(&self.extensions));
        }

        if self.interactive {
            let input = config.require_input()?;
            let loaded = LoadedDocument::from_file(input)
                .await
                .with_context(|| format!("Failed to load {}", input.display()))?;
            let capture = Capture::from_document(loaded, &EntryFilter::default())?;
            match &capture.inventory {
                Some(inventory) => config.filter = interactive_filter(inventory)?,
                None => tracing::info!("Recordings cannot be filtered; using every sample"),
            }
        }
        Ok(())
    }
}

impl MatchArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(filter) = &self.url_filter {
            config.url_filter = UrlFilter::parse(filter);
        }
        if let Some(occurrence) = self.occurrence {
            config.matcher.occurrence = occurrence;
        }
    }
}

fn print_report(report: &CorrelationReport) {
    for entry in &report.entries {
        println!(
            "[{}] {} {} {}",
            entry.sequence_index, entry.label, entry.method, entry.url
        );
        if entry.parameters.is_empty() {
            println!("    (no parameters)");
        }
        for pc in &entry.parameters {
            match &pc.correlation {
                Correlation::Correlated(m) => println!(
                    "    {} = {}  <- first #{} '{}', nearest #{} '{}' ({} sources)",
                    pc.parameter.name,
                    pc.parameter.value,
                    m.first_source.sequence_index,
                    m.first_source.label,
                    m.nearest_source.sequence_index,
                    m.nearest_source.label,
                    m.match_count
                ),
                Correlation::Uncorrelated => println!(
                    "    {} = {}  (uncorrelated)",
                    pc.parameter.name, pc.parameter.value
                ),
            }
        }
    }
    println!(
        "{} requests, {} correlated parameters",
        report.len(),
        report.correlated_parameters().count()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging; library warnings go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref()).await?;

    match &cli.command {
        Commands::Analyze {
            input,
            matching,
            format,
        } => {
            input.apply(&mut config).await?;
            matching.apply(&mut config);
            let analysis = generate::analyze_input(&config)
                .await
                .context("Failed to analyze capture")?;
            match format {
                ReportFormat::Text => print_report(&analysis.report),
                ReportFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&analysis.report)?)
                }
            }
        }
        Commands::Synthesize {
            input,
            matching,
            output,
            name,
            threads,
            ramp_up,
            loops,
            group_by,
            template_dir,
            no_keep_alive,
            no_dns_cache,
            no_cookie_manager,
            no_cache_manager,
        } => {
            input.apply(&mut config).await?;
            matching.apply(&mut config);
            if let Some(output) = output {
                config.output = Some(output.clone());
            }
            if let Some(template_dir) = template_dir {
                tracing::debug!("Using template directory: {}", template_dir.display());
                config.template_dir = Some(template_dir.clone());
            }
            let plan = &mut config.plan;
            if let Some(name) = name {
                plan.name = name.clone();
            }
            plan.threads = threads.unwrap_or(plan.threads);
            plan.ramp_up = ramp_up.unwrap_or(plan.ramp_up);
            plan.loops = loops.unwrap_or(plan.loops);
            plan.grouping = group_by.unwrap_or(plan.grouping);
            plan.keep_alive &= !no_keep_alive;
            plan.dns_cache &= !no_dns_cache;
            plan.cookie_manager &= !no_cookie_manager;
            plan.cache_manager &= !no_cache_manager;

            let summary = generate::generate(&config)
                .await
                .context("Failed to generate test plan")?;
            println!(
                "Wrote {} ({} requests, {} extractors)",
                summary.output.display(),
                summary.requests,
                summary.extractors
            );
        }
        Commands::Record { input, output } => {
            input.apply(&mut config).await?;
            if let Some(output) = output {
                config.output = Some(output.clone());
            }
            let count = generate::export_recording(&config)
                .await
                .context("Failed to export recording")?;
            println!("Exported {} samples", count);
        }
        Commands::Inspect { input } => {
            input.apply(&mut config).await?;
            let path = config.require_input()?;
            let capture = Capture::load(path, &config.filter)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?;
            print!("{}", capture.diagnostics());
            if let Some(inventory) = &capture.inventory {
                println!("Base URLs: {}", inventory.base_urls.join(", "));
                println!("Methods: {}", inventory.methods.join(", "));
                println!("Extensions: {}", inventory.extensions.join(", "));
            }
        }
        Commands::Delegate {
            input,
            matching,
            output,
        } => {
            input.apply(&mut config).await?;
            matching.apply(&mut config);
            if let Some(output) = output {
                config.output = Some(output.clone());
            }
            let settings = config.collaborator.clone().unwrap_or_default();
            let collaborator =
                HttpCollaborator::new(settings).context("Failed to set up collaborator")?;
            let written = generate::delegate(&config, &collaborator)
                .await
                .context("Failed to obtain a test plan from the collaborator")?;
            println!("Wrote {}", written.display());
        }
    }
    Ok(())
}
