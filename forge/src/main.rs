//! Multi-agent pipeline for offline service generation.
//!
//! `forge run` sequences planning, bounded generation, bounded review, and
//! testing stages against an external agent command, recording a durable
//! JSONL trace of every step. `forge summary` rebuilds the run summary from
//! that trace alone.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, anyhow};
use clap::{Parser, Subcommand};

use forge::context::{WorkflowContext, load_schema, service_name_from_schema};
use forge::core::summary::derive_summary;
use forge::errors::{ContractExhaustedError, ReviewExhaustedError};
use forge::exit_codes;
use forge::io::config::{PipelineConfig, load_config, write_config};
use forge::io::paths::{OutputPaths, slugify};
use forge::io::runtime::CliRuntime;
use forge::logging;
use forge::pipeline::{DEFAULT_GOAL, render_run_summary, run_pipeline};
use forge::trace::sink::{JsonlSink, load_events};
use forge::trace::tracker::Tracker;

#[derive(Parser)]
#[command(
    name = "forge",
    version,
    about = "Bounded multi-agent pipeline for offline service generation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline against a declarative service schema.
    Run {
        /// Path to the service schema JSON file.
        #[arg(long)]
        schema: PathBuf,
        /// Workspace root for generated outputs (defaults to the current directory).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Configuration file (defaults to `<workspace>/forge.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the slug derived from the schema's service name.
        #[arg(long)]
        slug: Option<String>,
        /// Group outputs under a domain directory.
        #[arg(long)]
        domain: Option<String>,
        /// High-level goal shared across all stage prompts.
        #[arg(long)]
        goal: Option<String>,
        /// Override the configured per-agent turn budget.
        #[arg(long)]
        max_turns: Option<u32>,
    },
    /// Recompute a run summary from a persisted JSONL trace.
    Summary {
        /// Path to a `trace_<slug>.jsonl` file.
        #[arg(long)]
        trace: PathBuf,
    },
    /// Write a default `forge.toml` in the current directory.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ContractExhaustedError>().is_some() {
        exit_codes::CONTRACT_EXHAUSTED
    } else if err.downcast_ref::<ReviewExhaustedError>().is_some() {
        exit_codes::REVIEW_EXHAUSTED
    } else {
        exit_codes::INVALID
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            schema,
            workspace,
            config,
            slug,
            domain,
            goal,
            max_turns,
        } => cmd_run(RunArgs {
            schema,
            workspace,
            config,
            slug,
            domain,
            goal,
            max_turns,
        }),
        Command::Summary { trace } => cmd_summary(&trace),
        Command::Init { force } => cmd_init(force),
    }
}

struct RunArgs {
    schema: PathBuf,
    workspace: Option<PathBuf>,
    config: Option<PathBuf>,
    slug: Option<String>,
    domain: Option<String>,
    goal: Option<String>,
    max_turns: Option<u32>,
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let workspace_root = match args.workspace {
        Some(root) => root,
        None => std::env::current_dir().context("resolve current directory")?,
    };

    let config_path = args
        .config
        .unwrap_or_else(|| workspace_root.join("forge.toml"));
    let mut config = load_config(&config_path)?;
    config.apply_env_overrides();
    if let Some(max_turns) = args.max_turns {
        config.max_turns_per_agent = max_turns;
    }
    config.validate()?;

    let schema_path = if args.schema.is_absolute() {
        args.schema
    } else {
        workspace_root.join(&args.schema)
    };
    if !schema_path.exists() {
        return Err(anyhow!("schema file not found: {}", schema_path.display()));
    }
    let schema = load_schema(&schema_path)?;

    let service_name = service_name_from_schema(&schema, &schema_path);
    let slug = args
        .slug
        .map_or_else(|| slugify(&service_name), |value| slugify(&value));
    let domain_slug = args.domain.as_deref().map(slugify);

    let paths = OutputPaths::new(&workspace_root, &slug, domain_slug.as_deref());
    paths.ensure_layout()?;
    let mut context = WorkflowContext::new(
        workspace_root,
        schema_path,
        schema,
        slug.clone(),
        domain_slug,
        &paths,
    );

    let sink = JsonlSink::create(&paths.trace_path)?;
    let mut tracker = Tracker::new(sink);
    let runtime = CliRuntime::new(config.agent.command.clone())?;
    let goal = args.goal.unwrap_or_else(|| DEFAULT_GOAL.to_string());

    let result = run_pipeline(&mut context, &runtime, &mut tracker, &config, &paths, &goal);

    // Export the snapshot for failed runs too; the trace must stay complete.
    if let Err(export_err) = tracker.export(&paths.trace_export_path, &slug) {
        tracing::warn!("failed to export trace snapshot: {export_err:#}");
    }

    let outcome = result?;
    println!("{}", render_run_summary(&context, &outcome));
    println!();
    println!(
        "Trace: {} (snapshot: {})",
        paths.trace_path.display(),
        paths.trace_export_path.display()
    );
    Ok(())
}

fn cmd_summary(trace: &Path) -> Result<()> {
    let events = load_events(trace)?;
    let summary = derive_summary(&events);
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("serialize summary")?
    );
    Ok(())
}

fn cmd_init(force: bool) -> Result<()> {
    let path = std::env::current_dir()
        .context("resolve current directory")?
        .join("forge.toml");
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    write_config(&path, &PipelineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}
