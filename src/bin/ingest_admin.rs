//! Ingest Admin CLI
//!
//! Operator tooling: inspect configuration, check descriptor compatibility,
//! and manage scheduled jobs in a durable store.
//!
//! `schemas` and `jobs` open the snapshot exclusively. They refuse to run
//! while a driver process holds it; stop the driver first.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use schema_ingest::storage::DocumentStore;
use schema_ingest::{
    CompatibilityChecker, IngestConfig, JobDescriptor, JobScheduler, SchemaDescriptor,
    SchemaIdentity, SchemaRegistry,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ingest-admin")]
#[command(about = "Administer the schema registry and ingestion jobs")]
#[command(
    after_help = "The schemas and jobs commands lock the store snapshot. They fail while a running driver holds it."
)]
struct Cli {
    /// Explicit config file layered over the default locations
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or write configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Check whether a new descriptor is backward compatible with an old one
    Check {
        /// Old descriptor (JSON)
        #[arg(long)]
        old: PathBuf,
        /// New descriptor (JSON)
        #[arg(long)]
        new: PathBuf,
        /// Strict mode - any change is breaking
        #[arg(long)]
        strict: bool,
    },

    /// Registered schemas and their row counts (needs the store unlocked)
    Schemas,

    /// Inspect and administer jobs (needs the store unlocked; stop the driver first)
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration
    Init {
        #[arg(default_value = "ingest.toml")]
        path: String,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List every job
    List,
    /// Show one job with its run notes
    Show { identity: String },
    /// Restart backfilling from the initial cursor
    Reset {
        /// Job identity as namespace.name.version
        identity: Option<String>,
        /// Reset every job
        #[arg(long, conflicts_with = "identity")]
        all: bool,
    },
    /// Submit or overwrite a job descriptor (JSON file)
    Submit { descriptor: PathBuf },
    /// Delete a job
    Remove { identity: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = IngestConfig::load_from(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Init { path } => {
                if std::path::Path::new(&path).exists() {
                    bail!("{} already exists", path);
                }
                IngestConfig::default().save(&path)?;
                println!("✅ Wrote default configuration to {}", path);
                Ok(())
            }
        },

        Commands::Check { old, new, strict } => {
            let old_descriptor = read_descriptor(&old)?;
            let new_descriptor = read_descriptor(&new)?;
            let checker = if strict || config.registry.strict {
                CompatibilityChecker::new().strict()
            } else {
                CompatibilityChecker::new()
            };
            let result = checker.check(&old_descriptor, &new_descriptor);

            for change in &result.changes {
                let marker = if change.is_breaking { "❌" } else { "✅" };
                println!("{} {} at {}", marker, change.description, change.path);
            }
            println!();
            if result.is_compatible {
                println!("✅ {}", result.summary);
                Ok(())
            } else {
                println!("❌ {}", result.summary);
                std::process::exit(1);
            }
        }

        Commands::Schemas => {
            let store = open_store(&config).await?;
            let registry = SchemaRegistry::with_config(store.clone(), store, config.registry.clone());
            let stats = registry.load_stats().await?;
            if stats.is_empty() {
                println!("No schemas registered");
            }
            for stat in stats {
                let updated = stat
                    .last_updated
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<40} {:>8} rows  last updated {}", stat.identity, stat.row_count, updated);
            }
            Ok(())
        }

        Commands::Jobs { action } => {
            let store = open_store(&config).await?;
            let scheduler = JobScheduler::new(store, config.scheduler.clone());
            run_jobs(&scheduler, action).await
        }
    }
}

async fn run_jobs(scheduler: &JobScheduler, action: JobsAction) -> anyhow::Result<()> {
    match action {
        JobsAction::List => {
            let jobs = scheduler.find_all().await?;
            if jobs.is_empty() {
                println!("No jobs");
            }
            for job in jobs {
                println!(
                    "{:<40} {:<10} {:<12} cursor={:<12} fails={} next={}",
                    job.identity,
                    job.state,
                    job.schedule_mode,
                    job.cursor,
                    job.current_fail_count,
                    job.scheduled_at.to_rfc3339()
                );
            }
            Ok(())
        }
        JobsAction::Show { identity } => {
            let identity = SchemaIdentity::parse(&identity)?;
            let job = scheduler
                .find_job(&identity)
                .await?
                .with_context(|| format!("no job for {}", identity))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        JobsAction::Reset { identity, all } => {
            if all {
                let count = scheduler.reset_all().await?;
                println!("✅ Reset {} jobs", count);
                return Ok(());
            }
            let Some(identity) = identity else {
                bail!("pass a job identity or --all");
            };
            let identity = SchemaIdentity::parse(&identity)?;
            match scheduler.reset(&identity).await? {
                Some(job) => println!("✅ Reset {} to cursor {}", job.identity, job.cursor),
                None => bail!("no job for {}", identity),
            }
            Ok(())
        }
        JobsAction::Submit { descriptor } => {
            let content = std::fs::read_to_string(&descriptor)
                .with_context(|| format!("reading {}", descriptor.display()))?;
            let descriptor: JobDescriptor = serde_json::from_str(&content)?;
            let job = scheduler.schedule(descriptor).await?;
            println!(
                "✅ Scheduled {} ({} from cursor {}) at {}",
                job.identity,
                job.schedule_mode,
                job.cursor,
                job.scheduled_at.to_rfc3339()
            );
            Ok(())
        }
        JobsAction::Remove { identity } => {
            let identity = SchemaIdentity::parse(&identity)?;
            if !scheduler.remove(&identity).await? {
                bail!("no job for {}", identity);
            }
            println!("✅ Removed {}", identity);
            Ok(())
        }
    }
}

fn read_descriptor(path: &PathBuf) -> anyhow::Result<SchemaDescriptor> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let descriptor: SchemaDescriptor =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    descriptor.validate()?;
    Ok(descriptor)
}

/// The configured snapshot, or one under the platform data directory
async fn open_store(config: &IngestConfig) -> anyhow::Result<Arc<DocumentStore>> {
    let path = match &config.storage.path {
        Some(path) => path.clone(),
        None => directories::ProjectDirs::from("dev", "familiar", "schema-ingest")
            .map(|dirs| dirs.data_dir().join("ingest.json"))
            .context("no storage.path configured and no home directory found")?,
    };
    let store = DocumentStore::open(&path).await.with_context(|| {
        format!(
            "opening store at {} (is a driver still running against it?)",
            path.display()
        )
    })?;
    Ok(Arc::new(store))
}
