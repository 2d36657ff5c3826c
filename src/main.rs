// 🗺️ Carte Scolaire - data pipeline CLI
// Fetches the upstream datasets, merges them into the stores and writes the map artifacts.

use anyhow::{Context, Result};
use carte_scolaire::{HttpTransport, Pipeline, PipelineConfig, RunSummary, Step};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "carte-scolaire", version, about = "Build the school map artifacts")]
struct Cli {
    /// TOML configuration file; built-in defaults when absent
    #[arg(long, env = "CARTE_SCOLAIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Restrict the run to one region (name or code)
    #[arg(long)]
    region: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Directory, IPS and exam results
    Education,
    /// Enrollment counts per school
    Enrollment,
    /// Foreign language offerings
    Languages,
    /// Mayors and election results
    Political,
    /// Assemble schools.json from the stores
    Schools,
    /// Assemble communes.json from the stores
    Communes,
    /// Every step in order (default)
    All,
}

impl From<Command> for Step {
    fn from(command: Command) -> Self {
        match command {
            Command::Education => Step::Education,
            Command::Enrollment => Step::Enrollment,
            Command::Languages => Step::Languages,
            Command::Political => Step::Political,
            Command::Schools => Step::Schools,
            Command::Communes => Step::Communes,
            Command::All => Step::All,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(region) = &cli.region {
        config.restrict_to_region(region)?;
    }
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory: {}", config.data_dir.display()))?;

    let step: Step = cli.command.unwrap_or(Command::All).into();

    println!("🗺️  Carte Scolaire {} - step: {}", carte_scolaire::VERSION, step.as_str());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let regions: Vec<&str> = config.regions.iter().map(|r| r.name.as_str()).collect();
    println!("📍 Regions: {}", regions.join(", "));
    println!("📂 Data dir: {}", config.data_dir.display());

    let education = HttpTransport::new(&config.education_api)?;
    let geo = HttpTransport::new(&config.geo_api)?;

    let mut pipeline = Pipeline::new(config, &education, &geo)?;
    let summary = pipeline.run(step)?;

    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    if !summary.stores.is_empty() {
        println!("\n💾 Stores");
        for store in &summary.stores {
            let marker = if store.complete { "✓" } else { "⚠️" };
            println!(
                "{} {:<20} fetched {:>6}  kept {:>6}  +{} ~{} ={} preserved {}",
                marker,
                store.store_id,
                store.fetched,
                store.reconciled,
                store.merge.inserted,
                store.merge.replaced,
                store.merge.unchanged,
                store.merge.preserved
            );
        }
    }

    for artifact in &summary.artifacts {
        println!("\n📄 {} ({} entities)", artifact.path.display(), artifact.entities);
        for table in artifact.join.tables.keys() {
            if let Some(coverage) = artifact.join.coverage(table) {
                println!("   {:<14} {:>5.1}%", table, coverage);
            }
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let incomplete = summary.incomplete();
    if incomplete.is_empty() {
        println!("✅ Run complete, {} ledger events", summary.ledger_events);
    } else {
        println!("⚠️  Partial fetches kept previous data for: {}", incomplete.join(", "));
        println!("✓ {} ledger events", summary.ledger_events);
    }
}
