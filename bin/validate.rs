// ✅ Carte Scolaire - artifact validator
// Checks schools.json and communes.json; exits 1 on any critical violation.

use anyhow::Result;
use carte_scolaire::{load_artifacts, PipelineConfig, Validator};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "carte-validate", version, about = "Validate the map artifacts")]
struct Cli {
    #[arg(long, env = "CARTE_SCOLAIRE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Add a per-rule breakdown
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    println!("🔍 Validating artifacts in {}", config.data_dir.display());
    let (schools, communes) = load_artifacts(&config.data_dir)?;
    let report = Validator::new(&config).validate(&schools, &communes);

    for violation in &report.violations {
        println!("{}", violation);
    }

    if cli.verbose {
        println!("\n📊 By rule");
        for ((severity, rule), count) in report.counts_by_rule() {
            println!("   {:?} {:<26} {:>6}", severity, rule, count);
        }
    }

    println!("\n{}", report.summary());
    if report.has_critical() {
        println!("❌ Validation failed");
        std::process::exit(1);
    }

    println!("✅ Validation passed");
    Ok(())
}
