use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use smoking_area_seed::{
    init_tracing, migrate, open_store, repair_from_log, seed, AppConfig, Pipeline, SeedOptions,
    WriteMode,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Geocode and seed smoking-area records", long_about = None)]
struct Cli {
    /// SQLite store; defaults to DATABASE_PATH
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve a source table and write it to the store
    Seed(SeedArgs),
    /// Retry the rows listed in a failure log
    Repair(RepairArgs),
    /// Bring the store schema up to date
    Migrate,
}

#[derive(Debug, Args)]
struct SeedArgs {
    /// Source CSV/TSV file
    #[arg(long)]
    csv: PathBuf,
    #[arg(long, value_enum, default_value_t = ModeArg::Replace)]
    mode: ModeArg,
    /// Check each query against the postal-code service before geocoding
    #[arg(long)]
    validate: bool,
    /// Run the repair pass over failures before writing
    #[arg(long)]
    repair: bool,
    #[arg(long = "failure-log")]
    failure_log: Option<PathBuf>,
    /// Write a JSON summary of the stored records
    #[arg(long)]
    summary: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RepairArgs {
    #[arg(long = "failure-log")]
    failure_log: PathBuf,
    #[arg(long)]
    validate: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum ModeArg {
    Replace,
    Append,
}

impl From<ModeArg> for WriteMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Replace => WriteMode::Replace,
            ModeArg::Append => WriteMode::Append,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let database = cli
        .database
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.database_path));
    info!(config = ?config.public_profile(), "configuration loaded");

    match cli.command {
        Commands::Seed(args) => {
            let pipeline = Pipeline::from_config(&config, args.validate)?;
            let mut connection = open_store(&database)?;
            let options = SeedOptions {
                csv: args.csv,
                mode: args.mode.into(),
                repair: args.repair,
                failure_log: args.failure_log,
                summary: args.summary,
            };
            let report = seed(&pipeline, &mut connection, &options)
                .await
                .with_context(|| format!("seeding from {}", options.csv.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Repair(args) => {
            let pipeline = Pipeline::from_config(&config, args.validate)?;
            let mut connection = open_store(&database)?;
            let summary = repair_from_log(&pipeline, &mut connection, &args.failure_log)
                .await
                .with_context(|| format!("repairing {}", args.failure_log.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let mut connection = open_store(&database)?;
            let state = migrate(&mut connection)?;
            println!("{}", serde_json::to_string_pretty(&state.columns)?);
        }
    }
    Ok(())
}
