use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use medload_intake::IntakeError;
use medload_sync::{ConfigError, LoadConfig, LoadOverrides, RunMode};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "medload")]
#[command(about = "Load healthcare admission CSV exports into a document collection")]
struct Cli {
    #[command(flatten)]
    load: LoadArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Stream the CSV into the collection (default).
    Load,
    /// Create the natural-key unique index and exit.
    EnsureIndex,
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Input CSV file [env: CSV_PATH]
    #[arg(long = "csv", global = true)]
    csv_path: Option<PathBuf>,
    /// Store endpoint [env: DATABASE_URL]
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Database name [env: DB_NAME]
    #[arg(long = "db", global = true)]
    database: Option<String>,
    /// Collection name [env: DB_COLLECTION]
    #[arg(long, global = true)]
    collection: Option<String>,
    /// dry-run, upsert or insert-only [env: LOAD_MODE]
    #[arg(long, global = true)]
    mode: Option<RunMode>,
    /// Provision the unique index before loading [env: CREATE_INDEXES]
    #[arg(long, global = true, overrides_with = "no_create_indexes")]
    create_indexes: bool,
    /// Skip index provisioning even if CREATE_INDEXES is set
    #[arg(long, global = true, overrides_with = "create_indexes")]
    no_create_indexes: bool,
    /// Rows per chunk [env: CHUNK_SIZE]
    #[arg(long, global = true)]
    chunk_size: Option<usize>,
    /// Log filter, e.g. info or debug [env: LOG_LEVEL]
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Append-only run log [env: REPORT_LOG_PATH]
    #[arg(long, global = true)]
    report_log: Option<PathBuf>,
    /// Documents printed in dry-run mode [env: PREVIEW_LIMIT]
    #[arg(long, global = true)]
    preview_limit: Option<usize>,
    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,
}

impl LoadArgs {
    fn overrides(&self) -> LoadOverrides {
        LoadOverrides {
            csv_path: self.csv_path.clone(),
            database_url: self.database_url.clone(),
            database: self.database.clone(),
            collection: self.collection.clone(),
            mode: self.mode,
            create_indexes: if self.no_create_indexes {
                Some(false)
            } else {
                self.create_indexes.then_some(true)
            },
            chunk_size: self.chunk_size,
            log_level: self.log_level.clone(),
            report_log: self.report_log.clone(),
            preview_limit: self.preview_limit,
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

async fn run(cli: &Cli, config: &LoadConfig) -> Result<()> {
    match cli.command.unwrap_or(Commands::Load) {
        Commands::Load => {
            let summary = medload_sync::run_load(config).await?;
            if cli.load.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.one_line());
            }
        }
        Commands::EnsureIndex => {
            let status = medload_sync::ensure_index_from_config(config).await?;
            println!(
                "ensure-index complete: collection={}.{} status={:?}",
                config.database, config.collection, status
            );
        }
    }
    Ok(())
}

/// 2 for configuration problems (including a malformed header), 1 otherwise.
fn exit_status(err: &anyhow::Error) -> u8 {
    let config_problem = err.downcast_ref::<ConfigError>().is_some()
        || matches!(err.downcast_ref::<IntakeError>(), Some(IntakeError::MissingColumns { .. }));
    if config_problem {
        2
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = LoadConfig::resolve(cli.load.overrides());
    let filter = config
        .as_ref()
        .map(LoadConfig::log_filter)
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&filter);

    let result = match config {
        Ok(config) => run(&cli, &config).await,
        Err(err) => Err(err.into()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_status(&err))
        }
    }
}
