use crate::commands::{Commands, SyncMode};
use crate::error::CliError;
use crate::shutdown::ShutdownCoordinator;
use checkpoint::CheckpointStore;
use clap::Parser;
use engine::SyncEngine;
use engine_config::{load_config, NotifierRegistry};
use std::path::Path;
use std::process;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod shutdown;

#[derive(Parser)]
#[command(name = "cdc-sync", version, about = "SQLite change-capture replication to MySQL/Oracle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level override (DEBUG, INFO, WARNING, ERROR).
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let exit_code = match run(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("error: {err}");
            1
        }
    };

    process::exit(exit_code);
}

fn init_logging(level: Option<&str>) {
    let directive = match level.map(str::to_ascii_uppercase).as_deref() {
        Some("DEBUG") => "debug",
        Some("WARNING") => "warn",
        Some("ERROR") => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Init { path, force } => init_template(&path, force),
        Commands::Validate { config } => validate(&config),
        Commands::Sync {
            config,
            mode,
            tables,
            checkpoints,
        } => sync(&config, mode, tables.as_deref(), &checkpoints).await,
        Commands::Status {
            config,
            checkpoints,
        } => status(&config, &checkpoints),
        Commands::Reset {
            config,
            table,
            checkpoints,
        } => reset(&config, table.as_deref(), &checkpoints),
    }
}

fn init_template(path: &str, force: bool) -> Result<(), CliError> {
    if Path::new(path).exists() && !force {
        return Err(CliError::FileExists(path.to_string()));
    }
    std::fs::write(path, engine_config::config_template())?;
    println!("Configuration template written to {path}");
    Ok(())
}

fn validate(config_path: &str) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    println!("Configuration OK");
    println!("  source:   {}", config.source.db_path);
    println!("  targets:  {}", config.targets.len());
    println!("  mappings: {}", config.mappings.len());
    Ok(())
}

async fn sync(
    config_path: &str,
    mode: SyncMode,
    tables: Option<&str>,
    checkpoints: &str,
) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let tables = tables.map(|csv| {
        csv.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
    });

    let mut engine = SyncEngine::new(config, checkpoints)?
        .with_notifiers(NotifierRegistry::with_console());

    let coordinator = ShutdownCoordinator::new(engine.cancel_token());
    coordinator.register_handlers();

    match mode {
        SyncMode::Initial => engine.run_initial_only(tables).await?,
        SyncMode::Full => engine.start(tables, true).await?,
        SyncMode::Incremental => engine.start(tables, false).await?,
    }

    Ok(())
}

fn status(config_path: &str, checkpoints: &str) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let store = CheckpointStore::open(checkpoints)?;
    let source = &config.source.db_path;

    println!("Sync status for {source}");
    println!("----------------------------------------");

    let initial = store.list_initial_checkpoints(source)?;
    if !initial.is_empty() {
        println!("Initial sync:");
        for mapping in &config.mappings {
            if let Some(ckpt) = initial.get(&mapping.source_table) {
                println!(
                    "  {:<24} {:>10} rows  ({})",
                    ckpt.table_name, ckpt.total_synced, ckpt.status
                );
            }
        }
        println!();
    }

    println!("Incremental sync:");
    for target in &config.targets {
        let position = store.load_position(source, &target.name)?;
        println!("  target {}", target.name);
        println!("    events processed: {}", position.total_events);
        println!("    cursor:           {}", position.last_audit_id);
    }

    let unresolved = store.list_unresolved_errors(source, None)?;
    if !unresolved.is_empty() {
        println!();
        println!("Unresolved errors: {}", unresolved.len());
        for err in unresolved.iter().take(5) {
            println!("  [{}] {}: {}", err.id, err.target_name, err.error_message);
        }
    }

    Ok(())
}

fn reset(config_path: &str, table: Option<&str>, checkpoints: &str) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let store = CheckpointStore::open(checkpoints)?;
    let source = &config.source.db_path;

    match table {
        Some(table) => {
            store.delete_initial_checkpoint(source, table)?;
            println!("Checkpoint for table {table} reset");
        }
        None => {
            for table in config.mapped_tables() {
                store.delete_initial_checkpoint(source, &table)?;
            }
            println!("Checkpoints for all mapped tables reset");
        }
    }

    Ok(())
}
