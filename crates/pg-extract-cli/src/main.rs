//! pg-extract CLI - incremental, resumable PostgreSQL table extraction.

use clap::{Parser, Subcommand};
use pg_extract::{
    Checkpoint, CheckpointFile, Config, ExtractError, ExtractionEngine, PgConnector, ReadOutcome,
    TracingHost,
};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-extract")]
#[command(about = "Incremental, resumable PostgreSQL table extraction")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to state file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Write rows as JSON lines to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output JSON result summary
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh extraction from the first table
    Run {
        /// Rows per fetch, overriding the configured batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Resume an interrupted extraction from the state file
    Resume {
        /// Rows per fetch, overriding the configured batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// List tables and views in the source database
    ListTables,

    /// Test the source database connection
    HealthCheck,
}

/// End-of-run report.
#[derive(Debug, Serialize)]
struct ExtractSummary {
    run_id: String,
    resumed: bool,
    tables_total: usize,
    tables_completed: usize,
    tables_skipped: Vec<String>,
    batches: u64,
    rows: u64,
    duration_seconds: f64,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ExtractError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match &cli.command {
        Commands::Run { batch_size } => {
            let cancel_token = setup_signal_handler()?;
            let run_id = uuid::Uuid::new_v4().to_string();
            let state = cli
                .state_file
                .as_ref()
                .map(|path| (path.clone(), CheckpointFile::new(run_id.clone(), config.hash())));

            let summary = extract(&cli, &config, run_id, state, *batch_size, cancel_token).await?;
            print_summary(&cli, &summary)?;
        }

        Commands::Resume { batch_size } => {
            // State file is required for resume
            let state_file = cli.state_file.clone().ok_or_else(|| {
                ExtractError::Config("--state-file is required for resume".to_string())
            })?;

            if !state_file.exists() {
                return Err(ExtractError::Config(format!(
                    "State file not found: {:?}",
                    state_file
                )));
            }

            let file = CheckpointFile::load(&state_file)?;
            file.validate_config_hash(&config.hash())?;
            info!(
                "Resuming run {} at table {} ({} batches so far)",
                file.run_id,
                file.checkpoint.table_index + 1,
                file.batches
            );

            let cancel_token = setup_signal_handler()?;
            let run_id = file.run_id.clone();
            let summary = extract(
                &cli,
                &config,
                run_id,
                Some((state_file, file)),
                *batch_size,
                cancel_token,
            )
            .await?;
            print_summary(&cli, &summary)?;
        }

        Commands::ListTables => {
            let connector = PgConnector::new(&config.source)?;
            let tables = connector.list_tables().await?;

            if cli.output_json {
                let names: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                for table in &tables {
                    println!("{}", table);
                }
            }
        }

        Commands::HealthCheck => {
            let connector = PgConnector::new(&config.source)?;
            let result = connector.health_check().await?;

            if cli.output_json {
                let report = serde_json::json!({
                    "healthy": true,
                    "database": config.source.database,
                    "latency_ms": result.latency_ms,
                    "server_version": result.server_version,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (PostgreSQL {}): OK ({}ms)",
                    config.source.database, result.latency_ms
                );
                println!("  Server: {}", result.server_version);
            }
        }
    }

    Ok(())
}

/// Drive the engine to the end of the table list, writing every row.
async fn extract(
    cli: &Cli,
    config: &Config,
    run_id: String,
    state: Option<(PathBuf, CheckpointFile)>,
    batch_size: Option<usize>,
    cancel_token: CancellationToken,
) -> Result<ExtractSummary, ExtractError> {
    let started = Instant::now();
    let resumed = matches!(cli.command, Commands::Resume { .. });

    let mut host = TracingHost::new().with_progress_json(cli.progress);
    let mut checkpoint = Checkpoint::start();
    if let Some((path, file)) = state {
        checkpoint = file.checkpoint.clone();
        host = host.with_checkpoint_file(path, file);
    }
    let host = Arc::new(host);

    let connector = Arc::new(PgConnector::new(&config.source)?);
    let options = config.engine_options()?;
    let tables_total = options.tables.len();
    let mut engine = ExtractionEngine::new(options, connector, host.clone())
        .with_retry(config.retry.policy(), config.retry.heartbeat_interval())
        .with_checkpoint(checkpoint);

    let mut writer = open_output(cli.output.as_deref())?;
    let mut summary = ExtractSummary {
        run_id,
        resumed,
        tables_total,
        tables_completed: 0,
        tables_skipped: Vec::new(),
        batches: 0,
        rows: 0,
        duration_seconds: 0.0,
    };

    loop {
        if cancel_token.is_cancelled() {
            engine.close().await;
            writer.flush()?;
            return Err(ExtractError::Cancelled);
        }

        let outcome = match engine.read(batch_size).await {
            Ok(outcome) => outcome,
            Err(ExtractError::TableNotFound { schema, table })
                if config.extraction.skip_missing_tables =>
            {
                warn!("Table {}.{} does not exist, skipping", schema, table);
                summary.tables_skipped.push(format!("{}.{}", schema, table));
                engine.skip_table().await;
                continue;
            }
            Err(e) => {
                engine.close().await;
                writer.flush()?;
                return Err(e);
            }
        };

        match outcome {
            ReadOutcome::Batch(rows) if rows.is_empty() => summary.tables_completed += 1,
            ReadOutcome::Batch(rows) => {
                summary.batches += 1;
                summary.rows += rows.len() as u64;
                for row in &rows {
                    serde_json::to_writer(&mut writer, &row.to_json())?;
                    writer.write_all(b"\n")?;
                }
            }
            ReadOutcome::EndOfStream => break,
        }
    }

    writer.flush()?;
    host.finish(engine.checkpoint())?;

    summary.duration_seconds = started.elapsed().as_secs_f64();
    Ok(summary)
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write>, ExtractError> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    })
}

/// The summary shares stdout with rows only when rows go to a file.
fn print_summary(cli: &Cli, summary: &ExtractSummary) -> Result<(), ExtractError> {
    let text = if cli.output_json {
        serde_json::to_string_pretty(summary)?
    } else {
        let mut text = format!(
            "\nExtraction completed!\n  Run ID: {}\n  Duration: {:.2}s\n  Tables: {}/{}\n  Batches: {}\n  Rows: {}",
            summary.run_id,
            summary.duration_seconds,
            summary.tables_completed,
            summary.tables_total,
            summary.batches,
            summary.rows
        );
        if !summary.tables_skipped.is_empty() {
            text.push_str(&format!("\n  Skipped tables: {:?}", summary.tables_skipped));
        }
        text
    };

    if cli.output.is_some() {
        println!("{}", text);
    } else {
        eprintln!("{}", text);
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT (Ctrl-C) or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, ExtractError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("\nReceived {}. Stopping after the current batch...", name);
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, ExtractError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current batch...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
