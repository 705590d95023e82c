//! # Spreadsheet Ingestion Tool
//!
//! Normalizes a spreadsheet export into cell records and prints the
//! ingestion report as JSON.
//!
//! ## Usage
//! ```bash
//! # Print the report for a JSON array of row objects
//! cargo run -p cellsync-sync --bin cellsync-ingest -- rows.json
//!
//! # Also import the records into the SQLite inspection store
//! cargo run -p cellsync-sync --bin cellsync-ingest -- rows.json --import --db ./cellsync.db
//! ```
//!
//! The row file is what a spreadsheet-to-JSON export produces: one object
//! per row, keyed by column header (`"Название Ячейки"`, `"Status"`, ...)
//! or by column letter (`"A"`..`"E"`).
//!
//! Logs go to stderr so stdout stays valid JSON.

use std::env;
use std::path::PathBuf;

use cellsync_core::{CellRecord, IngestionReport};
use cellsync_db::{Database, DbConfig};
use cellsync_sync::{EventBus, SyncConfig, SyncEngine};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, PartialEq)]
struct Args {
    rows: PathBuf,
    import: bool,
    db_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

fn print_help() {
    println!("cellsync spreadsheet ingestion");
    println!();
    println!("Usage: cellsync-ingest <ROWS.json> [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -i, --import         Import the records into the inspection store");
    println!("  -d, --db <PATH>      Database file (default: from sync config)");
    println!("  -c, --config <PATH>  sync.toml to load or create (default: platform config dir)");
    println!("  -h, --help           Show this help message");
}

/// Parses command line arguments (without the program name). `None` when
/// help was requested.
fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Option<Args>, String> {
    let mut rows = None;
    let mut import = false;
    let mut db_path = None;
    let mut config_path = None;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--import" | "-i" => import = true,
            "--db" | "-d" => {
                let value = iter.next().ok_or("--db needs a path")?;
                db_path = Some(PathBuf::from(value));
            }
            "--config" | "-c" => {
                let value = iter.next().ok_or("--config needs a path")?;
                config_path = Some(PathBuf::from(value));
            }
            "--help" | "-h" => return Ok(None),
            other if other.starts_with('-') => return Err(format!("unknown option {other}")),
            other => {
                if rows.is_some() {
                    return Err(format!("unexpected argument {other}"));
                }
                rows = Some(PathBuf::from(other));
            }
        }
    }

    let rows = rows.ok_or("missing row file")?;
    Ok(Some(Args {
        rows,
        import,
        db_path,
        config_path,
    }))
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - Default: `info,cellsync=debug,sqlx=warn`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cellsync=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Reads the row file and builds the report, importing it when asked.
async fn run(args: Args) -> Result<IngestionReport, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(&args.rows)?;
    let value: serde_json::Value = serde_json::from_str(&contents)?;

    if !args.import {
        return Ok(cellsync_core::normalize_json(&value)?);
    }

    let mut config = SyncConfig::load_or_init(args.config_path)?;
    if let Some(path) = args.db_path {
        config.storage.database_path = Some(path);
    }
    let db_path = config
        .database_path()
        .ok_or("no database path configured")?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let engine = SyncEngine::with_database(config, &db, EventBus::new()).await?;

    let report = engine.ingest_json(&value)?;
    let records: Vec<CellRecord> = report.records.values().cloned().collect();
    let imported = engine.import_records(&records).await?;
    info!(imported, path = %db_path.display(), "Import finished");

    db.close().await;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args(env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print_help();
            return Ok(());
        }
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!();
            print_help();
            std::process::exit(2);
        }
    };

    init_tracing();

    let report = run(args).await?;
    if report.summary.errors > 0 {
        warn!(errors = report.summary.errors, "Some rows could not be read");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
