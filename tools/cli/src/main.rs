//! AnchorSync CLI - Command line interface for the sync engine.
//!
//! This tool keeps a local SQLite replica of files and records and
//! reconciles it with an HTTP remote store.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use anchorsync_common::Error;
use anchorsync_storage::{HttpRemote, SqliteStore};
use anchorsync_sync::{chain_order, state::count_by_action, Record, SyncAction, SyncEngine};

use crate::config::ClientConfig;

type Engine = SyncEngine<SqliteStore, HttpRemote>;

#[derive(Parser)]
#[command(name = "anchorsync")]
#[command(about = "AnchorSync - Offline-first file and record sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote base URL (overrides the config file).
    #[arg(long)]
    remote: Option<String>,

    /// Local database path (overrides the config file).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Zone scope (overrides the config file).
    #[arg(long)]
    zone: Option<String>,

    /// Author name stamped on record edits.
    #[arg(long)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the sync action of every known file.
    Status {
        /// Do not contact the remote; list local changes only.
        #[arg(long)]
        offline: bool,
    },

    /// Synchronize with the remote.
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },

    /// List local files.
    Ls,

    /// Store a file in the local replica.
    Put {
        /// Source file to read.
        source: PathBuf,

        /// Path in the replica (default: the source file name).
        #[arg(short, long)]
        dest: Option<String>,
    },

    /// Write a file from the local replica to disk.
    Get {
        /// Path in the replica.
        path: String,

        /// Destination file.
        dest: PathBuf,
    },

    /// Delete a file from the local replica.
    Rm {
        /// Path in the replica.
        path: String,
    },

    /// Inspect and edit records.
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },

    /// Show the columns of a table.
    Columns {
        /// Table name.
        table: String,

        /// Key order instead of chain order.
        #[arg(long)]
        raw: bool,
    },
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Files only.
    Files,
    /// Records only.
    Records {
        /// Pull the whole history again.
        #[arg(long)]
        full: bool,
    },
    /// Records, then files.
    All,
}

#[derive(Subcommand)]
enum RecordsCommand {
    /// List live records of a table.
    List { table: String },

    /// Show one record.
    Show {
        table: String,
        id: String,

        /// Version to show (default: latest).
        #[arg(long)]
        version: Option<u64>,
    },

    /// Save fields of one page.
    Save {
        table: String,
        page: String,

        /// Existing record id (default: create a new record).
        #[arg(long)]
        id: Option<String>,

        /// Field assignment `name=value`; the value is parsed as JSON
        /// when possible, otherwise taken as a string.
        #[arg(short = 's', long = "set")]
        fields: Vec<String>,

        /// Mark the page complete.
        #[arg(long)]
        complete: bool,
    },

    /// Delete a record.
    Delete { table: String, id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = resolve_config(&cli).await?;
    let engine = open_engine(&config)?;

    match cli.command {
        Commands::Status { offline } => cmd_status(&engine, offline).await,

        Commands::Sync { target } => cmd_sync(&engine, target).await,

        Commands::Ls => cmd_ls(&engine).await,

        Commands::Put { source, dest } => cmd_put(&engine, &source, dest).await,

        Commands::Get { path, dest } => cmd_get(&engine, &path, &dest).await,

        Commands::Rm { path } => cmd_rm(&engine, &path).await,

        Commands::Records { command } => cmd_records(&engine, command).await,

        Commands::Columns { table, raw } => cmd_columns(&engine, &table, raw).await,
    }
}

/// Merge the config file with command line overrides.
async fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path).await?,
        None => ClientConfig::default(),
    };

    if let Some(remote) = &cli.remote {
        config.remote_url = remote.clone();
    }
    if let Some(database) = &cli.database {
        config.database = database.clone();
    }
    if let Some(zone) = &cli.zone {
        config.sync.zone = Some(zone.clone());
    }
    if let Some(user) = &cli.user {
        config.sync.username = user.clone();
    }

    Ok(config)
}

fn open_engine(config: &ClientConfig) -> Result<Engine> {
    let store = SqliteStore::open(&config.database).context("Failed to open local database")?;
    let remote = HttpRemote::new(&config.remote_url).context("Failed to create remote client")?;

    Ok(SyncEngine::new(
        Arc::new(store),
        Arc::new(remote),
        config.sync.clone(),
    ))
}

/// Show the three-way status of every path.
async fn cmd_status(engine: &Engine, offline: bool) -> Result<()> {
    let entries = engine
        .files()
        .status(!offline)
        .await
        .context("Failed to compute status")?;

    if entries.is_empty() {
        println!("No files.");
        return Ok(());
    }

    for entry in &entries {
        println!("  {:<12} {}", entry.action.label(), entry.path);
    }

    let counts = count_by_action(&entries);
    let pending = entries.len() - counts.get(&SyncAction::Noop).copied().unwrap_or(0);
    println!("\n{} path(s), {} pending", entries.len(), pending);
    Ok(())
}

/// Run a sync round.
async fn cmd_sync(engine: &Engine, target: SyncTarget) -> Result<()> {
    match target {
        SyncTarget::Files => {
            let report = engine.sync_files().await.map_err(explain)?;
            println!(
                "Files: {} uploaded, {} downloaded, {} deleted remotely, {} removed locally",
                report.uploaded, report.downloaded, report.deleted_remote, report.removed_local
            );
        }
        SyncTarget::Records { full } => {
            let report = engine.sync_records(full).await.map_err(explain)?;
            println!(
                "Records: {} uploaded, {} fragment(s) pulled, {} touched (anchor {})",
                report.uploaded,
                report.fragments,
                report.touched.len(),
                report.watermark
            );
            if report.conflict {
                println!(
                    "Upload refused: some records changed remotely. {} unsynced edit(s) were dropped; re-apply them.",
                    report.discarded
                );
            }
        }
        SyncTarget::All => {
            let mut result = engine.sync_all().await.map_err(explain)?;
            println!(
                "Synced in {:?}: {} file(s) uploaded, {} downloaded, {} record(s) touched",
                result.duration,
                result.files_uploaded,
                result.files_downloaded,
                result.touched.len()
            );
            if result.record_conflict {
                println!(
                    "Upload refused: some records changed remotely. {} unsynced edit(s) were dropped; re-apply them.",
                    result.records_discarded
                );
            }
            if let Some(e) = result.files_error.take() {
                return Err(explain(e));
            }
        }
    }
    Ok(())
}

/// Turn engine errors into a readable message.
fn explain(error: Error) -> anyhow::Error {
    match error {
        Error::UnresolvedConflicts(paths) => anyhow::anyhow!(
            "Sync blocked by {} conflict(s):\n  {}",
            paths.len(),
            paths.join("\n  ")
        ),
        Error::PartialFailure { failures } => {
            let lines: Vec<String> = failures
                .iter()
                .map(|(path, e)| format!("{}: {}", path, e))
                .collect();
            anyhow::anyhow!("Sync failed for {} path(s):\n  {}", lines.len(), lines.join("\n  "))
        }
        other => anyhow::Error::new(other).context("Sync failed"),
    }
}

/// List local files.
async fn cmd_ls(engine: &Engine) -> Result<()> {
    let files = engine.files().list().await.context("Failed to list files")?;

    if files.is_empty() {
        println!("No files.");
    } else {
        for file in files {
            println!(
                "  {} ({} bytes, {})",
                file.path,
                file.size,
                file.mtime.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

/// Store a file in the replica.
async fn cmd_put(engine: &Engine, source: &PathBuf, dest: Option<String>) -> Result<()> {
    let dest = match dest {
        Some(dest) => dest,
        None => source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .context("Source has no file name; pass --dest")?,
    };
    info!("Adding {} as {}", source.display(), dest);

    let content = tokio::fs::read(source)
        .await
        .context("Failed to read source file")?;
    let file = engine
        .files()
        .save(&dest, content)
        .await
        .context("Failed to store file")?;

    let digest = file.digest.map(|d| d.to_hex()).unwrap_or_default();
    println!("Stored {} ({} bytes, {})", dest, file.size, digest);
    Ok(())
}

/// Write a file from the replica to disk.
async fn cmd_get(engine: &Engine, path: &str, dest: &PathBuf) -> Result<()> {
    let content = engine
        .files()
        .load(path)
        .await
        .context("Failed to load file")?
        .with_context(|| format!("No such file: {}", path))?;

    tokio::fs::write(dest, &content.data)
        .await
        .context("Failed to write destination file")?;

    println!("Wrote {} ({} bytes)", dest.display(), content.data.len());
    Ok(())
}

/// Delete a file from the replica.
async fn cmd_rm(engine: &Engine, path: &str) -> Result<()> {
    engine
        .files()
        .delete(path)
        .await
        .context("Failed to delete file")?;
    println!("Deleted {} (pending sync)", path);
    Ok(())
}

async fn cmd_records(engine: &Engine, command: RecordsCommand) -> Result<()> {
    let records = engine.records();

    match command {
        RecordsCommand::List { table } => {
            let all = records.load_all(&table).await.context("Failed to load records")?;
            if all.is_empty() {
                println!("No records in {}.", table);
            }
            for record in all {
                print_record_line(&record);
            }
        }

        RecordsCommand::Show { table, id, version } => {
            let record = records
                .load(&table, &id, version)
                .await
                .context("Failed to load record")?
                .with_context(|| format!("No such record: {}:{}", table, id))?;
            print_record(&record)?;
        }

        RecordsCommand::Save {
            table,
            page,
            id,
            fields,
            complete,
        } => {
            let record = match id {
                Some(id) => records
                    .load(&table, &id, None)
                    .await
                    .context("Failed to load record")?
                    .with_context(|| format!("No such record: {}:{}", table, id))?,
                None => records.create(&table).context("Failed to create record")?,
            };

            let values = fields
                .iter()
                .map(|f| parse_assignment(f))
                .collect::<Result<BTreeMap<_, _>>>()?;

            let saved = records
                .save(&record, &page, values, complete)
                .await
                .context("Failed to save record")?;
            println!("Saved {}:{} version {}", saved.table, saved.id, saved.version);
        }

        RecordsCommand::Delete { table, id } => {
            records
                .delete(&table, &id)
                .await
                .context("Failed to delete record")?;
            println!("Deleted {}:{} (pending sync)", table, id);
        }
    }
    Ok(())
}

fn print_record_line(record: &Record) {
    let sequence = record
        .sequence
        .map(|s| format!("#{}", s))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {} {:>6} v{} ({} field(s))",
        record.id,
        sequence,
        record.version,
        record.values.len()
    );
}

fn print_record(record: &Record) -> Result<()> {
    println!("Record {}:{}", record.table, record.id);
    println!("  Version: {}", record.version);
    if let Some(zone) = &record.zone {
        println!("  Zone: {}", zone);
    }
    if let Some(sequence) = record.sequence {
        println!("  Sequence: {}", sequence);
    }
    if let Some(mtime) = record.mtime {
        println!("  Modified: {}", mtime);
    }
    for (page, complete) in &record.complete {
        println!("  Page {}: {}", page, if *complete { "complete" } else { "draft" });
    }
    println!("{}", serde_json::to_string_pretty(&record.values)?);
    Ok(())
}

/// Show the columns of a table.
async fn cmd_columns(engine: &Engine, table: &str, raw: bool) -> Result<()> {
    let columns = engine
        .records()
        .list_columns(table)
        .await
        .context("Failed to load columns")?;
    let columns = if raw { columns } else { chain_order(columns) };

    if columns.is_empty() {
        println!("No columns in {}.", table);
    }
    for column in columns {
        println!("  {}", column.key());
    }
    Ok(())
}

/// Parse `name=value`, reading the value as JSON when it parses.
fn parse_assignment(assignment: &str) -> Result<(String, Value)> {
    let (name, raw) = assignment
        .split_once('=')
        .with_context(|| format!("Expected name=value, got '{}'", assignment))?;
    if name.is_empty() {
        anyhow::bail!("Field name is empty in '{}'", assignment);
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(parse_assignment("age=42").unwrap(), ("age".to_string(), json!(42)));
        assert_eq!(
            parse_assignment("name=Rui").unwrap(),
            ("name".to_string(), json!("Rui"))
        );
        assert_eq!(
            parse_assignment("note=").unwrap(),
            ("note".to_string(), json!(""))
        );
        assert_eq!(
            parse_assignment("gone=null").unwrap(),
            ("gone".to_string(), Value::Null)
        );
        assert!(parse_assignment("missing").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn test_cli_parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "anchorsync",
            "--zone",
            "north",
            "records",
            "save",
            "visits",
            "intro",
            "--set",
            "age=3",
            "--complete",
        ])
        .unwrap();

        assert_eq!(cli.zone.as_deref(), Some("north"));
        match cli.command {
            Commands::Records {
                command: RecordsCommand::Save { fields, complete, .. },
            } => {
                assert_eq!(fields, vec!["age=3".to_string()]);
                assert!(complete);
            }
            _ => panic!("Expected records save"),
        }
    }

    #[test]
    fn test_explain_lists_conflicts() {
        let message = explain(Error::UnresolvedConflicts(vec!["a.txt".to_string()])).to_string();
        assert!(message.contains("a.txt"));
    }
}
