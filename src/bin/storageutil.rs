//! Inspects and round-trips a configured storage backend from the command
//! line (spec §6 CLI surface: `storageutil`).
//!
//! Shares the library's `Config`/`storage::auto` wiring rather than opening
//! its own connections, so the tool always talks to the same backend the
//! server would pick for the same config file.

use clap::{Parser, ValueEnum};
use codeassist_gateway::storage::{self, ExportedData};
use codeassist_gateway::{Config, error::StorageError};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Mode {
    Export,
    Import,
    Verify,
    #[value(name = "plan-audit")]
    PlanAudit,
}

/// Exports, imports, verifies, or audits the configured storage backend.
#[derive(Parser)]
#[command(name = "storageutil", about = "Inspect and round-trip the codeassist-gateway storage backend")]
struct Cli {
    /// Operation to perform.
    #[arg(long, value_enum)]
    mode: Mode,

    /// JSON file used by `export` (write target), `import`/`verify` (read source).
    #[arg(long)]
    file: Option<PathBuf>,

    /// Config file to load instead of `./config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overall operation timeout, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let timeout = std::time::Duration::from_secs(cli.timeout);

    match tokio::time::timeout(timeout, run(cli)).await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("storageutil: {e}");
            ExitCode::FAILURE
        }
        Err(_) => {
            eprintln!("storageutil: operation timed out");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path),
        None => Config::from_optional_toml(),
    };
    let backend = storage::auto::build(&cfg.storage).await;

    match cli.mode {
        Mode::Export => export(backend.as_ref(), require_file(&cli.file)?).await,
        Mode::Import => import(backend.as_ref(), require_file(&cli.file)?).await,
        Mode::Verify => verify(backend.as_ref(), require_file(&cli.file)?).await,
        Mode::PlanAudit => plan_audit(backend.as_ref()).await,
    }
}

fn require_file(file: &Option<PathBuf>) -> Result<&PathBuf, String> {
    file.as_ref().ok_or_else(|| "-file is required for this mode".to_string())
}

async fn export(storage: &dyn storage::Storage, file: &PathBuf) -> Result<(), String> {
    let data = storage.export_data().await.map_err(fmt_storage_err)?;
    let json = serde_json::to_string_pretty(&data).map_err(|e| e.to_string())?;
    std::fs::write(file, json).map_err(|e| format!("failed to write {}: {e}", file.display()))?;
    println!(
        "storageutil: exported {} credential(s), {} config(s) to {}",
        data.credentials.len(),
        data.configs.len(),
        file.display()
    );
    Ok(())
}

async fn import(storage: &dyn storage::Storage, file: &PathBuf) -> Result<(), String> {
    let data = read_export(file)?;
    let credential_count = data.credentials.len();
    let config_count = data.configs.len();
    storage.import_data(data).await.map_err(fmt_storage_err)?;
    println!("storageutil: imported {credential_count} credential(s), {config_count} config(s) from {}", file.display());
    Ok(())
}

/// Compares `file`'s recorded export against the backend's current state.
/// Order-independent: both sides are sorted by key before comparing, since
/// storage listings make no ordering guarantee across backends.
async fn verify(storage: &dyn storage::Storage, file: &PathBuf) -> Result<(), String> {
    let expected = read_export(file)?;
    let actual = storage.export_data().await.map_err(fmt_storage_err)?;

    let mut expected_creds = expected.credentials;
    let mut actual_creds = actual.credentials;
    expected_creds.sort_by(|a, b| a.0.cmp(&b.0));
    actual_creds.sort_by(|a, b| a.0.cmp(&b.0));

    let mut expected_configs = expected.configs;
    let mut actual_configs = actual.configs;
    expected_configs.sort_by(|a, b| a.0.cmp(&b.0));
    actual_configs.sort_by(|a, b| a.0.cmp(&b.0));

    if expected_creds == actual_creds && expected_configs == actual_configs {
        println!("storageutil: verify OK ({} credential(s), {} config(s) match)", actual_creds.len(), actual_configs.len());
        Ok(())
    } else {
        Err(format!(
            "verify mismatch: file has {} credential(s)/{} config(s), backend has {}/{}",
            expected_creds.len(),
            expected_configs.len(),
            actual_creds.len(),
            actual_configs.len()
        ))
    }
}

async fn plan_audit(storage: &dyn storage::Storage) -> Result<(), String> {
    let records = storage.list_plan_meta().await.map_err(fmt_storage_err)?;
    if records.is_empty() {
        println!("storageutil: no plan-meta records");
        return Ok(());
    }
    for record in &records {
        println!(
            "{} [{:?}] stage={} started={} finished={:?} mutations={:?} error={:?}",
            record.idempotency_key,
            record.status,
            record.stage,
            record.started_at,
            record.finished_at,
            record.mutation_count,
            record.error,
        );
    }
    Ok(())
}

fn read_export(file: &PathBuf) -> Result<ExportedData, String> {
    let raw = std::fs::read_to_string(file).map_err(|e| format!("failed to read {}: {e}", file.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("failed to parse {}: {e}", file.display()))
}

fn fmt_storage_err(e: StorageError) -> String {
    e.to_string()
}
