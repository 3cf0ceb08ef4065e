//! Applies or inspects the Postgres schema backing the `postgres` storage
//! backend (spec §6 CLI surface: `migrate`).
//!
//! Walks the embedded migration set one file at a time via the low-level
//! [`sqlx::migrate::Migrate`] connection trait rather than
//! `Migrator::run`/`undo`, so `-steps` can bound how many migrations a
//! single invocation applies or reverts.

use clap::{Parser, ValueEnum};
use sqlx::migrate::{Migrate, MigrateError, Migrator};
use sqlx::{Connection, PgConnection};
use std::collections::HashSet;
use std::process::ExitCode;

static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Action {
    Up,
    Down,
    Version,
}

/// Manages the Postgres schema used by `storage.backend = "postgres"`.
#[derive(Parser)]
#[command(name = "migrate", about = "Manage the codeassist-gateway Postgres schema")]
struct Cli {
    /// Postgres connection string.
    #[arg(long)]
    dsn: String,

    /// Action to perform.
    #[arg(long, value_enum)]
    action: Action,

    /// For `up`/`down`, the number of migrations to step through.
    /// Defaults to every pending (up) or applied (down) migration.
    #[arg(long)]
    steps: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut conn = match PgConnection::connect(&cli.dsn).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("migrate: failed to connect to postgres: {e}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.action {
        Action::Up => run_up(&mut conn, cli.steps).await,
        Action::Down => run_down(&mut conn, cli.steps).await,
        Action::Version => print_version(&mut conn).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("migrate: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run_up(conn: &mut PgConnection, steps: Option<usize>) -> Result<(), MigrateError> {
    conn.ensure_migrations_table().await?;
    let applied: HashSet<i64> = conn
        .list_applied_migrations()
        .await?
        .into_iter()
        .map(|m| m.version)
        .collect();

    let mut count = 0usize;
    for migration in MIGRATOR.migrations.iter() {
        if !migration.migration_type.is_up_migration() || applied.contains(&migration.version) {
            continue;
        }
        if steps.is_some_and(|limit| count >= limit) {
            break;
        }
        conn.apply(migration).await?;
        println!("migrate: applied {} {}", migration.version, migration.description);
        count += 1;
    }
    if count == 0 {
        println!("migrate: already up to date");
    }
    Ok(())
}

async fn run_down(conn: &mut PgConnection, steps: Option<usize>) -> Result<(), MigrateError> {
    conn.ensure_migrations_table().await?;
    let mut applied: Vec<i64> = conn
        .list_applied_migrations()
        .await?
        .into_iter()
        .map(|m| m.version)
        .collect();
    applied.sort_unstable_by(|a, b| b.cmp(a));

    let mut count = 0usize;
    for version in applied {
        if steps.is_some_and(|limit| count >= limit) {
            break;
        }
        let Some(migration) = MIGRATOR
            .migrations
            .iter()
            .find(|m| m.version == version && m.migration_type.is_down_migration())
        else {
            continue;
        };
        conn.revert(migration).await?;
        println!("migrate: reverted {} {}", migration.version, migration.description);
        count += 1;
    }
    if count == 0 {
        println!("migrate: nothing to revert");
    }
    Ok(())
}

async fn print_version(conn: &mut PgConnection) -> Result<(), MigrateError> {
    conn.ensure_migrations_table().await?;
    let applied = conn.list_applied_migrations().await?;
    match applied.iter().map(|m| m.version).max() {
        Some(v) => println!("{v}"),
        None => println!("0"),
    }
    Ok(())
}
