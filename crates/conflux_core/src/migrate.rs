use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/v001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
];

/// Schema versions applied by one `open_migrated` call and the version the
/// database ends up at.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<u32>,
    pub current_version: u32,
}

/// Open the cache database, creating parent directories, and bring its schema up to date.
pub fn open_migrated(db_path: &Path) -> Result<(Connection, MigrateReport)> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let report = run_migrations(&connection)?;
    Ok((connection, report))
}

/// Apply every pending migration on an open connection, each in its own transaction.
pub fn run_migrations(connection: &Connection) -> Result<MigrateReport> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")?;

    let mut current: u32 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read schema version")?;
    let mut applied = Vec::new();

    let starting_version = current;
    for migration in MIGRATIONS.iter().filter(|migration| migration.version > starting_version) {
        let label = format!("v{:03}_{}", migration.version, migration.name);
        let transaction = connection
            .unchecked_transaction()
            .with_context(|| format!("failed to begin migration {label}"))?;
        transaction
            .execute_batch(migration.sql)
            .with_context(|| format!("migration {label} failed"))?;
        transaction
            .execute(
                "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
                params![migration.version, migration.name],
            )
            .with_context(|| format!("failed to record migration {label}"))?;
        transaction
            .commit()
            .with_context(|| format!("failed to commit migration {label}"))?;

        tracing::debug!(version = migration.version, name = migration.name, "applied migration");
        applied.push(migration.version);
        current = migration.version;
    }

    Ok(MigrateReport {
        applied,
        current_version: current,
    })
}
