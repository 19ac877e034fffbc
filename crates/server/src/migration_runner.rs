//! Lightweight migration runner for rusqlite.
//!
//! Migrations are numbered SQL files under the workspace `migrations/`
//! directory, embedded at compile time so the binary carries its own schema.
//! Applied versions are tracked in `schema_versions`.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::info;

/// (version, name, sql) in application order
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "001_initial",
    include_str!("../../../migrations/001_initial.sql"),
)];

/// Run all pending migrations against the given connection.
///
/// Each migration runs in its own transaction together with its
/// `schema_versions` row, so a failed migration leaves no trace.
pub fn run_migrations(conn: &mut Connection) -> rusqlite::Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    info!(
        component = "migrations",
        event = "migrations.complete",
        total = MIGRATIONS.len(),
        applied = pending,
        "Migration check complete"
    );

    Ok(pending)
}
