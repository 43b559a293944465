//! Schema migration runner for the memory database.
//!
//! Migrations run in version order, each inside its own transaction, so a
//! failure rolls back with no partial schema state. The `schema_version`
//! table records what has been applied; running the migrator again skips
//! applied versions.
//!
//! A file written before versioning existed has no `schema_version` rows and
//! starts at version 0. Version 1 is that pre-versioning layout declared with
//! `IF NOT EXISTS`, so such a file is adopted and then upgraded in place.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::timestamp::now_timestamp;

/// How a migration changes the schema.
enum Step {
    Sql(&'static str),
    /// Data-carrying conversions that plain SQL cannot express.
    Code(fn(&Connection) -> Result<()>),
}

struct Migration {
    version: u32,
    description: &'static str,
    step: Step,
}

/// All migrations in version order.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Pre-versioning layout: messages, semantic_memory, single-row summaries",
        step: Step::Sql(include_str!("v001_legacy.sql")),
    },
    Migration {
        version: 2,
        description: "Retained multi-row summaries with (user_id, created_at) index",
        step: Step::Code(convert_summaries),
    },
    Migration {
        version: 3,
        description: "Lookup indexes on messages and semantic_memory",
        step: Step::Sql(include_str!("v003_indexes.sql")),
    },
];

/// Legacy rows accumulated several summaries in one text field; this many
/// of the most recent survive the conversion.
const LEGACY_KEEP: usize = 2;

/// Run all pending migrations. Returns how many were applied.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    ensure_version_table(conn)?;
    let current = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version <= current {
            debug!(
                version = migration.version,
                description = migration.description,
                "migration already applied, skipping"
            );
            continue;
        }

        info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        apply_migration(conn, migration)?;
        applied += 1;
    }

    if applied > 0 {
        info!(applied, "migrations complete");
    }
    Ok(applied)
}

/// Highest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration(format!("failed to read schema_version: {e}")))
}

/// Latest migration version defined in code.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version     INTEGER PRIMARY KEY,
           applied_at  TEXT    NOT NULL,
           description TEXT
         );",
    )
    .map_err(|e| StoreError::Migration(format!("failed to create schema_version table: {e}")))
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    let tx = conn.unchecked_transaction().map_err(|e| {
        StoreError::Migration(format!(
            "failed to begin transaction for v{}: {e}",
            migration.version
        ))
    })?;

    let outcome = match migration.step {
        Step::Sql(sql) => tx.execute_batch(sql).map_err(StoreError::from),
        Step::Code(convert) => convert(&tx),
    };
    outcome.map_err(|e| {
        StoreError::Migration(format!(
            "migration v{} ({}) failed: {e}",
            migration.version, migration.description
        ))
    })?;

    let _ = tx
        .execute(
            "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, now_timestamp(), migration.description],
        )
        .map_err(|e| {
            StoreError::Migration(format!(
                "failed to record v{} in schema_version: {e}",
                migration.version
            ))
        })?;

    tx.commit().map_err(|e| {
        StoreError::Migration(format!("failed to commit v{}: {e}", migration.version))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// v2: summaries conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Rebuild `summaries` as one row per retained summary.
///
/// Accepts the single-row-per-user layout (`summary`, `updated_at`) and the
/// earlier multi-row layout that named its text column `summary`.
fn convert_summaries(conn: &Connection) -> Result<()> {
    let columns = table_columns(conn, "summaries")?;
    let has = |name: &str| columns.iter().any(|c| c == name);

    conn.execute_batch(
        "CREATE TABLE summaries_v2 (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    TEXT    NOT NULL,
            text       TEXT    NOT NULL,
            created_at TEXT    NOT NULL
        );",
    )?;

    if has("updated_at") {
        let mut stmt = conn.prepare("SELECT user_id, summary, updated_at FROM summaries")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut converted = 0usize;
        for (user_id, text, updated_at) in rows {
            let stamp = updated_at.unwrap_or_else(now_timestamp);
            for part in split_legacy_summary(text.as_deref().unwrap_or_default(), LEGACY_KEEP) {
                let _ = conn.execute(
                    "INSERT INTO summaries_v2 (user_id, text, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![user_id, part, stamp],
                )?;
                converted += 1;
            }
        }
        info!(converted, "converted single-row summaries");
    } else if has("summary") {
        let copied = conn.execute(
            "INSERT INTO summaries_v2 (user_id, text, created_at)
             SELECT user_id, summary, created_at FROM summaries
             WHERE summary IS NOT NULL ORDER BY id",
            [],
        )?;
        info!(copied, "copied multi-row summaries");
    } else if has("text") {
        let _ = conn.execute(
            "INSERT INTO summaries_v2 (user_id, text, created_at)
             SELECT user_id, text, created_at FROM summaries ORDER BY id",
            [],
        )?;
    }

    conn.execute_batch(
        "DROP TABLE IF EXISTS summaries;
         ALTER TABLE summaries_v2 RENAME TO summaries;
         CREATE INDEX IF NOT EXISTS idx_summaries_user_created
             ON summaries(user_id, created_at DESC);",
    )?;
    Ok(())
}

/// Split accumulated summary text on newlines, dropping blanks and keeping
/// the last `keep` parts in order.
fn split_legacy_summary(text: &str, keep: usize) -> Vec<String> {
    let parts: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let skip = parts.len().saturating_sub(keep);
    parts.into_iter().skip(skip).collect()
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}
