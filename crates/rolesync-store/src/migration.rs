//! Database schema migrations for SQLite.
//!
//! Migrations are applied in order inside one transaction, and each applied
//! version is recorded in `schema_migrations`.

use rusqlite::{params, Connection, Transaction};

use crate::error::{Result, StoreError};

type Migration = fn(&Transaction<'_>) -> Result<()>;

/// Every migration, indexed by `version - 1`.
const MIGRATIONS: &[Migration] = &[apply_v1];

/// Current schema version.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let applied: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{applied} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    let tx = conn.transaction()?;
    for (version, migration) in (1..).zip(MIGRATIONS).skip(applied as usize) {
        migration(&tx)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, rolesync_core::Time::now().millis()],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Migration v1: Initial schema.
fn apply_v1(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        r#"
        -- Action queue: one row per internal action not yet acknowledged
        CREATE TABLE pending_actions (
            action_id INTEGER PRIMARY KEY,    -- local, monotonically increasing
            role_id INTEGER NOT NULL,
            service TEXT NOT NULL,            -- service type identifier
            state TEXT NOT NULL,              -- queued | in-flight | acknowledged
            attempts INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,     -- Unix ms
            action BLOB NOT NULL              -- wire-encoded InternalAction
        );

        -- Audit cursor per (role, service)
        CREATE TABLE audit_cursors (
            role_id INTEGER NOT NULL,
            service TEXT NOT NULL,
            last_time INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (role_id, service)
        );

        -- Actions the host rejected or that exhausted delivery attempts
        CREATE TABLE failed_actions (
            action_id INTEGER PRIMARY KEY,
            role_id INTEGER NOT NULL,
            service TEXT NOT NULL,
            action BLOB NOT NULL,
            reason TEXT NOT NULL,
            failed_at INTEGER NOT NULL
        );

        CREATE INDEX idx_pending_service ON pending_actions(role_id, service, action_id);
        "#,
    )?;

    Ok(())
}
