//! Task relation operations
//!
//! Schema, forward-only column migration, row projection, and the SQL behind
//! task CRUD and the run-lock transitions. All functions here take a plain
//! connection (or a transaction derefing to one) and leave transaction
//! boundaries to the store.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::model::{NewTask, SyncStatus, Task};

/// Column list shared by every task projection. Order matters; it matches
/// `task_from_row`.
const TASK_COLUMNS: &str = "id, name, remote_host, remote_port, username, password, \
     local_dir, remote_dir, interval_minutes, version_enabled, trash_enabled, \
     enabled, is_running, started_at, consecutive_failures, last_sync_time, \
     last_sync_status, created_at, updated_at";

/// Create the tasks table and its indexes.
pub(super) fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            remote_host TEXT NOT NULL,
            remote_port INTEGER NOT NULL DEFAULT 22,
            username TEXT NOT NULL,
            password TEXT NOT NULL DEFAULT '',
            local_dir TEXT NOT NULL,
            remote_dir TEXT NOT NULL,
            interval_minutes INTEGER NOT NULL,
            version_enabled BOOLEAN NOT NULL DEFAULT 0,
            trash_enabled BOOLEAN NOT NULL DEFAULT 0,
            enabled BOOLEAN NOT NULL DEFAULT 1,
            is_running BOOLEAN NOT NULL DEFAULT 0,
            started_at INTEGER,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_sync_time INTEGER,
            last_sync_status TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        [],
    )
    .context("Failed to create tasks table")?;

    Ok(())
}

/// Add columns introduced after the first shipped schema to databases that
/// predate them. Forward-only; nothing is ever dropped or rewritten.
pub(super) fn migrate_columns(conn: &Connection) -> Result<()> {
    let added_columns = [
        ("is_running", "BOOLEAN NOT NULL DEFAULT 0"),
        ("started_at", "INTEGER"),
        ("consecutive_failures", "INTEGER NOT NULL DEFAULT 0"),
        ("last_sync_status", "TEXT"),
    ];
    for (column, definition) in added_columns {
        if !column_exists(conn, "tasks", column)? {
            conn.execute(
                &format!("ALTER TABLE tasks ADD COLUMN {} {}", column, definition),
                [],
            )
            .with_context(|| format!("Failed to add tasks.{} column", column))?;
        }
    }
    Ok(())
}

/// Check for a column via the table metadata pragma.
pub(super) fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .context("Failed to query table metadata")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

/// Project one row into a `Task`. Column order follows `TASK_COLUMNS`.
fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        remote_host: row.get(2)?,
        remote_port: row.get::<_, i64>(3)? as u16,
        username: row.get(4)?,
        password_ct: row.get(5)?,
        local_dir: row.get(6)?,
        remote_dir: row.get(7)?,
        interval_minutes: row.get::<_, i64>(8)? as u32,
        version_enabled: row.get(9)?,
        trash_enabled: row.get(10)?,
        enabled: row.get(11)?,
        is_running: row.get(12)?,
        started_at: row.get(13)?,
        consecutive_failures: row.get::<_, i64>(14)? as u32,
        last_sync_time: row.get(15)?,
        last_sync_status: row
            .get::<_, Option<String>>(16)?
            .and_then(|s| SyncStatus::parse(&s)),
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

pub(super) fn get(conn: &Connection, id: i64) -> Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
        params![id],
        task_from_row,
    )
    .optional()
    .with_context(|| format!("Failed to load task {}", id))
}

pub(super) fn list(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks ORDER BY id", TASK_COLUMNS))?;
    let tasks = stmt
        .query_map([], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list tasks")?;
    Ok(tasks)
}

pub(super) fn list_enabled(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tasks WHERE enabled = 1 ORDER BY id",
        TASK_COLUMNS
    ))?;
    let tasks = stmt
        .query_map([], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list enabled tasks")?;
    Ok(tasks)
}

pub(super) fn list_trash_enabled(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tasks WHERE trash_enabled = 1 ORDER BY id",
        TASK_COLUMNS
    ))?;
    let tasks = stmt
        .query_map([], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to list trash-enabled tasks")?;
    Ok(tasks)
}

pub(super) fn insert(conn: &Connection, new: &NewTask, now: i64) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO tasks (name, remote_host, remote_port, username, password,
                           local_dir, remote_dir, interval_minutes, version_enabled,
                           trash_enabled, enabled, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
        "#,
        params![
            new.name,
            new.remote_host,
            new.remote_port,
            new.username,
            new.password_ct,
            new.local_dir,
            new.remote_dir,
            new.interval_minutes,
            new.version_enabled,
            new.trash_enabled,
            new.enabled,
            now
        ],
    )
    .context("Failed to insert task")?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn update(conn: &Connection, id: i64, new: &NewTask, now: i64) -> Result<usize> {
    let changed = conn
        .execute(
            r#"
            UPDATE tasks
            SET name = ?2, remote_host = ?3, remote_port = ?4, username = ?5,
                password = ?6, local_dir = ?7, remote_dir = ?8,
                interval_minutes = ?9, version_enabled = ?10, trash_enabled = ?11,
                enabled = ?12, updated_at = ?13
            WHERE id = ?1
            "#,
            params![
                id,
                new.name,
                new.remote_host,
                new.remote_port,
                new.username,
                new.password_ct,
                new.local_dir,
                new.remote_dir,
                new.interval_minutes,
                new.version_enabled,
                new.trash_enabled,
                new.enabled,
                now
            ],
        )
        .with_context(|| format!("Failed to update task {}", id))?;
    Ok(changed)
}

pub(super) fn delete(conn: &Connection, id: i64) -> Result<usize> {
    conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])
        .with_context(|| format!("Failed to delete task {}", id))
}

/// Flip the enabled flag. Re-enabling (and disabling) resets the failure
/// streak so a repaired task starts from a clean slate.
pub(super) fn set_enabled(conn: &Connection, id: i64, enabled: bool, now: i64) -> Result<usize> {
    conn.execute(
        "UPDATE tasks SET enabled = ?2, consecutive_failures = 0, updated_at = ?3 WHERE id = ?1",
        params![id, enabled, now],
    )
    .with_context(|| format!("Failed to set enabled for task {}", id))
}

/// Conditional lock acquisition. Affects one row only when the lock is free.
pub(super) fn try_lock(conn: &Connection, id: i64, now: i64) -> Result<usize> {
    conn.execute(
        "UPDATE tasks SET is_running = 1, started_at = ?2, updated_at = ?2 \
         WHERE id = ?1 AND is_running = 0",
        params![id, now],
    )
    .with_context(|| format!("Failed to acquire lock for task {}", id))
}

pub(super) fn clear_lock(conn: &Connection, id: i64) -> Result<usize> {
    conn.execute(
        "UPDATE tasks SET is_running = 0, started_at = NULL WHERE id = ?1",
        params![id],
    )
    .with_context(|| format!("Failed to clear lock for task {}", id))
}

/// All stored passwords, for the startup re-encryption pass.
pub(super) fn passwords(conn: &Connection) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare("SELECT id, password FROM tasks WHERE password != ''")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read stored passwords")?;
    Ok(rows)
}

pub(super) fn set_password(conn: &Connection, id: i64, ciphertext: &str) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET password = ?2 WHERE id = ?1",
        params![id, ciphertext],
    )
    .with_context(|| format!("Failed to rewrite password for task {}", id))?;
    Ok(())
}
