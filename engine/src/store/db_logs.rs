//! Log relation operations
//!
//! One row per completed run. Rows are trimmed oldest-first in the same
//! transaction that inserts, so the per-task cap holds at every commit
//! boundary.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use shared::model::{LogEntry, SyncMode, SyncStatus};

pub(super) fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            timestamp INTEGER NOT NULL,
            status TEXT NOT NULL,
            output TEXT NOT NULL DEFAULT '',
            duration_s REAL NOT NULL DEFAULT 0,
            sync_mode TEXT NOT NULL DEFAULT 'rsync'
        )
        "#,
        [],
    )
    .context("Failed to create logs table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_logs_task ON logs(task_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp DESC)",
        [],
    )?;

    Ok(())
}

/// Add columns introduced after the first shipped schema.
pub(super) fn migrate_columns(conn: &Connection) -> Result<()> {
    let added_columns = [
        ("duration_s", "REAL NOT NULL DEFAULT 0"),
        ("sync_mode", "TEXT NOT NULL DEFAULT 'rsync'"),
    ];
    for (column, definition) in added_columns {
        if !super::db_tasks::column_exists(conn, "logs", column)? {
            conn.execute(
                &format!("ALTER TABLE logs ADD COLUMN {} {}", column, definition),
                [],
            )
            .with_context(|| format!("Failed to add logs.{} column", column))?;
        }
    }
    Ok(())
}

fn log_from_row(row: &Row) -> rusqlite::Result<LogEntry> {
    let status: String = row.get(3)?;
    let mode: String = row.get(6)?;
    Ok(LogEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        timestamp: row.get(2)?,
        status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Fail),
        output: row.get(4)?,
        duration_s: row.get(5)?,
        sync_mode: SyncMode::parse(&mode).unwrap_or(SyncMode::Rsync),
    })
}

pub(super) fn insert(
    conn: &Connection,
    task_id: i64,
    timestamp: i64,
    status: SyncStatus,
    output: &str,
    duration_s: f64,
    mode: SyncMode,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO logs (task_id, timestamp, status, output, duration_s, sync_mode)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            task_id,
            timestamp,
            status.as_str(),
            output,
            duration_s,
            mode.as_str()
        ],
    )
    .context("Failed to insert log row")?;
    Ok(conn.last_insert_rowid())
}

/// Delete rows beyond the newest `keep`, oldest first.
pub(super) fn trim(conn: &Connection, task_id: i64, keep: usize) -> Result<usize> {
    conn.execute(
        r#"
        DELETE FROM logs
        WHERE task_id = ?1
          AND id NOT IN (
              SELECT id FROM logs
              WHERE task_id = ?1
              ORDER BY timestamp DESC, id DESC
              LIMIT ?2
          )
        "#,
        params![task_id, keep as i64],
    )
    .with_context(|| format!("Failed to trim logs for task {}", task_id))
}

pub(super) fn list(conn: &Connection, task_id: i64, limit: usize) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, timestamp, status, output, duration_s, sync_mode \
         FROM logs WHERE task_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
    )?;
    let entries = stmt
        .query_map(params![task_id, limit as i64], log_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list logs for task {}", task_id))?;
    Ok(entries)
}

pub(super) fn count(conn: &Connection, task_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM logs WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )
    .with_context(|| format!("Failed to count logs for task {}", task_id))
}
