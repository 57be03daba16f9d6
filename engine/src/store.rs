//! Task and log persistence for the synchronization engine
//!
//! A single SQLite database holds the `tasks` and `logs` relations. The store
//! is the authority for task state: the run lock lives in the `is_running`
//! column and every transition happens inside a transaction here, so a crash
//! can never leave the lock in a state the staleness check cannot recover.
//
// The database lives in the per-user data directory. WAL mode keeps readers
// unblocked while a run commits its log row, and the busy timeout plus the
// lock retry loop absorb the rare writer collision between concurrent runs.

// Relation-specific modules
mod db_logs;
mod db_tasks;

use crate::secret::{looks_encrypted, SecretBox};
use anyhow::{Context, Result};
use rusqlite::{Connection, TransactionBehavior};
use shared::model::{LockAcquire, LogEntry, NewTask, SyncMode, SyncStatus, Task};
use shared::utils::current_timestamp;
use shared::WardenError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default database file name. Using a constant avoids magic strings.
const DATABASE_FILE: &str = "syncwarden.db";

/// Lock acquisition retries on transient contention.
const LOCK_RETRY_ATTEMPTS: u32 = 5;
const LOCK_RETRY_BACKOFF_MS: u64 = 50;

/// SQLite-backed store for sync tasks and their run logs.
pub struct TaskStore {
    /// Path to the database file.
    db_path: PathBuf,
    /// The active connection, opened lazily on first use.
    connection: Option<Connection>,
    /// Database busy timeout in seconds.
    busy_timeout_seconds: u64,
}

// SAFETY: `TaskStore` is always held behind `Arc<tokio::sync::RwLock<TaskStore>>`
// and every call site acquires `.write().await` — there is no `.read()` access
// path anywhere in this crate. Access is therefore always exclusive, so the
// non-`Sync` internals of `rusqlite::Connection` are never touched from two
// threads at once.
unsafe impl Sync for TaskStore {}

impl TaskStore {
    /// Create a store manager for a given data directory, creating the
    /// directory if necessary.
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory: {}", data_dir.display())
            })?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            connection: None,
            busy_timeout_seconds,
        })
    }

    /// Create tables and run the forward-only column migrations. Idempotent;
    /// safe to call on every startup.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing task store at {}", self.db_path.display());

        let conn = self.get_connection()?;
        db_tasks::create_tables(conn)?;
        db_logs::create_tables(conn)?;
        db_tasks::migrate_columns(conn)?;
        db_logs::migrate_columns(conn)?;

        info!("Task store initialization complete");
        Ok(())
    }

    /// Lazily open and configure the connection.
    fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("Failed to open database: {}", self.db_path.display()))?;

            // WAL lets observers read task state while a run commits.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("Failed to enable WAL mode")?;

            // Cascading log deletion depends on foreign key enforcement,
            // which SQLite leaves off per connection by default.
            conn.execute("PRAGMA foreign_keys=ON", [])
                .context("Failed to enable foreign key enforcement")?;

            conn.busy_timeout(Duration::from_secs(self.busy_timeout_seconds))
                .context("Failed to set busy timeout")?;

            self.connection = Some(conn);
        }

        // `unwrap` is safe here because we've just ensured `self.connection` is `Some`.
        Ok(self.connection.as_mut().unwrap())
    }

    pub async fn list_tasks(&mut self) -> Result<Vec<Task>> {
        db_tasks::list(self.get_connection()?)
    }

    pub async fn list_enabled_tasks(&mut self) -> Result<Vec<Task>> {
        db_tasks::list_enabled(self.get_connection()?)
    }

    pub async fn list_trash_enabled_tasks(&mut self) -> Result<Vec<Task>> {
        db_tasks::list_trash_enabled(self.get_connection()?)
    }

    pub async fn get_task(&mut self, id: i64) -> Result<Task> {
        db_tasks::get(self.get_connection()?, id)?.ok_or_else(|| WardenError::NotFound(id).into())
    }

    pub async fn create_task(&mut self, new: &NewTask) -> Result<i64> {
        let now = current_timestamp();
        let id = db_tasks::insert(self.get_connection()?, new, now)?;
        debug!("Created task {} ({})", id, new.name);
        Ok(id)
    }

    pub async fn update_task(&mut self, id: i64, new: &NewTask) -> Result<()> {
        let now = current_timestamp();
        let changed = db_tasks::update(self.get_connection()?, id, new, now)?;
        if changed == 0 {
            return Err(WardenError::NotFound(id).into());
        }
        Ok(())
    }

    /// Delete a task. Log rows go with it through the cascading foreign key.
    pub async fn delete_task(&mut self, id: i64) -> Result<()> {
        let deleted = db_tasks::delete(self.get_connection()?, id)?;
        if deleted == 0 {
            return Err(WardenError::NotFound(id).into());
        }
        debug!("Deleted task {} and its logs", id);
        Ok(())
    }

    /// Enable or disable a task, resetting its failure streak.
    pub async fn set_enabled(&mut self, id: i64, enabled: bool) -> Result<()> {
        let now = current_timestamp();
        let changed = db_tasks::set_enabled(self.get_connection()?, id, enabled, now)?;
        if changed == 0 {
            return Err(WardenError::NotFound(id).into());
        }
        Ok(())
    }

    /// Try to take the single-flight run lock for a task.
    ///
    /// A lock held longer than `stale_threshold_secs` is treated as left over
    /// from a crashed run and reclaimed. On transient contention the attempt
    /// is retried with linear backoff.
    pub async fn acquire_lock(
        &mut self,
        id: i64,
        stale_threshold_secs: u64,
    ) -> Result<LockAcquire> {
        let mut attempt = 1;
        loop {
            match self.try_acquire_lock(id, stale_threshold_secs) {
                Err(e) if is_busy_error(&e) && attempt < LOCK_RETRY_ATTEMPTS => {
                    debug!(
                        "Lock attempt {} for task {} hit contention, retrying",
                        attempt, id
                    );
                    tokio::time::sleep(Duration::from_millis(
                        LOCK_RETRY_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn try_acquire_lock(&mut self, id: i64, stale_threshold_secs: u64) -> Result<LockAcquire> {
        let conn = self.get_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin lock transaction")?;

        let task = db_tasks::get(&tx, id)?.ok_or(WardenError::NotFound(id))?;
        let now = current_timestamp();

        if task.is_running {
            let started = task.started_at.unwrap_or(0);
            if now.saturating_sub(started) > stale_threshold_secs as i64 {
                warn!(
                    "Task {} holds a stale run lock (started_at={}), reclaiming",
                    id, started
                );
                db_tasks::clear_lock(&tx, id)?;
            }
        }

        let changed = db_tasks::try_lock(&tx, id, now)?;
        let current = db_tasks::get(&tx, id)?.ok_or(WardenError::NotFound(id))?;
        tx.commit().context("Failed to commit lock transaction")?;

        Ok(LockAcquire {
            task: current,
            locked: changed > 0,
        })
    }

    /// Release the run lock without writing a log row. Used by the scheduler
    /// when it finds a stale lock, and by error paths that never started a
    /// run.
    pub async fn release_lock(&mut self, id: i64) -> Result<()> {
        db_tasks::clear_lock(self.get_connection()?, id)?;
        Ok(())
    }

    /// Record a completed run: insert the log row, trim the task's logs to
    /// `max_logs`, release the lock, and apply failure accounting, all in one
    /// transaction. Returns the task as of after the commit.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_run(
        &mut self,
        id: i64,
        status: SyncStatus,
        output: &str,
        duration_s: f64,
        mode: SyncMode,
        max_logs: usize,
        max_consecutive_failures: u32,
    ) -> Result<Task> {
        let conn = self.get_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin run-record transaction")?;

        let task = db_tasks::get(&tx, id)?.ok_or(WardenError::NotFound(id))?;
        let now = current_timestamp();

        db_logs::insert(&tx, id, now, status, output, duration_s, mode)?;
        db_logs::trim(&tx, id, max_logs)?;

        let failures = if status.is_success() {
            0
        } else {
            task.consecutive_failures + 1
        };
        let auto_disable =
            !status.is_success() && task.enabled && failures >= max_consecutive_failures;

        tx.execute(
            "UPDATE tasks SET is_running = 0, started_at = NULL, last_sync_time = ?2, \
             last_sync_status = ?3, consecutive_failures = ?4, \
             enabled = CASE WHEN ?5 THEN 0 ELSE enabled END, updated_at = ?2 \
             WHERE id = ?1",
            rusqlite::params![id, now, status.as_str(), failures, auto_disable],
        )
        .with_context(|| format!("Failed to finalize run for task {}", id))?;

        let updated = db_tasks::get(&tx, id)?.ok_or(WardenError::NotFound(id))?;
        tx.commit().context("Failed to commit run record")?;

        if auto_disable {
            warn!(
                "Task {} disabled after {} consecutive failed runs",
                id, failures
            );
        }

        Ok(updated)
    }

    /// Append a log row outside the run protocol. `record_run` is the normal
    /// path; this exists for callers that need a row without touching the
    /// lock or the failure accounting.
    pub async fn append_log(
        &mut self,
        task_id: i64,
        status: SyncStatus,
        output: &str,
        duration_s: f64,
        mode: SyncMode,
    ) -> Result<i64> {
        let now = current_timestamp();
        db_logs::insert(
            self.get_connection()?,
            task_id,
            now,
            status,
            output,
            duration_s,
            mode,
        )
    }

    /// Trim a task's logs down to the newest `keep` rows.
    pub async fn trim_logs(&mut self, task_id: i64, keep: usize) -> Result<usize> {
        db_logs::trim(self.get_connection()?, task_id, keep)
    }

    /// The newest log rows for a task, capped at `limit`.
    pub async fn get_logs(&mut self, task_id: i64, limit: usize) -> Result<Vec<LogEntry>> {
        db_logs::list(self.get_connection()?, task_id, limit)
    }

    pub async fn count_logs(&mut self, task_id: i64) -> Result<i64> {
        db_logs::count(self.get_connection()?, task_id)
    }

    /// Rewrite any plaintext passwords left by earlier releases as
    /// ciphertext. Runs once at startup; rows already carrying the
    /// ciphertext tag are left alone.
    pub async fn migrate_plaintext_passwords(&mut self, secrets: &SecretBox) -> Result<usize> {
        let conn = self.get_connection()?;
        let rows = db_tasks::passwords(conn)?;

        let mut rewritten = 0;
        for (id, password) in rows {
            if looks_encrypted(&password) {
                continue;
            }
            let ciphertext = secrets.encrypt(&password)?;
            db_tasks::set_password(self.get_connection()?, id, &ciphertext)?;
            rewritten += 1;
        }

        if rewritten > 0 {
            info!("Re-encrypted {} stored task passwords", rewritten);
        }
        Ok(rewritten)
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err(e) = conn.close() {
                warn!("Error closing database connection: {:?}", e);
            } else {
                debug!("Database connection closed");
            }
        }
    }
}

/// True when the error chain bottoms out in SQLite reporting contention.
fn is_busy_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}
