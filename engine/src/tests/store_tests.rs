//! Tests for the task store: CRUD, the lock protocol, run recording, log
//! trimming, and the startup migrations.

use crate::secret::{looks_encrypted, SecretBox};
use crate::store::TaskStore;
use shared::model::{NewTask, SyncMode, SyncStatus};
use shared::utils::current_timestamp;
use shared::WardenError;
use tempfile::TempDir;

fn test_task(name: &str) -> NewTask {
    NewTask {
        name: name.to_string(),
        remote_host: "backup.example.com".to_string(),
        remote_port: 22,
        username: "backup".to_string(),
        password_ct: String::new(),
        local_dir: "/tmp".to_string(),
        remote_dir: "/srv/backup".to_string(),
        interval_minutes: 30,
        version_enabled: true,
        trash_enabled: true,
        enabled: true,
    }
}

async fn new_store(dir: &TempDir) -> TaskStore {
    let mut store = TaskStore::new(dir.path(), 5).unwrap();
    store.initialize().await.unwrap();
    store
}

/// Open a second raw connection to the same database, for fixtures the
/// public API deliberately does not offer (backdating locks, old schemas).
fn raw_connection(dir: &TempDir) -> rusqlite::Connection {
    rusqlite::Connection::open(dir.path().join("syncwarden.db")).unwrap()
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;

    let id = store.create_task(&test_task("docs")).await.unwrap();
    let task = store.get_task(id).await.unwrap();

    assert_eq!(task.name, "docs");
    assert_eq!(task.remote_port, 22);
    assert_eq!(task.interval_minutes, 30);
    assert!(task.version_enabled);
    assert!(task.trash_enabled);
    assert!(task.enabled);
    assert!(!task.is_running);
    assert_eq!(task.consecutive_failures, 0);
    assert!(task.created_at > 0);
    assert_eq!(task.created_at, task.updated_at);
}

#[tokio::test]
async fn get_missing_task_is_not_found() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;

    let err = store.get_task(999).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WardenError>(),
        Some(WardenError::NotFound(999))
    ));
}

#[tokio::test]
async fn update_changes_fields() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;

    let id = store.create_task(&test_task("docs")).await.unwrap();
    let mut changed = test_task("docs-renamed");
    changed.interval_minutes = 5;
    changed.trash_enabled = false;
    store.update_task(id, &changed).await.unwrap();

    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.name, "docs-renamed");
    assert_eq!(task.interval_minutes, 5);
    assert!(!task.trash_enabled);

    let err = store.update_task(12345, &changed).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WardenError>(),
        Some(WardenError::NotFound(12345))
    ));
}

#[tokio::test]
async fn delete_cascades_logs() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;

    let id = store.create_task(&test_task("docs")).await.unwrap();
    store
        .record_run(id, SyncStatus::Success, "ok", 1.0, SyncMode::Rsync, 100, 3)
        .await
        .unwrap();
    assert_eq!(store.count_logs(id).await.unwrap(), 1);

    store.delete_task(id).await.unwrap();

    // The cascade removes the log rows with the task.
    let conn = raw_connection(&dir);
    let remaining: i64 = conn
        .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn lock_is_single_flight() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    let first = store.acquire_lock(id, 86_400).await.unwrap();
    assert!(first.locked);
    assert!(first.task.is_running);
    let started = first.task.started_at.unwrap();
    assert!(started <= current_timestamp());

    // A second acquisition must lose without disturbing the lock.
    let second = store.acquire_lock(id, 86_400).await.unwrap();
    assert!(!second.locked);
    assert!(second.task.is_running);

    store.release_lock(id).await.unwrap();
    let task = store.get_task(id).await.unwrap();
    assert!(!task.is_running);
    assert!(task.started_at.is_none());
}

#[tokio::test]
async fn stale_lock_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    let first = store.acquire_lock(id, 86_400).await.unwrap();
    assert!(first.locked);

    // Backdate the lock past the staleness threshold, as if the process
    // holding it had crashed a day ago.
    let conn = raw_connection(&dir);
    conn.execute(
        "UPDATE tasks SET started_at = ?2 WHERE id = ?1",
        rusqlite::params![id, current_timestamp() - 90_000],
    )
    .unwrap();

    let retry = store.acquire_lock(id, 86_400).await.unwrap();
    assert!(retry.locked);
    assert!(retry.task.is_running);
}

#[tokio::test]
async fn record_run_success_resets_failures() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    store
        .record_run(id, SyncStatus::Fail, "boom", 1.0, SyncMode::Rsync, 100, 3)
        .await
        .unwrap();
    store
        .record_run(id, SyncStatus::Fail, "boom", 1.0, SyncMode::Rsync, 100, 3)
        .await
        .unwrap();
    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.consecutive_failures, 2);
    assert!(task.enabled);

    let task = store
        .record_run(id, SyncStatus::Success, "ok", 1.0, SyncMode::Rsync, 100, 3)
        .await
        .unwrap();
    assert_eq!(task.consecutive_failures, 0);
    assert_eq!(task.last_sync_status, Some(SyncStatus::Success));
    assert!(!task.is_running);
    assert!(task.last_sync_time.is_some());
}

#[tokio::test]
async fn third_consecutive_failure_disables_the_task() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    for expected in 1..=3u32 {
        let task = store
            .record_run(id, SyncStatus::Fail, "boom", 1.0, SyncMode::Sftp, 100, 3)
            .await
            .unwrap();
        assert_eq!(task.consecutive_failures, expected);
        if expected < 3 {
            assert!(task.enabled);
        } else {
            assert!(!task.enabled);
        }
    }
}

#[tokio::test]
async fn record_run_releases_the_lock() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    assert!(store.acquire_lock(id, 86_400).await.unwrap().locked);
    let task = store
        .record_run(id, SyncStatus::Success, "ok", 2.5, SyncMode::Rsync, 100, 3)
        .await
        .unwrap();
    assert!(!task.is_running);
    assert!(task.started_at.is_none());
}

#[tokio::test]
async fn logs_are_trimmed_to_the_cap() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    for i in 0..8 {
        store
            .record_run(
                id,
                SyncStatus::Success,
                &format!("run {}", i),
                1.0,
                SyncMode::Rsync,
                5,
                3,
            )
            .await
            .unwrap();
    }

    assert_eq!(store.count_logs(id).await.unwrap(), 5);
    let logs = store.get_logs(id, 100).await.unwrap();
    assert_eq!(logs.len(), 5);
    // Newest first; the oldest three runs were trimmed away.
    assert_eq!(logs[0].output, "run 7");
    assert_eq!(logs[4].output, "run 3");
}

#[tokio::test]
async fn append_and_trim_outside_the_run_protocol() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    for i in 0..4 {
        store
            .append_log(
                id,
                SyncStatus::Success,
                &format!("manual {}", i),
                0.1,
                SyncMode::Rsync,
            )
            .await
            .unwrap();
    }
    // Appending alone neither trims nor touches the task row.
    assert_eq!(store.count_logs(id).await.unwrap(), 4);
    let task = store.get_task(id).await.unwrap();
    assert_eq!(task.consecutive_failures, 0);
    assert!(task.last_sync_time.is_none());

    let removed = store.trim_logs(id, 2).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(store.count_logs(id).await.unwrap(), 2);
    let logs = store.get_logs(id, 10).await.unwrap();
    assert_eq!(logs[0].output, "manual 3");
}

#[tokio::test]
async fn logs_carry_duration_and_mode() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    store
        .record_run(id, SyncStatus::Fail, "fell back", 12.5, SyncMode::Sftp, 100, 3)
        .await
        .unwrap();
    let logs = store.get_logs(id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, SyncStatus::Fail);
    assert_eq!(logs[0].sync_mode, SyncMode::Sftp);
    assert!((logs[0].duration_s - 12.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn set_enabled_resets_failure_streak() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;
    let id = store.create_task(&test_task("docs")).await.unwrap();

    for _ in 0..3 {
        store
            .record_run(id, SyncStatus::Fail, "boom", 1.0, SyncMode::Rsync, 100, 3)
            .await
            .unwrap();
    }
    let task = store.get_task(id).await.unwrap();
    assert!(!task.enabled);

    store.set_enabled(id, true).await.unwrap();
    let task = store.get_task(id).await.unwrap();
    assert!(task.enabled);
    assert_eq!(task.consecutive_failures, 0);
}

#[tokio::test]
async fn plaintext_passwords_are_rewritten_at_startup() {
    let dir = TempDir::new().unwrap();
    let mut store = new_store(&dir).await;

    let mut with_plain = test_task("legacy");
    with_plain.password_ct = "hunter2".to_string();
    let legacy_id = store.create_task(&with_plain).await.unwrap();

    let secrets = SecretBox::new(&[7u8; 32]);
    let mut already = test_task("modern");
    already.password_ct = secrets.encrypt("s3cret").unwrap();
    let modern_id = store.create_task(&already).await.unwrap();

    let rewritten = store.migrate_plaintext_passwords(&secrets).await.unwrap();
    assert_eq!(rewritten, 1);

    let legacy = store.get_task(legacy_id).await.unwrap();
    assert!(looks_encrypted(&legacy.password_ct));
    assert_eq!(&*secrets.decrypt(&legacy.password_ct).unwrap(), "hunter2");

    // The already-encrypted row is untouched.
    let modern = store.get_task(modern_id).await.unwrap();
    assert_eq!(modern.password_ct, already.password_ct);

    // A second pass finds nothing to do.
    assert_eq!(
        store.migrate_plaintext_passwords(&secrets).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn initialize_migrates_old_schemas_forward() {
    let dir = TempDir::new().unwrap();

    // A database created by an early release: no lock columns, no failure
    // accounting, no sync_mode on logs.
    {
        let conn = rusqlite::Connection::open(dir.path().join("syncwarden.db")).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE tasks (
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
                last_sync_time INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL,
                output TEXT NOT NULL DEFAULT ''
            );
            INSERT INTO tasks (name, remote_host, remote_port, username, password,
                               local_dir, remote_dir, interval_minutes, created_at, updated_at)
            VALUES ('old', 'h', 22, 'u', '', '/tmp', '/srv', 15, 1, 1);
            "#,
        )
        .unwrap();
    }

    let mut store = new_store(&dir).await;
    let task = store.get_task(1).await.unwrap();
    assert_eq!(task.name, "old");
    assert!(!task.is_running);
    assert_eq!(task.consecutive_failures, 0);

    // The migrated row participates in the full run protocol.
    assert!(store.acquire_lock(1, 86_400).await.unwrap().locked);
    let task = store
        .record_run(1, SyncStatus::Success, "ok", 1.0, SyncMode::Rsync, 100, 3)
        .await
        .unwrap();
    assert_eq!(task.last_sync_status, Some(SyncStatus::Success));
}
