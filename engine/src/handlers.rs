//! Management surface for the synchronization engine
//!
//! Typed operations the outer UI or CLI calls: task CRUD, enable/disable,
//! manual runs, connection tests, and log retrieval. Inputs are validated
//! here, passwords are encrypted here before the store ever sees them, and
//! every listing strips the ciphertext. When a live scheduler is passed in,
//! the timer side effects (restart on update, stop on delete) are applied in
//! the same call.

use crate::engine::Engine;
use crate::remote::SshEndpoint;
use crate::scheduler::SyncScheduler;
use anyhow::Result;
use serde::Serialize;
use shared::model::{LogEntry, NewTask, SyncMode, TaskView};
use shared::utils::truncate_output_tail;
use shared::WardenError;
use std::path::Path;
use tracing::info;

/// Inputs for creating or updating a task. The password is plaintext at this
/// boundary; `None` on update keeps the stored one, and an empty string
/// clears it.
#[derive(Debug, Clone)]
pub struct TaskForm {
    pub name: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub username: String,
    pub password: Option<String>,
    pub local_dir: String,
    pub remote_dir: String,
    pub interval_minutes: u32,
    pub version_enabled: bool,
    pub trash_enabled: bool,
    pub enabled: bool,
}

/// Result of a manual `sync_task` call.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_mode: Option<SyncMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a `test_connection` call.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn validate_form(form: &TaskForm) -> Result<()> {
    if form.name.trim().is_empty() {
        return Err(WardenError::InputInvalid("Task name cannot be empty".to_string()).into());
    }
    if form.remote_host.trim().is_empty() {
        return Err(WardenError::InputInvalid("Remote host cannot be empty".to_string()).into());
    }
    if form.remote_port == 0 {
        return Err(WardenError::InputInvalid("Remote port cannot be 0".to_string()).into());
    }
    if form.username.trim().is_empty() {
        return Err(WardenError::InputInvalid("Username cannot be empty".to_string()).into());
    }
    if form.remote_dir.trim().is_empty() {
        return Err(
            WardenError::InputInvalid("Remote directory cannot be empty".to_string()).into(),
        );
    }
    if form.interval_minutes == 0 {
        return Err(WardenError::InputInvalid(
            "Sync interval must be at least one minute".to_string(),
        )
        .into());
    }
    let local = Path::new(&form.local_dir);
    if !local.is_dir() {
        return Err(WardenError::InputInvalid(format!(
            "Local directory does not exist: {}",
            form.local_dir
        ))
        .into());
    }
    Ok(())
}

pub async fn list_tasks(engine: &Engine) -> Result<Vec<TaskView>> {
    let tasks = engine.store.write().await.list_tasks().await?;
    Ok(tasks.into_iter().map(TaskView::from).collect())
}

pub async fn get_task(engine: &Engine, id: i64) -> Result<TaskView> {
    let task = engine.store.write().await.get_task(id).await?;
    Ok(TaskView::from(task))
}

pub async fn create_task(
    engine: &Engine,
    scheduler: Option<&mut SyncScheduler>,
    form: TaskForm,
) -> Result<i64> {
    validate_form(&form)?;

    let password_ct = match form.password.as_deref() {
        Some(plain) if !plain.is_empty() => engine.secrets.encrypt(plain)?,
        _ => String::new(),
    };
    let new = NewTask {
        name: form.name,
        remote_host: form.remote_host,
        remote_port: form.remote_port,
        username: form.username,
        password_ct,
        local_dir: form.local_dir,
        remote_dir: form.remote_dir,
        interval_minutes: form.interval_minutes,
        version_enabled: form.version_enabled,
        trash_enabled: form.trash_enabled,
        enabled: form.enabled,
    };

    let id = engine.store.write().await.create_task(&new).await?;
    info!("Created task {} ({})", id, new.name);

    if let Some(scheduler) = scheduler {
        scheduler.restart_task_ticker(id).await?;
    }
    Ok(id)
}

pub async fn update_task(
    engine: &Engine,
    scheduler: Option<&mut SyncScheduler>,
    id: i64,
    form: TaskForm,
) -> Result<()> {
    validate_form(&form)?;

    let existing = engine.store.write().await.get_task(id).await?;
    let password_ct = match form.password.as_deref() {
        None => existing.password_ct,
        Some("") => String::new(),
        Some(plain) => engine.secrets.encrypt(plain)?,
    };
    let new = NewTask {
        name: form.name,
        remote_host: form.remote_host,
        remote_port: form.remote_port,
        username: form.username,
        password_ct,
        local_dir: form.local_dir,
        remote_dir: form.remote_dir,
        interval_minutes: form.interval_minutes,
        version_enabled: form.version_enabled,
        trash_enabled: form.trash_enabled,
        enabled: form.enabled,
    };

    engine.store.write().await.update_task(id, &new).await?;
    info!("Updated task {}", id);

    if let Some(scheduler) = scheduler {
        scheduler.restart_task_ticker(id).await?;
    }
    Ok(())
}

pub async fn delete_task(
    engine: &Engine,
    scheduler: Option<&mut SyncScheduler>,
    id: i64,
) -> Result<()> {
    engine.store.write().await.delete_task(id).await?;
    info!("Deleted task {}", id);

    if let Some(scheduler) = scheduler {
        scheduler.stop_task_ticker(id);
    }
    Ok(())
}

/// Enable or disable a task. The failure streak resets either way so a
/// re-enabled task is not one bad run from auto-disable.
pub async fn toggle_task(
    engine: &Engine,
    scheduler: Option<&mut SyncScheduler>,
    id: i64,
    enabled: bool,
) -> Result<()> {
    engine.store.write().await.set_enabled(id, enabled).await?;
    info!("Task {} {}", id, if enabled { "enabled" } else { "disabled" });

    if let Some(scheduler) = scheduler {
        if enabled {
            scheduler.restart_task_ticker(id).await?;
        } else {
            scheduler.stop_task_ticker(id);
        }
    }
    Ok(())
}

/// Run one sync immediately. Manual runs are permitted on disabled tasks;
/// the single-flight lock still applies.
pub async fn sync_task(engine: &Engine, id: i64) -> SyncReport {
    match engine.executor().execute_sync(id).await {
        Ok(outcome) => SyncReport {
            success: outcome.success,
            output: Some(outcome.output),
            sync_mode: Some(outcome.sync_mode),
            error: None,
        },
        Err(e) => SyncReport {
            success: false,
            output: None,
            sync_mode: None,
            error: Some(e.to_string()),
        },
    }
}

/// The newest log rows for a task, up to the configured cap.
pub async fn get_logs(engine: &Engine, task_id: i64) -> Result<Vec<LogEntry>> {
    engine
        .store
        .write()
        .await
        .get_logs(task_id, engine.tunables.max_logs)
        .await
}

/// Check that an SSH endpoint accepts the given credentials.
pub async fn test_connection(
    engine: &Engine,
    host: &str,
    port: u16,
    username: &str,
    password: &str,
) -> ConnectionReport {
    if host.trim().is_empty() || username.trim().is_empty() || port == 0 {
        return ConnectionReport {
            success: false,
            error: Some("Host, port, and username are required".to_string()),
        };
    }
    let endpoint = SshEndpoint {
        host: host.to_string(),
        port,
        username: username.to_string(),
    };
    let result = engine.executor().test_connection(&endpoint, password).await;
    if result.success {
        ConnectionReport {
            success: true,
            error: None,
        }
    } else {
        ConnectionReport {
            success: false,
            error: Some(truncate_output_tail(&result.output, 1024)),
        }
    }
}
