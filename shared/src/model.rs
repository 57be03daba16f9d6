//! Task and log model types
//!
//! The store projects its rows directly into these structs. `Task` mirrors the
//! `tasks` relation including the run lock columns; `TaskView` is the same
//! record with the password ciphertext stripped, which is the only shape the
//! management surface ever returns.

use serde::{Deserialize, Serialize};

/// Outcome classification of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Fail,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(SyncStatus::Success),
            "fail" => Some(SyncStatus::Fail),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SyncStatus::Success)
    }
}

/// Which transfer tool produced the run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Rsync,
    Sftp,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Rsync => "rsync",
            SyncMode::Sftp => "sftp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rsync" => Some(SyncMode::Rsync),
            "sftp" => Some(SyncMode::Sftp),
            _ => None,
        }
    }
}

/// One sync job as stored in the `tasks` relation.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub username: String,
    /// Ciphertext password, or empty when the task has no password stored.
    pub password_ct: String,
    /// Local source directory, platform-native absolute path.
    pub local_dir: String,
    /// Remote destination directory, POSIX path.
    pub remote_dir: String,
    pub interval_minutes: u32,
    pub version_enabled: bool,
    pub trash_enabled: bool,
    pub enabled: bool,
    /// Single-flight run lock.
    pub is_running: bool,
    /// Unix seconds at lock acquisition; used for staleness detection.
    pub started_at: Option<i64>,
    pub consecutive_failures: u32,
    pub last_sync_time: Option<i64>,
    pub last_sync_status: Option<SyncStatus>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Field set used for task creation and full updates.
///
/// The password here is already ciphertext; encryption happens in the
/// management surface before the store is touched.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub username: String,
    pub password_ct: String,
    pub local_dir: String,
    pub remote_dir: String,
    pub interval_minutes: u32,
    pub version_enabled: bool,
    pub trash_enabled: bool,
    pub enabled: bool,
}

/// A task as exposed to observers, with the password ciphertext stripped.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: i64,
    pub name: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub username: String,
    pub local_dir: String,
    pub remote_dir: String,
    pub interval_minutes: u32,
    pub version_enabled: bool,
    pub trash_enabled: bool,
    pub enabled: bool,
    pub is_running: bool,
    pub consecutive_failures: u32,
    pub last_sync_time: Option<i64>,
    pub last_sync_status: Option<SyncStatus>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            name: task.name,
            remote_host: task.remote_host,
            remote_port: task.remote_port,
            username: task.username,
            local_dir: task.local_dir,
            remote_dir: task.remote_dir,
            interval_minutes: task.interval_minutes,
            version_enabled: task.version_enabled,
            trash_enabled: task.trash_enabled,
            enabled: task.enabled,
            is_running: task.is_running,
            consecutive_failures: task.consecutive_failures,
            last_sync_time: task.last_sync_time,
            last_sync_status: task.last_sync_status,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// One run outcome as stored in the `logs` relation.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub task_id: i64,
    pub timestamp: i64,
    pub status: SyncStatus,
    /// Captured child output, capped at the configured maximum.
    pub output: String,
    pub duration_s: f64,
    pub sync_mode: SyncMode,
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockAcquire {
    /// The task row as of the end of the transaction.
    pub task: Task,
    /// True when this caller now holds the run lock.
    pub locked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        assert_eq!(SyncStatus::parse("success"), Some(SyncStatus::Success));
        assert_eq!(SyncStatus::parse("fail"), Some(SyncStatus::Fail));
        assert_eq!(SyncStatus::parse("bogus"), None);
        assert_eq!(SyncStatus::Success.as_str(), "success");
        assert_eq!(SyncStatus::Fail.as_str(), "fail");
    }

    #[test]
    fn mode_round_trip() {
        assert_eq!(SyncMode::parse("rsync"), Some(SyncMode::Rsync));
        assert_eq!(SyncMode::parse("sftp"), Some(SyncMode::Sftp));
        assert_eq!(SyncMode::parse(""), None);
    }

    #[test]
    fn view_strips_password() {
        let task = Task {
            id: 1,
            name: "backup".to_string(),
            remote_host: "example.com".to_string(),
            remote_port: 22,
            username: "backup".to_string(),
            password_ct: "enc:v1:abc".to_string(),
            local_dir: "/home/user/docs".to_string(),
            remote_dir: "/srv/backup/docs".to_string(),
            interval_minutes: 30,
            version_enabled: true,
            trash_enabled: true,
            enabled: true,
            is_running: false,
            started_at: None,
            consecutive_failures: 0,
            last_sync_time: None,
            last_sync_status: None,
            created_at: 0,
            updated_at: 0,
        };
        let view = TaskView::from(task);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("enc:v1:abc"));
    }
}
