//! Configuration for the synchronization engine
//!
//! Two layers live here. `Tunables` is the environment contract: every numeric
//! knob of the engine can be overridden with an environment variable, and a
//! malformed value falls back to its default with a warning rather than
//! aborting startup. `WardenSettings` is the optional `warden.toml` file the
//! outer surface reads for non-tunable settings such as directories.

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Runtime tunables, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Wall-clock timeout for the primary rsync transfer, in milliseconds.
    pub rsync_timeout_ms: u64,
    /// Wall-clock timeout for the sftp fallback transfer, in milliseconds.
    pub sftp_timeout_ms: u64,
    /// Timeout for generic ssh utility commands, in milliseconds.
    pub ssh_timeout_ms: u64,
    /// Timeout for the remote directory preparation command, in milliseconds.
    pub ssh_mkdir_timeout_ms: u64,
    /// Timeout for the remote file enumeration command, in milliseconds.
    pub ssh_find_timeout_ms: u64,
    /// Timeout for one batch of trash move commands, in milliseconds.
    pub ssh_trash_move_timeout_ms: u64,
    /// Timeout for the version retention cleanup command, in milliseconds.
    pub ssh_version_cleanup_timeout_ms: u64,
    /// Timeout for the daily trash retention sweep, in milliseconds.
    pub ssh_trash_cleanup_timeout_ms: u64,
    /// Timeout for the connection test command, in milliseconds.
    pub ssh_test_connection_timeout_ms: u64,
    /// Timeout for any child command without a more specific knob, in milliseconds.
    pub default_command_timeout_ms: u64,
    /// Maximum number of log rows kept per task.
    pub max_logs: usize,
    /// Maximum number of version directories kept under the remote versions directory.
    pub max_versions: usize,
    /// Days a trash directory survives on the remote host before the daily sweep removes it.
    pub trash_retention_days: u32,
    /// Consecutive failed runs after which a task is automatically disabled.
    pub max_consecutive_failures: u32,
    /// Seconds after which a held run lock is treated as left over from a crash.
    pub stale_task_threshold_secs: u64,
    /// Cap in bytes on captured child output (tail-preserving).
    pub max_output_bytes: usize,
    /// Name of the remote directory holding overwritten file versions.
    pub versions_dir: String,
    /// Name of the remote directory holding deleted files.
    pub trash_dir: String,
    /// Number of trash move commands joined into one remote invocation.
    pub trash_move_batch_size: usize,
    /// Program name or path for sshpass.
    pub sshpass_bin: String,
    /// Program name or path for rsync.
    pub rsync_bin: String,
    /// Program name or path for sftp.
    pub sftp_bin: String,
    /// Program name or path for ssh (used inside the rsync remote shell string).
    pub ssh_bin: String,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            rsync_timeout_ms: default_rsync_timeout_ms(),
            sftp_timeout_ms: default_sftp_timeout_ms(),
            ssh_timeout_ms: default_ssh_timeout_ms(),
            ssh_mkdir_timeout_ms: default_ssh_mkdir_timeout_ms(),
            ssh_find_timeout_ms: default_ssh_find_timeout_ms(),
            ssh_trash_move_timeout_ms: default_ssh_trash_move_timeout_ms(),
            ssh_version_cleanup_timeout_ms: default_ssh_version_cleanup_timeout_ms(),
            ssh_trash_cleanup_timeout_ms: default_ssh_trash_cleanup_timeout_ms(),
            ssh_test_connection_timeout_ms: default_ssh_test_connection_timeout_ms(),
            default_command_timeout_ms: default_command_timeout_ms(),
            max_logs: default_max_logs(),
            max_versions: default_max_versions(),
            trash_retention_days: default_trash_retention_days(),
            max_consecutive_failures: default_max_consecutive_failures(),
            stale_task_threshold_secs: default_stale_task_threshold_secs(),
            max_output_bytes: default_max_output_bytes(),
            versions_dir: default_versions_dir(),
            trash_dir: default_trash_dir(),
            trash_move_batch_size: default_trash_move_batch_size(),
            sshpass_bin: "sshpass".to_string(),
            rsync_bin: "rsync".to_string(),
            sftp_bin: "sftp".to_string(),
            ssh_bin: "ssh".to_string(),
        }
    }
}

impl Tunables {
    /// Resolve the tunables from the process environment.
    ///
    /// Unset variables use the defaults; variables that are set but do not
    /// parse are reported and ignored.
    pub fn from_env() -> Self {
        let mut t = Self::default();
        env_override("RSYNC_TIMEOUT", &mut t.rsync_timeout_ms);
        env_override("SFTP_TIMEOUT", &mut t.sftp_timeout_ms);
        env_override("SSH_TIMEOUT", &mut t.ssh_timeout_ms);
        env_override("SSH_MKDIR_TIMEOUT", &mut t.ssh_mkdir_timeout_ms);
        env_override("SSH_FIND_TIMEOUT", &mut t.ssh_find_timeout_ms);
        env_override("SSH_TRASH_MOVE_TIMEOUT", &mut t.ssh_trash_move_timeout_ms);
        env_override(
            "SSH_VERSION_CLEANUP_TIMEOUT",
            &mut t.ssh_version_cleanup_timeout_ms,
        );
        env_override(
            "SSH_TRASH_CLEANUP_TIMEOUT",
            &mut t.ssh_trash_cleanup_timeout_ms,
        );
        env_override(
            "SSH_TEST_CONNECTION_TIMEOUT",
            &mut t.ssh_test_connection_timeout_ms,
        );
        env_override("DEFAULT_COMMAND_TIMEOUT", &mut t.default_command_timeout_ms);
        env_override("MAX_LOGS", &mut t.max_logs);
        env_override("MAX_VERSIONS", &mut t.max_versions);
        env_override("TRASH_RETENTION_DAYS", &mut t.trash_retention_days);
        env_override(
            "MAX_CONSECUTIVE_FAILURES",
            &mut t.max_consecutive_failures,
        );
        env_override("STALE_TASK_THRESHOLD", &mut t.stale_task_threshold_secs);
        env_override("MAX_OUTPUT_SIZE", &mut t.max_output_bytes);
        env_override_string("VERSIONS_DIR", &mut t.versions_dir);
        env_override_string("TRASH_DIR", &mut t.trash_dir);
        env_override_string("SSHPASS_BIN", &mut t.sshpass_bin);
        env_override_string("RSYNC_BIN", &mut t.rsync_bin);
        env_override_string("SFTP_BIN", &mut t.sftp_bin);
        env_override_string("SSH_BIN", &mut t.ssh_bin);
        t
    }
}

/// Overwrite `target` with the parsed value of `name` if set and well-formed.
fn env_override<T: FromStr + Copy>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(
                "Ignoring environment variable {}: '{}' is not a valid value",
                name, raw
            ),
        }
    }
}

/// Overwrite `target` with the value of `name` if set and non-empty.
fn env_override_string(name: &str, target: &mut String) {
    if let Ok(raw) = std::env::var(name) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            warn!("Ignoring environment variable {}: value is empty", name);
        } else {
            *target = trimmed.to_string();
        }
    }
}

/// Settings read from the optional `warden.toml` file.
///
/// These cover the things that are not per-run tunables: where the database
/// and key file live, where log files go, and the engine plumbing sizes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WardenSettings {
    /// Directory holding the database, the secret key file, and run state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Directory for rolling log files written by the daemon.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// SQLite busy timeout in seconds.
    #[serde(default = "default_database_busy_timeout_seconds")]
    pub database_busy_timeout_seconds: u64,
    /// Wait time for in-flight runs during graceful shutdown, in seconds.
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Capacity of the scheduler and event channels.
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// Interval at which the daemon reconciles timers with the store, in seconds.
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,
}

impl Default for WardenSettings {
    fn default() -> Self {
        // serde defaults and Default must agree; an empty document produces
        // exactly the default settings.
        toml::from_str("").expect("empty settings document must deserialize")
    }
}

impl WardenSettings {
    /// Load settings from a TOML file, or the defaults if the file is absent.
    pub fn load(path: &Path) -> crate::Result<Self> {
        use anyhow::Context;

        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_empty_document() {
        let settings = WardenSettings::default();
        assert_eq!(settings.database_busy_timeout_seconds, 5);
        assert_eq!(settings.channel_buffer_size, 256);
        assert_eq!(settings.data_dir, "./data");
    }

    #[test]
    fn tunables_defaults() {
        let t = Tunables::default();
        assert_eq!(t.max_logs, 100);
        assert_eq!(t.max_versions, 10);
        assert_eq!(t.trash_retention_days, 90);
        assert_eq!(t.max_consecutive_failures, 3);
        assert_eq!(t.stale_task_threshold_secs, 86_400);
        assert_eq!(t.max_output_bytes, 10_240);
        assert_eq!(t.versions_dir, ".versions");
        assert_eq!(t.trash_dir, ".trash");
    }

    #[test]
    fn settings_load_missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = WardenSettings::load(&dir.path().join("warden.toml")).unwrap();
        assert_eq!(settings, WardenSettings::default());
    }

    #[test]
    fn settings_load_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "data_dir = \"/var/lib/warden\"\n").unwrap();
        let settings = WardenSettings::load(&path).unwrap();
        assert_eq!(settings.data_dir, "/var/lib/warden");
        assert_eq!(settings.log_dir, "./logs");
    }
}
