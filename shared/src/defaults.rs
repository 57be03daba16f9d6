//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the tunable
//! layer and the settings file. Timeouts for child processes are expressed in
//! milliseconds because that is the unit the process runner consumes.

// Child process timeouts

/// Default rsync transfer timeout (1 hour)
pub fn default_rsync_timeout_ms() -> u64 {
    3_600_000
}

/// Default sftp fallback transfer timeout (5 minutes)
pub fn default_sftp_timeout_ms() -> u64 {
    300_000
}

/// Default timeout for plain ssh utility commands (30 seconds)
pub fn default_ssh_timeout_ms() -> u64 {
    30_000
}

/// Default timeout for the remote mkdir preparation command (30 seconds)
pub fn default_ssh_mkdir_timeout_ms() -> u64 {
    30_000
}

/// Default timeout for the remote file enumeration command (60 seconds)
pub fn default_ssh_find_timeout_ms() -> u64 {
    60_000
}

/// Default timeout for one batch of trash move commands (2 minutes)
pub fn default_ssh_trash_move_timeout_ms() -> u64 {
    120_000
}

/// Default timeout for the version retention cleanup command (60 seconds)
pub fn default_ssh_version_cleanup_timeout_ms() -> u64 {
    60_000
}

/// Default timeout for the daily trash retention sweep command (2 minutes)
pub fn default_ssh_trash_cleanup_timeout_ms() -> u64 {
    120_000
}

/// Default timeout for the connection test command (30 seconds)
pub fn default_ssh_test_connection_timeout_ms() -> u64 {
    30_000
}

/// Default timeout for any other child command (60 seconds)
pub fn default_command_timeout_ms() -> u64 {
    60_000
}

// Retention and accounting

/// Default maximum number of log rows kept per task
pub fn default_max_logs() -> usize {
    100
}

/// Default maximum number of version directories kept per task
pub fn default_max_versions() -> usize {
    10
}

/// Default number of days a trash directory is kept on the remote host
pub fn default_trash_retention_days() -> u32 {
    90
}

/// Default number of consecutive failed runs before a task is auto-disabled
pub fn default_max_consecutive_failures() -> u32 {
    3
}

/// Default age in seconds after which a held run lock is considered stale (24 hours)
pub fn default_stale_task_threshold_secs() -> u64 {
    86_400
}

/// Default cap in bytes on captured child output
pub fn default_max_output_bytes() -> usize {
    10_240
}

// Remote layout

/// Default name of the remote directory holding overwritten file versions
pub fn default_versions_dir() -> String {
    ".versions".to_string()
}

/// Default name of the remote directory holding deleted files
pub fn default_trash_dir() -> String {
    ".trash".to_string()
}

// Engine plumbing

/// Default number of trash move commands joined into one remote invocation
pub fn default_trash_move_batch_size() -> usize {
    100
}

/// Default SQLite busy timeout (5 seconds)
pub fn default_database_busy_timeout_seconds() -> u64 {
    5
}

/// Default wait time for in-flight runs during shutdown (30 seconds)
pub fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}

/// Default capacity of the scheduler and event channels
pub fn default_channel_buffer_size() -> usize {
    256
}

/// Default interval at which the scheduler reconciles its timers with the store (60 seconds)
pub fn default_reconcile_interval_seconds() -> u64 {
    60
}

/// Default data directory when neither the command line nor warden.toml names one
pub fn default_data_dir() -> String {
    "./data".to_string()
}

/// Default directory for rolling log files
pub fn default_log_dir() -> String {
    "./logs".to_string()
}
