//! Shared data structures and utilities for the syncwarden synchronization system
//!
//! This crate contains the task and log model types, the tunable configuration
//! layer, and small utilities shared by the engine and any outer surface built
//! on top of it.

pub mod config;
pub mod defaults;
pub mod model;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{Tunables, WardenSettings};
pub use model::{LogEntry, NewTask, SyncMode, SyncStatus, Task, TaskView};
pub use utils::{current_timestamp, shell_escape};

/// Result type alias used throughout the system
pub type Result<T> = anyhow::Result<T>;

/// Common error kinds for the synchronization engine
///
/// These are the run-rejection and validation errors the outer surface is
/// expected to match on. Everything else travels as `anyhow` context.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("Task not found: {0}")]
    NotFound(i64),

    #[error("Task {0} is already running")]
    AlreadyRunning(i64),

    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("Secret box error: {0}")]
    SecretBox(String),

    #[error("Database error: {0}")]
    Database(String),
}
