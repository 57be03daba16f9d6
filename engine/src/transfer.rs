//! Transfer orchestration: one sync run for one task
//!
//! A run moves through lock acquisition, remote preparation, the pre-transfer
//! trash pass, the rsync primary transfer, the sftp fallback, and version
//! retention cleanup. Whatever happens in between, the run always ends in
//! `record_run`, which releases the lock and writes the log row in one
//! transaction, followed by a `task-update` event.
//
// The executor is cheap to clone; the scheduler clones it into a spawned
// task per run so a slow transfer never blocks the scheduler loop.

use crate::events::EventBus;
use crate::process::{run_command, CommandOutput, RunOptions, StdoutCallback};
use crate::remote::{rsync_remote_shell, ssh_exec, SshEndpoint};
use crate::secret::SecretBox;
use crate::store::TaskStore;
use anyhow::Result;
use regex::Regex;
use shared::config::Tunables;
use shared::model::{SyncMode, SyncStatus, Task};
use shared::utils::{normalize_local_path, run_timestamp, shell_escape, truncate_output_tail};
use shared::WardenError;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// rsync exit code for "some source files vanished"; the transfer is still
/// complete for everything that existed, so it counts as success.
const RSYNC_VANISHED_FILES: i32 = 24;

/// Warning line prefixed to the run output when the sftp fallback was used.
const SFTP_FALLBACK_WARNING: &str =
    "WARNING: rsync failed; transferred with sftp instead (remote deletions and versioning were not applied)\n";

/// rsync `--progress` lines look like `  1,234,567  42%    1.23MB/s    0:00:12`.
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%\s+([0-9.]+\w+/s)").expect("progress pattern is valid"));

/// Result of one sync run as reported to the caller.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: bool,
    pub output: String,
    pub sync_mode: SyncMode,
}

/// Internal pipeline result before finalization.
struct PipelineResult {
    status: SyncStatus,
    output: String,
    mode: SyncMode,
}

impl PipelineResult {
    fn fail(output: String) -> Self {
        Self {
            status: SyncStatus::Fail,
            output,
            mode: SyncMode::Rsync,
        }
    }
}

/// Executes sync runs. The scheduler decides when; this type decides what a
/// run actually does.
#[derive(Clone)]
pub struct TransferExecutor {
    store: Arc<RwLock<TaskStore>>,
    secrets: SecretBox,
    events: EventBus,
    tunables: Arc<Tunables>,
}

impl TransferExecutor {
    pub fn new(
        store: Arc<RwLock<TaskStore>>,
        secrets: SecretBox,
        events: EventBus,
        tunables: Arc<Tunables>,
    ) -> Self {
        Self {
            store,
            secrets,
            events,
            tunables,
        }
    }

    /// Run one sync for `task_id`.
    ///
    /// Returns `WardenError::AlreadyRunning` without side effects when the
    /// single-flight lock is held, and `WardenError::NotFound` for unknown
    /// ids. Any other trouble is folded into a failed run outcome so that
    /// failure accounting and the log row always happen.
    pub async fn execute_sync(&self, task_id: i64) -> Result<SyncOutcome> {
        let acquired = self
            .store
            .write()
            .await
            .acquire_lock(task_id, self.tunables.stale_task_threshold_secs)
            .await?;
        if !acquired.locked {
            debug!("Task {} is already running, rejecting run", task_id);
            return Err(WardenError::AlreadyRunning(task_id).into());
        }
        let task = acquired.task;
        info!("Starting sync run for task {} ({})", task.id, task.name);

        let started = Instant::now();
        let result = self.run_pipeline(&task).await;
        let duration_s = started.elapsed().as_secs_f64();
        let output = truncate_output_tail(&result.output, self.tunables.max_output_bytes);

        let recorded = self
            .store
            .write()
            .await
            .record_run(
                task.id,
                result.status,
                &output,
                duration_s,
                result.mode,
                self.tunables.max_logs,
                self.tunables.max_consecutive_failures,
            )
            .await;

        match recorded {
            Ok(_) => {
                self.events.task_update();
                if result.status.is_success() {
                    info!(
                        "Sync run for task {} finished in {:.1}s ({})",
                        task.id,
                        duration_s,
                        result.mode.as_str()
                    );
                } else {
                    warn!("Sync run for task {} failed after {:.1}s", task.id, duration_s);
                }
                Ok(SyncOutcome {
                    success: result.status.is_success(),
                    output,
                    sync_mode: result.mode,
                })
            }
            Err(e) => {
                // The log row is lost, but the lock must not stay held.
                warn!("Failed to record run for task {}: {}", task.id, e);
                let _ = self.store.write().await.release_lock(task.id).await;
                self.events.task_update();
                Err(e)
            }
        }
    }

    /// The run pipeline proper. Infallible by design: every failure becomes
    /// a failed `PipelineResult` so the caller's finalization is uniform.
    async fn run_pipeline(&self, task: &Task) -> PipelineResult {
        let t = self.tunables.as_ref();

        // Plaintext credentials live only for the span of this run.
        let password = match self.task_password(task) {
            Ok(password) => password,
            Err(e) => return PipelineResult::fail(format!("Credential error: {}", e)),
        };
        let endpoint = SshEndpoint {
            host: task.remote_host.clone(),
            port: task.remote_port,
            username: task.username.clone(),
        };
        let stamp = run_timestamp();

        // Remote preparation: the mirror root plus both history directories.
        let prep_cmd = format!(
            "mkdir -p {} {} {}",
            shell_escape(&task.remote_dir),
            shell_escape(&format!("{}/{}", task.remote_dir, t.versions_dir)),
            shell_escape(&format!("{}/{}", task.remote_dir, t.trash_dir)),
        );
        let prep = ssh_exec(t, &endpoint, &password, &prep_cmd, t.ssh_mkdir_timeout_ms).await;
        if !prep.success {
            return PipelineResult::fail(format!("Remote preparation failed:\n{}", prep.output));
        }

        // Files deleted locally are moved aside on the remote before the
        // transfer gets a chance to remove them.
        if task.trash_enabled {
            if let Err(message) = self
                .move_extras_to_trash(task, &endpoint, &password, &stamp)
                .await
            {
                return PipelineResult::fail(message);
            }
        }

        let rsync = self.run_rsync(task, &endpoint, &password, &stamp).await;
        if rsync.code == 0 || rsync.code == RSYNC_VANISHED_FILES {
            if rsync.code == RSYNC_VANISHED_FILES {
                debug!(
                    "rsync for task {} reported vanished source files, treating as success",
                    task.id
                );
            }
            if task.version_enabled {
                self.cleanup_versions(task, &endpoint, &password).await;
            }
            return PipelineResult {
                status: SyncStatus::Success,
                output: rsync.output,
                mode: SyncMode::Rsync,
            };
        }

        warn!(
            "rsync for task {} exited with code {}, falling back to sftp",
            task.id, rsync.code
        );
        let sftp = self.run_sftp(task, &endpoint, &password).await;
        let mut output = String::from(SFTP_FALLBACK_WARNING);
        if sftp.success {
            output.push_str(&sftp.output);
            PipelineResult {
                status: SyncStatus::Success,
                output,
                mode: SyncMode::Sftp,
            }
        } else {
            output.push_str(&format!(
                "rsync exit {}:\n{}\nsftp exit {}:\n{}",
                rsync.code, rsync.output, sftp.code, sftp.output
            ));
            PipelineResult {
                status: SyncStatus::Fail,
                output,
                mode: SyncMode::Sftp,
            }
        }
    }

    fn task_password(&self, task: &Task) -> Result<Zeroizing<String>> {
        if task.password_ct.is_empty() {
            return Ok(Zeroizing::new(String::new()));
        }
        self.secrets.decrypt(&task.password_ct)
    }

    /// Move remote files that no longer exist locally into the run's trash
    /// directory. Any batch failure aborts the run before the transfer; a
    /// partially applied trash pass followed by `--delete` would lose files.
    async fn move_extras_to_trash(
        &self,
        task: &Task,
        endpoint: &SshEndpoint,
        password: &str,
        stamp: &str,
    ) -> std::result::Result<(), String> {
        let t = self.tunables.as_ref();

        let local = walk_local_files(Path::new(&task.local_dir))
            .map_err(|e| format!("Local enumeration failed: {}", e))?;

        let find_cmd = format!(
            "cd {} && find . -type f ! -path {} ! -path {} | sed 's|^./||'",
            shell_escape(&task.remote_dir),
            shell_escape(&format!("./{}/*", t.versions_dir)),
            shell_escape(&format!("./{}/*", t.trash_dir)),
        );
        let found = ssh_exec(t, endpoint, password, &find_cmd, t.ssh_find_timeout_ms).await;
        if !found.success {
            return Err(format!("Remote enumeration failed:\n{}", found.output));
        }

        let remote: BTreeSet<String> = found
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        let extras: Vec<&String> = remote.iter().filter(|path| !local.contains(*path)).collect();
        if extras.is_empty() {
            debug!("No remote extras to trash for task {}", task.id);
            return Ok(());
        }

        info!(
            "Moving {} remote files to trash for task {}",
            extras.len(),
            task.id
        );
        let trash_root = format!("{}/{}/{}", task.remote_dir, t.trash_dir, stamp);
        for batch in extras.chunks(t.trash_move_batch_size) {
            let mut parts = Vec::with_capacity(batch.len());
            for path in batch {
                let target_dir = match path.rsplit_once('/') {
                    Some((dir, _)) => format!("{}/{}", trash_root, dir),
                    None => trash_root.clone(),
                };
                parts.push(format!(
                    "mkdir -p {} && mv {} {}",
                    shell_escape(&target_dir),
                    shell_escape(&format!("{}/{}", task.remote_dir, path)),
                    shell_escape(&format!("{}/{}", trash_root, path)),
                ));
            }
            let command = parts.join(" && ");
            let moved =
                ssh_exec(t, endpoint, password, &command, t.ssh_trash_move_timeout_ms).await;
            if !moved.success {
                return Err(format!("Trash move batch failed:\n{}", moved.output));
            }
        }
        Ok(())
    }

    /// The primary transfer. Mirrors the contents of `local_dir` into
    /// `remote_dir`, preserving overwritten files under the versions
    /// directory when enabled.
    async fn run_rsync(
        &self,
        task: &Task,
        endpoint: &SshEndpoint,
        password: &str,
        stamp: &str,
    ) -> CommandOutput {
        let t = self.tunables.as_ref();

        let mut args: Vec<String> = vec![
            "-e".to_string(),
            t.rsync_bin.clone(),
            "-avz".to_string(),
            "--delete".to_string(),
            "--force".to_string(),
            format!("--exclude={}", t.versions_dir),
            format!("--exclude={}", t.trash_dir),
            "--progress".to_string(),
        ];
        if task.version_enabled {
            args.push("--backup".to_string());
            args.push(format!(
                "--backup-dir={}/{}/{}",
                task.remote_dir, t.versions_dir, stamp
            ));
        }
        args.push("-e".to_string());
        args.push(rsync_remote_shell(t, endpoint.port));
        // Trailing slash on the source: the contents of local_dir replace
        // the contents of remote_dir.
        args.push(format!(
            "{}/",
            normalize_local_path(Path::new(&task.local_dir))
        ));
        args.push(format!(
            "{}:{}/",
            endpoint.destination(),
            shell_escape(&task.remote_dir)
        ));

        let events = self.events.clone();
        let task_id = task.id;
        let callback: StdoutCallback = Box::new(move |chunk: &str| {
            for line in chunk.lines() {
                if let Some(caps) = PROGRESS_RE.captures(line) {
                    let percent = caps[1].parse::<u16>().map(|v| v.min(100) as u8).unwrap_or(0);
                    events.task_progress(task_id, percent, caps[2].to_string());
                }
            }
        });

        let opts = RunOptions::new(t.rsync_timeout_ms, t.max_output_bytes)
            .with_env("SSHPASS", password)
            .with_stdout_callback(callback);
        run_command(&t.sshpass_bin, &args, opts).await
    }

    /// The degraded fallback: a recursive sftp upload. Does not delete
    /// remote files and does not version overwrites.
    async fn run_sftp(&self, task: &Task, endpoint: &SshEndpoint, password: &str) -> CommandOutput {
        let t = self.tunables.as_ref();

        let batch = format!(
            "put -r {}/* {}/\n",
            normalize_local_path(Path::new(&task.local_dir)),
            task.remote_dir
        );
        let batch_file = match tempfile::NamedTempFile::new() {
            Ok(file) => file,
            Err(e) => {
                return synthetic_failure(
                    format!("Failed to create sftp batch file: {}", e),
                    t.max_output_bytes,
                )
            }
        };
        if let Err(e) = std::fs::write(batch_file.path(), &batch) {
            return synthetic_failure(
                format!("Failed to write sftp batch file: {}", e),
                t.max_output_bytes,
            );
        }

        let args: Vec<String> = vec![
            "-e".to_string(),
            t.sftp_bin.clone(),
            "-P".to_string(),
            endpoint.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-b".to_string(),
            batch_file.path().to_string_lossy().to_string(),
            endpoint.destination(),
        ];
        let opts =
            RunOptions::new(t.sftp_timeout_ms, t.max_output_bytes).with_env("SSHPASS", password);
        // The batch file must outlive the child; it is removed when this
        // binding drops.
        let result = run_command(&t.sshpass_bin, &args, opts).await;
        drop(batch_file);
        result
    }

    /// Drop all but the newest `max_versions` directories under the remote
    /// versions directory. Failures are logged and do not affect the run.
    async fn cleanup_versions(&self, task: &Task, endpoint: &SshEndpoint, password: &str) {
        let t = self.tunables.as_ref();
        let versions_path = format!("{}/{}", task.remote_dir, t.versions_dir);
        let command = format!(
            "cd {} && ls -td */ | tail -n +{} | while read d; do rm -rf \"$d\"; done",
            shell_escape(&versions_path),
            t.max_versions + 1
        );
        let result = ssh_exec(
            t,
            endpoint,
            password,
            &command,
            t.ssh_version_cleanup_timeout_ms,
        )
        .await;
        if !result.success {
            warn!(
                "Version cleanup failed for task {}: {}",
                task.id,
                truncate_output_tail(&result.output, 512)
            );
        }
    }

    /// Remove trash directories older than the retention window for every
    /// trash-enabled task. Called by the scheduler's daily sweep; failures
    /// are logged per task and never abort the sweep.
    pub async fn sweep_trash(&self) -> Result<()> {
        let tasks = self.store.write().await.list_trash_enabled_tasks().await?;
        if tasks.is_empty() {
            return Ok(());
        }
        info!("Running trash retention sweep over {} tasks", tasks.len());
        for task in tasks {
            if let Err(e) = self.sweep_task_trash(&task).await {
                warn!("Trash sweep failed for task {}: {}", task.id, e);
            }
        }
        Ok(())
    }

    async fn sweep_task_trash(&self, task: &Task) -> Result<()> {
        let t = self.tunables.as_ref();
        let password = self.task_password(task)?;
        let endpoint = SshEndpoint {
            host: task.remote_host.clone(),
            port: task.remote_port,
            username: task.username.clone(),
        };
        let trash_path = format!("{}/{}", task.remote_dir, t.trash_dir);
        let command = format!(
            "find {} -mindepth 1 -maxdepth 1 -type d -mtime +{} -exec rm -rf {{}} \\;",
            shell_escape(&trash_path),
            t.trash_retention_days
        );
        let result = ssh_exec(
            t,
            &endpoint,
            &password,
            &command,
            t.ssh_trash_cleanup_timeout_ms,
        )
        .await;
        if !result.success {
            anyhow::bail!(
                "remote sweep exited {}: {}",
                result.code,
                truncate_output_tail(&result.output, 512)
            );
        }
        Ok(())
    }

    /// Issue a trivial remote command to verify host, credentials, and
    /// reachability.
    pub async fn test_connection(&self, endpoint: &SshEndpoint, password: &str) -> CommandOutput {
        ssh_exec(
            self.tunables.as_ref(),
            endpoint,
            password,
            "echo 'connection test'",
            self.tunables.ssh_test_connection_timeout_ms,
        )
        .await
    }
}

/// Recursively enumerate files under `root` as POSIX relative paths.
///
/// An unreadable root is an error; unreadable subdirectories are skipped
/// with a warning so one bad permission does not abort the trash pass.
fn walk_local_files(root: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                if dir == root {
                    return Err(e);
                }
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.insert(rel);
                }
            }
        }
    }
    Ok(files)
}

fn synthetic_failure(message: String, max_output_bytes: usize) -> CommandOutput {
    CommandOutput {
        code: -1,
        stdout: String::new(),
        stderr: message.clone(),
        output: truncate_output_tail(&message, max_output_bytes),
        killed: false,
        success: false,
    }
}
