//! Child process execution for the transfer tools
//!
//! The engine never performs transfers itself; it drives rsync, sftp, and ssh
//! as children. This module is the single place a child is spawned: piped
//! stdout/stderr drained concurrently, a progress callback fed from the
//! stdout reader, a wall-clock timeout that kills the whole process group,
//! and a result that is always resolved rather than raised. Callers decide
//! what an exit code means.

use shared::utils::truncate_output_tail;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Marker appended to stderr when a child is killed on timeout.
pub const TIMEOUT_MARKER: &str = "[TIMEOUT]";

/// Per-chunk callback over captured stdout.
pub type StdoutCallback = Box<dyn FnMut(&str) + Send>;

/// Options for one child invocation.
pub struct RunOptions {
    /// Extra environment entries overlaid on the inherited environment.
    pub env: Vec<(String, String)>,
    /// Wall-clock limit; on expiry the process group is killed.
    pub timeout: Duration,
    /// Cap on each captured stream and on the combined output.
    pub max_output_bytes: usize,
    /// Invoked with each stdout chunk before it is buffered.
    pub on_stdout: Option<StdoutCallback>,
}

impl RunOptions {
    pub fn new(timeout_ms: u64, max_output_bytes: usize) -> Self {
        Self {
            env: Vec::new(),
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes,
            on_stdout: None,
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_stdout_callback(mut self, callback: StdoutCallback) -> Self {
        self.on_stdout = Some(callback);
        self
    }
}

/// Result of one child invocation. Never an error: spawn failures and
/// timeouts are folded into the fields.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, or -1 when the child was killed or never started.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    /// stdout then stderr, tail-truncated to the configured cap.
    pub output: String,
    /// True when the timeout fired and the process group was killed.
    pub killed: bool,
    /// True iff the child exited normally with code 0.
    pub success: bool,
}

/// Run a child to completion, capturing output.
///
/// When `args` is exactly `["-c", "<script>"]` the platform shell is launched
/// instead of `program`. This is the only supported way to run a composite
/// shell string locally; every other call site passes a real argv.
pub async fn run_command(program: &str, args: &[String], mut opts: RunOptions) -> CommandOutput {
    let (effective_program, effective_args) = resolve_shell_mode(program, args);
    debug!(
        "Running command: {} {}",
        effective_program,
        effective_args.join(" ")
    );

    let mut command = Command::new(&effective_program);
    command
        .args(&effective_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &opts.env {
        command.env(key, value);
    }
    // The child gets its own process group so a timeout can take down the
    // entire descendant tree, not just the immediate child.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Failed to spawn {}: {}", effective_program, e);
            return CommandOutput {
                code: -1,
                stdout: String::new(),
                stderr: message.clone(),
                output: truncate_output_tail(&message, opts.max_output_bytes),
                killed: false,
                success: false,
            };
        }
    };

    let child_pid = child.id();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();
    let cap = opts.max_output_bytes;
    let mut killed = false;

    let code = {
        let on_stdout = &mut opts.on_stdout;
        let out_buf = &mut stdout_buf;
        let err_buf = &mut stderr_buf;
        let drain = async {
            let stdout_side = async {
                if let Some(pipe) = stdout_pipe.as_mut() {
                    let mut chunk = [0u8; 8192];
                    loop {
                        match pipe.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                                if let Some(callback) = on_stdout.as_mut() {
                                    callback(&text);
                                }
                                append_capped(out_buf, &text, cap);
                            }
                        }
                    }
                }
            };
            let stderr_side = async {
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let mut chunk = [0u8; 8192];
                    loop {
                        match pipe.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                                append_capped(err_buf, &text, cap);
                            }
                        }
                    }
                }
            };
            tokio::join!(stdout_side, stderr_side);
            child.wait().await
        };

        // Bound into a plain value first so the drain future (and its borrow
        // of the child) is gone before the timeout branch kills the group.
        let waited = tokio::time::timeout(opts.timeout, drain).await;
        match waited {
            Ok(Ok(status)) => status.code().unwrap_or(-1),
            Ok(Err(e)) => {
                warn!("Waiting on child {} failed: {}", effective_program, e);
                -1
            }
            Err(_) => {
                killed = true;
                warn!(
                    "Command {} exceeded its {}ms timeout, killing process group",
                    effective_program,
                    opts.timeout.as_millis()
                );
                kill_child_group(&mut child, child_pid);
                // Reap the child so the group does not linger as a zombie.
                let _ = child.wait().await;
                -1
            }
        }
    };

    if killed {
        if stderr_buf.is_empty() {
            stderr_buf.push_str(TIMEOUT_MARKER);
        } else {
            stderr_buf.push('\n');
            stderr_buf.push_str(TIMEOUT_MARKER);
        }
    }

    let stdout = truncate_output_tail(&stdout_buf, cap);
    let stderr = truncate_output_tail(&stderr_buf, cap);
    let combined = format!("{}{}", stdout_buf, stderr_buf);
    let output = truncate_output_tail(&combined, cap);

    CommandOutput {
        code,
        stdout,
        stderr,
        output,
        killed,
        success: code == 0 && !killed,
    }
}

/// Map the shell-mode convention onto the platform shell.
fn resolve_shell_mode(program: &str, args: &[String]) -> (String, Vec<String>) {
    let shell_mode = args.len() == 2 && args[0] == "-c";
    if !shell_mode {
        return (program.to_string(), args.to_vec());
    }
    if cfg!(windows) {
        ("cmd".to_string(), vec!["/C".to_string(), args[1].clone()])
    } else {
        ("sh".to_string(), args.to_vec())
    }
}

/// Append a chunk, keeping the buffer within twice the cap so long-running
/// children cannot grow memory without bound.
fn append_capped(buf: &mut String, chunk: &str, cap: usize) {
    buf.push_str(chunk);
    if buf.len() > cap.saturating_mul(2) {
        *buf = truncate_output_tail(buf, cap);
    }
}

#[cfg(unix)]
fn kill_child_group(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match pid {
        Some(pid) => {
            if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_err() {
                // The group may already be gone; fall back to the child itself.
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_child_group(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}
