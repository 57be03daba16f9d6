//! Remote command execution over password-based SSH
//!
//! One remote invocation is `sshpass -e ssh -p <port> -o
//! StrictHostKeyChecking=accept-new user@host <command>`. The password
//! travels in the `SSHPASS` environment variable and never on the command
//! line. The remote command is a single argv element; the remote shell
//! evaluates it, so callers must shell-escape anything they interpolate.

use crate::process::{run_command, CommandOutput, RunOptions};
use shared::config::Tunables;

/// One SSH endpoint, as taken from a task row.
#[derive(Debug, Clone)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl SshEndpoint {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Execute one command on the remote host.
pub async fn ssh_exec(
    tunables: &Tunables,
    endpoint: &SshEndpoint,
    password: &str,
    remote_command: &str,
    timeout_ms: u64,
) -> CommandOutput {
    let args: Vec<String> = vec![
        "-e".to_string(),
        tunables.ssh_bin.clone(),
        "-p".to_string(),
        endpoint.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        endpoint.destination(),
        remote_command.to_string(),
    ];
    let opts = RunOptions::new(timeout_ms, tunables.max_output_bytes).with_env("SSHPASS", password);
    run_command(&tunables.sshpass_bin, &args, opts).await
}

/// The remote shell string handed to rsync's `-e` option.
pub fn rsync_remote_shell(tunables: &Tunables, port: u16) -> String {
    format!(
        "{} -p {} -o StrictHostKeyChecking=accept-new",
        tunables.ssh_bin, port
    )
}
