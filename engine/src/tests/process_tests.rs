//! Tests for the process runner: capture, exit codes, shell mode, timeout
//! kill, and the never-reject contract.

use crate::process::{run_command, RunOptions, TIMEOUT_MARKER};
use std::sync::{Arc, Mutex};
use std::time::Instant;

fn opts(timeout_ms: u64) -> RunOptions {
    RunOptions::new(timeout_ms, 10_240)
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn captures_stdout_on_success() {
    let result = run_command("echo", &args(&["hello"]), opts(5_000)).await;
    assert_eq!(result.code, 0);
    assert!(result.success);
    assert!(!result.killed);
    assert!(result.stdout.contains("hello"));
    assert!(result.output.contains("hello"));
}

#[tokio::test]
async fn nonzero_exit_is_not_success() {
    let result = run_command("sh", &args(&["-c", "exit 3"]), opts(5_000)).await;
    assert_eq!(result.code, 3);
    assert!(!result.success);
    assert!(!result.killed);
}

#[tokio::test]
async fn shell_mode_runs_composite_commands() {
    let result = run_command(
        "sh",
        &args(&["-c", "printf out; printf err >&2; exit 0"]),
        opts(5_000),
    )
    .await;
    assert!(result.success);
    assert_eq!(result.stdout, "out");
    assert_eq!(result.stderr, "err");
    // Combined output is stdout then stderr.
    assert_eq!(result.output, "outerr");
}

#[tokio::test]
async fn spawn_error_resolves_instead_of_raising() {
    let result = run_command(
        "definitely-not-a-real-binary-7c1f",
        &args(&["x"]),
        opts(5_000),
    )
    .await;
    assert_eq!(result.code, -1);
    assert!(!result.success);
    assert!(!result.killed);
    assert!(result.stderr.contains("Failed to spawn"));
}

#[tokio::test]
async fn timeout_kills_the_child_and_marks_the_output() {
    let started = Instant::now();
    let result = run_command("sh", &args(&["-c", "sleep 30"]), opts(200)).await;

    assert!(result.killed);
    assert_eq!(result.code, -1);
    assert!(!result.success);
    assert!(result.output.ends_with(TIMEOUT_MARKER));
    assert!(result.stderr.ends_with(TIMEOUT_MARKER));
    // The child was killed, not waited out.
    assert!(started.elapsed().as_secs() < 10);
}

#[tokio::test]
async fn timeout_kills_the_whole_process_group() {
    // The inner sleep is a grandchild; group kill must take it down too,
    // otherwise the drain future never sees EOF and this test times out.
    let started = Instant::now();
    let result = run_command("sh", &args(&["-c", "sh -c 'sleep 30' & wait"]), opts(300)).await;
    assert!(result.killed);
    assert!(started.elapsed().as_secs() < 10);
}

#[tokio::test]
async fn stdout_callback_sees_chunks_before_buffering() {
    let seen = Arc::new(Mutex::new(String::new()));
    let sink = seen.clone();
    let options = opts(5_000).with_stdout_callback(Box::new(move |chunk| {
        sink.lock().unwrap().push_str(chunk);
    }));

    let result = run_command("sh", &args(&["-c", "printf 'one\\ntwo\\n'"]), options).await;
    assert!(result.success);
    assert_eq!(&*seen.lock().unwrap(), "one\ntwo\n");
    assert_eq!(result.stdout, "one\ntwo\n");
}

#[tokio::test]
async fn env_is_overlaid_on_the_parent_environment() {
    let options = opts(5_000).with_env("WARDEN_TEST_VALUE", "xyzzy");
    let result = run_command(
        "sh",
        &args(&["-c", "printf '%s' \"$WARDEN_TEST_VALUE\""]),
        options,
    )
    .await;
    assert!(result.success);
    assert_eq!(result.stdout, "xyzzy");
}

#[tokio::test]
async fn output_is_capped_tail_first() {
    let mut options = opts(5_000);
    options.max_output_bytes = 64;
    let result = run_command(
        "sh",
        &args(&["-c", "i=0; while [ $i -lt 200 ]; do echo aaaaaaaaaa; i=$((i+1)); done; echo LASTLINE"]),
        options,
    )
    .await;
    assert!(result.success);
    assert!(result.output.len() <= 64);
    // Tail truncation keeps the end of the stream.
    assert!(result.output.contains("LASTLINE"));
}
