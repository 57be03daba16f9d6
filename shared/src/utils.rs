//! Utility functions for the synchronization system
//!
//! Small pure helpers shared by the engine: timestamps, shell quoting for
//! remote command strings, and output truncation. Remote commands are the one
//! place a shell string is composed, so every interpolated value must pass
//! through `shell_escape` before it reaches a command.

use chrono::Utc;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in seconds.
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// State for disambiguating run timestamps that fall in the same second.
static RUN_STAMP_STATE: Mutex<(i64, u64)> = Mutex::new((0, 0));

/// Format the timestamp used to name `.versions/<ts>` and `.trash/<ts>`
/// directories for one run.
///
/// The base format is `YYYY-MM-DD_HH-MM-SS` in UTC. When two runs land in the
/// same second, later calls get a `-<n>` suffix so the directory names stay
/// unique within the process.
pub fn run_timestamp() -> String {
    let now = Utc::now();
    let second = now.timestamp();
    let base = now.format("%Y-%m-%d_%H-%M-%S").to_string();

    let mut state = RUN_STAMP_STATE.lock().unwrap_or_else(|e| e.into_inner());
    if state.0 == second {
        state.1 += 1;
        format!("{}-{}", base, state.1)
    } else {
        *state = (second, 0);
        base
    }
}

/// Quote a string for a POSIX shell: wrap in single quotes and escape any
/// embedded single quote as `'\''`.
pub fn posix_shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('\'');
    for c in s.chars() {
        if c == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(c);
        }
    }
    escaped.push('\'');
    escaped
}

/// Quote a string for the Windows shell in shell mode: wrap in double quotes
/// and escape backslashes and double quotes.
pub fn windows_shell_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len() + 2);
    escaped.push('"');
    for c in s.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            _ => escaped.push(c),
        }
    }
    escaped.push('"');
    escaped
}

/// Quote a string for the platform shell.
///
/// Remote command strings are always evaluated by a POSIX shell on the remote
/// host, so callers composing remote commands should use this on every
/// interpolated value.
#[cfg(not(windows))]
pub fn shell_escape(s: &str) -> String {
    posix_shell_escape(s)
}

#[cfg(windows)]
pub fn shell_escape(s: &str) -> String {
    windows_shell_escape(s)
}

/// Normalize a local filesystem path for use inside transfer tool arguments.
///
/// On Windows the path separators become forward slashes and a leading drive
/// letter is lowercased, which is the form the cygwin-derived transfer tools
/// expect. Elsewhere the path is passed through unchanged.
pub fn normalize_local_path(path: &Path) -> String {
    let raw = path.to_string_lossy().to_string();
    if cfg!(windows) {
        let mut normalized = raw.replace('\\', "/");
        let bytes = normalized.as_bytes();
        if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_uppercase() {
            let lower = (bytes[0] as char).to_ascii_lowercase();
            normalized.replace_range(0..1, &lower.to_string());
        }
        normalized
    } else {
        raw
    }
}

/// Keep the last `max_bytes` of a string, respecting char boundaries.
///
/// Child output is capped tail-first because the end of a transfer log is
/// where the failure reason lives.
pub fn truncate_output_tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_escape_plain() {
        assert_eq!(posix_shell_escape("abc"), "'abc'");
        assert_eq!(posix_shell_escape("with space"), "'with space'");
    }

    #[test]
    fn posix_escape_embedded_quote() {
        assert_eq!(posix_shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn posix_escape_hostile_input() {
        // A value with shell metacharacters stays inert inside the quotes.
        let escaped = posix_shell_escape("$(rm -rf /); `id`");
        assert_eq!(escaped, "'$(rm -rf /); `id`'");
    }

    #[test]
    fn windows_escape() {
        assert_eq!(windows_shell_escape("plain"), "\"plain\"");
        assert_eq!(windows_shell_escape("a\"b"), "\"a\\\"b\"");
        assert_eq!(windows_shell_escape("c:\\dir"), "\"c:\\\\dir\"");
    }

    #[test]
    fn run_timestamp_format() {
        let ts = run_timestamp();
        // YYYY-MM-DD_HH-MM-SS, possibly with a -<n> suffix
        assert!(ts.len() >= 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "_");
        assert!(!ts.contains(':'));
        assert!(!ts.contains('.'));
    }

    #[test]
    fn run_timestamps_are_unique_within_a_second() {
        let a = run_timestamp();
        let b = run_timestamp();
        let c = run_timestamp();
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn truncate_keeps_tail() {
        assert_eq!(truncate_output_tail("abcdef", 3), "def");
        assert_eq!(truncate_output_tail("abc", 10), "abc");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "aé日本語";
        let out = truncate_output_tail(s, 4);
        // Must not split inside a multi-byte char.
        assert!(s.ends_with(&out));
        assert!(out.len() <= 4);
    }

    #[test]
    fn timestamp_is_recent() {
        let now = current_timestamp();
        assert!(now > 1_700_000_000);
    }
}
