//! Child-process plumbing shared by the acquire, render and publish steps.
//!
//! Every external program (git, the site generator) is awaited to completion
//! with stdout/stderr captured, so callers can log the output and map the exit
//! status into their own error type.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, error};

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last few lines of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(5);
        lines[start..].join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },
}

/// Run `program` with `args` in `cwd` and wait for it to exit.
///
/// A `timeout` of `None` waits indefinitely. On timeout the child is killed.
pub async fn run<S: AsRef<str>>(
    program: &str,
    args: &[S],
    cwd: &Path,
    envs: &[(String, String)],
    timeout: Option<Duration>,
) -> Result<CommandOutput, ExecError> {
    let start = Instant::now();
    let rendered_args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
    debug!(program, args = ?rendered_args, cwd = %cwd.display(), "Launching process");

    let mut command = Command::new(program);
    command
        .args(&rendered_args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        command.env(key, value);
    }

    let child = command.spawn().map_err(|e| {
        error!(error = ?e, program, "Failed to launch process");
        ExecError::Launch {
            program: program.to_string(),
            source: e,
        }
    })?;

    let waited = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ExecError::TimedOut {
                program: program.to_string(),
                secs: limit.as_secs(),
            })?,
        None => child.wait_with_output().await,
    };
    let output = waited.map_err(|e| ExecError::Launch {
        program: program.to_string(),
        source: e,
    })?;

    let result = CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    debug!(
        program,
        code = ?result.code,
        duration_ms = result.duration_ms,
        "Process exited"
    );
    Ok(result)
}

/// Run `git` with interactive prompts disabled.
pub async fn git<S: AsRef<str>>(
    cwd: &Path,
    args: &[S],
    envs: &[(String, String)],
) -> Result<CommandOutput, ExecError> {
    let mut all_envs = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
    all_envs.extend_from_slice(envs);
    run("git", args, cwd, &all_envs, None).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run("sh", &["-c", "echo hello; exit 3"], dir.path(), &[], None)
            .await
            .expect("sh should launch");
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn passes_environment_to_child() {
        let dir = tempfile::tempdir().unwrap();
        let envs = vec![("SITE_PUBLISH_MARKER".to_string(), "42".to_string())];
        let out = run("sh", &["-c", "echo $SITE_PUBLISH_MARKER"], dir.path(), &envs, None)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run::<&str>("definitely-not-a-real-binary-xyz", &[], dir.path(), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            "sh",
            &["-c", "sleep 5"],
            dir.path(),
            &[],
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::TimedOut { .. }));
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let out = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: (1..=8).map(|i| format!("line{i}\n")).collect(),
            duration_ms: 0,
        };
        assert_eq!(out.stderr_tail(), "line4\nline5\nline6\nline7\nline8");
    }
}
