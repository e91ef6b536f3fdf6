use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for spawning an analyzer or build tool.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
    pub stdin_data: Option<String>,
}

/// Output from a completed child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    /// Full transcript, stdout then stderr, for report parsing and the
    /// noise filter's summary-line extraction.
    pub fn combined(&self) -> String {
        let mut out = self.stdout_lines.join("\n");
        if !self.stderr_lines.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.stderr_lines.join("\n"));
        }
        out
    }
}

/// Spawn a child process, stream its output line-by-line, and enforce
/// the configured timeout.
///
/// The child is placed in its own process group on Unix; on timeout the
/// whole group receives SIGTERM, then SIGKILL, and
/// [`Error::ProcessTimeout`] is returned so callers can shape a
/// timeout-specific result instead of failing the enclosing loop.
pub async fn spawn_and_capture(config: ProcessConfig) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdin(if config.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))?;

    if let Some(data) = config.stdin_data {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("stdin not piped".into()))?;
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| Error::Process(format!("failed to write stdin: {e}")))?;
        drop(stdin);
    }

    let stdout = child.stdout.take().ok_or_else(|| Error::Process("stdout not piped".into()))?;
    let stderr = child.stderr.take().ok_or_else(|| Error::Process("stderr not piped".into()))?;

    let prefix_out = config.log_prefix.clone();
    let prefix_err = config.log_prefix;

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_out}] {line}");
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_err}] {line}");
            lines.push(line);
        }
        lines
    });

    let status = if let Some(dur) = config.timeout {
        match tokio::time::timeout(dur, child.wait()).await {
            Ok(r) => r.map_err(|e| Error::Process(format!("wait error: {e}")))?,
            Err(_) => {
                warn!(
                    command = %config.command,
                    timeout = ?dur,
                    "process timed out, killing process group"
                );
                kill_process_group(pid as i32).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::ProcessTimeout(dur));
            }
        }
    } else {
        child
            .wait()
            .await
            .map_err(|e| Error::Process(format!("wait error: {e}")))?
    };

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = extract_exit_info(&status);

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout_lines,
        stderr_lines,
    })
}

#[cfg(unix)]
async fn kill_process_group(pgid: i32) {
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_pgid: i32) {}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}

/// Whether `binary` resolves to an executable file, either as an
/// absolute/relative path or through `$PATH`. Read-only check used by
/// analyzer availability probes.
pub fn binary_on_path(binary: &str) -> bool {
    let candidate = std::path::Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_on_path_finds_shell() {
        assert!(binary_on_path("sh"));
    }

    #[test]
    fn test_binary_on_path_rejects_missing() {
        assert!(!binary_on_path("definitely-not-a-real-binary-xyz"));
    }

    #[test]
    fn test_combined_joins_both_streams() {
        let output = ProcessOutput {
            exit_code: 0,
            signal: None,
            stdout_lines: vec!["a".to_string(), "b".to_string()],
            stderr_lines: vec!["c".to_string()],
        };
        assert_eq!(output.combined(), "a\nb\nc");
    }

    #[test]
    fn test_combined_stderr_only() {
        let output = ProcessOutput {
            exit_code: 1,
            signal: None,
            stdout_lines: vec![],
            stderr_lines: vec!["err".to_string()],
        };
        assert_eq!(output.combined(), "err");
    }

    #[test]
    fn test_success_requires_zero_exit_and_no_signal() {
        let ok = ProcessOutput {
            exit_code: 0,
            signal: None,
            stdout_lines: vec![],
            stderr_lines: vec![],
        };
        assert!(ok.success());
        let killed = ProcessOutput {
            exit_code: 137,
            signal: Some(9),
            stdout_lines: vec![],
            stderr_lines: vec![],
        };
        assert!(!killed.success());
    }
}
