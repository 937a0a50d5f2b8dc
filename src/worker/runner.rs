// src/worker/runner.rs

//! Launcher execution for claimed jobs.
//!
//! A job run is: mark the row `running`, spawn the configured launcher with
//! `{id}` substituted, capture both streams up to the configured cap, wait
//! for exit, write everything back as `done`. Output pipes are drained past
//! the cap so a chatty child can never block on a full pipe; exceeding the
//! cap fails the job.

use crate::config::LauncherSection;
use crate::store::{JobCompletion, JobStore, JobVerdict};
use serde::Serialize;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Outcome of one job execution, as reported to manual-run waiters.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    #[serde(rename = "result")]
    pub verdict: JobVerdict,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    pub stdout: String,
    pub stderr: String,
}

impl JobReport {
    fn failure(stderr: String) -> Self {
        Self { verdict: JobVerdict::Fail, code: None, signal: None, stdout: String::new(), stderr }
    }
}

/// Execute one claimed job end to end.
///
/// Storage failure on the final write is logged, not propagated: the slot
/// must be freed either way, and reconciling the row is an external
/// concern.
pub async fn run_job(store: &dyn JobStore, launcher: &LauncherSection, id: u64) -> JobReport {
    if let Err(e) = store.mark_running(id).await {
        warn!("cannot mark job {id} running, skipping execution: {e}");
        return JobReport::failure(format!("storage error: {e}"));
    }

    let report = execute(launcher, id).await;

    let completion = JobCompletion {
        verdict: report.verdict,
        return_code: report.code,
        sig: report.signal.clone(),
        stdout: report.stdout.clone(),
        stderr: report.stderr.clone(),
    };
    if let Err(e) = store.mark_done(id, &completion).await {
        warn!("failed to write result for job {id}: {e}");
    }
    report
}

async fn execute(launcher: &LauncherSection, id: u64) -> JobReport {
    let command_line = launcher.command.replace("{id}", &id.to_string());
    let argv: Vec<&str> = command_line.split_whitespace().collect();
    let Some((program, args)) = argv.split_first() else {
        return JobReport::failure("empty launcher command".to_string());
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    if let Some(cwd) = &launcher.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &launcher.env {
        command.env(key, value);
    }

    debug!(id, command = %command_line, "spawning launcher");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return JobReport::failure(format!("failed to spawn launcher: {e}")),
    };

    let cap = launcher.max_output_buffer;
    let stdout_pipe = child.stdout.take().expect("stdout is piped");
    let stderr_pipe = child.stderr.take().expect("stderr is piped");
    let stdout_task = tokio::spawn(read_capped(stdout_pipe, cap));
    let stderr_task = tokio::spawn(read_capped(stderr_pipe, cap));

    let status = child.wait().await;
    let (stdout, stdout_overflow) = stdout_task.await.unwrap_or_default();
    let (mut stderr, stderr_overflow) = stderr_task.await.unwrap_or_default();

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return JobReport {
                verdict: JobVerdict::Fail,
                code: None,
                signal: None,
                stdout,
                stderr: format!("failed to wait for launcher: {e}"),
            };
        }
    };

    let code = status.code().map(|c| u8::try_from(c).unwrap_or(u8::MAX));
    let signal = termination_signal(&status);
    let mut verdict =
        if status.code() == Some(0) { JobVerdict::Ok } else { JobVerdict::Fail };

    if stdout_overflow || stderr_overflow {
        verdict = JobVerdict::Fail;
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&format!("output exceeded max_output_buffer ({cap} bytes)"));
    }

    JobReport { verdict, code, signal, stdout, stderr }
}

/// Read a child stream to EOF, keeping at most `cap` bytes. The remainder
/// is drained and discarded so the child never stalls on a full pipe.
async fn read_capped<R>(mut reader: R, cap: usize) -> (String, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut overflow = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(captured.len());
                let keep = room.min(n);
                captured.extend_from_slice(&chunk[..keep]);
                if keep < n {
                    overflow = true;
                }
            }
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&captured).into_owned(), overflow)
}

#[cfg(unix)]
fn termination_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(crate::util::signal_name)
}

#[cfg(not(unix))]
fn termination_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn launcher(command: &str) -> LauncherSection {
        LauncherSection {
            command: command.to_string(),
            cwd: None,
            max_output_buffer: 1024 * 1024,
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_successful_run_substitutes_id() {
        let report = execute(&launcher("echo job {id}"), 7).await;
        assert_eq!(report.verdict, JobVerdict::Ok);
        assert_eq!(report.code, Some(0));
        assert_eq!(report.signal, None);
        assert_eq!(report.stdout, "job 7\n");
        assert_eq!(report.stderr, "");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let report = execute(&launcher("false"), 1).await;
        assert_eq!(report.verdict, JobVerdict::Fail);
        assert_eq!(report.code, Some(1));
    }

    #[tokio::test]
    async fn test_spawn_error_is_recorded() {
        let report = execute(&launcher("/nonexistent/launcher {id}"), 1).await;
        assert_eq!(report.verdict, JobVerdict::Fail);
        assert_eq!(report.code, None);
        assert!(report.stderr.contains("failed to spawn launcher"));
    }

    #[tokio::test]
    async fn test_output_cap_fails_the_job() {
        let mut config = launcher("echo 0123456789abcdefghijklmnopqrstuvwxyz");
        config.max_output_buffer = 8;
        let report = execute(&config, 1).await;
        assert_eq!(report.verdict, JobVerdict::Fail, "overflow must fail the job");
        assert_eq!(report.stdout, "01234567", "capture is truncated at the cap");
        assert!(report.stderr.contains("output exceeded max_output_buffer"));
    }

    #[tokio::test]
    async fn test_cwd_and_env_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = launcher("pwd");
        config.cwd = Some(dir.path().to_path_buf());
        let report = execute(&config, 1).await;
        assert_eq!(report.verdict, JobVerdict::Ok);
        assert!(
            report.stdout.trim_end().ends_with(
                dir.path().file_name().unwrap().to_str().unwrap()
            ),
            "child should run in the configured directory, got {:?}",
            report.stdout
        );

        let mut config = launcher("printenv DISPATCH_TEST_VAR");
        config.env.insert("DISPATCH_TEST_VAR".to_string(), "42".to_string());
        let report = execute(&config, 1).await;
        assert_eq!(report.stdout, "42\n");
    }
}
