//! Subprocess execution with captured output and a hard timeout.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{PackwrightError, Result};

#[derive(Debug)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Run `argv` in `working_dir` with extra environment variables, killing the
/// child if it outlives `timeout`. Output is drained on reader threads so a
/// chatty child never deadlocks against a full pipe.
pub fn run_command(
    argv: &[String],
    working_dir: &Path,
    extra_env: &HashMap<String, String>,
    timeout: Duration,
) -> Result<ExecutionResult> {
    run_command_with_input(argv, working_dir, extra_env, None, timeout)
}

/// Like [`run_command`], but feeds `input` to the child on stdin first.
pub fn run_command_with_input(
    argv: &[String],
    working_dir: &Path,
    extra_env: &HashMap<String, String>,
    input: Option<&str>,
    timeout: Duration,
) -> Result<ExecutionResult> {
    let (program, args) = argv.split_first().ok_or_else(|| {
        PackwrightError::ToolchainError("empty command line".to_string())
    })?;

    let started = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .envs(extra_env)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            PackwrightError::ToolchainError(format!("failed to spawn {}: {}", program, e))
        })?;

    let stdout_handle = drain(child.stdout.take());
    let stderr_handle = drain(child.stderr.take());

    if let Some(payload) = input {
        if let Some(mut stdin) = child.stdin.take() {
            use std::io::Write;
            // A child that exits without reading its stdin is not an error.
            let _ = stdin.write_all(payload.as_bytes());
        }
    }

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() >= timeout {
                    warn!("{} exceeded {:?}; killing", program, timeout);
                    let _ = child.kill();
                    timed_out = true;
                    break child.wait().map_err(PackwrightError::IoError)?;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(PackwrightError::IoError(e)),
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    let duration = started.elapsed();

    let exit_code = if timed_out { -1 } else { status.code().unwrap_or(-1) };

    Ok(ExecutionResult { exit_code, stdout, stderr, duration, timed_out })
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut out = String::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_string(&mut out);
        }
        out
    })
}
