//! The built-in `shell` job: runs a command line from the job's data.
//!
//! Data shape: `{ "cmd": ["program", "arg", ...], "cwd": "/optional/dir",
//! "env": { "KEY": "value" } }`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use cadence_scheduler::Processor;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Name the shell job is registered under.
pub const SHELL_JOB: &str = "shell";

/// Longest stderr tail kept in a failure message.
const MAX_STDERR_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
struct ShellJob {
    cmd: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("invalid shell job data: {0}")]
    InvalidData(#[from] serde_json::Error),

    #[error("shell job has an empty command")]
    EmptyCommand,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Processor for [`SHELL_JOB`].
///
/// The child process is not killed if the job times out; it is left to
/// finish and its exit is reported as a late completion.
pub fn processor() -> Processor {
    Processor::new(|data| async move { run(data).await.map_err(|e| e.to_string()) })
}

async fn run(data: Value) -> Result<(), ShellError> {
    let job: ShellJob = serde_json::from_value(data)?;
    let (program, args) = job.cmd.split_first().ok_or(ShellError::EmptyCommand)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(&job.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(ref cwd) = job.cwd {
        cmd.current_dir(cwd);
    }

    debug!(program = %program, ?args, "running shell job");
    let output = cmd.output().await.map_err(|source| ShellError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        info!(program = %program, stdout = %stdout.trim_end(), "shell job output");
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(program = %program, status = %output.status, "shell job failed");
        return Err(ShellError::Failed {
            status: output.status.to_string(),
            stderr: tail(stderr.trim_end(), MAX_STDERR_CHARS),
        });
    }

    Ok(())
}

/// The last `max` characters of `s`.
fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max)).collect()
}
