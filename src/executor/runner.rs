//! Bounded subprocess execution
//!
//! Commands run in their own process group with stdout and stderr merged
//! into one capped buffer. The run ends when the process exits and both
//! pipes close, or early on timeout, cancellation, or output overflow; in
//! the early cases the whole group is terminated.

use crate::process::terminate_group;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TRUNCATION_MARKER: &str = "\n... [truncated] ...";

const READ_CHUNK: usize = 8192;

/// Program invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn shell(command: &str, cwd: Option<PathBuf>) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            cwd,
        }
    }

    pub fn script(interpreter: &str, script: &str, cwd: Option<PathBuf>) -> Self {
        Self {
            program: interpreter.to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEnd {
    Exited,
    TimedOut,
    Cancelled,
    OutputLimit,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub end: ExecEnd,
    /// `None` when killed by a signal
    pub exit_code: Option<i32>,
    pub output: String,
    pub truncated: bool,
    pub pid: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.end == ExecEnd::Exited && self.exit_code == Some(0)
    }
}

struct OutputCapture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputCapture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    /// Append a chunk. Returns false once the limit is exceeded.
    fn push(&mut self, bytes: &[u8]) -> bool {
        let room = self.limit.saturating_sub(self.buf.len());
        if bytes.len() > room {
            self.buf.extend_from_slice(&bytes[..room]);
            self.truncated = true;
            return false;
        }
        self.buf.extend_from_slice(bytes);
        true
    }

    fn into_string(self) -> (String, bool) {
        let mut bytes = self.buf;
        if self.truncated {
            // Drop a multi-byte character split by the cut
            if let Err(e) = std::str::from_utf8(&bytes) {
                if e.error_len().is_none() {
                    bytes.truncate(e.valid_up_to());
                }
            }
        }
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        (text, self.truncated)
    }
}

fn spawn_reader<R>(mut pipe: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Run `spec` under `limits`. Errors only when the process cannot be spawned.
pub async fn run_command(
    spec: &CommandSpec,
    limits: ExecLimits,
    cancel: &CancellationToken,
) -> std::io::Result<ExecOutput> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(ref cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    tracing::debug!(program = %spec.program, pid = ?pid, "Spawned task process");

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx.clone());
    }
    drop(tx);

    let mut capture = OutputCapture::new(limits.max_output_bytes);
    let deadline = tokio::time::sleep(limits.timeout);
    tokio::pin!(deadline);

    let mut status = None;
    let mut pipes_open = true;

    let end = loop {
        if status.is_some() && !pipes_open {
            break ExecEnd::Exited;
        }
        tokio::select! {
            chunk = rx.recv(), if pipes_open => match chunk {
                Some(bytes) => {
                    if !capture.push(&bytes) {
                        break ExecEnd::OutputLimit;
                    }
                }
                None => pipes_open = false,
            },
            exited = child.wait(), if status.is_none() => {
                status = Some(exited?);
            }
            _ = &mut deadline => break ExecEnd::TimedOut,
            _ = cancel.cancelled() => break ExecEnd::Cancelled,
        }
    };

    if end != ExecEnd::Exited {
        tracing::debug!(pid = ?pid, end = ?end, "Terminating task process group");
        terminate_group(&mut child, limits.kill_grace).await;
        if status.is_none() {
            status = child.try_wait()?;
        }
    }

    let (output, truncated) = capture.into_string();
    Ok(ExecOutput {
        end,
        exit_code: status.and_then(|s| s.code()),
        output,
        truncated,
        pid,
    })
}
