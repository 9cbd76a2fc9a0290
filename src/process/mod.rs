//! Process runner.
//!
//! Runs exactly one external program per call with a discrete argv (never a
//! shell), streams stdout/stderr to an optional callback as chunks arrive,
//! and enforces a timeout and a cancellation token. Timeout and cancellation
//! share one termination path: SIGTERM through the `kill` utility, then a
//! forced kill once the grace window has passed.

#[cfg(test)]
pub mod mock;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::{EngineError, EngineResult};

/// Pipes still open after the process exited (a grandchild holding them) are
/// abandoned after this long.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_BUFFER: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl RunRequest {
    pub fn new(program: &str, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args,
            env: BTreeMap::new(),
            working_dir: None,
            timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

pub type OutputCallback = Arc<dyn Fn(OutputChunk) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ProcessStatus,
    /// `None` when the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Total bytes read, including anything beyond the capture limit.
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub truncated: bool,
    pub duration: Duration,
    /// `None` when no process was spawned.
    pub pid: Option<u32>,
}

impl RunOutcome {
    pub fn exited(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            status: ProcessStatus::Exited,
            exit_code: Some(exit_code),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            stdout_bytes: stdout.len() as u64,
            stderr_bytes: stderr.len() as u64,
            truncated: false,
            duration: Duration::ZERO,
            pid: None,
        }
    }

    /// Outcome for a call whose token was cancelled before spawning.
    pub fn cancelled_before_start() -> Self {
        Self {
            status: ProcessStatus::Cancelled,
            exit_code: None,
            ..Self::exited(0, "", "")
        }
    }

    pub fn success(&self) -> bool {
        self.status == ProcessStatus::Exited && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        on_output: Option<OutputCallback>,
    ) -> EngineResult<RunOutcome>;
}

#[derive(Default)]
struct StreamCapture {
    data: Vec<u8>,
    total: u64,
    truncated: bool,
}

impl StreamCapture {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        self.total += chunk.len() as u64;
        let room = limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

type SharedCapture = Arc<Mutex<StreamCapture>>;

/// Production runner on `tokio::process`.
pub struct TokioProcessRunner {
    config: RunnerConfig,
}

impl TokioProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

enum Finish {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
        on_output: Option<OutputCallback>,
    ) -> EngineResult<RunOutcome> {
        if cancel.is_cancelled() {
            log::debug!("Not spawning '{}': already cancelled", request.program);
            return Ok(RunOutcome::cancelled_before_start());
        }

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: request.program.clone(),
            source,
        })?;
        let pid = child.id();
        log::debug!("Spawned '{}' (pid {:?})", request.program, pid);

        let limit = self.config.max_capture_bytes;
        let stdout = Arc::new(Mutex::new(StreamCapture::default()));
        let stderr = Arc::new(Mutex::new(StreamCapture::default()));
        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(spawn_pump(out, OutputStream::Stdout, stdout.clone(), limit, on_output.clone()));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(spawn_pump(err, OutputStream::Stderr, stderr.clone(), limit, on_output.clone()));
        }

        let finish = tokio::select! {
            res = child.wait() => Finish::Exited(res?),
            _ = tokio::time::sleep(request.timeout) => Finish::TimedOut,
            _ = cancel.cancelled() => Finish::Cancelled,
        };

        let (status, exit_code, drain) = match finish {
            Finish::Exited(exit) => (ProcessStatus::Exited, exit.code(), DRAIN_TIMEOUT),
            Finish::TimedOut => {
                log::warn!(
                    "'{}' exceeded its {}s timeout, terminating",
                    request.program,
                    request.timeout.as_secs()
                );
                terminate(&mut child, pid, self.config.termination_grace()).await;
                (ProcessStatus::TimedOut, None, self.config.termination_grace())
            }
            Finish::Cancelled => {
                log::info!("Cancelling '{}'", request.program);
                terminate(&mut child, pid, self.config.termination_grace()).await;
                (ProcessStatus::Cancelled, None, self.config.termination_grace())
            }
        };

        drain_pumps(pumps, drain).await;
        let (stdout, stdout_bytes, stdout_truncated) = take_capture(&stdout);
        let (stderr, stderr_bytes, stderr_truncated) = take_capture(&stderr);

        Ok(RunOutcome {
            status,
            exit_code,
            stdout,
            stderr,
            stdout_bytes,
            stderr_bytes,
            truncated: stdout_truncated || stderr_truncated,
            duration: started.elapsed(),
            pid,
        })
    }
}

fn spawn_pump<R>(
    mut reader: R,
    stream: OutputStream,
    sink: SharedCapture,
    limit: usize,
    on_output: Option<OutputCallback>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    sink.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(chunk, limit);
                    if let Some(cb) = &on_output {
                        cb(OutputChunk {
                            stream,
                            text: String::from_utf8_lossy(chunk).into_owned(),
                        });
                    }
                }
                Err(e) => {
                    log::debug!("Reading {} failed: {}", stream.as_str(), e);
                    break;
                }
            }
        }
    })
}

async fn drain_pumps(pumps: Vec<JoinHandle<()>>, within: Duration) {
    for mut pump in pumps {
        if tokio::time::timeout(within, &mut pump).await.is_err() {
            log::debug!("Output pipe still open after {:?}, abandoning", within);
            pump.abort();
        }
    }
}

fn take_capture(capture: &SharedCapture) -> (String, u64, bool) {
    let mut c = capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let data = std::mem::take(&mut c.data);
    (String::from_utf8_lossy(&data).into_owned(), c.total, c.truncated)
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    if let Some(pid) = pid {
        if send_sigterm(pid) {
            if let Ok(Ok(_)) = tokio::time::timeout(grace, child.wait()).await {
                return;
            }
            log::debug!("pid {} ignored SIGTERM for {:?}, killing", pid, grace);
        }
    }

    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill child process: {}", e);
    }
}

/// The child has not been reaped yet, so `pid` still names it.
#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        log::debug!("SIGTERM to pid {} failed: {}", pid, std::io::Error::last_os_error());
    }
    rc == 0
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}
